use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{ApprovalId, Capability, StepId, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalState {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl ApprovalState {
    pub fn is_resolved(self) -> bool {
        !matches!(self, ApprovalState::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalState::Pending => "pending",
            ApprovalState::Approved => "approved",
            ApprovalState::Rejected => "rejected",
            ApprovalState::Expired => "expired",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    Approve,
    Reject,
}

impl FromStr for ApprovalDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "approve" | "approved" | "allow" | "yes" => Ok(ApprovalDecision::Approve),
            "reject" | "rejected" | "deny" | "no" => Ok(ApprovalDecision::Reject),
            other => Err(format!("decision must be approve|reject, got `{other}`")),
        }
    }
}

/// A pending or resolved human decision on exactly one sensitive step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: ApprovalId,
    #[serde(rename = "taskID")]
    pub task_id: TaskId,
    #[serde(rename = "stepID")]
    pub step_id: StepId,
    pub capability: Capability,
    pub summary: String,
    pub state: ApprovalState,
    pub requested_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decider: Option<String>,
    /// Resolved as moot because the owning task was cancelled.
    #[serde(default)]
    pub withdrawn: bool,
}

impl ApprovalRequest {
    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline
    }
}
