use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{ApprovalId, Capability, FailureKind, Intent, StepId, TaskId};

/// Aggregate state of a task. Always derived from its steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Created,
    Planning,
    Running,
    AwaitingApproval,
    Completed,
    PartiallyFailed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed
                | TaskState::PartiallyFailed
                | TaskState::Failed
                | TaskState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Created => "created",
            TaskState::Planning => "planning",
            TaskState::Running => "running",
            TaskState::AwaitingApproval => "awaiting_approval",
            TaskState::Completed => "completed",
            TaskState::PartiallyFailed => "partially_failed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    PendingApproval,
    Dispatched,
    Succeeded,
    Failed,
    Skipped,
}

impl StepState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepState::Succeeded | StepState::Failed | StepState::Skipped
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepState::Pending => "pending",
            StepState::PendingApproval => "pending_approval",
            StepState::Dispatched => "dispatched",
            StepState::Succeeded => "succeeded",
            StepState::Failed => "failed",
            StepState::Skipped => "skipped",
        }
    }
}

/// Where the task is in its own lifecycle, independent of step outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskLifecycle {
    Created,
    Planning,
    Planned,
    PlanRejected,
    Cancelled,
}

/// Reason code recorded on a step that did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepFailureReason {
    TransientCapabilityError,
    TerminalCapabilityError,
    ApprovalRejected,
    ApprovalExpired,
    DependencyUnmet,
    RetryCeilingExceeded,
    TaskCancelled,
}

impl StepFailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StepFailureReason::TransientCapabilityError => "transient_capability_error",
            StepFailureReason::TerminalCapabilityError => "terminal_capability_error",
            StepFailureReason::ApprovalRejected => "approval_rejected",
            StepFailureReason::ApprovalExpired => "approval_expired",
            StepFailureReason::DependencyUnmet => "dependency_unmet",
            StepFailureReason::RetryCeilingExceeded => "retry_ceiling_exceeded",
            StepFailureReason::TaskCancelled => "task_cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    pub reason: StepFailureReason,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<FailureKind>,
}

impl StepError {
    pub fn new(reason: StepFailureReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
            kind: None,
        }
    }
}

/// One capability call inside a task plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub capability: Capability,
    pub operation: String,
    /// `{operation, intent, inputs}`; `inputs` is bound from dependency results at dispatch.
    pub request: Value,
    pub sensitive: bool,
    /// Whether a success of this step alone is worth reporting to the user.
    #[serde(default = "default_true")]
    pub user_visible: bool,
    #[serde(default)]
    pub depends_on: Vec<StepId>,
    pub summary: String,
    pub state: StepState,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<ApprovalId>,
    #[serde(default)]
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<StepError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    pub updated_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

impl Step {
    pub fn new(id: impl Into<StepId>, capability: Capability, operation: impl Into<String>) -> Self {
        let operation = operation.into();
        Self {
            id: id.into(),
            capability,
            request: serde_json::json!({ "operation": operation, "inputs": {} }),
            operation,
            sensitive: false,
            user_visible: true,
            depends_on: Vec::new(),
            summary: String::new(),
            state: StepState::Pending,
            attempts: 0,
            approval_id: None,
            approved: false,
            last_error: None,
            result: None,
            updated_at: Utc::now(),
        }
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.user_visible = false;
        self
    }

    pub fn depends_on(mut self, dependency: impl Into<StepId>) -> Self {
        self.depends_on.push(dependency.into());
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    /// Attempt-independent key a downstream service can use to deduplicate retries.
    pub fn idempotency_key(&self, task_id: &TaskId) -> String {
        format!("{}:{}", task_id, self.id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub intent: Intent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub steps: Vec<Step>,
    pub lifecycle: TaskLifecycle,
    pub state: TaskState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<String>,
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    pub fn new(id: TaskId, intent: Intent, idempotency_key: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            intent,
            idempotency_key,
            category: None,
            steps: Vec::new(),
            lifecycle: TaskLifecycle::Created,
            state: TaskState::Created,
            result: None,
            error_summary: None,
            revision: 1,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn step(&self, step_id: &StepId) -> Option<&Step> {
        self.steps.iter().find(|step| &step.id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &StepId) -> Option<&mut Step> {
        self.steps.iter_mut().find(|step| &step.id == step_id)
    }

    pub fn to_snapshot(&self) -> TaskSnapshot {
        let count = |state: StepState| self.steps.iter().filter(|s| s.state == state).count();
        TaskSnapshot {
            task_id: self.id.clone(),
            intent_id: self.intent.id.clone(),
            requester: self.intent.requester.clone(),
            category: self.category.clone(),
            state: self.state,
            step_count: self.steps.len(),
            steps_succeeded: count(StepState::Succeeded),
            steps_failed: count(StepState::Failed),
            steps_skipped: count(StepState::Skipped),
            awaiting_approval: count(StepState::PendingApproval),
            steps: self.steps.clone(),
            result: self.result.clone(),
            error_summary: self.error_summary.clone(),
            revision: self.revision,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Point-in-time view of a task for callers polling status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    #[serde(rename = "taskID")]
    pub task_id: TaskId,
    #[serde(rename = "intentID")]
    pub intent_id: crate::IntentId,
    pub requester: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    pub state: TaskState,
    pub step_count: usize,
    pub steps_succeeded: usize,
    pub steps_failed: usize,
    pub steps_skipped: usize,
    pub awaiting_approval: usize,
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<String>,
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One entry of the append-only transition log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub seq: u64,
    pub task_id: TaskId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<StepId>,
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub attempt: u32,
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_ignores_attempts() {
        let task_id = TaskId::new("task_1");
        let mut step = Step::new("send", Capability::Mail, "send_message").sensitive();
        let first = step.idempotency_key(&task_id);
        step.attempts = 3;
        assert_eq!(first, step.idempotency_key(&task_id));
        assert_eq!(first, "task_1:send");
    }

    #[test]
    fn snapshot_counts_step_states() {
        let intent = Intent::text("sam", "hello");
        let mut task = Task::new(TaskId::new("task_1"), intent, None);
        let mut done = Step::new("a", Capability::Grounding, "answer");
        done.state = StepState::Succeeded;
        let mut waiting = Step::new("b", Capability::Mail, "send_message").sensitive();
        waiting.state = StepState::PendingApproval;
        task.steps = vec![done, waiting];

        let snapshot = task.to_snapshot();
        assert_eq!(snapshot.step_count, 2);
        assert_eq!(snapshot.steps_succeeded, 1);
        assert_eq!(snapshot.awaiting_approval, 1);
    }

    #[test]
    fn terminal_states_are_flagged() {
        assert!(TaskState::PartiallyFailed.is_terminal());
        assert!(!TaskState::AwaitingApproval.is_terminal());
        assert!(StepState::Skipped.is_terminal());
        assert!(!StepState::PendingApproval.is_terminal());
    }
}
