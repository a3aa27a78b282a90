use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of capability services a step can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Grounding,
    Calendar,
    Mail,
    AssignmentTracker,
}

impl Capability {
    pub const ALL: [Capability; 4] = [
        Capability::Grounding,
        Capability::Calendar,
        Capability::Mail,
        Capability::AssignmentTracker,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Capability::Grounding => "grounding",
            Capability::Calendar => "calendar",
            Capability::Mail => "mail",
            Capability::AssignmentTracker => "assignment_tracker",
        }
    }

    /// Name the backing service reports from its `/health` endpoint.
    pub fn service_name(self) -> &'static str {
        match self {
            Capability::Grounding => "ai-buddy-platform-grounding-service",
            Capability::Calendar => "ai-buddy-platform-calendar-manager",
            Capability::Mail => "ai-buddy-platform-outlook-mail-checker",
            Capability::AssignmentTracker => "ai-buddy-platform-assignment-tracker",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "grounding" | "context" => Ok(Capability::Grounding),
            "calendar" => Ok(Capability::Calendar),
            "mail" | "email" => Ok(Capability::Mail),
            "assignment_tracker" | "assignments" | "tracker" => Ok(Capability::AssignmentTracker),
            other => Err(format!("unknown capability `{other}`")),
        }
    }
}

/// Machine-readable failure category reported by a capability call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Unavailable,
    ServerError,
    RateLimited,
    BadRequest,
    PermissionDenied,
    NotFound,
    Unsupported,
    Cancelled,
}

impl FailureKind {
    /// Only transient categories feed the retry policy.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FailureKind::Timeout
                | FailureKind::Unavailable
                | FailureKind::ServerError
                | FailureKind::RateLimited
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::Unavailable => "unavailable",
            FailureKind::ServerError => "server_error",
            FailureKind::RateLimited => "rate_limited",
            FailureKind::BadRequest => "bad_request",
            FailureKind::PermissionDenied => "permission_denied",
            FailureKind::NotFound => "not_found",
            FailureKind::Unsupported => "unsupported",
            FailureKind::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityFailure {
    pub kind: FailureKind,
    pub retryable: bool,
    pub message: String,
}

impl CapabilityFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            retryable: kind.is_retryable(),
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Unavailable, message)
    }
}

impl fmt::Display for CapabilityFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}): {}",
            self.kind.as_str(),
            if self.retryable { "retryable" } else { "terminal" },
            self.message
        )
    }
}

impl std::error::Error for CapabilityFailure {}

/// A single call to a capability service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityRequest {
    pub capability: Capability,
    pub operation: String,
    pub payload: Value,
    /// Derived from task and step ids only, so every attempt of a step shares it.
    pub idempotency_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_parses_aliases() {
        assert_eq!(
            "assignment-tracker".parse::<Capability>(),
            Ok(Capability::AssignmentTracker)
        );
        assert_eq!("Email".parse::<Capability>(), Ok(Capability::Mail));
        assert!("weather".parse::<Capability>().is_err());
    }

    #[test]
    fn failure_retryability_follows_kind() {
        assert!(CapabilityFailure::timeout("slow").retryable);
        assert!(CapabilityFailure::new(FailureKind::ServerError, "500").retryable);
        assert!(!CapabilityFailure::new(FailureKind::PermissionDenied, "403").retryable);
        assert!(!CapabilityFailure::new(FailureKind::NotFound, "404").retryable);
    }
}
