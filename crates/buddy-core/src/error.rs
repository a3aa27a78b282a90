use buddy_orchestrator::{PlanError, TransitionError};
use buddy_types::TaskId;
use thiserror::Error;

use crate::approval::GateError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("task `{0}` not found")]
    TaskNotFound(TaskId),
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl OrchestratorError {
    /// Stable machine-readable code for API clients.
    pub fn code(&self) -> &'static str {
        match self {
            OrchestratorError::TaskNotFound(_) => "TASK_NOT_FOUND",
            OrchestratorError::Gate(GateError::NotFound(_)) => "APPROVAL_NOT_FOUND",
            OrchestratorError::Gate(GateError::AlreadyDecided { .. }) => "APPROVAL_ALREADY_DECIDED",
            OrchestratorError::Gate(GateError::Expired(_)) => "APPROVAL_EXPIRED",
            OrchestratorError::Gate(GateError::DuplicateRequest { .. }) => "APPROVAL_DUPLICATE",
            OrchestratorError::Gate(GateError::NotSensitive(_)) => "APPROVAL_NOT_REQUIRED",
            OrchestratorError::Plan(_) => "PLAN_REJECTED",
            OrchestratorError::Transition(_) => "INVALID_TRANSITION",
            OrchestratorError::Store(_) => "STORE_ERROR",
        }
    }
}
