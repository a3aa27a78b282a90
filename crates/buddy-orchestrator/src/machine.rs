use buddy_types::{
    ApprovalId, CapabilityFailure, Step, StepError, StepFailureReason, StepId, StepState, Task,
    TaskId, TaskLifecycle, TaskState,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::StepScheduler;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("step `{0}` not found")]
    StepNotFound(StepId),
    #[error("step `{step_id}` is already {}", state.as_str())]
    StepTerminal { step_id: StepId, state: StepState },
    #[error("step `{step_id}` cannot {event} while {}", from.as_str())]
    InvalidStepTransition {
        step_id: StepId,
        from: StepState,
        event: &'static str,
    },
    #[error("step `{0}` is sensitive and has not been approved")]
    ApprovalRequired(StepId),
    #[error("step `{0}` does not require approval")]
    NotSensitive(StepId),
    #[error("step `{step_id}` waits on dependencies {waiting_on:?}")]
    DependenciesUnmet {
        step_id: StepId,
        waiting_on: Vec<StepId>,
    },
    #[error("step `{step_id}` reached its retry ceiling after {attempts} attempts")]
    RetryCeilingReached { step_id: StepId, attempts: u32 },
    #[error("task `{task_id}` is {} and accepts no further transitions", state.as_str())]
    TaskClosed { task_id: TaskId, state: TaskState },
    #[error("task lifecycle cannot move from {from:?} to {to:?}")]
    InvalidLifecycle {
        from: TaskLifecycle,
        to: TaskLifecycle,
    },
}

/// Input that drives one step transition.
#[derive(Debug, Clone)]
pub enum StepEvent {
    RequestApproval { approval_id: ApprovalId },
    /// Approval granted; the step is dispatched in the same transition.
    Approve,
    Deny {
        reason: StepFailureReason,
        message: String,
    },
    Dispatch,
    Succeed { payload: Value },
    Fail { failure: CapabilityFailure },
    Skip {
        reason: StepFailureReason,
        message: String,
    },
    /// Returns an interrupted step to `Pending`, used when resuming after a restart.
    Requeue,
}

impl StepEvent {
    pub fn name(&self) -> &'static str {
        match self {
            StepEvent::RequestApproval { .. } => "request_approval",
            StepEvent::Approve => "approve",
            StepEvent::Deny { .. } => "deny",
            StepEvent::Dispatch => "dispatch",
            StepEvent::Succeed { .. } => "succeed",
            StepEvent::Fail { .. } => "fail",
            StepEvent::Skip { .. } => "skip",
            StepEvent::Requeue => "requeue",
        }
    }

    fn needs_dependencies(&self) -> bool {
        matches!(
            self,
            StepEvent::RequestApproval { .. } | StepEvent::Approve | StepEvent::Dispatch
        )
    }
}

/// One applied change, either to a step (`step_id` set) or to the task aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub step_id: Option<StepId>,
    pub from: String,
    pub to: String,
    pub reason: Option<String>,
    pub attempt: u32,
}

pub fn validate_step_transition(from: StepState, to: StepState) -> bool {
    valid_step_transitions(from).contains(&to)
}

pub fn valid_step_transitions(from: StepState) -> &'static [StepState] {
    match from {
        StepState::Pending => &[
            StepState::PendingApproval,
            StepState::Dispatched,
            StepState::Skipped,
        ],
        StepState::PendingApproval => &[
            StepState::Dispatched,
            StepState::Failed,
            StepState::Skipped,
            StepState::Pending,
        ],
        StepState::Dispatched => &[
            StepState::Succeeded,
            StepState::Failed,
            StepState::Pending,
            StepState::Skipped,
        ],
        StepState::Succeeded | StepState::Failed | StepState::Skipped => &[],
    }
}

/// Applies `event` to a single step. Returns the state the step left.
pub fn apply_step_event(
    step: &mut Step,
    event: StepEvent,
    max_attempts: u32,
) -> Result<StepState, TransitionError> {
    let from = step.state;
    if from.is_terminal() {
        return Err(TransitionError::StepTerminal {
            step_id: step.id.clone(),
            state: from,
        });
    }
    let name = event.name();
    let max_attempts = max_attempts.max(1);

    match event {
        StepEvent::RequestApproval { approval_id } => {
            if from != StepState::Pending || step.approved {
                return Err(invalid(step, name));
            }
            if !step.sensitive {
                return Err(TransitionError::NotSensitive(step.id.clone()));
            }
            step.state = StepState::PendingApproval;
            step.approval_id = Some(approval_id);
        }
        StepEvent::Approve => {
            if from != StepState::PendingApproval {
                return Err(invalid(step, name));
            }
            ensure_attempts_left(step, max_attempts)?;
            step.approved = true;
            step.state = StepState::Dispatched;
            step.attempts += 1;
        }
        StepEvent::Deny { reason, message } => {
            if from != StepState::PendingApproval {
                return Err(invalid(step, name));
            }
            step.state = StepState::Failed;
            step.last_error = Some(StepError::new(reason, message));
        }
        StepEvent::Dispatch => {
            if from != StepState::Pending {
                return Err(invalid(step, name));
            }
            if step.sensitive && !step.approved {
                return Err(TransitionError::ApprovalRequired(step.id.clone()));
            }
            ensure_attempts_left(step, max_attempts)?;
            step.state = StepState::Dispatched;
            step.attempts += 1;
        }
        StepEvent::Succeed { payload } => {
            if from != StepState::Dispatched {
                return Err(invalid(step, name));
            }
            step.state = StepState::Succeeded;
            step.result = Some(payload);
            step.last_error = None;
        }
        StepEvent::Fail { failure } => {
            if from != StepState::Dispatched {
                return Err(invalid(step, name));
            }
            let (state, reason, message) = if !failure.retryable {
                (
                    StepState::Failed,
                    StepFailureReason::TerminalCapabilityError,
                    failure.message.clone(),
                )
            } else if step.attempts >= max_attempts {
                (
                    StepState::Failed,
                    StepFailureReason::RetryCeilingExceeded,
                    format!("gave up after {} attempts: {}", step.attempts, failure.message),
                )
            } else {
                (
                    StepState::Pending,
                    StepFailureReason::TransientCapabilityError,
                    failure.message.clone(),
                )
            };
            step.state = state;
            step.last_error = Some(StepError {
                reason,
                message,
                kind: Some(failure.kind),
            });
        }
        StepEvent::Skip { reason, message } => {
            step.state = StepState::Skipped;
            step.last_error = Some(StepError::new(reason, message));
        }
        StepEvent::Requeue => match from {
            StepState::Dispatched => {
                // the interrupted attempt never reported back
                step.attempts = step.attempts.saturating_sub(1);
                step.state = StepState::Pending;
            }
            StepState::PendingApproval => {
                step.state = StepState::Pending;
                step.approval_id = None;
            }
            _ => return Err(invalid(step, name)),
        },
    }

    debug_assert!(validate_step_transition(from, step.state));
    step.updated_at = Utc::now();
    Ok(from)
}

fn invalid(step: &Step, event: &'static str) -> TransitionError {
    TransitionError::InvalidStepTransition {
        step_id: step.id.clone(),
        from: step.state,
        event,
    }
}

fn ensure_attempts_left(step: &Step, max_attempts: u32) -> Result<(), TransitionError> {
    if step.attempts >= max_attempts {
        return Err(TransitionError::RetryCeilingReached {
            step_id: step.id.clone(),
            attempts: step.attempts,
        });
    }
    Ok(())
}

/// Aggregate task state as a pure function of lifecycle and steps.
pub fn derive_task_state(lifecycle: TaskLifecycle, steps: &[Step]) -> TaskState {
    match lifecycle {
        TaskLifecycle::Cancelled => return TaskState::Cancelled,
        TaskLifecycle::Created => return TaskState::Created,
        TaskLifecycle::Planning => return TaskState::Planning,
        TaskLifecycle::PlanRejected => return TaskState::Failed,
        TaskLifecycle::Planned => {}
    }
    if steps.is_empty() {
        return TaskState::Failed;
    }

    if StepScheduler::all_terminal(steps) {
        if steps.iter().all(|s| s.state == StepState::Succeeded) {
            return TaskState::Completed;
        }
        let visible_success = steps
            .iter()
            .any(|s| s.state == StepState::Succeeded && s.user_visible);
        return if visible_success {
            TaskState::PartiallyFailed
        } else {
            TaskState::Failed
        };
    }

    if steps.iter().any(|s| s.state == StepState::PendingApproval) {
        return TaskState::AwaitingApproval;
    }
    let started = steps
        .iter()
        .any(|s| s.state != StepState::Pending || s.attempts > 0);
    if started {
        TaskState::Running
    } else {
        TaskState::Planning
    }
}

/// Applies transitions to a whole task and keeps its aggregate consistent.
pub struct TaskMachine;

impl TaskMachine {
    pub fn begin_planning(task: &mut Task) -> Result<Vec<Transition>, TransitionError> {
        Self::move_lifecycle(task, TaskLifecycle::Created, TaskLifecycle::Planning)?;
        Ok(Self::finalize(task, Vec::new(), None))
    }

    pub fn install_plan(
        task: &mut Task,
        category: impl Into<String>,
        steps: Vec<Step>,
    ) -> Result<Vec<Transition>, TransitionError> {
        Self::move_lifecycle(task, TaskLifecycle::Planning, TaskLifecycle::Planned)?;
        task.category = Some(category.into());
        task.steps = steps;
        Ok(Self::finalize(task, Vec::new(), Some("planned")))
    }

    pub fn reject_plan(
        task: &mut Task,
        message: impl Into<String>,
    ) -> Result<Vec<Transition>, TransitionError> {
        Self::move_lifecycle(task, TaskLifecycle::Planning, TaskLifecycle::PlanRejected)?;
        task.error_summary = Some(message.into());
        Ok(Self::finalize(task, Vec::new(), Some("plan_rejected")))
    }

    /// Applies one step event, then skips newly unreachable steps and re-derives the task.
    pub fn apply(
        task: &mut Task,
        step_id: &StepId,
        event: StepEvent,
        max_attempts: u32,
    ) -> Result<Vec<Transition>, TransitionError> {
        if task.state.is_terminal() {
            return Err(TransitionError::TaskClosed {
                task_id: task.id.clone(),
                state: task.state,
            });
        }
        if task.lifecycle != TaskLifecycle::Planned {
            return Err(TransitionError::InvalidLifecycle {
                from: task.lifecycle,
                to: TaskLifecycle::Planned,
            });
        }
        let index = task
            .steps
            .iter()
            .position(|s| &s.id == step_id)
            .ok_or_else(|| TransitionError::StepNotFound(step_id.clone()))?;

        let dispatching = matches!(event, StepEvent::Dispatch | StepEvent::Approve);
        if event.needs_dependencies() {
            let waiting_on = StepScheduler::unmet_dependencies(&task.steps, &task.steps[index]);
            if !waiting_on.is_empty() {
                return Err(TransitionError::DependenciesUnmet {
                    step_id: step_id.clone(),
                    waiting_on,
                });
            }
        }
        let inputs = dispatching.then(|| bind_inputs(&task.steps, &task.steps[index]));

        let step = &mut task.steps[index];
        let from = apply_step_event(step, event, max_attempts)?;
        if let Some(inputs) = inputs {
            if let Some(request) = step.request.as_object_mut() {
                request.insert("inputs".to_string(), Value::Object(inputs));
            }
        }
        let transition = step_transition(step, from);
        Ok(Self::finalize(task, vec![transition], None))
    }

    /// Marks every non-terminal step skipped. Repeated calls are no-ops.
    pub fn cancel(task: &mut Task) -> Vec<Transition> {
        if task.state.is_terminal() {
            return Vec::new();
        }
        task.lifecycle = TaskLifecycle::Cancelled;
        let mut transitions = Vec::new();
        for step in task.steps.iter_mut().filter(|s| !s.state.is_terminal()) {
            let event = StepEvent::Skip {
                reason: StepFailureReason::TaskCancelled,
                message: "task cancelled".to_string(),
            };
            if let Ok(from) = apply_step_event(step, event, u32::MAX) {
                transitions.push(step_transition(step, from));
            }
        }
        Self::finalize(task, transitions, Some("cancelled"))
    }

    /// Returns interrupted steps to `Pending` so a resumed run can re-drive them.
    pub fn requeue_in_flight(task: &mut Task) -> Vec<Transition> {
        if task.state.is_terminal() || task.lifecycle != TaskLifecycle::Planned {
            return Vec::new();
        }
        let mut transitions = Vec::new();
        for step in task.steps.iter_mut().filter(|s| {
            matches!(s.state, StepState::Dispatched | StepState::PendingApproval)
        }) {
            if let Ok(from) = apply_step_event(step, StepEvent::Requeue, u32::MAX) {
                transitions.push(step_transition(step, from));
            }
        }
        Self::finalize(task, transitions, None)
    }

    pub fn is_consistent(task: &Task) -> bool {
        derive_task_state(task.lifecycle, &task.steps) == task.state
    }

    fn move_lifecycle(
        task: &mut Task,
        expected: TaskLifecycle,
        to: TaskLifecycle,
    ) -> Result<(), TransitionError> {
        if task.lifecycle != expected {
            return Err(TransitionError::InvalidLifecycle {
                from: task.lifecycle,
                to,
            });
        }
        task.lifecycle = to;
        Ok(())
    }

    fn finalize(
        task: &mut Task,
        mut transitions: Vec<Transition>,
        lifecycle_note: Option<&str>,
    ) -> Vec<Transition> {
        transitions.extend(skip_unreachable(&mut task.steps));

        let previous = task.state;
        task.state = derive_task_state(task.lifecycle, &task.steps);
        if task.state != previous {
            transitions.push(Transition {
                step_id: None,
                from: previous.as_str().to_string(),
                to: task.state.as_str().to_string(),
                reason: lifecycle_note.map(str::to_string),
                attempt: 0,
            });
        }
        if task.state.is_terminal() {
            summarize(task);
        }
        if !transitions.is_empty() || lifecycle_note.is_some() {
            task.revision = task.revision.saturating_add(1);
            task.updated_at = Utc::now();
        }
        transitions
    }
}

fn step_transition(step: &Step, from: StepState) -> Transition {
    Transition {
        step_id: Some(step.id.clone()),
        from: from.as_str().to_string(),
        to: step.state.as_str().to_string(),
        reason: step
            .last_error
            .as_ref()
            .filter(|_| step.state != StepState::Succeeded && step.state != StepState::Dispatched)
            .map(|err| err.reason.as_str().to_string()),
        attempt: step.attempts,
    }
}

fn bind_inputs(steps: &[Step], step: &Step) -> Map<String, Value> {
    step.depends_on
        .iter()
        .filter_map(|dep| {
            steps
                .iter()
                .find(|candidate| &candidate.id == dep)
                .map(|candidate| {
                    (
                        dep.to_string(),
                        candidate.result.clone().unwrap_or(Value::Null),
                    )
                })
        })
        .collect()
}

/// Skips steps whose dependencies ended without success, until nothing changes.
fn skip_unreachable(steps: &mut [Step]) -> Vec<Transition> {
    let mut transitions = Vec::new();
    loop {
        let blocked: Vec<(StepId, StepId)> = StepScheduler::unreachable_steps(steps)
            .into_iter()
            .filter_map(|step| {
                step.depends_on
                    .iter()
                    .find(|dep| {
                        steps.iter().any(|s| {
                            &s.id == *dep
                                && matches!(s.state, StepState::Failed | StepState::Skipped)
                        })
                    })
                    .map(|dep| (step.id.clone(), dep.clone()))
            })
            .collect();
        if blocked.is_empty() {
            return transitions;
        }
        for (step_id, dep) in blocked {
            let Some(step) = steps.iter_mut().find(|s| s.id == step_id) else {
                continue;
            };
            let event = StepEvent::Skip {
                reason: StepFailureReason::DependencyUnmet,
                message: format!("dependency `{dep}` did not succeed"),
            };
            if let Ok(from) = apply_step_event(step, event, u32::MAX) {
                transitions.push(step_transition(step, from));
            }
        }
    }
}

fn summarize(task: &mut Task) {
    let results: Map<String, Value> = task
        .steps
        .iter()
        .filter(|s| s.state == StepState::Succeeded && s.user_visible)
        .filter_map(|s| s.result.clone().map(|r| (s.id.to_string(), r)))
        .collect();
    task.result = (!results.is_empty()).then_some(Value::Object(results));

    let failures: Vec<String> = task
        .steps
        .iter()
        .filter_map(|s| {
            s.last_error
                .as_ref()
                .filter(|_| matches!(s.state, StepState::Failed | StepState::Skipped))
                .map(|err| format!("{}: {} ({})", s.id, err.reason.as_str(), err.message))
        })
        .collect();
    if !failures.is_empty() {
        task.error_summary = Some(failures.join("; "));
    }
}
