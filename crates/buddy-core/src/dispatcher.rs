use std::collections::HashSet;
use std::sync::Arc;

use buddy_observability::{emit_event, ObservabilityEvent, ProcessKind};
use buddy_orchestrator::{Planner, RetryPolicy, StepEvent, StepScheduler};
use buddy_types::{
    ApprovalState, CapabilityRequest, Step, StepFailureReason, StepId, StepState, TaskId,
    TaskLifecycle,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use crate::approval::ApprovalGate;
use crate::capability::CapabilityRouter;
use crate::error::OrchestratorError;
use crate::registry::TaskRegistry;

/// Turns a task's intent into a plan and drives its steps to terminal states.
#[derive(Clone)]
pub struct Dispatcher {
    registry: TaskRegistry,
    gate: ApprovalGate,
    router: Arc<CapabilityRouter>,
    planner: Arc<Planner>,
    retry: RetryPolicy,
    permits: Arc<Semaphore>,
}

enum StepExit {
    Finished,
    Interrupted,
}

impl Dispatcher {
    pub fn new(
        registry: TaskRegistry,
        gate: ApprovalGate,
        router: Arc<CapabilityRouter>,
        planner: Arc<Planner>,
        retry: RetryPolicy,
        max_parallel_steps: usize,
    ) -> Self {
        Self {
            registry,
            gate,
            router,
            planner,
            retry,
            permits: Arc::new(Semaphore::new(max_parallel_steps.max(1))),
        }
    }

    /// Plans the task if needed, then runs it until every step is terminal or `cancel` fires.
    pub async fn run_task(&self, task_id: TaskId, cancel: CancellationToken) {
        match self.ensure_planned(&task_id).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(err) => {
                tracing::warn!(task_id = %task_id, "planning failed: {err}");
                return;
            }
        }
        self.drive(&task_id, &cancel).await;
    }

    /// Returns whether the task has a plan to execute.
    async fn ensure_planned(&self, task_id: &TaskId) -> Result<bool, OrchestratorError> {
        let Some(task) = self.registry.task(task_id).await else {
            return Err(OrchestratorError::TaskNotFound(task_id.clone()));
        };
        if task.state.is_terminal() {
            return Ok(false);
        }
        match task.lifecycle {
            TaskLifecycle::Planned => return Ok(true),
            TaskLifecycle::Created => {
                self.registry.begin_planning(task_id).await?;
            }
            TaskLifecycle::Planning => {}
            TaskLifecycle::PlanRejected | TaskLifecycle::Cancelled => return Ok(false),
        }

        match self.planner.plan(&task.intent) {
            Ok(plan) => {
                tracing::info!(
                    task_id = %task_id,
                    category = %plan.category,
                    steps = plan.steps.len(),
                    "plan built"
                );
                let task = self
                    .registry
                    .install_plan(task_id, plan.category, plan.steps)
                    .await?;
                Ok(!task.state.is_terminal())
            }
            Err(err) => {
                emit_event(
                    Level::WARN,
                    ProcessKind::Engine,
                    ObservabilityEvent::new("dispatcher", "plan.rejected")
                        .task(task_id.as_str())
                        .error_code("plan_rejected")
                        .detail(&err.to_string()),
                );
                self.registry.reject_plan(task_id, err.to_string()).await?;
                Ok(false)
            }
        }
    }

    async fn drive(&self, task_id: &TaskId, cancel: &CancellationToken) {
        let mut running: JoinSet<()> = JoinSet::new();
        let mut spawned: HashSet<StepId> = HashSet::new();

        loop {
            if cancel.is_cancelled() {
                break;
            }
            let Some(task) = self.registry.task(task_id).await else {
                break;
            };
            if task.state.is_terminal() {
                break;
            }

            for step in StepScheduler::ready_steps(&task.steps) {
                if spawned.insert(step.id.clone()) {
                    let worker = self.clone();
                    let task_id = task_id.clone();
                    let step_id = step.id.clone();
                    let cancel = cancel.clone();
                    running.spawn(async move {
                        worker.run_step(&task_id, &step_id, &cancel).await;
                    });
                }
            }

            if running.is_empty() {
                tracing::error!(task_id = %task_id, state = task.state.as_str(), "task stalled with no runnable steps");
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                joined = running.join_next() => {
                    if let Some(Err(err)) = joined {
                        tracing::error!(task_id = %task_id, "step worker aborted: {err}");
                    }
                }
            }
        }

        // workers watch the same token; wait for them to observe it
        while running.join_next().await.is_some() {}
    }

    /// Carries one step through its approval cycle (if sensitive) and its attempts.
    async fn run_step(&self, task_id: &TaskId, step_id: &StepId, cancel: &CancellationToken) {
        let Some(step) = self.registry.step(task_id, step_id).await else {
            return;
        };

        let mut preapproved = None;
        if step.sensitive && !step.approved {
            match self.approval_cycle(task_id, &step, cancel).await {
                Some(permit) => preapproved = Some(permit),
                None => return,
            }
        }

        loop {
            let (permit, step) = match preapproved.take() {
                Some(permit) => match self.registry.step(task_id, step_id).await {
                    Some(step) => (permit, step),
                    None => return,
                },
                None => {
                    let Some(permit) = self.acquire(cancel).await else {
                        return;
                    };
                    match self
                        .registry
                        .apply_step(task_id, step_id, StepEvent::Dispatch)
                        .await
                    {
                        Ok(step) => (permit, step),
                        Err(err) => {
                            tracing::debug!(task_id = %task_id, step_id = %step_id, "dispatch refused: {err}");
                            return;
                        }
                    }
                }
            };

            match self.attempt(task_id, step, permit, cancel).await {
                StepExit::Finished => return,
                StepExit::Interrupted => {}
            }
        }
    }

    /// Returns a permit for the dispatched step on approval, `None` when the step is done.
    async fn approval_cycle(
        &self,
        task_id: &TaskId,
        step: &Step,
        cancel: &CancellationToken,
    ) -> Option<OwnedSemaphorePermit> {
        if cancel.is_cancelled() {
            return None;
        }
        let waiting = self.registry.task(task_id).await.is_some_and(|task| {
            !task.state.is_terminal()
                && task
                    .step(&step.id)
                    .is_some_and(|current| current.state == StepState::Pending)
        });
        if !waiting {
            tracing::debug!(task_id = %task_id, step_id = %step.id, "step no longer needs approval");
            return None;
        }

        let request = match self.gate.submit(task_id, step).await {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!(task_id = %task_id, step_id = %step.id, "approval submit failed: {err}");
                return None;
            }
        };

        let requested = self
            .registry
            .apply_step(
                task_id,
                &step.id,
                StepEvent::RequestApproval {
                    approval_id: request.id.clone(),
                },
            )
            .await;
        if let Err(err) = requested {
            tracing::debug!(task_id = %task_id, step_id = %step.id, "approval not needed anymore: {err}");
            let _ = self.gate.withdraw(&request.id).await;
            return None;
        }

        let outcome = match self.gate.wait(&request.id, cancel).await {
            Ok(state) => state,
            Err(err) => {
                tracing::warn!(task_id = %task_id, step_id = %step.id, "approval wait failed: {err}");
                return None;
            }
        };
        let resolved = self.gate.get(&request.id).await.ok();

        let (reason, message) = match outcome {
            ApprovalState::Approved => {
                let permit = self.acquire(cancel).await?;
                return match self
                    .registry
                    .apply_step(task_id, &step.id, StepEvent::Approve)
                    .await
                {
                    Ok(_) => Some(permit),
                    Err(err) => {
                        tracing::debug!(task_id = %task_id, step_id = %step.id, "approved step not dispatched: {err}");
                        None
                    }
                };
            }
            ApprovalState::Rejected => {
                let decider = resolved
                    .and_then(|r| r.decider)
                    .unwrap_or_else(|| "approver".to_string());
                (
                    StepFailureReason::ApprovalRejected,
                    format!("rejected by {decider}"),
                )
            }
            ApprovalState::Expired => {
                let withdrawn = resolved.map(|r| r.withdrawn).unwrap_or(false);
                let message = if withdrawn {
                    "approval withdrawn"
                } else {
                    "approval deadline passed"
                };
                (StepFailureReason::ApprovalExpired, message.to_string())
            }
            ApprovalState::Pending => return None,
        };

        if let Err(err) = self
            .registry
            .apply_step(task_id, &step.id, StepEvent::Deny { reason, message })
            .await
        {
            tracing::debug!(task_id = %task_id, step_id = %step.id, "denial not applied: {err}");
        }
        None
    }

    async fn attempt(
        &self,
        task_id: &TaskId,
        step: Step,
        permit: OwnedSemaphorePermit,
        cancel: &CancellationToken,
    ) -> StepExit {
        let request = CapabilityRequest {
            capability: step.capability,
            operation: step.operation.clone(),
            payload: step.request.clone(),
            idempotency_key: step.idempotency_key(task_id),
        };
        tracing::debug!(
            task_id = %task_id,
            step_id = %step.id,
            capability = step.capability.as_str(),
            attempt = step.attempts,
            "invoking capability"
        );
        let outcome = self.router.invoke(&request, cancel).await;
        drop(permit);

        let event = match outcome {
            Ok(payload) => StepEvent::Succeed { payload },
            Err(failure) => {
                emit_event(
                    Level::WARN,
                    ProcessKind::Engine,
                    ObservabilityEvent::new("dispatcher", "capability.failed")
                        .task(task_id.as_str())
                        .step(step.id.as_str())
                        .capability(step.capability.as_str())
                        .error_code(failure.kind.as_str())
                        .detail(&failure.message),
                );
                StepEvent::Fail { failure }
            }
        };
        let updated = match self.registry.apply_step(task_id, &step.id, event).await {
            Ok(updated) => updated,
            Err(err) => {
                // late result for a cancelled task or a step already settled
                tracing::debug!(task_id = %task_id, step_id = %step.id, "result discarded: {err}");
                return StepExit::Finished;
            }
        };
        if updated.state != StepState::Pending {
            return StepExit::Finished;
        }

        let delay = self.retry.backoff(updated.attempts);
        tracing::info!(
            task_id = %task_id,
            step_id = %step.id,
            attempt = updated.attempts,
            delay_ms = delay.as_millis() as u64,
            "retrying after transient failure"
        );
        tokio::select! {
            _ = cancel.cancelled() => StepExit::Finished,
            _ = tokio::time::sleep(delay) => StepExit::Interrupted,
        }
    }

    async fn acquire(&self, cancel: &CancellationToken) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            _ = cancel.cancelled() => None,
            permit = self.permits.clone().acquire_owned() => permit.ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use buddy_types::{Capability, Intent};

    use super::*;
    use crate::event_bus::EventBus;

    fn dispatcher(registry: &TaskRegistry, gate: &ApprovalGate) -> Dispatcher {
        Dispatcher::new(
            registry.clone(),
            gate.clone(),
            Arc::new(CapabilityRouter::new(Duration::from_secs(1))),
            Arc::new(Planner::default()),
            RetryPolicy::default(),
            2,
        )
    }

    async fn planned_send(registry: &TaskRegistry) -> (TaskId, Step) {
        let (task_id, _) = registry
            .create(Intent::text("sam", "send check-in message to Alex"), None)
            .await;
        registry.begin_planning(&task_id).await.expect("planning");
        registry
            .install_plan(
                &task_id,
                "check_in".to_string(),
                vec![Step::new("send", Capability::Mail, "send_message").sensitive()],
            )
            .await
            .expect("plan");
        let step = registry
            .step(&task_id, &StepId::new("send"))
            .await
            .expect("step");
        (task_id, step)
    }

    #[tokio::test]
    async fn cancelled_task_opens_no_approval() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let registry = TaskRegistry::new(bus.clone(), None, 3);
        let gate = ApprovalGate::new(bus, Duration::from_secs(60));
        let (task_id, step) = planned_send(&registry).await;
        registry.cancel(&task_id).await.expect("cancel");

        let permit = dispatcher(&registry, &gate)
            .approval_cycle(&task_id, &step, &CancellationToken::new())
            .await;
        assert!(permit.is_none());
        assert!(gate.list_for_task(&task_id).await.is_empty());
        while let Ok(event) = rx.try_recv() {
            assert_ne!(event.event_type, "approval.requested");
        }
    }

    #[tokio::test]
    async fn withdrawn_approval_fails_the_step() {
        let bus = EventBus::new();
        let registry = TaskRegistry::new(bus.clone(), None, 3);
        let gate = ApprovalGate::new(bus, Duration::from_secs(60));
        let (task_id, step) = planned_send(&registry).await;
        let cancel = CancellationToken::new();

        let worker = dispatcher(&registry, &gate);
        let cycle = {
            let task_id = task_id.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { worker.approval_cycle(&task_id, &step, &cancel).await.is_some() })
        };
        let started = tokio::time::Instant::now();
        while gate.list_pending().await.is_empty() {
            assert!(started.elapsed() < Duration::from_secs(5), "no approval requested");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        assert!(!cycle.await.expect("join"));

        let requests = gate.list_for_task(&task_id).await;
        assert_eq!(requests.len(), 1);
        assert!(requests[0].withdrawn);
        let send = registry
            .step(&task_id, &StepId::new("send"))
            .await
            .expect("step");
        assert_eq!(send.state, StepState::Failed);
        assert_eq!(
            send.last_error.map(|e| e.reason),
            Some(StepFailureReason::ApprovalExpired)
        );
    }
}
