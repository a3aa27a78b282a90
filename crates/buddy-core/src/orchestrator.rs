use std::sync::Arc;
use std::time::Duration;

use buddy_orchestrator::{Plan, Planner};
use buddy_types::{
    ApprovalDecision, ApprovalId, ApprovalRequest, ApprovalState, EngineEvent, Intent, TaskId,
    TaskSnapshot, TransitionRecord,
};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::approval::ApprovalGate;
use crate::cancellation::CancellationRegistry;
use crate::capability::{CapabilityHealth, CapabilityRouter};
use crate::config::OrchestratorConfig;
use crate::dispatcher::Dispatcher;
use crate::error::OrchestratorError;
use crate::event_bus::EventBus;
use crate::registry::TaskRegistry;
use crate::store::OrchestratorStore;

#[derive(Debug, Clone, Serialize)]
pub struct Submitted {
    #[serde(rename = "taskID")]
    pub task_id: TaskId,
    /// False when the idempotency key matched an existing task.
    pub created: bool,
}

/// Entry point for submitting intents, deciding approvals and observing tasks.
#[derive(Clone)]
pub struct Orchestrator {
    registry: TaskRegistry,
    gate: ApprovalGate,
    dispatcher: Dispatcher,
    cancellations: CancellationRegistry,
    event_bus: EventBus,
    planner: Arc<Planner>,
    router: Arc<CapabilityRouter>,
    store: Option<Arc<OrchestratorStore>>,
}

impl Orchestrator {
    pub fn new(
        config: &OrchestratorConfig,
        router: CapabilityRouter,
        store: Option<OrchestratorStore>,
    ) -> Self {
        let event_bus = EventBus::new();
        let store = store.map(Arc::new);
        let registry = TaskRegistry::new(
            event_bus.clone(),
            store.clone(),
            config.retry.max_attempts(),
        );
        let mut gate = ApprovalGate::new(event_bus.clone(), config.approval_timeout());
        if let Some(store) = &store {
            gate = gate.with_store(store.clone());
        }
        let planner = Arc::new(config.planner());
        let router = Arc::new(router);
        let dispatcher = Dispatcher::new(
            registry.clone(),
            gate.clone(),
            router.clone(),
            planner.clone(),
            config.retry.clone(),
            config.max_parallel_steps,
        );
        Self {
            registry,
            gate,
            dispatcher,
            cancellations: CancellationRegistry::new(),
            event_bus,
            planner,
            router,
            store,
        }
    }

    /// Builds an orchestrator persisting under `config.state_dir` when one is set.
    pub fn open(
        config: &OrchestratorConfig,
        router: CapabilityRouter,
    ) -> Result<Self, OrchestratorError> {
        let store = match &config.state_dir {
            Some(dir) => Some(OrchestratorStore::new(dir)?),
            None => None,
        };
        Ok(Self::new(config, router, store))
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn gate(&self) -> &ApprovalGate {
        &self.gate
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.event_bus.subscribe()
    }

    /// Registers the intent as a task and starts driving it in the background.
    ///
    /// Resubmitting with a known idempotency key returns the existing task and
    /// starts nothing.
    pub async fn submit(&self, intent: Intent, idempotency_key: Option<String>) -> Submitted {
        let (task_id, created) = self.registry.create(intent, idempotency_key).await;
        if created {
            self.spawn_task(task_id.clone()).await;
        } else {
            tracing::info!(task_id = %task_id, "duplicate submission resolved to existing task");
        }
        Submitted { task_id, created }
    }

    async fn spawn_task(&self, task_id: TaskId) {
        let cancel = self.cancellations.create(&task_id).await;
        let dispatcher = self.dispatcher.clone();
        let cancellations = self.cancellations.clone();
        let registry = self.registry.clone();
        let gate = self.gate.clone();
        tokio::spawn(async move {
            dispatcher.run_task(task_id.clone(), cancel).await;
            cancellations.remove(&task_id).await;
            if registry.archive(&task_id).await {
                gate.archive_task(&task_id).await;
            }
        });
    }

    pub async fn status(&self, task_id: &TaskId) -> Result<TaskSnapshot, OrchestratorError> {
        self.registry.snapshot(task_id).await
    }

    pub async fn list_tasks(&self) -> Vec<TaskSnapshot> {
        self.registry.list().await
    }

    /// Ordered transition log for one task.
    pub async fn history(&self, task_id: &TaskId) -> Result<Vec<TransitionRecord>, OrchestratorError> {
        self.registry.transitions(task_id).await
    }

    /// Cancels a task. Calling it on a task that already finished is a no-op.
    pub async fn cancel(&self, task_id: &TaskId) -> Result<TaskSnapshot, OrchestratorError> {
        let task = self.registry.cancel(task_id).await?;
        let interrupted = self.cancellations.cancel(task_id).await;
        let withdrawn = self.gate.withdraw_for_task(task_id).await;
        tracing::info!(
            task_id = %task_id,
            state = task.state.as_str(),
            interrupted,
            withdrawn,
            "task cancel requested"
        );
        Ok(task.to_snapshot())
    }

    pub async fn decide(
        &self,
        approval_id: &ApprovalId,
        decision: ApprovalDecision,
        decider: Option<String>,
    ) -> Result<ApprovalRequest, OrchestratorError> {
        Ok(self.gate.decide(approval_id, decision, decider).await?)
    }

    pub async fn list_pending_approvals(&self) -> Vec<ApprovalRequest> {
        self.gate.list_pending().await
    }

    pub async fn get_approval(&self, approval_id: &ApprovalId) -> Result<ApprovalRequest, OrchestratorError> {
        Ok(self.gate.get(approval_id).await?)
    }

    pub async fn approvals_for_task(
        &self,
        task_id: &TaskId,
    ) -> Result<Vec<ApprovalRequest>, OrchestratorError> {
        self.registry.snapshot(task_id).await?;
        Ok(self.gate.list_for_task(task_id).await)
    }

    /// Waits until the task reaches a terminal state or `timeout` passes, then
    /// returns its snapshot either way.
    pub async fn wait_for_terminal(
        &self,
        task_id: &TaskId,
        timeout: Duration,
    ) -> Result<TaskSnapshot, OrchestratorError> {
        let mut rx = self.registry.watch_state(task_id).await?;
        let _ = tokio::time::timeout(timeout, rx.wait_for(|state| state.is_terminal())).await;
        self.registry.snapshot(task_id).await
    }

    /// Plans an intent without registering a task.
    pub fn plan_preview(&self, intent: &Intent) -> Result<Plan, OrchestratorError> {
        Ok(self.planner.plan(intent)?)
    }

    pub async fn capability_health(&self) -> Vec<CapabilityHealth> {
        self.router.health().await
    }

    /// Reloads persisted tasks and resumes every one that had not finished.
    ///
    /// Steps caught mid-call or mid-approval go back to pending; their approval
    /// requests from the previous run are recorded as withdrawn and stay known
    /// to the gate, so a late decision on one is refused as expired.
    pub async fn recover(&self) -> Result<usize, OrchestratorError> {
        let Some(store) = self.store.clone() else {
            return Ok(0);
        };

        let mut stale = 0;
        for mut request in store.load_approvals()? {
            if request.state != ApprovalState::Pending {
                continue;
            }
            request.state = ApprovalState::Expired;
            request.withdrawn = true;
            request.decided_at = Some(Utc::now());
            store.save_approval(&request)?;
            self.gate.restore(request).await;
            stale += 1;
        }

        let mut resumed = 0;
        for task_id in store.list_task_ids()? {
            let task = match store.load_task(&task_id) {
                Ok(task) => task,
                Err(err) => {
                    tracing::warn!(task_id = %task_id, "skipping unreadable task: {err}");
                    continue;
                }
            };
            let transitions = store.load_transitions(&task_id)?;
            let finished = task.state.is_terminal();
            self.registry.restore(task, transitions).await;
            if finished {
                // keeps the idempotency key, drops the task body
                self.registry.archive(&task_id).await;
                continue;
            }
            self.registry.requeue_in_flight(&task_id).await?;
            self.spawn_task(task_id).await;
            resumed += 1;
        }
        tracing::info!(resumed, stale_approvals = stale, "recovery finished");
        Ok(resumed)
    }
}
