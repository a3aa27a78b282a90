use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use buddy_observability::{emit_event, redact_text, ObservabilityEvent, ProcessKind};
use buddy_orchestrator::{StepEvent, TaskMachine, Transition, TransitionError};
use buddy_types::{
    EngineEvent, Intent, Step, StepId, Task, TaskId, TaskSnapshot, TaskState, TransitionRecord,
};
use chrono::Utc;
use serde_json::json;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::Level;

use crate::error::OrchestratorError;
use crate::event_bus::EventBus;
use crate::store::OrchestratorStore;

struct TaskRecord {
    task: Task,
    transitions: Vec<TransitionRecord>,
    state_tx: watch::Sender<TaskState>,
}

impl TaskRecord {
    fn new(task: Task, transitions: Vec<TransitionRecord>) -> Self {
        let (state_tx, _) = watch::channel(task.state);
        Self {
            task,
            transitions,
            state_tx,
        }
    }
}

/// Owns every task and is the only writer of task and step state.
///
/// Each task sits behind its own mutex so transitions for one task are totally
/// ordered while unrelated tasks never contend.
#[derive(Clone)]
pub struct TaskRegistry {
    tasks: Arc<RwLock<HashMap<TaskId, Arc<Mutex<TaskRecord>>>>>,
    idempotency: Arc<Mutex<HashMap<String, TaskId>>>,
    event_bus: EventBus,
    store: Option<Arc<OrchestratorStore>>,
    max_attempts: u32,
}

impl TaskRegistry {
    pub fn new(event_bus: EventBus, store: Option<Arc<OrchestratorStore>>, max_attempts: u32) -> Self {
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
            idempotency: Arc::new(Mutex::new(HashMap::new())),
            event_bus,
            store,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Creates a task, or returns the one already registered under `idempotency_key`.
    pub async fn create(&self, intent: Intent, idempotency_key: Option<String>) -> (TaskId, bool) {
        let mut index = self.idempotency.lock().await;
        if let Some(existing) = idempotency_key.as_ref().and_then(|key| index.get(key)) {
            return (existing.clone(), false);
        }

        let task = Task::new(TaskId::generate(), intent, idempotency_key.clone());
        let task_id = task.id.clone();
        self.tasks.write().await.insert(
            task_id.clone(),
            Arc::new(Mutex::new(TaskRecord::new(task.clone(), Vec::new()))),
        );
        if let Some(key) = idempotency_key {
            index.insert(key, task_id.clone());
        }
        drop(index);

        self.event_bus.publish(EngineEvent::new(
            "task.created",
            json!({
                "taskID": task_id,
                "intentID": task.intent.id,
                "requester": task.intent.requester,
                "idempotencyKey": task.idempotency_key,
            }),
        ));
        let redacted = redact_text(task.intent.text_content().unwrap_or_default());
        emit_event(
            Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent::new("registry", "task.created")
                .task(task_id.as_str())
                .status(task.state.as_str())
                .detail(&redacted),
        );
        self.persist(&task, &[]);
        (task_id, true)
    }

    /// Re-registers a task loaded from the store.
    pub async fn restore(&self, task: Task, transitions: Vec<TransitionRecord>) {
        let task_id = task.id.clone();
        if let Some(key) = task.idempotency_key.clone() {
            self.idempotency.lock().await.insert(key, task_id.clone());
        }
        self.tasks
            .write()
            .await
            .insert(task_id, Arc::new(Mutex::new(TaskRecord::new(task, transitions))));
    }

    /// Drops a finished task from memory once its snapshot is on disk. Later
    /// lookups reload it from the store. Returns whether the task was archived.
    pub async fn archive(&self, task_id: &TaskId) -> bool {
        if self.store.is_none() {
            return false;
        }
        let mut tasks = self.tasks.write().await;
        let Some(record) = tasks.get(task_id).cloned() else {
            return false;
        };
        let finished = record.lock().await.task.state.is_terminal();
        if finished {
            tasks.remove(task_id);
            tracing::debug!(task_id = %task_id, "task archived");
        }
        finished
    }

    async fn record(&self, task_id: &TaskId) -> Result<Arc<Mutex<TaskRecord>>, OrchestratorError> {
        if let Some(record) = self.tasks.read().await.get(task_id).cloned() {
            return Ok(record);
        }
        let Some(store) = self.store.as_ref().filter(|store| store.contains_task(task_id)) else {
            return Err(OrchestratorError::TaskNotFound(task_id.clone()));
        };
        let task = store.load_task(task_id)?;
        let transitions = store.load_transitions(task_id)?;
        let record = self
            .tasks
            .write()
            .await
            .entry(task_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(TaskRecord::new(task, transitions))))
            .clone();
        Ok(record)
    }

    pub async fn task(&self, task_id: &TaskId) -> Option<Task> {
        let record = self.record(task_id).await.ok()?;
        let task = record.lock().await.task.clone();
        Some(task)
    }

    pub async fn step(&self, task_id: &TaskId, step_id: &StepId) -> Option<Step> {
        let record = self.record(task_id).await.ok()?;
        let step = record.lock().await.task.step(step_id).cloned();
        step
    }

    pub async fn snapshot(&self, task_id: &TaskId) -> Result<TaskSnapshot, OrchestratorError> {
        let record = self.record(task_id).await?;
        let snapshot = record.lock().await.task.to_snapshot();
        Ok(snapshot)
    }

    /// Every known task, archived ones included, oldest first.
    pub async fn list(&self) -> Vec<TaskSnapshot> {
        let records: Vec<_> = self.tasks.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(records.len());
        for record in records {
            out.push(record.lock().await.task.to_snapshot());
        }
        if let Some(store) = &self.store {
            let live: HashSet<TaskId> = out.iter().map(|snapshot| snapshot.task_id.clone()).collect();
            match store.list_task_ids() {
                Ok(ids) => {
                    for id in ids.into_iter().filter(|id| !live.contains(id)) {
                        match store.load_task(&id) {
                            Ok(task) => out.push(task.to_snapshot()),
                            Err(err) => tracing::warn!(task_id = %id, "skipping unreadable task: {err}"),
                        }
                    }
                }
                Err(err) => tracing::warn!("failed to list archived tasks: {err}"),
            }
        }
        out.sort_by_key(|snapshot| snapshot.created_at);
        out
    }

    pub async fn transitions(
        &self,
        task_id: &TaskId,
    ) -> Result<Vec<TransitionRecord>, OrchestratorError> {
        let record = self.record(task_id).await?;
        let transitions = record.lock().await.transitions.clone();
        Ok(transitions)
    }

    pub async fn watch_state(
        &self,
        task_id: &TaskId,
    ) -> Result<watch::Receiver<TaskState>, OrchestratorError> {
        let record = self.record(task_id).await?;
        let rx = record.lock().await.state_tx.subscribe();
        Ok(rx)
    }

    /// Runs one state-machine operation under the task's lock, then records,
    /// publishes and persists whatever it changed. Returns the updated task.
    pub async fn update<F>(&self, task_id: &TaskId, op: F) -> Result<Task, OrchestratorError>
    where
        F: FnOnce(&mut Task) -> Result<Vec<Transition>, TransitionError>,
    {
        let record = self.record(task_id).await?;
        let mut guard = record.lock().await;
        let record = &mut *guard;

        let revision = record.task.revision;
        let applied = op(&mut record.task)?;
        if record.task.revision == revision {
            return Ok(record.task.clone());
        }

        let now = Utc::now();
        let mut logged = Vec::with_capacity(applied.len());
        for transition in applied {
            let entry = TransitionRecord {
                seq: record.transitions.len() as u64 + 1,
                task_id: task_id.clone(),
                step_id: transition.step_id,
                from: transition.from,
                to: transition.to,
                reason: transition.reason,
                attempt: transition.attempt,
                at: now,
            };
            self.announce(&record.task, &entry);
            record.transitions.push(entry.clone());
            logged.push(entry);
        }
        record.state_tx.send_if_modified(|state| {
            let changed = *state != record.task.state;
            *state = record.task.state;
            changed
        });
        self.persist(&record.task, &logged);
        Ok(record.task.clone())
    }

    pub async fn apply_step(
        &self,
        task_id: &TaskId,
        step_id: &StepId,
        event: StepEvent,
    ) -> Result<Step, OrchestratorError> {
        let max_attempts = self.max_attempts;
        let task = self
            .update(task_id, |task| {
                TaskMachine::apply(task, step_id, event, max_attempts)
            })
            .await?;
        task.step(step_id)
            .cloned()
            .ok_or_else(|| TransitionError::StepNotFound(step_id.clone()).into())
    }

    pub async fn begin_planning(&self, task_id: &TaskId) -> Result<Task, OrchestratorError> {
        self.update(task_id, TaskMachine::begin_planning).await
    }

    pub async fn install_plan(
        &self,
        task_id: &TaskId,
        category: String,
        steps: Vec<Step>,
    ) -> Result<Task, OrchestratorError> {
        let task = self
            .update(task_id, move |task| {
                TaskMachine::install_plan(task, category, steps)
            })
            .await?;
        let steps: Vec<_> = task
            .steps
            .iter()
            .map(|step| {
                json!({
                    "stepID": step.id,
                    "capability": step.capability,
                    "operation": step.operation,
                    "sensitive": step.sensitive,
                    "dependsOn": step.depends_on,
                })
            })
            .collect();
        self.event_bus.publish(EngineEvent::new(
            "task.planned",
            json!({
                "taskID": task.id,
                "category": task.category,
                "steps": steps,
            }),
        ));
        Ok(task)
    }

    pub async fn reject_plan(&self, task_id: &TaskId, message: String) -> Result<Task, OrchestratorError> {
        self.update(task_id, move |task| TaskMachine::reject_plan(task, message))
            .await
    }

    pub async fn cancel(&self, task_id: &TaskId) -> Result<Task, OrchestratorError> {
        self.update(task_id, |task| Ok(TaskMachine::cancel(task))).await
    }

    pub async fn requeue_in_flight(&self, task_id: &TaskId) -> Result<Task, OrchestratorError> {
        self.update(task_id, |task| Ok(TaskMachine::requeue_in_flight(task)))
            .await
    }

    fn announce(&self, task: &Task, entry: &TransitionRecord) {
        let (event_type, component) = match &entry.step_id {
            Some(_) => ("step.state_changed", "task_machine.step"),
            None => ("task.state_changed", "task_machine.task"),
        };
        self.event_bus.publish(EngineEvent::new(
            event_type,
            json!({
                "taskID": entry.task_id,
                "stepID": entry.step_id,
                "seq": entry.seq,
                "from": entry.from,
                "to": entry.to,
                "reason": entry.reason,
                "attempt": entry.attempt,
                "taskState": task.state,
                "revision": task.revision,
            }),
        ));

        let level = if entry.to == "failed" {
            Level::WARN
        } else {
            Level::INFO
        };
        let capability = entry
            .step_id
            .as_ref()
            .and_then(|id| task.step(id))
            .map(|step| step.capability.as_str());
        let mut obs = ObservabilityEvent::new(component, event_type)
            .task(entry.task_id.as_str())
            .status(entry.to.as_str());
        if let Some(step_id) = &entry.step_id {
            obs = obs.step(step_id.as_str());
        }
        if let Some(capability) = capability {
            obs = obs.capability(capability);
        }
        if let Some(reason) = &entry.reason {
            obs = obs.error_code(reason.as_str());
        }
        emit_event(level, ProcessKind::Engine, obs);
    }

    fn persist(&self, task: &Task, logged: &[TransitionRecord]) {
        let Some(store) = &self.store else {
            return;
        };
        for entry in logged {
            if let Err(err) = store.append_transition(entry) {
                tracing::warn!(task_id = %task.id, "failed to append transition: {err}");
            }
        }
        if let Err(err) = store.save_task(task) {
            tracing::warn!(task_id = %task.id, "failed to save task snapshot: {err}");
        }
    }
}
