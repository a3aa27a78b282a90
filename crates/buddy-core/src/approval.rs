use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use buddy_observability::{emit_event, ObservabilityEvent, ProcessKind};
use buddy_types::{
    ApprovalDecision, ApprovalId, ApprovalRequest, ApprovalState, EngineEvent, Step, StepId,
    TaskId,
};
use chrono::Utc;
use serde_json::json;
use thiserror::Error;
use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::event_bus::EventBus;
use crate::store::OrchestratorStore;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateError {
    #[error("step `{step_id}` of task `{task_id}` already has an approval request")]
    DuplicateRequest { task_id: TaskId, step_id: StepId },
    #[error("step `{0}` is not sensitive and needs no approval")]
    NotSensitive(StepId),
    #[error("approval request `{0}` not found")]
    NotFound(ApprovalId),
    #[error("approval request `{id}` is already {}", state.as_str())]
    AlreadyDecided { id: ApprovalId, state: ApprovalState },
    #[error("approval request `{0}` expired")]
    Expired(ApprovalId),
}

struct ApprovalSlot {
    request: Mutex<ApprovalRequest>,
    state_tx: watch::Sender<ApprovalState>,
}

/// Holds sensitive steps until a human approves, rejects, or the deadline passes.
///
/// Each request resolves exactly once; whichever of `decide`, `expire` or
/// `withdraw` takes the slot lock first wins and the others observe the result.
#[derive(Clone)]
pub struct ApprovalGate {
    requests: Arc<RwLock<HashMap<ApprovalId, Arc<ApprovalSlot>>>>,
    by_step: Arc<RwLock<HashMap<(TaskId, StepId), ApprovalId>>>,
    timeout: Duration,
    event_bus: EventBus,
    store: Option<Arc<OrchestratorStore>>,
}

impl ApprovalGate {
    pub fn new(event_bus: EventBus, timeout: Duration) -> Self {
        Self {
            requests: Arc::new(RwLock::new(HashMap::new())),
            by_step: Arc::new(RwLock::new(HashMap::new())),
            timeout,
            event_bus,
            store: None,
        }
    }

    /// Keeps an audit copy of every request and its resolution.
    pub fn with_store(mut self, store: Arc<OrchestratorStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Opens the single approval cycle a sensitive step is allowed.
    pub async fn submit(&self, task_id: &TaskId, step: &Step) -> Result<ApprovalRequest, GateError> {
        if !step.sensitive {
            return Err(GateError::NotSensitive(step.id.clone()));
        }
        let now = Utc::now();
        let deadline = now
            + chrono::Duration::from_std(self.timeout)
                .unwrap_or_else(|_| chrono::Duration::minutes(15));
        let request = ApprovalRequest {
            id: ApprovalId::generate(),
            task_id: task_id.clone(),
            step_id: step.id.clone(),
            capability: step.capability,
            summary: step.summary.clone(),
            state: ApprovalState::Pending,
            requested_at: now,
            deadline,
            decided_at: None,
            decider: None,
            withdrawn: false,
        };

        {
            let mut by_step = self.by_step.write().await;
            let key = (task_id.clone(), step.id.clone());
            if by_step.contains_key(&key) {
                return Err(GateError::DuplicateRequest {
                    task_id: task_id.clone(),
                    step_id: step.id.clone(),
                });
            }
            by_step.insert(key, request.id.clone());
            let (state_tx, _) = watch::channel(ApprovalState::Pending);
            self.requests.write().await.insert(
                request.id.clone(),
                Arc::new(ApprovalSlot {
                    request: Mutex::new(request.clone()),
                    state_tx,
                }),
            );
        }

        self.persist(&request);
        self.event_bus.publish(EngineEvent::new(
            "approval.requested",
            json!({
                "approvalID": request.id,
                "taskID": request.task_id,
                "stepID": request.step_id,
                "capability": request.capability,
                "summary": request.summary,
                "deadline": request.deadline,
            }),
        ));
        emit_event(
            tracing::Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent::new("approval_gate", "approval.requested")
                .task(request.task_id.as_str())
                .step(request.step_id.as_str())
                .approval(request.id.as_str())
                .capability(request.capability.as_str())
                .status("pending"),
        );
        Ok(request)
    }

    pub async fn decide(
        &self,
        id: &ApprovalId,
        decision: ApprovalDecision,
        decider: Option<String>,
    ) -> Result<ApprovalRequest, GateError> {
        let slot = match self.slot(id).await {
            Ok(slot) => slot,
            Err(err) => {
                return Err(match self.archived(id) {
                    Some(request) => late_decision_error(request),
                    None => err,
                })
            }
        };
        let mut request = slot.request.lock().await;
        match request.state {
            ApprovalState::Expired => return Err(GateError::Expired(id.clone())),
            ApprovalState::Approved | ApprovalState::Rejected => {
                return Err(GateError::AlreadyDecided {
                    id: id.clone(),
                    state: request.state,
                })
            }
            ApprovalState::Pending => {}
        }
        if request.is_past_deadline(Utc::now()) {
            self.resolve_locked(&slot, &mut request, ApprovalState::Expired, false);
            return Err(GateError::Expired(id.clone()));
        }

        request.decider = decider;
        let state = match decision {
            ApprovalDecision::Approve => ApprovalState::Approved,
            ApprovalDecision::Reject => ApprovalState::Rejected,
        };
        self.resolve_locked(&slot, &mut request, state, false);
        Ok(request.clone())
    }

    /// Suspends until the request resolves, expiring it at its deadline.
    ///
    /// Cancelling `cancel` withdraws the request, which resolves it as expired.
    pub async fn wait(
        &self,
        id: &ApprovalId,
        cancel: &CancellationToken,
    ) -> Result<ApprovalState, GateError> {
        let slot = self.slot(id).await?;
        let mut rx = slot.state_tx.subscribe();
        let deadline = slot.request.lock().await.deadline;

        loop {
            let current = *rx.borrow_and_update();
            if current.is_resolved() {
                return Ok(current);
            }
            let remaining = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Ok(self.withdraw(id).await?);
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Ok(slot.request.lock().await.state);
                    }
                }
                _ = tokio::time::sleep(remaining) => {
                    self.expire(id).await?;
                }
            }
        }
    }

    /// Resolves a pending request as expired. Returns the state that won.
    pub async fn expire(&self, id: &ApprovalId) -> Result<ApprovalState, GateError> {
        let slot = self.slot(id).await?;
        let mut request = slot.request.lock().await;
        if request.state == ApprovalState::Pending {
            self.resolve_locked(&slot, &mut request, ApprovalState::Expired, false);
        }
        Ok(request.state)
    }

    /// Resolves a pending request as moot because its task went away.
    pub async fn withdraw(&self, id: &ApprovalId) -> Result<ApprovalState, GateError> {
        let slot = self.slot(id).await?;
        let mut request = slot.request.lock().await;
        if request.state == ApprovalState::Pending {
            self.resolve_locked(&slot, &mut request, ApprovalState::Expired, true);
        }
        Ok(request.state)
    }

    pub async fn withdraw_for_task(&self, task_id: &TaskId) -> usize {
        let ids: Vec<ApprovalId> = self
            .by_step
            .read()
            .await
            .iter()
            .filter(|((owner, _), _)| owner == task_id)
            .map(|(_, id)| id.clone())
            .collect();
        let mut withdrawn = 0;
        for id in ids {
            if let Ok(slot) = self.slot(&id).await {
                let mut request = slot.request.lock().await;
                if request.state == ApprovalState::Pending {
                    self.resolve_locked(&slot, &mut request, ApprovalState::Expired, true);
                    withdrawn += 1;
                }
            }
        }
        withdrawn
    }

    pub async fn get(&self, id: &ApprovalId) -> Result<ApprovalRequest, GateError> {
        match self.slot(id).await {
            Ok(slot) => {
                let request = slot.request.lock().await.clone();
                Ok(request)
            }
            Err(err) => self.archived(id).ok_or(err),
        }
    }

    pub async fn list_pending(&self) -> Vec<ApprovalRequest> {
        let mut out = self.list_where(|r| r.state == ApprovalState::Pending).await;
        out.sort_by_key(|r| r.requested_at);
        out
    }

    /// Live and archived requests for one task, oldest first.
    pub async fn list_for_task(&self, task_id: &TaskId) -> Vec<ApprovalRequest> {
        let mut out = self.list_where(|r| &r.task_id == task_id).await;
        if let Some(store) = &self.store {
            match store.load_approvals() {
                Ok(stored) => {
                    let live: HashSet<ApprovalId> = out.iter().map(|r| r.id.clone()).collect();
                    out.extend(
                        stored
                            .into_iter()
                            .filter(|r| &r.task_id == task_id && !live.contains(&r.id)),
                    );
                }
                Err(err) => tracing::warn!(task_id = %task_id, "failed to read archived approvals: {err}"),
            }
        }
        out.sort_by_key(|r| r.requested_at);
        out
    }

    /// Re-registers a request from a previous run so lookups and late decisions
    /// still find it. The request keeps its resolution and does not block a new
    /// request for the same step.
    pub async fn restore(&self, request: ApprovalRequest) {
        let (state_tx, _) = watch::channel(request.state);
        self.requests
            .write()
            .await
            .entry(request.id.clone())
            .or_insert_with(|| {
                Arc::new(ApprovalSlot {
                    request: Mutex::new(request),
                    state_tx,
                })
            });
    }

    /// Drops a finished task's resolved requests from memory. Only a gate with a
    /// store archives; lookups then read the stored copy.
    pub async fn archive_task(&self, task_id: &TaskId) -> usize {
        if self.store.is_none() {
            return 0;
        }
        let slots: Vec<(ApprovalId, Arc<ApprovalSlot>)> = self
            .requests
            .read()
            .await
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();
        let mut resolved = HashSet::new();
        for (id, slot) in slots {
            let request = slot.request.lock().await;
            if &request.task_id == task_id && request.state.is_resolved() {
                resolved.insert(id);
            }
        }
        if resolved.is_empty() {
            return 0;
        }

        let mut by_step = self.by_step.write().await;
        by_step.retain(|_, id| !resolved.contains(id));
        let mut requests = self.requests.write().await;
        requests.retain(|id, _| !resolved.contains(id));
        tracing::debug!(task_id = %task_id, archived = resolved.len(), "approvals archived");
        resolved.len()
    }

    async fn list_where(&self, keep: impl Fn(&ApprovalRequest) -> bool) -> Vec<ApprovalRequest> {
        let slots: Vec<Arc<ApprovalSlot>> = self.requests.read().await.values().cloned().collect();
        let mut out = Vec::new();
        for slot in slots {
            let request = slot.request.lock().await;
            if keep(&request) {
                out.push(request.clone());
            }
        }
        out
    }

    async fn slot(&self, id: &ApprovalId) -> Result<Arc<ApprovalSlot>, GateError> {
        self.requests
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| GateError::NotFound(id.clone()))
    }

    fn archived(&self, id: &ApprovalId) -> Option<ApprovalRequest> {
        let store = self.store.as_ref()?;
        match store.load_approval(id) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!(approval_id = %id, "failed to read archived approval: {err}");
                None
            }
        }
    }

    fn persist(&self, request: &ApprovalRequest) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(err) = store.save_approval(request) {
            tracing::warn!(approval_id = %request.id, "failed to save approval: {err}");
        }
    }

    fn resolve_locked(
        &self,
        slot: &ApprovalSlot,
        request: &mut ApprovalRequest,
        state: ApprovalState,
        withdrawn: bool,
    ) {
        request.state = state;
        request.decided_at = Some(Utc::now());
        request.withdrawn = withdrawn;
        slot.state_tx.send_replace(state);
        self.persist(request);

        let event_type = match (state, withdrawn) {
            (_, true) => "approval.withdrawn",
            (ApprovalState::Expired, false) => "approval.expired",
            _ => "approval.decided",
        };
        self.event_bus.publish(EngineEvent::new(
            event_type,
            json!({
                "approvalID": request.id,
                "taskID": request.task_id,
                "stepID": request.step_id,
                "state": state,
                "decider": request.decider,
            }),
        ));
        emit_event(
            tracing::Level::INFO,
            ProcessKind::Engine,
            ObservabilityEvent::new("approval_gate", event_type)
                .task(request.task_id.as_str())
                .step(request.step_id.as_str())
                .approval(request.id.as_str())
                .status(state.as_str()),
        );
    }
}

/// A stored request is never pending from this process's point of view: it
/// was either resolved here or left behind by a previous run.
fn late_decision_error(request: ApprovalRequest) -> GateError {
    match request.state {
        ApprovalState::Approved | ApprovalState::Rejected => GateError::AlreadyDecided {
            id: request.id,
            state: request.state,
        },
        ApprovalState::Expired | ApprovalState::Pending => GateError::Expired(request.id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buddy_types::Capability;

    fn sensitive_step() -> Step {
        Step::new("send", Capability::Mail, "send_message")
            .sensitive()
            .with_summary("Send message to Alex")
    }

    fn gate(timeout: Duration) -> ApprovalGate {
        ApprovalGate::new(EventBus::new(), timeout)
    }

    #[tokio::test]
    async fn wait_returns_decision() {
        let gate = gate(Duration::from_secs(60));
        let task_id = TaskId::new("task_1");
        let request = gate.submit(&task_id, &sensitive_step()).await.expect("submit");

        let deciding = gate.clone();
        let id = request.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            deciding
                .decide(&id, ApprovalDecision::Approve, Some("pat".to_string()))
                .await
                .expect("decide");
        });

        let state = gate
            .wait(&request.id, &CancellationToken::new())
            .await
            .expect("wait");
        assert_eq!(state, ApprovalState::Approved);
        let stored = gate.get(&request.id).await.expect("get");
        assert_eq!(stored.decider.as_deref(), Some("pat"));
        assert!(stored.decided_at.is_some());
        assert!(gate.list_pending().await.is_empty());
    }

    #[tokio::test]
    async fn second_submit_for_same_step_is_rejected() {
        let gate = gate(Duration::from_secs(60));
        let task_id = TaskId::new("task_1");
        gate.submit(&task_id, &sensitive_step()).await.expect("submit");
        let err = gate.submit(&task_id, &sensitive_step()).await.unwrap_err();
        assert!(matches!(err, GateError::DuplicateRequest { .. }));

        let plain = Step::new("lookup", Capability::Grounding, "lookup_contact");
        assert!(matches!(
            gate.submit(&task_id, &plain).await,
            Err(GateError::NotSensitive(_))
        ));
    }

    #[tokio::test]
    async fn decide_reports_unknown_and_repeated_decisions() {
        let gate = gate(Duration::from_secs(60));
        let missing = gate
            .decide(&ApprovalId::new("appr_missing"), ApprovalDecision::Approve, None)
            .await;
        assert!(matches!(missing, Err(GateError::NotFound(_))));

        let request = gate
            .submit(&TaskId::new("task_1"), &sensitive_step())
            .await
            .expect("submit");
        gate.decide(&request.id, ApprovalDecision::Reject, None)
            .await
            .expect("reject");
        let again = gate.decide(&request.id, ApprovalDecision::Approve, None).await;
        assert_eq!(
            again.unwrap_err(),
            GateError::AlreadyDecided {
                id: request.id.clone(),
                state: ApprovalState::Rejected
            }
        );
    }

    #[tokio::test]
    async fn deadline_expires_exactly_once() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let gate = ApprovalGate::new(bus, Duration::from_millis(30));
        let request = gate
            .submit(&TaskId::new("task_1"), &sensitive_step())
            .await
            .expect("submit");

        let state = gate
            .wait(&request.id, &CancellationToken::new())
            .await
            .expect("wait");
        assert_eq!(state, ApprovalState::Expired);
        assert_eq!(gate.expire(&request.id).await, Ok(ApprovalState::Expired));

        let late = gate.decide(&request.id, ApprovalDecision::Approve, None).await;
        assert_eq!(late.unwrap_err(), GateError::Expired(request.id.clone()));

        let mut expired_events = 0;
        while let Ok(event) = rx.try_recv() {
            if event.event_type == "approval.expired" {
                expired_events += 1;
            }
        }
        assert_eq!(expired_events, 1);
    }

    #[tokio::test]
    async fn decide_after_deadline_expires_request() {
        let gate = gate(Duration::from_millis(5));
        let request = gate
            .submit(&TaskId::new("task_1"), &sensitive_step())
            .await
            .expect("submit");
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result = gate.decide(&request.id, ApprovalDecision::Approve, None).await;
        assert_eq!(result.unwrap_err(), GateError::Expired(request.id.clone()));
        assert_eq!(
            gate.get(&request.id).await.map(|r| r.state),
            Ok(ApprovalState::Expired)
        );
    }

    #[tokio::test]
    async fn cancellation_withdraws_pending_request() {
        let gate = gate(Duration::from_secs(60));
        let request = gate
            .submit(&TaskId::new("task_1"), &sensitive_step())
            .await
            .expect("submit");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let state = gate.wait(&request.id, &cancel).await.expect("wait");
        assert_eq!(state, ApprovalState::Expired);
        let stored = gate.get(&request.id).await.expect("get");
        assert!(stored.withdrawn);
        assert!(stored.decider.is_none());
    }

    #[tokio::test]
    async fn withdraw_for_task_only_touches_that_task() {
        let gate = gate(Duration::from_secs(60));
        let mine = gate
            .submit(&TaskId::new("task_1"), &sensitive_step())
            .await
            .expect("submit");
        let other = gate
            .submit(&TaskId::new("task_2"), &sensitive_step())
            .await
            .expect("submit");

        assert_eq!(gate.withdraw_for_task(&TaskId::new("task_1")).await, 1);
        assert_eq!(
            gate.get(&mine.id).await.map(|r| r.state),
            Ok(ApprovalState::Expired)
        );
        let pending = gate.list_pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, other.id);
    }

    #[tokio::test]
    async fn restored_request_answers_late_decisions_without_blocking_step() {
        let gate = gate(Duration::from_secs(60));
        let task_id = TaskId::new("task_1");
        let now = Utc::now();
        let stale = ApprovalRequest {
            id: ApprovalId::new("appr_stale"),
            task_id: task_id.clone(),
            step_id: StepId::new("send"),
            capability: buddy_types::Capability::Mail,
            summary: "Send message to Alex".to_string(),
            state: ApprovalState::Expired,
            requested_at: now,
            deadline: now,
            decided_at: Some(now),
            decider: None,
            withdrawn: true,
        };
        gate.restore(stale.clone()).await;

        let late = gate.decide(&stale.id, ApprovalDecision::Approve, None).await;
        assert_eq!(late.unwrap_err(), GateError::Expired(stale.id.clone()));
        assert!(gate.get(&stale.id).await.expect("get").withdrawn);

        let fresh = gate.submit(&task_id, &sensitive_step()).await.expect("submit");
        assert_ne!(fresh.id, stale.id);
        assert_eq!(gate.list_for_task(&task_id).await.len(), 2);
        assert_eq!(gate.list_pending().await.len(), 1);
    }

    #[tokio::test]
    async fn archived_requests_are_served_from_the_store() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(OrchestratorStore::new(dir.path()).expect("store"));
        let gate = gate(Duration::from_secs(60)).with_store(store);
        let task_id = TaskId::new("task_1");
        let decided = gate.submit(&task_id, &sensitive_step()).await.expect("submit");
        gate.decide(&decided.id, ApprovalDecision::Reject, Some("pat".to_string()))
            .await
            .expect("reject");
        let other_step = Step::new("notify", buddy_types::Capability::Mail, "send_message")
            .sensitive();
        let open = gate.submit(&task_id, &other_step).await.expect("submit");

        assert_eq!(gate.archive_task(&task_id).await, 1);
        assert!(gate.requests.read().await.get(&decided.id).is_none());
        assert!(gate.requests.read().await.get(&open.id).is_some());

        let stored = gate.get(&decided.id).await.expect("archived copy");
        assert_eq!(stored.state, ApprovalState::Rejected);
        assert_eq!(stored.decider.as_deref(), Some("pat"));
        let again = gate.decide(&decided.id, ApprovalDecision::Approve, None).await;
        assert_eq!(
            again.unwrap_err(),
            GateError::AlreadyDecided {
                id: decided.id.clone(),
                state: ApprovalState::Rejected
            }
        );
        let listed: Vec<ApprovalId> = gate
            .list_for_task(&task_id)
            .await
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(listed.len(), 2);
        assert!(listed.contains(&decided.id) && listed.contains(&open.id));
    }

    #[tokio::test]
    async fn gate_without_store_keeps_everything_in_memory() {
        let gate = gate(Duration::from_secs(60));
        let task_id = TaskId::new("task_1");
        let request = gate.submit(&task_id, &sensitive_step()).await.expect("submit");
        gate.withdraw(&request.id).await.expect("withdraw");

        assert_eq!(gate.archive_task(&task_id).await, 0);
        assert!(gate.get(&request.id).await.is_ok());
    }
}
