use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use buddy_core::OrchestratorError;
use buddy_types::{ApprovalDecision, ApprovalId, EngineEvent, Intent, TaskId};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tower_http::cors::{Any, CorsLayer};

use crate::AppState;

const DEFAULT_REQUESTER: &str = "api";

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<String>,
}

type ApiError = (StatusCode, Json<ErrorEnvelope>);

fn bad_request(message: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorEnvelope {
            error: message.into(),
            code: Some("INVALID_REQUEST".to_string()),
        }),
    )
}

fn orchestrator_error(err: OrchestratorError) -> ApiError {
    let code = err.code();
    let status = match code {
        "TASK_NOT_FOUND" | "APPROVAL_NOT_FOUND" => StatusCode::NOT_FOUND,
        "APPROVAL_EXPIRED" => StatusCode::GONE,
        "PLAN_REJECTED" => StatusCode::BAD_REQUEST,
        "STORE_ERROR" => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::CONFLICT,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!("request failed: {err}");
    }
    (
        status,
        Json(ErrorEnvelope {
            error: err.to_string(),
            code: Some(code.to_string()),
        }),
    )
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("buddy-server listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if tokio::signal::ctrl_c().await.is_err() {
                futures::future::pending::<()>().await;
            }
        })
        .await?;
    Ok(())
}

pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/global/health", get(global_health))
        .route(
            "/global/config",
            get(global_config).patch(global_config_patch),
        )
        .route("/capability/health", get(capability_health))
        .route("/task", post(create_task).get(list_tasks))
        .route("/task/{id}", get(get_task))
        .route("/task/{id}/cancel", post(cancel_task))
        .route("/task/{id}/events", get(task_events))
        .route("/plan/preview", post(plan_preview))
        .route("/approval", get(list_approvals))
        .route("/approval/{id}", get(get_approval))
        .route("/approval/{id}/decide", post(decide_approval))
        .route("/event", get(events))
        .layer(cors)
        .with_state(state)
}

async fn global_health(State(state): State<AppState>) -> impl IntoResponse {
    let tasks = state.orchestrator.list_tasks().await;
    let active = tasks.iter().filter(|t| !t.state.is_terminal()).count();
    let pending = state.orchestrator.list_pending_approvals().await.len();
    Json(json!({
        "healthy": true,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_ms": state.uptime_ms(),
        "tasks": tasks.len(),
        "activeTasks": active,
        "pendingApprovals": pending,
    }))
}

async fn global_config(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "effective": state.config.get_effective_value().await,
        "layers": state.config.get_layers_value().await,
    }))
}

/// Config edits land in the project file when one is configured, otherwise in
/// the runtime layer. Either way they apply from the next start.
async fn global_config_patch(
    State(state): State<AppState>,
    Json(patch): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    if !patch.is_object() {
        return Err(bad_request("config patch must be a JSON object"));
    }
    let effective = match state.config.patch_project(patch.clone()).await {
        Ok(effective) => effective,
        Err(err) => {
            tracing::debug!("project config not writable, patching runtime layer: {err}");
            state.config.patch_runtime(patch).await
        }
    };
    Ok(Json(json!({
        "effective": effective,
        "restartRequired": true,
    })))
}

async fn capability_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "capabilities": state.orchestrator.capability_health().await }))
}

#[derive(Debug, Deserialize, Default)]
struct TaskCreateInput {
    text: Option<String>,
    payload: Option<Value>,
    category: Option<String>,
    requester: Option<String>,
    #[serde(rename = "idempotencyKey", alias = "idempotency_key")]
    idempotency_key: Option<String>,
}

impl TaskCreateInput {
    fn into_intent(self) -> Result<(Intent, Option<String>), ApiError> {
        let payload = match (self.payload, self.text) {
            (Some(payload), _) if !payload.is_null() => payload,
            (_, Some(text)) if !text.trim().is_empty() => Value::String(text),
            _ => return Err(bad_request("task needs `text` or `payload`")),
        };
        let requester = self
            .requester
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_REQUESTER.to_string());
        let mut intent = Intent::new(requester, payload);
        if let Some(category) = self.category.filter(|c| !c.trim().is_empty()) {
            intent = intent.with_category(category);
        }
        Ok((intent, self.idempotency_key))
    }
}

async fn create_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<TaskCreateInput>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let header_key = headers
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let (intent, body_key) = input.into_intent()?;
    let key = body_key.or(header_key).filter(|k| !k.trim().is_empty());

    let submitted = state.orchestrator.submit(intent, key).await;
    let task = state
        .orchestrator
        .status(&submitted.task_id)
        .await
        .map_err(orchestrator_error)?;
    let status = if submitted.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(json!({
            "taskID": submitted.task_id,
            "created": submitted.created,
            "task": task,
        })),
    ))
}

async fn list_tasks(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.orchestrator.list_tasks().await)
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let task = state
        .orchestrator
        .status(&TaskId::new(id))
        .await
        .map_err(orchestrator_error)?;
    Ok(Json(json!(task)))
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let task = state
        .orchestrator
        .cancel(&TaskId::new(id))
        .await
        .map_err(orchestrator_error)?;
    Ok(Json(json!(task)))
}

async fn task_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let task_id = TaskId::new(id);
    let transitions = state
        .orchestrator
        .history(&task_id)
        .await
        .map_err(orchestrator_error)?;
    let approvals = state
        .orchestrator
        .approvals_for_task(&task_id)
        .await
        .map_err(orchestrator_error)?;
    Ok(Json(json!({
        "taskID": task_id,
        "transitions": transitions,
        "approvals": approvals,
    })))
}

async fn plan_preview(
    State(state): State<AppState>,
    Json(input): Json<TaskCreateInput>,
) -> Result<Json<Value>, ApiError> {
    let (intent, _) = input.into_intent()?;
    let plan = state
        .orchestrator
        .plan_preview(&intent)
        .map_err(orchestrator_error)?;
    Ok(Json(json!({
        "category": plan.category,
        "steps": plan.steps,
    })))
}

#[derive(Debug, Deserialize, Default)]
struct ApprovalListQuery {
    #[serde(rename = "taskID", alias = "task_id")]
    task_id: Option<String>,
}

async fn list_approvals(
    State(state): State<AppState>,
    Query(query): Query<ApprovalListQuery>,
) -> Result<Json<Value>, ApiError> {
    let approvals = match query.task_id {
        Some(task_id) => state
            .orchestrator
            .approvals_for_task(&TaskId::new(task_id))
            .await
            .map_err(orchestrator_error)?,
        None => state.orchestrator.list_pending_approvals().await,
    };
    Ok(Json(json!(approvals)))
}

async fn get_approval(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let approval = state
        .orchestrator
        .get_approval(&ApprovalId::new(id))
        .await
        .map_err(orchestrator_error)?;
    Ok(Json(json!(approval)))
}

#[derive(Debug, Deserialize)]
struct DecideInput {
    decision: String,
    decider: Option<String>,
}

async fn decide_approval(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<DecideInput>,
) -> Result<Json<Value>, ApiError> {
    let decision: ApprovalDecision = input.decision.parse().map_err(bad_request)?;
    let approval = state
        .orchestrator
        .decide(&ApprovalId::new(id), decision, input.decider)
        .await
        .map_err(orchestrator_error)?;
    Ok(Json(json!(approval)))
}

#[derive(Debug, Deserialize, Default)]
struct EventFilterQuery {
    #[serde(rename = "taskID", alias = "task_id")]
    task_id: Option<String>,
}

fn event_matches_filter(event: &EngineEvent, filter: &EventFilterQuery) -> bool {
    match filter.task_id.as_deref() {
        Some(task_id) => event.task_id() == Some(task_id),
        None => true,
    }
}

fn sse_stream(
    state: AppState,
    filter: EventFilterQuery,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    let rx = state.orchestrator.subscribe();
    let initial = tokio_stream::once(Ok(Event::default().data(
        serde_json::to_string(&EngineEvent::new("server.connected", json!({}))).unwrap_or_default(),
    )));
    let live = BroadcastStream::new(rx).filter_map(move |msg| match msg {
        Ok(event) => {
            if !event_matches_filter(&event, &filter) {
                return None;
            }
            let payload = serde_json::to_string(&event).unwrap_or_default();
            Some(Ok(Event::default().data(payload)))
        }
        Err(_) => None,
    });
    initial.chain(live)
}

async fn events(
    State(state): State<AppState>,
    Query(filter): Query<EventFilterQuery>,
) -> Sse<impl Stream<Item = Result<Event, std::convert::Infallible>>> {
    Sse::new(sse_stream(state, filter)).keep_alive(KeepAlive::new().interval(Duration::from_secs(10)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use buddy_core::{
        CapabilityClient, CapabilityRouter, ConfigStore, Orchestrator, OrchestratorConfig,
    };
    use buddy_types::{Capability, CapabilityFailure, CapabilityRequest, TaskState};
    use tower::ServiceExt;

    struct EchoClient;

    #[async_trait]
    impl CapabilityClient for EchoClient {
        async fn invoke(&self, request: &CapabilityRequest) -> Result<Value, CapabilityFailure> {
            Ok(json!({ "operation": request.operation, "ok": true }))
        }
    }

    async fn test_state() -> AppState {
        let root = std::env::temp_dir().join(format!("buddy-http-test-{}", crate::now_ms()));
        std::env::set_var("BUDDY_GLOBAL_CONFIG", root.join("global-config.json"));
        let config = ConfigStore::new(None, None).await.expect("config");
        let mut router = CapabilityRouter::new(Duration::from_secs(1));
        for capability in Capability::ALL {
            router = router.with_client(capability, Arc::new(EchoClient));
        }
        let orchestrator = Orchestrator::new(&OrchestratorConfig::default(), router, None);
        AppState::new(orchestrator, config)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(body) => {
                builder = builder.header("content-type", "application/json");
                Body::from(body.to_string())
            }
            None => Body::empty(),
        };
        let resp = app
            .clone()
            .oneshot(builder.body(body).expect("request"))
            .await
            .expect("response");
        let status = resp.status();
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.expect("body");
        let payload = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, payload)
    }

    #[tokio::test]
    async fn global_health_route_returns_healthy_shape() {
        let app = app_router(test_state().await);
        let (status, payload) = send(&app, "GET", "/global/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(payload.get("healthy").and_then(|v| v.as_bool()), Some(true));
        assert!(payload.get("version").and_then(|v| v.as_str()).is_some());
        assert_eq!(payload.get("pendingApprovals").and_then(|v| v.as_u64()), Some(0));
    }

    #[tokio::test]
    async fn capability_health_lists_every_capability() {
        let app = app_router(test_state().await);
        let (status, payload) = send(&app, "GET", "/capability/health", None).await;
        assert_eq!(status, StatusCode::OK);
        let entries = payload["capabilities"].as_array().expect("array");
        assert_eq!(entries.len(), 4);
        assert!(entries.iter().all(|e| e["healthy"] == true));
    }

    #[tokio::test]
    async fn create_task_requires_text_or_payload() {
        let app = app_router(test_state().await);
        let (status, payload) = send(&app, "POST", "/task", Some(json!({ "text": "  " }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(payload["code"], "INVALID_REQUEST");
    }

    #[tokio::test]
    async fn create_task_is_idempotent_per_key() {
        let app = app_router(test_state().await);
        let body = json!({ "text": "plan my day", "idempotencyKey": "req-1" });
        let (first_status, first) = send(&app, "POST", "/task", Some(body.clone())).await;
        let (second_status, second) = send(&app, "POST", "/task", Some(body)).await;
        assert_eq!(first_status, StatusCode::CREATED);
        assert_eq!(second_status, StatusCode::OK);
        assert_eq!(first["taskID"], second["taskID"]);
        assert_eq!(second["created"], false);

        let (_, list) = send(&app, "GET", "/task", None).await;
        assert_eq!(list.as_array().map(|a| a.len()), Some(1));
    }

    #[tokio::test]
    async fn unknown_ids_return_not_found_envelope() {
        let app = app_router(test_state().await);
        let (status, payload) = send(&app, "GET", "/task/task_missing", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(payload["code"], "TASK_NOT_FOUND");

        let (status, payload) = send(
            &app,
            "POST",
            "/approval/appr_missing/decide",
            Some(json!({ "decision": "approve" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(payload["code"], "APPROVAL_NOT_FOUND");
    }

    #[tokio::test]
    async fn approval_routes_drive_sensitive_step() {
        let state = test_state().await;
        let app = app_router(state.clone());
        let (status, created) = send(
            &app,
            "POST",
            "/task",
            Some(json!({ "text": "send check-in message to Alex", "requester": "sam" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        let task_id = TaskId::new(created["taskID"].as_str().expect("task id"));

        let approval = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let (_, pending) = send(&app, "GET", "/approval", None).await;
                if let Some(first) = pending.as_array().and_then(|a| a.first()).cloned() {
                    return first;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("approval requested");
        let approval_id = approval["id"].as_str().expect("approval id").to_string();
        assert_eq!(approval["taskID"], task_id.as_str());

        let (status, payload) = send(
            &app,
            "POST",
            &format!("/approval/{approval_id}/decide"),
            Some(json!({ "decision": "maybe" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(payload["code"], "INVALID_REQUEST");

        let (status, decided) = send(
            &app,
            "POST",
            &format!("/approval/{approval_id}/decide"),
            Some(json!({ "decision": "approve", "decider": "pat" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(decided["state"], "approved");

        let (status, payload) = send(
            &app,
            "POST",
            &format!("/approval/{approval_id}/decide"),
            Some(json!({ "decision": "reject" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(payload["code"], "APPROVAL_ALREADY_DECIDED");

        let done = state
            .orchestrator
            .wait_for_terminal(&task_id, Duration::from_secs(5))
            .await
            .expect("task");
        assert_eq!(done.state, TaskState::Completed);

        let (status, history) = send(&app, "GET", &format!("/task/{task_id}/events"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(history["transitions"].as_array().is_some_and(|t| !t.is_empty()));
        assert_eq!(history["approvals"].as_array().map(|a| a.len()), Some(1));
    }

    #[tokio::test]
    async fn cancel_route_is_idempotent() {
        let app = app_router(test_state().await);
        let (_, created) = send(
            &app,
            "POST",
            "/task",
            Some(json!({ "text": "record homework due friday" })),
        )
        .await;
        let task_id = created["taskID"].as_str().expect("task id").to_string();

        let (status, first) = send(&app, "POST", &format!("/task/{task_id}/cancel"), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, second) = send(&app, "POST", &format!("/task/{task_id}/cancel"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first["state"], second["state"]);
        assert!(matches!(
            first["state"].as_str(),
            Some("cancelled") | Some("completed")
        ));
    }

    #[tokio::test]
    async fn plan_preview_reports_unknown_category() {
        let app = app_router(test_state().await);
        let (status, plan) = send(
            &app,
            "POST",
            "/plan/preview",
            Some(json!({ "text": "schedule a meeting with Alex" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(plan["category"], "schedule_event");
        assert_eq!(plan["steps"].as_array().map(|s| s.len()), Some(3));

        let (status, payload) = send(
            &app,
            "POST",
            "/plan/preview",
            Some(json!({ "text": "anything", "category": "teleport" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(payload["code"], "PLAN_REJECTED");
    }

    #[tokio::test]
    async fn event_route_streams_sse() {
        let app = app_router(test_state().await);
        let req = Request::builder()
            .method("GET")
            .uri("/event?taskID=task_1")
            .body(Body::empty())
            .expect("request");
        let resp = app.oneshot(req).await.expect("response");
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        assert!(content_type.starts_with("text/event-stream"));
    }

    #[test]
    fn event_filter_matches_task_id() {
        let event = EngineEvent::new("task.created", json!({ "taskID": "task_1" }));
        let all = EventFilterQuery::default();
        let mine = EventFilterQuery {
            task_id: Some("task_1".to_string()),
        };
        let other = EventFilterQuery {
            task_id: Some("task_2".to_string()),
        };
        assert!(event_matches_filter(&event, &all));
        assert!(event_matches_filter(&event, &mine));
        assert!(!event_matches_filter(&event, &other));
    }
}
