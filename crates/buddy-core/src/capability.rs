use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use buddy_types::{Capability, CapabilityFailure, CapabilityRequest, FailureKind};
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::config::OrchestratorConfig;

const ERROR_BODY_LIMIT: usize = 512;

/// Uniform request/response adapter to one capability service.
#[async_trait]
pub trait CapabilityClient: Send + Sync {
    async fn invoke(&self, request: &CapabilityRequest) -> Result<Value, CapabilityFailure>;

    async fn health(&self) -> Result<Value, CapabilityFailure> {
        Ok(json!({ "status": "ok" }))
    }
}

/// Maps an HTTP status from a capability service onto a failure category.
pub fn classify_status(status: u16) -> FailureKind {
    match status {
        408 => FailureKind::Timeout,
        429 => FailureKind::RateLimited,
        502..=504 => FailureKind::Unavailable,
        500..=599 => FailureKind::ServerError,
        401 | 403 => FailureKind::PermissionDenied,
        404 => FailureKind::NotFound,
        _ => FailureKind::BadRequest,
    }
}

pub struct HttpCapabilityClient {
    capability: Capability,
    base_url: String,
    client: reqwest::Client,
}

impl HttpCapabilityClient {
    pub fn new(capability: Capability, base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            capability,
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn transport_failure(&self, err: reqwest::Error) -> CapabilityFailure {
        let kind = if err.is_timeout() {
            FailureKind::Timeout
        } else {
            FailureKind::Unavailable
        };
        CapabilityFailure::new(kind, format!("{} request failed: {err}", self.capability))
    }

    async fn read_response(&self, response: reqwest::Response) -> Result<Value, CapabilityFailure> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| self.transport_failure(err))?;
        if status.is_success() {
            if body.trim().is_empty() {
                return Ok(Value::Null);
            }
            return serde_json::from_str(&body).map_err(|err| {
                CapabilityFailure::new(
                    FailureKind::ServerError,
                    format!("{} returned invalid JSON: {err}", self.capability),
                )
            });
        }
        let mut detail: String = body.chars().take(ERROR_BODY_LIMIT).collect();
        if detail.is_empty() {
            detail = status.canonical_reason().unwrap_or("no body").to_string();
        }
        Err(CapabilityFailure::new(
            classify_status(status.as_u16()),
            format!("{} responded {}: {detail}", self.capability, status.as_u16()),
        ))
    }
}

#[async_trait]
impl CapabilityClient for HttpCapabilityClient {
    async fn invoke(&self, request: &CapabilityRequest) -> Result<Value, CapabilityFailure> {
        let response = self
            .client
            .post(format!("{}/invoke", self.base_url))
            .header("Idempotency-Key", request.idempotency_key.as_str())
            .json(&json!({
                "operation": request.operation,
                "payload": request.payload,
                "idempotency_key": request.idempotency_key,
            }))
            .send()
            .await
            .map_err(|err| self.transport_failure(err))?;
        self.read_response(response).await
    }

    async fn health(&self) -> Result<Value, CapabilityFailure> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .map_err(|err| self.transport_failure(err))?;
        self.read_response(response).await
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CapabilityHealth {
    pub capability: Capability,
    pub service: &'static str,
    pub configured: bool,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Routes each call to its capability's client and enforces the per-call deadline.
#[derive(Clone)]
pub struct CapabilityRouter {
    clients: HashMap<Capability, Arc<dyn CapabilityClient>>,
    timeouts: HashMap<Capability, Duration>,
    default_timeout: Duration,
}

impl CapabilityRouter {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            clients: HashMap::new(),
            timeouts: HashMap::new(),
            default_timeout,
        }
    }

    /// HTTP clients for every service with a configured URL.
    pub fn from_config(config: &OrchestratorConfig) -> anyhow::Result<Self> {
        let mut router = Self::new(Duration::from_millis(config.call_timeout_ms.max(1)));
        for (capability, service) in &config.services {
            let timeout = config.call_timeout_for(*capability);
            let client = HttpCapabilityClient::new(*capability, &service.url, timeout)?;
            router = router
                .with_client(*capability, Arc::new(client))
                .with_timeout(*capability, timeout);
        }
        Ok(router)
    }

    pub fn with_client(mut self, capability: Capability, client: Arc<dyn CapabilityClient>) -> Self {
        self.clients.insert(capability, client);
        self
    }

    pub fn with_timeout(mut self, capability: Capability, timeout: Duration) -> Self {
        self.timeouts.insert(capability, timeout);
        self
    }

    pub fn is_configured(&self, capability: Capability) -> bool {
        self.clients.contains_key(&capability)
    }

    pub fn timeout_for(&self, capability: Capability) -> Duration {
        self.timeouts
            .get(&capability)
            .copied()
            .unwrap_or(self.default_timeout)
    }

    /// A missed deadline is reported as a retryable timeout, cancellation as terminal.
    pub async fn invoke(
        &self,
        request: &CapabilityRequest,
        cancel: &CancellationToken,
    ) -> Result<Value, CapabilityFailure> {
        let Some(client) = self.clients.get(&request.capability).cloned() else {
            return Err(CapabilityFailure::new(
                FailureKind::Unsupported,
                format!("no client configured for {}", request.capability),
            ));
        };
        let timeout = self.timeout_for(request.capability);
        tokio::select! {
            _ = cancel.cancelled() => Err(CapabilityFailure::new(
                FailureKind::Cancelled,
                format!("{} call cancelled", request.capability),
            )),
            outcome = tokio::time::timeout(timeout, client.invoke(request)) => match outcome {
                Ok(result) => result,
                Err(_) => Err(CapabilityFailure::timeout(format!(
                    "{} did not answer within {}ms",
                    request.capability,
                    timeout.as_millis()
                ))),
            },
        }
    }

    pub async fn health(&self) -> Vec<CapabilityHealth> {
        let mut out = Vec::with_capacity(Capability::ALL.len());
        for capability in Capability::ALL {
            let Some(client) = self.clients.get(&capability).cloned() else {
                out.push(CapabilityHealth {
                    capability,
                    service: capability.service_name(),
                    configured: false,
                    healthy: false,
                    detail: None,
                    error: None,
                });
                continue;
            };
            let probe = tokio::time::timeout(self.timeout_for(capability), client.health()).await;
            let (healthy, detail, error) = match probe {
                Ok(Ok(body)) => (true, Some(body), None),
                Ok(Err(failure)) => (false, None, Some(failure.to_string())),
                Err(_) => (false, None, Some("health probe timed out".to_string())),
            };
            out.push(CapabilityHealth {
                capability,
                service: capability.service_name(),
                configured: true,
                healthy,
                detail,
                error,
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SlowClient;

    #[async_trait]
    impl CapabilityClient for SlowClient {
        async fn invoke(&self, _request: &CapabilityRequest) -> Result<Value, CapabilityFailure> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Value::Null)
        }
    }

    struct EchoClient;

    #[async_trait]
    impl CapabilityClient for EchoClient {
        async fn invoke(&self, request: &CapabilityRequest) -> Result<Value, CapabilityFailure> {
            Ok(json!({ "key": request.idempotency_key }))
        }
    }

    fn request(capability: Capability) -> CapabilityRequest {
        CapabilityRequest {
            capability,
            operation: "list_events".to_string(),
            payload: json!({}),
            idempotency_key: "task_1:events".to_string(),
        }
    }

    #[test]
    fn status_classification_splits_retryable_and_terminal() {
        assert!(classify_status(503).is_retryable());
        assert!(classify_status(500).is_retryable());
        assert!(classify_status(429).is_retryable());
        assert!(classify_status(408).is_retryable());
        assert_eq!(classify_status(422), FailureKind::BadRequest);
        assert_eq!(classify_status(403), FailureKind::PermissionDenied);
        assert_eq!(classify_status(404), FailureKind::NotFound);
        assert!(!classify_status(400).is_retryable());
    }

    #[tokio::test]
    async fn deadline_turns_into_retryable_timeout() {
        let router = CapabilityRouter::new(Duration::from_millis(20))
            .with_client(Capability::Calendar, Arc::new(SlowClient));
        let failure = router
            .invoke(&request(Capability::Calendar), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Timeout);
        assert!(failure.retryable);
    }

    #[tokio::test]
    async fn cancellation_interrupts_call() {
        let router = CapabilityRouter::new(Duration::from_secs(10))
            .with_client(Capability::Calendar, Arc::new(SlowClient));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let failure = router
            .invoke(&request(Capability::Calendar), &cancel)
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Cancelled);
        assert!(!failure.retryable);
    }

    #[tokio::test]
    async fn missing_client_is_terminal_and_reported_in_health() {
        let router = CapabilityRouter::new(Duration::from_secs(1))
            .with_client(Capability::Mail, Arc::new(EchoClient));
        let failure = router
            .invoke(&request(Capability::Grounding), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(failure.kind, FailureKind::Unsupported);
        assert!(!failure.retryable);

        let ok = router
            .invoke(&request(Capability::Mail), &CancellationToken::new())
            .await
            .expect("echo");
        assert_eq!(ok["key"], "task_1:events");

        let health = router.health().await;
        assert_eq!(health.len(), 4);
        let mail = health
            .iter()
            .find(|h| h.capability == Capability::Mail)
            .expect("mail");
        assert!(mail.configured && mail.healthy);
        assert!(health.iter().filter(|h| !h.configured).count() == 3);
    }
}
