use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use buddy_orchestrator::{PlanRule, Planner, RetryPolicy};
use buddy_types::Capability;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub url: String,
    /// Overrides `call_timeout_ms` for this capability.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub retry: RetryPolicy,
    pub call_timeout_ms: u64,
    pub approval_timeout_ms: u64,
    /// Upper bound on capability calls in flight across all tasks.
    pub max_parallel_steps: usize,
    pub services: BTreeMap<Capability, ServiceConfig>,
    /// Replaces the built-in intent rules when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_rules: Option<Vec<PlanRule>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            call_timeout_ms: 10_000,
            approval_timeout_ms: 15 * 60 * 1000,
            max_parallel_steps: 8,
            services: BTreeMap::new(),
            plan_rules: None,
            state_dir: None,
        }
    }
}

impl OrchestratorConfig {
    pub fn call_timeout_for(&self, capability: Capability) -> Duration {
        let ms = self
            .services
            .get(&capability)
            .and_then(|service| service.timeout_ms)
            .unwrap_or(self.call_timeout_ms);
        Duration::from_millis(ms.max(1))
    }

    pub fn approval_timeout(&self) -> Duration {
        Duration::from_millis(self.approval_timeout_ms.max(1))
    }

    pub fn planner(&self) -> Planner {
        match &self.plan_rules {
            Some(rules) if !rules.is_empty() => Planner::new(rules.clone()),
            _ => Planner::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ConfigLayers {
    global: Value,
    project: Value,
    env: Value,
    runtime: Value,
    cli: Value,
}

/// Layered configuration: global, project, env, runtime, cli (later wins).
#[derive(Clone)]
pub struct ConfigStore {
    project_path: Option<PathBuf>,
    global_path: PathBuf,
    layers: Arc<RwLock<ConfigLayers>>,
}

impl ConfigStore {
    pub async fn new(
        project_path: Option<PathBuf>,
        cli_overrides: Option<Value>,
    ) -> anyhow::Result<Self> {
        let global_path = resolve_global_config_path();
        let global = read_json_file(&global_path).await?;
        let project = match &project_path {
            Some(path) => read_json_file(path).await?,
            None => empty_object(),
        };

        let layers = ConfigLayers {
            global,
            project,
            env: env_layer(|key| std::env::var(key).ok()),
            runtime: empty_object(),
            cli: cli_overrides.unwrap_or_else(empty_object),
        };
        Ok(Self {
            project_path,
            global_path,
            layers: Arc::new(RwLock::new(layers)),
        })
    }

    pub fn global_path(&self) -> &Path {
        &self.global_path
    }

    pub async fn get(&self) -> OrchestratorConfig {
        let merged = self.get_effective_value().await;
        match serde_json::from_value(merged) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!("invalid orchestrator config, using defaults: {err}");
                OrchestratorConfig::default()
            }
        }
    }

    pub async fn get_effective_value(&self) -> Value {
        let layers = self.layers.read().await.clone();
        let mut merged = empty_object();
        for layer in [
            &layers.global,
            &layers.project,
            &layers.env,
            &layers.runtime,
            &layers.cli,
        ] {
            deep_merge(&mut merged, layer);
        }
        merged
    }

    pub async fn get_layers_value(&self) -> Value {
        let layers = self.layers.read().await;
        json!({
            "global": layers.global,
            "project": layers.project,
            "env": layers.env,
            "runtime": layers.runtime,
            "cli": layers.cli,
        })
    }

    pub async fn patch_runtime(&self, patch: Value) -> Value {
        deep_merge(&mut self.layers.write().await.runtime, &patch);
        self.get_effective_value().await
    }

    /// Merges `patch` into the project layer and writes the project file.
    pub async fn patch_project(&self, patch: Value) -> anyhow::Result<Value> {
        let Some(path) = self.project_path.clone() else {
            anyhow::bail!("no project config file configured");
        };
        let snapshot = {
            let mut layers = self.layers.write().await;
            deep_merge(&mut layers.project, &patch);
            layers.project.clone()
        };
        write_json_file(&path, &snapshot).await?;
        Ok(self.get_effective_value().await)
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    match serde_json::from_str::<Value>(&raw) {
        Ok(value) => Ok(value),
        Err(err) => {
            tracing::warn!("ignoring unparseable config {}: {err}", path.display());
            Ok(empty_object())
        }
    }
}

async fn write_json_file(path: &Path, value: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(path, serde_json::to_string_pretty(value)?).await?;
    Ok(())
}

fn resolve_global_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("BUDDY_GLOBAL_CONFIG") {
        return PathBuf::from(path);
    }
    match dirs::config_dir() {
        Some(dir) => dir.join("buddy").join("config.json"),
        None => PathBuf::from(".buddy/config.json"),
    }
}

fn env_layer(lookup: impl Fn(&str) -> Option<String>) -> Value {
    let mut root = empty_object();
    let number = |key: &str| {
        lookup(key).and_then(|raw| {
            let parsed = raw.trim().parse::<u64>().ok();
            if parsed.is_none() {
                tracing::warn!("ignoring non-numeric {key}={raw}");
            }
            parsed
        })
    };

    if let Some(v) = number("BUDDY_RETRY_MAX_ATTEMPTS") {
        deep_merge(&mut root, &json!({ "retry": { "max_attempts": v } }));
    }
    if let Some(v) = number("BUDDY_CALL_TIMEOUT_MS") {
        deep_merge(&mut root, &json!({ "call_timeout_ms": v }));
    }
    if let Some(v) = number("BUDDY_APPROVAL_TIMEOUT_MS") {
        deep_merge(&mut root, &json!({ "approval_timeout_ms": v }));
    }
    if let Some(v) = number("BUDDY_MAX_PARALLEL_STEPS") {
        deep_merge(&mut root, &json!({ "max_parallel_steps": v }));
    }
    for capability in Capability::ALL {
        let key = format!("BUDDY_{}_URL", capability.as_str().to_ascii_uppercase());
        if let Some(url) = lookup(&key).filter(|url| !url.trim().is_empty()) {
            deep_merge(
                &mut root,
                &json!({ "services": { capability.as_str(): { "url": url.trim() } } }),
            );
        }
    }
    if let Some(dir) = lookup("BUDDY_STATE_DIR").filter(|dir| !dir.trim().is_empty()) {
        deep_merge(&mut root, &json!({ "state_dir": dir.trim() }));
    }
    root
}

/// Objects merge key by key; `null` never overwrites.
fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}
