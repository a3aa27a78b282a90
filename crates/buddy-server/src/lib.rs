use std::time::{SystemTime, UNIX_EPOCH};

use buddy_core::{ConfigStore, Orchestrator};

mod http;

pub use http::{app_router, serve};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Orchestrator,
    pub config: ConfigStore,
    pub started_at_ms: u64,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator, config: ConfigStore) -> Self {
        Self {
            orchestrator,
            config,
            started_at_ms: now_ms(),
        }
    }

    pub fn uptime_ms(&self) -> u64 {
        now_ms().saturating_sub(self.started_at_ms)
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
