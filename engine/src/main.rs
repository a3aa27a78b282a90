use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use buddy_core::{
    CapabilityRouter, ConfigStore, Orchestrator, OrchestratorConfig, DEFAULT_ENGINE_HOST,
    DEFAULT_ENGINE_PORT,
};
use buddy_observability::{
    canonical_logs_dir_from_root, emit_event, init_process_logging, ObservabilityEvent, ProcessKind,
};
use buddy_server::{serve, AppState};
use buddy_types::Intent;
use clap::{Parser, Subcommand};
use serde_json::{json, Map, Value};
use tracing::info;

const LOG_RETENTION_DAYS: u64 = 14;

#[derive(Parser, Debug)]
#[command(name = "buddy-engine")]
#[command(about = "Approval-gated task orchestrator for the Buddy assistant")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API and resume any unfinished tasks.
    Serve {
        #[arg(long, alias = "host", default_value = DEFAULT_ENGINE_HOST)]
        hostname: String,
        #[arg(long, default_value_t = DEFAULT_ENGINE_PORT)]
        port: u16,
        /// Project config file layered over the global one.
        #[arg(long)]
        config: Option<String>,
        #[arg(long)]
        state_dir: Option<String>,
        #[arg(long)]
        approval_timeout_ms: Option<u64>,
        #[arg(long)]
        call_timeout_ms: Option<u64>,
    },
    /// Print the plan an intent would get, without running it.
    Plan {
        text: String,
        #[arg(long)]
        category: Option<String>,
        #[arg(long)]
        config: Option<String>,
    },
    /// Probe every configured capability service.
    Health {
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            config,
            state_dir,
            approval_timeout_ms,
            call_timeout_ms,
        } => {
            let overrides = build_cli_overrides(state_dir, approval_timeout_ms, call_timeout_ms);
            let config_store = ConfigStore::new(config.map(PathBuf::from), overrides)
                .await
                .context("failed to load config")?;
            let mut orchestrator_config = config_store.get().await;
            let state_dir = orchestrator_config
                .state_dir
                .clone()
                .unwrap_or_else(default_state_dir);
            orchestrator_config.state_dir = Some(state_dir.clone());

            let logs_dir = canonical_logs_dir_from_root(&state_dir);
            let (_log_guard, log_info) =
                init_process_logging(ProcessKind::Engine, &logs_dir, LOG_RETENTION_DAYS)?;
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Engine,
                ObservabilityEvent::new("engine.main", "logging.initialized")
                    .status("ok")
                    .detail("engine jsonl logging initialized"),
            );
            info!("engine logging initialized: {:?}", log_info);

            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            log_startup(&state_dir, &addr, &orchestrator_config, config_store.global_path());

            let router = CapabilityRouter::from_config(&orchestrator_config)
                .context("failed to build capability clients")?;
            let orchestrator = Orchestrator::open(&orchestrator_config, router)
                .context("failed to open task store")?;
            let resumed = orchestrator
                .recover()
                .await
                .context("failed to recover stored tasks")?;
            emit_event(
                tracing::Level::INFO,
                ProcessKind::Engine,
                ObservabilityEvent::new("engine.main", "engine.startup.ready")
                    .status("ok")
                    .detail(&format!("resumed_tasks={resumed}")),
            );

            serve(addr, AppState::new(orchestrator, config_store)).await?;
        }
        Command::Plan {
            text,
            category,
            config,
        } => {
            let config_store = ConfigStore::new(config.map(PathBuf::from), None).await?;
            let planner = config_store.get().await.planner();
            let mut intent = Intent::text("cli", text);
            if let Some(category) = category {
                intent = intent.with_category(category);
            }
            let plan = planner.plan(&intent)?;
            let output = json!({
                "category": plan.category,
                "steps": plan.steps,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Command::Health { config } => {
            let config_store = ConfigStore::new(config.map(PathBuf::from), None).await?;
            let router = CapabilityRouter::from_config(&config_store.get().await)?;
            let health = router.health().await;
            println!("{}", serde_json::to_string_pretty(&health)?);
        }
    }

    Ok(())
}

fn build_cli_overrides(
    state_dir: Option<String>,
    approval_timeout_ms: Option<u64>,
    call_timeout_ms: Option<u64>,
) -> Option<Value> {
    let mut root = Map::new();
    if let Some(dir) = state_dir.filter(|d| !d.trim().is_empty()) {
        root.insert("state_dir".to_string(), Value::String(dir));
    }
    if let Some(ms) = approval_timeout_ms {
        root.insert("approval_timeout_ms".to_string(), json!(ms));
    }
    if let Some(ms) = call_timeout_ms {
        root.insert("call_timeout_ms".to_string(), json!(ms));
    }
    if root.is_empty() {
        None
    } else {
        Some(Value::Object(root))
    }
}

fn default_state_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("buddy"))
        .unwrap_or_else(|| PathBuf::from(".buddy"))
}

fn log_startup(state_dir: &Path, addr: &SocketAddr, config: &OrchestratorConfig, global: &Path) {
    info!("starting buddy-engine on http://{addr}");
    info!(
        "startup paths: state_dir={} global_config={}",
        state_dir.display(),
        global.display()
    );
    let configured: Vec<&str> = config.services.keys().map(|c| c.as_str()).collect();
    info!(
        "capabilities configured: [{}] approval_timeout_ms={} max_attempts={}",
        configured.join(", "),
        config.approval_timeout_ms,
        config.retry.max_attempts()
    );
}
