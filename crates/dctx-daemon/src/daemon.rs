use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use dctx_agents::attention::AttentionEngine;
use dctx_agents::commands::register_attention_commands;
use dctx_bridge::command_registry::CommandRegistry;
use dctx_bridge::commands::{register_default_commands, CommandState};
use dctx_bridge::event_bus::EventBus;
use dctx_bridge::http_api::{router_with_auth, ApiState};
use dctx_core::cache::Store;
use dctx_core::config::{Config, SeedBackend};
use dctx_core::types::{BackendDescriptor, Health, Priority, RoleTag, Transport};
use dctx_harness::broker::Broker;
use dctx_harness::budget::{BudgetConfig, BudgetTracker};
use dctx_harness::mcp::BackendRegistry;
use dctx_harness::shutdown::ShutdownSignal;

/// The running broker daemon: the Session & Context Store, the
/// Meta-Broker, the event bus, and the full `session.*`/`task.*`/`stats`
/// command registry (§6.2), served over the §6.1 HTTP route until
/// shutdown is triggered.
pub struct Daemon {
    config: Config,
    store: Arc<Store>,
    broker: Arc<Broker>,
    registry: Arc<CommandRegistry>,
    shutdown: ShutdownSignal,
}

impl Daemon {
    /// Open the store, seed the backend registry from config, and build
    /// the command registry: `dctx_bridge::commands::register_default_commands`
    /// first, then `dctx_agents::commands::register_attention_commands`
    /// overwriting `session.end`/`stats` with their attention-aware
    /// versions (§4.4).
    pub async fn new(config: Config) -> Result<Self> {
        let store = Store::new(expand_home(&config.store.path))
            .await
            .context("failed to open session & context store")?;
        let store = Arc::new(store);

        let backend_registry = BackendRegistry::new();
        for seed in &config.broker.seed_backends {
            match seed_descriptor(seed) {
                Ok(descriptor) => backend_registry.register(descriptor),
                Err(e) => {
                    warn!(backend = %seed.name, error = %e, "skipping malformed seed backend")
                }
            }
        }

        let budgets = BudgetTracker::new(BudgetConfig::default());
        let broker = Arc::new(Broker::new(
            backend_registry,
            budgets,
            config.broker.max_retries,
            Duration::from_millis(config.broker.default_timeout_ms),
            config.broker.role_daily_budget.clone(),
        ));

        let event_bus = EventBus::new();
        let bridge_state = Arc::new(CommandState {
            store: store.clone(),
            broker: broker.clone(),
            event_bus: event_bus.clone(),
        });
        let attention = Arc::new(AttentionEngine::new(config.attention.clone(), event_bus));

        let mut registry = CommandRegistry::new();
        register_default_commands(&mut registry, bridge_state.clone());
        register_attention_commands(&mut registry, bridge_state, attention);

        Ok(Self {
            config,
            store,
            broker,
            registry: Arc::new(registry),
            shutdown: ShutdownSignal::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn command_registry(&self) -> &Arc<CommandRegistry> {
        &self.registry
    }

    /// Returns a handle that can be used to trigger shutdown from another task.
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Serve the §6.1 tool-invocation route on a pre-bound listener until
    /// shutdown is triggered.
    pub async fn run_with_listener(&self, listener: tokio::net::TcpListener) -> Result<()> {
        let api_state = ApiState {
            broker: self.broker.clone(),
            store: self.store.clone(),
        };
        let api_key = std::env::var("DCTX_API_KEY").ok().filter(|s| !s.is_empty());
        let router = router_with_auth(api_state, api_key);

        let bound = listener.local_addr()?;
        let mut shutdown_rx = self.shutdown.subscribe();
        info!(%bound, "API server listening");

        let server = axum::serve(listener, router).with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
            info!("shutdown signal received, stopping API server");
        });

        if let Err(e) = server.await {
            error!(error = %e, "API server error");
        }
        info!("daemon stopped");
        Ok(())
    }
}

fn expand_home(path: &str) -> std::path::PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir().unwrap_or_else(|| std::path::PathBuf::from(".")).join(rest),
        None => std::path::PathBuf::from(path),
    }
}

/// Convert a config-level [`SeedBackend`] (string transport/priority/role
/// tags) into the registry's typed [`BackendDescriptor`] via the same
/// `snake_case` names their `Serialize`/`Deserialize` impls use.
fn seed_descriptor(seed: &SeedBackend) -> Result<BackendDescriptor, String> {
    let transport: Transport = serde_json::from_value(serde_json::json!(seed.transport))
        .map_err(|e| format!("transport: {e}"))?;
    let priority: Priority = serde_json::from_value(serde_json::json!(seed.priority))
        .map_err(|e| format!("priority: {e}"))?;
    let role_tags: Vec<RoleTag> = seed
        .role_tags
        .iter()
        .map(|t| serde_json::from_value(serde_json::json!(t)))
        .collect::<Result<_, _>>()
        .map_err(|e: serde_json::Error| format!("role_tags: {e}"))?;

    Ok(BackendDescriptor {
        name: seed.name.clone(),
        endpoint: seed.endpoint.clone(),
        transport,
        role_tags,
        priority,
        probe_path: None,
        probe_port: None,
        default_timeout_ms: 10_000,
        health: Health::Unknown,
        consecutive_failures: 0,
        last_latency_ms: None,
        extra: serde_json::Value::Null,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_daemon_registers_the_full_command_surface() {
        let mut config = Config::default();
        config.store.path = ":memory:".into();
        let daemon = Daemon::new(config).await.expect("daemon should bootstrap");
        for name in [
            "session.start",
            "session.save",
            "session.load",
            "session.break",
            "session.resume",
            "session.end",
            "task.assess",
            "task.implement",
            "stats",
        ] {
            assert!(daemon.command_registry().has(name), "missing command {name}");
        }
    }

    #[test]
    fn expand_home_leaves_absolute_paths_alone() {
        assert_eq!(expand_home("/tmp/x.db"), std::path::PathBuf::from("/tmp/x.db"));
    }

    #[test]
    fn malformed_seed_backend_is_rejected() {
        let seed = SeedBackend {
            name: "bad".into(),
            endpoint: "http://localhost".into(),
            transport: "carrier-pigeon".into(),
            role_tags: vec!["memory".into()],
            priority: "quality".into(),
        };
        assert!(seed_descriptor(&seed).is_err());
    }
}
