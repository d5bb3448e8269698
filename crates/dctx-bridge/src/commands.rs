//! Command handlers for the session/task/stats command surface (§6.2).
//!
//! Bridge owns every `session.*` command and a partial `stats` — the
//! parts expressible against [`dctx_core::cache::Store`] and
//! [`dctx_harness::broker::Broker`] alone. `task.assess`/`task.implement`,
//! and the attention-recommendation half of `session.end`/`stats`, need
//! the Attention Engine, which lives one layer up in `dctx-agents` (which
//! depends on this crate, not the reverse) — that crate registers those
//! commands into the same [`CommandRegistry`] at daemon startup.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use dctx_core::cache::Store;
use dctx_core::types::{Event, EventData, EventPriority, ProgressStatus};
use dctx_harness::broker::Broker;

use crate::command_registry::{
    CommandContext, CommandError, CommandHandler, CommandOutput, CommandRegistry, Result,
};
use crate::event_bus::EventBus;

/// The event bus attributes bridge-originated session lifecycle events to
/// this source system. `SessionStarted`/`SessionEnded`/`BreakStarted`/
/// `BreakEnded` carry no authority-matrix constraint (§4.5), so any
/// consistent name works; this one matches the persisted-state owner.
const SOURCE_SYSTEM: &str = "session-store";

/// Shared state every bridge command handler closes over.
pub struct CommandState {
    pub store: Arc<Store>,
    pub broker: Arc<Broker>,
    pub event_bus: EventBus,
}

fn workspace_id(ctx: &CommandContext) -> Result<String> {
    ctx.get_str("workspace_id")
        .map(str::to_string)
        .ok_or_else(|| CommandError::InvalidArgs("missing required param `workspace_id`".into()))
}

fn storage_err(e: impl std::fmt::Display) -> CommandError {
    CommandError::ExecutionFailed(e.to_string())
}

// ---------------------------------------------------------------------------
// session.start
// ---------------------------------------------------------------------------

pub struct SessionStartHandler {
    state: Arc<CommandState>,
}

impl SessionStartHandler {
    pub fn new(state: Arc<CommandState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl CommandHandler for SessionStartHandler {
    async fn execute(&self, ctx: CommandContext) -> Result<CommandOutput> {
        let ws = workspace_id(&ctx)?;
        let current = self.state.store.get_active_context(&ws).await.map_err(storage_err)?;

        let patch = if current.session_start.is_none() {
            serde_json::json!({ "session_start": Utc::now(), "mode": "act" })
        } else {
            serde_json::json!({})
        };
        let updated = self
            .state
            .store
            .update_active_context(&ws, patch)
            .await
            .map_err(storage_err)?;

        self.state
            .event_bus
            .publish(Event::new(SOURCE_SYSTEM, EventData::SessionStarted, EventPriority::Medium))
            .map_err(storage_err)?;

        Ok(CommandOutput::ok_data(
            serde_json::to_value(&updated).expect("serialize active context"),
        ))
    }
}

// ---------------------------------------------------------------------------
// session.save
// ---------------------------------------------------------------------------

pub struct SessionSaveHandler {
    state: Arc<CommandState>,
}

impl SessionSaveHandler {
    pub fn new(state: Arc<CommandState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl CommandHandler for SessionSaveHandler {
    async fn execute(&self, ctx: CommandContext) -> Result<CommandOutput> {
        let ws = workspace_id(&ctx)?;
        let mut patch = serde_json::Map::new();
        if let Some(focus) = ctx.get_str("current_focus") {
            patch.insert("current_focus".into(), serde_json::json!(focus));
        }
        if let Some(completed) = ctx.params.get("completed_tasks") {
            patch.insert("completed_tasks".into(), completed.clone());
        }
        if let Some(next_steps) = ctx.params.get("next_steps") {
            patch.insert("next_steps".into(), next_steps.clone());
        }

        let updated = self
            .state
            .store
            .update_active_context(&ws, serde_json::Value::Object(patch))
            .await
            .map_err(storage_err)?;

        Ok(CommandOutput::ok_data(
            serde_json::to_value(&updated).expect("serialize active context"),
        ))
    }
}

// ---------------------------------------------------------------------------
// session.load
// ---------------------------------------------------------------------------

pub struct SessionLoadHandler {
    state: Arc<CommandState>,
}

impl SessionLoadHandler {
    pub fn new(state: Arc<CommandState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl CommandHandler for SessionLoadHandler {
    async fn execute(&self, ctx: CommandContext) -> Result<CommandOutput> {
        let ws = workspace_id(&ctx)?;
        let limit = ctx.get_u64("limit").unwrap_or(20) as u32;

        let active_context = self.state.store.get_active_context(&ws).await.map_err(storage_err)?;
        let recent_activity = self
            .state
            .store
            .get_recent_activity_summary(&ws, limit)
            .await
            .map_err(storage_err)?;

        Ok(CommandOutput::ok_data(serde_json::json!({
            "active_context": active_context,
            "recent_activity": recent_activity,
        })))
    }
}

// ---------------------------------------------------------------------------
// session.break
// ---------------------------------------------------------------------------

pub struct SessionBreakHandler {
    state: Arc<CommandState>,
}

impl SessionBreakHandler {
    pub fn new(state: Arc<CommandState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl CommandHandler for SessionBreakHandler {
    async fn execute(&self, ctx: CommandContext) -> Result<CommandOutput> {
        let ws = workspace_id(&ctx)?;
        let patch = serde_json::json!({ "on_break": true, "last_break": Utc::now() });
        let updated = self
            .state
            .store
            .update_active_context(&ws, patch)
            .await
            .map_err(storage_err)?;

        self.state
            .event_bus
            .publish(Event::new(SOURCE_SYSTEM, EventData::BreakStarted, EventPriority::High))
            .map_err(storage_err)?;

        Ok(CommandOutput::ok_data(
            serde_json::to_value(&updated).expect("serialize active context"),
        ))
    }
}

// ---------------------------------------------------------------------------
// session.resume
// ---------------------------------------------------------------------------

pub struct SessionResumeHandler {
    state: Arc<CommandState>,
}

impl SessionResumeHandler {
    pub fn new(state: Arc<CommandState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl CommandHandler for SessionResumeHandler {
    async fn execute(&self, ctx: CommandContext) -> Result<CommandOutput> {
        let ws = workspace_id(&ctx)?;
        let patch = serde_json::json!({ "on_break": false });
        let updated = self
            .state
            .store
            .update_active_context(&ws, patch)
            .await
            .map_err(storage_err)?;

        self.state
            .event_bus
            .publish(Event::new(SOURCE_SYSTEM, EventData::BreakEnded, EventPriority::High))
            .map_err(storage_err)?;

        Ok(CommandOutput::ok_data(
            serde_json::to_value(&updated).expect("serialize active context"),
        ))
    }
}

// ---------------------------------------------------------------------------
// session.end
// ---------------------------------------------------------------------------

/// Finalizes the active context. The Attention Engine's `recommend_break`
/// call (§6.2) is layered on by `dctx-agents`, which re-registers
/// `session.end` wrapping this handler's committed patch with its own
/// recommendation step before emitting `session_ended`.
pub struct SessionEndHandler {
    state: Arc<CommandState>,
}

impl SessionEndHandler {
    pub fn new(state: Arc<CommandState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl CommandHandler for SessionEndHandler {
    async fn execute(&self, ctx: CommandContext) -> Result<CommandOutput> {
        let ws = workspace_id(&ctx)?;
        let patch = serde_json::json!({ "session_end": Utc::now() });
        let updated = self
            .state
            .store
            .update_active_context(&ws, patch)
            .await
            .map_err(storage_err)?;

        self.state
            .event_bus
            .publish(Event::new(SOURCE_SYSTEM, EventData::SessionEnded, EventPriority::Medium))
            .map_err(storage_err)?;

        Ok(CommandOutput::ok_data(
            serde_json::to_value(&updated).expect("serialize active context"),
        ))
    }
}

// ---------------------------------------------------------------------------
// stats (partial — attention-state recommendation added by dctx-agents)
// ---------------------------------------------------------------------------

pub struct StatsHandler {
    state: Arc<CommandState>,
}

impl StatsHandler {
    pub fn new(state: Arc<CommandState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl CommandHandler for StatsHandler {
    async fn execute(&self, ctx: CommandContext) -> Result<CommandOutput> {
        let ws = workspace_id(&ctx)?;

        let active_context = self.state.store.get_active_context(&ws).await.map_err(storage_err)?;
        let recent_activity = self
            .state
            .store
            .get_recent_activity_summary(&ws, 50)
            .await
            .map_err(storage_err)?;
        let completed_count = recent_activity
            .progress
            .iter()
            .filter(|p| p.status == ProgressStatus::Done)
            .count();

        let budget_remaining: serde_json::Map<String, serde_json::Value> = self
            .state
            .broker
            .budget_roles()
            .map(|role| {
                let remaining = self.state.broker.budget_remaining(&ws, role).unwrap_or(0);
                (role.to_string(), serde_json::json!(remaining))
            })
            .collect();

        let backend_health: Vec<serde_json::Value> = self
            .state
            .broker
            .registry()
            .list()
            .into_iter()
            .map(|b| serde_json::json!({ "name": b.name, "health": b.health }))
            .collect();

        Ok(CommandOutput::ok_data(serde_json::json!({
            "attention_state": active_context.attention_state,
            "completed_count": completed_count,
            "budget_remaining": budget_remaining,
            "backend_health": backend_health,
        })))
    }
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

pub fn register_default_commands(registry: &mut CommandRegistry, state: Arc<CommandState>) {
    use crate::command_registry::{CommandCategory, CommandDescriptor};

    let descriptor = |name: &str, title: &str, category: CommandCategory| CommandDescriptor {
        name: name.to_string(),
        title: title.to_string(),
        description: title.to_string(),
        category,
        keybinding: None,
        available_from: vec![],
        enabled: true,
    };

    registry.register(
        descriptor("session.start", "Start Session", CommandCategory::Session),
        Arc::new(SessionStartHandler::new(state.clone())),
    );
    registry.register(
        descriptor("session.save", "Save Session", CommandCategory::Session),
        Arc::new(SessionSaveHandler::new(state.clone())),
    );
    registry.register(
        descriptor("session.load", "Load Session", CommandCategory::Session),
        Arc::new(SessionLoadHandler::new(state.clone())),
    );
    registry.register(
        descriptor("session.break", "Take a Break", CommandCategory::Session),
        Arc::new(SessionBreakHandler::new(state.clone())),
    );
    registry.register(
        descriptor("session.resume", "Resume Session", CommandCategory::Session),
        Arc::new(SessionResumeHandler::new(state.clone())),
    );
    registry.register(
        descriptor("session.end", "End Session", CommandCategory::Session),
        Arc::new(SessionEndHandler::new(state.clone())),
    );
    registry.register(
        descriptor("stats", "Stats", CommandCategory::System),
        Arc::new(StatsHandler::new(state)),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_registry::CommandSource;
    use dctx_harness::budget::BudgetTracker;
    use dctx_harness::mcp::BackendRegistry;
    use std::collections::HashMap;
    use std::time::Duration;

    async fn test_state() -> Arc<CommandState> {
        let store = Store::new_in_memory().await.expect("in-memory store");
        let broker = Broker::new(
            BackendRegistry::new(),
            BudgetTracker::default(),
            2,
            Duration::from_millis(200),
            HashMap::new(),
        );
        Arc::new(CommandState {
            store: Arc::new(store),
            broker: Arc::new(broker),
            event_bus: EventBus::new(),
        })
    }

    #[tokio::test]
    async fn session_start_initializes_once() {
        let state = test_state().await;
        let handler = SessionStartHandler::new(state.clone());
        let ctx = CommandContext::new(CommandSource::Cli, "").with_param(
            "workspace_id",
            serde_json::json!("/ws"),
        );
        let out = handler.execute(ctx.clone()).await.unwrap();
        assert!(out.success);
        let first_start = out.data.unwrap()["session_start"].clone();

        let out2 = handler.execute(ctx).await.unwrap();
        let second_start = out2.data.unwrap()["session_start"].clone();
        assert_eq!(first_start, second_start); // idempotent: does not reset on re-start
    }

    #[tokio::test]
    async fn session_break_then_resume_toggles_on_break() {
        let state = test_state().await;
        let ctx = CommandContext::new(CommandSource::Cli, "").with_param(
            "workspace_id",
            serde_json::json!("/ws"),
        );

        let broke = SessionBreakHandler::new(state.clone()).execute(ctx.clone()).await.unwrap();
        assert_eq!(broke.data.unwrap()["on_break"], serde_json::json!(true));

        let resumed = SessionResumeHandler::new(state.clone()).execute(ctx).await.unwrap();
        assert_eq!(resumed.data.unwrap()["on_break"], serde_json::json!(false));
    }

    #[tokio::test]
    async fn session_save_patches_only_given_fields() {
        let state = test_state().await;
        let ctx = CommandContext::new(CommandSource::Cli, "")
            .with_param("workspace_id", serde_json::json!("/ws"))
            .with_param("current_focus", serde_json::json!("refactor auth"));
        let out = SessionSaveHandler::new(state).execute(ctx).await.unwrap();
        assert_eq!(out.data.unwrap()["current_focus"], serde_json::json!("refactor auth"));
    }

    #[tokio::test]
    async fn missing_workspace_id_is_invalid_args() {
        let state = test_state().await;
        let ctx = CommandContext::new(CommandSource::Cli, "");
        let result = SessionStartHandler::new(state).execute(ctx).await;
        assert!(matches!(result, Err(CommandError::InvalidArgs(_))));
    }

    #[tokio::test]
    async fn stats_reports_budget_and_health() {
        let state = test_state().await;
        let ctx = CommandContext::new(CommandSource::Cli, "")
            .with_param("workspace_id", serde_json::json!("/ws"));
        let out = StatsHandler::new(state).execute(ctx).await.unwrap();
        let data = out.data.unwrap();
        assert!(data["budget_remaining"].is_object());
        assert!(data["backend_health"].is_array());
    }

    #[tokio::test]
    async fn register_default_commands_covers_session_surface() {
        let state = test_state().await;
        let mut registry = CommandRegistry::new();
        register_default_commands(&mut registry, state);
        for name in [
            "session.start",
            "session.save",
            "session.load",
            "session.break",
            "session.resume",
            "session.end",
            "stats",
        ] {
            assert!(registry.has(name), "missing command {name}");
        }
    }
}
