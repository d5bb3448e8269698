//! Attention-aware command handlers layered onto the bridge's command
//! registry (§6.2): `task.assess`, `task.implement`, and the
//! attention-recommendation extensions to `session.end`/`stats`.
//!
//! `register_attention_commands` is called once at daemon startup, after
//! `dctx_bridge::commands::register_default_commands` — its `session.end`
//! and `stats` registrations overwrite the bridge's plain versions, since
//! `CommandRegistry::register` is a plain name-keyed insert.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use dctx_bridge::command_registry::{
    CommandCategory, CommandContext, CommandDescriptor, CommandError, CommandHandler,
    CommandOutput, CommandRegistry, Result,
};
use dctx_bridge::commands::CommandState;
use dctx_core::types::{EnergyRequired, Event, EventData, EventPriority, ProgressEntry, ProgressStatus};

use crate::attention::{AttentionEngine, BreakUrgency, TaskSummary};

const SOURCE_SYSTEM: &str = "attention-engine";

fn workspace_id(ctx: &CommandContext) -> Result<String> {
    ctx.get_str("workspace_id")
        .map(str::to_string)
        .ok_or_else(|| CommandError::InvalidArgs("missing required param `workspace_id`".into()))
}

fn user_id(ctx: &CommandContext) -> Result<String> {
    ctx.get_str("user_id")
        .map(str::to_string)
        .ok_or_else(|| CommandError::InvalidArgs("missing required param `user_id`".into()))
}

fn storage_err(e: impl std::fmt::Display) -> CommandError {
    CommandError::ExecutionFailed(e.to_string())
}

fn task_summary(entry: &ProgressEntry) -> TaskSummary {
    TaskSummary {
        complexity_score: entry.complexity_score.unwrap_or(0.5),
        estimated_minutes: entry.estimated_minutes.unwrap_or(30),
        energy_required: entry.energy_required.unwrap_or(EnergyRequired::Medium),
        description: entry.description.clone(),
    }
}

// ---------------------------------------------------------------------------
// task.assess
// ---------------------------------------------------------------------------

pub struct TaskAssessHandler {
    bridge: Arc<CommandState>,
    attention: Arc<AttentionEngine>,
}

impl TaskAssessHandler {
    pub fn new(bridge: Arc<CommandState>, attention: Arc<AttentionEngine>) -> Self {
        Self { bridge, attention }
    }
}

#[async_trait]
impl CommandHandler for TaskAssessHandler {
    async fn execute(&self, ctx: CommandContext) -> Result<CommandOutput> {
        let ws = workspace_id(&ctx)?;
        let uid = user_id(&ctx)?;
        let progress_id = ctx
            .get_u64("progress_id")
            .ok_or_else(|| CommandError::InvalidArgs("missing required param `progress_id`".into()))?
            as i64;

        let entry = self
            .bridge
            .store
            .get_progress(&ws, progress_id)
            .await
            .map_err(storage_err)?
            .ok_or_else(|| CommandError::InvalidArgs(format!("no progress entry {progress_id}")))?;

        let suitability = self.attention.assess_task(&uid, &task_summary(&entry));

        Ok(CommandOutput::ok_data(serde_json::json!({
            "progress_id": progress_id,
            "suitability": suitability,
        })))
    }
}

// ---------------------------------------------------------------------------
// task.implement
// ---------------------------------------------------------------------------

/// Selects a task (explicit `progress_id`, or the best-suitability `TODO`
/// entry when omitted), marks it `IN_PROGRESS`, and spawns a background
/// timer that checks in every 5 minutes to auto-save and raise the break
/// urgency along the 25/60/90-minute thresholds (§4.4, §6.2).
pub struct TaskImplementHandler {
    bridge: Arc<CommandState>,
    attention: Arc<AttentionEngine>,
}

impl TaskImplementHandler {
    pub fn new(bridge: Arc<CommandState>, attention: Arc<AttentionEngine>) -> Self {
        Self { bridge, attention }
    }

    async fn pick_task(&self, ws: &str, uid: &str) -> Result<ProgressEntry> {
        let recent = self
            .bridge
            .store
            .get_recent_activity_summary(ws, 100)
            .await
            .map_err(storage_err)?;

        recent
            .progress
            .into_iter()
            .filter(|p| p.status == ProgressStatus::Todo)
            .map(|p| {
                let score = self.attention.assess_task(uid, &task_summary(&p)).suitability_score;
                (score, p)
            })
            .max_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, p)| p)
            .ok_or_else(|| CommandError::ExecutionFailed("no TODO tasks available".into()))
    }
}

#[async_trait]
impl CommandHandler for TaskImplementHandler {
    async fn execute(&self, ctx: CommandContext) -> Result<CommandOutput> {
        let ws = workspace_id(&ctx)?;
        let uid = user_id(&ctx)?;

        let entry = match ctx.get_u64("progress_id") {
            Some(id) => self
                .bridge
                .store
                .get_progress(&ws, id as i64)
                .await
                .map_err(storage_err)?
                .ok_or_else(|| CommandError::InvalidArgs(format!("no progress entry {id}")))?,
            None => self.pick_task(&ws, &uid).await?,
        };

        let updated = self
            .bridge
            .store
            .update_progress(&ws, entry.progress_id, ProgressStatus::InProgress, None)
            .await
            .map_err(storage_err)?;

        self.bridge
            .event_bus
            .publish(Event::new(
                "project-management",
                EventData::StatusChanged {
                    progress_id: updated.progress_id,
                    status: ProgressStatus::InProgress,
                },
                EventPriority::Medium,
            ))
            .map_err(storage_err)?;

        spawn_task_timer(self.bridge.clone(), self.attention.clone(), ws.clone(), updated.progress_id);

        Ok(CommandOutput::ok_data(
            serde_json::to_value(&updated).expect("serialize progress entry"),
        ))
    }
}

/// Background check-in loop: every 5 minutes, auto-saves the active
/// context's current task and consults the break policy. Exits once the
/// task leaves `IN_PROGRESS` or a mandatory break is reached.
fn spawn_task_timer(bridge: Arc<CommandState>, attention: Arc<AttentionEngine>, workspace_id: String, progress_id: i64) {
    tokio::spawn(async move {
        let started = Utc::now();
        let mut ticker = tokio::time::interval(Duration::from_secs(5 * 60));
        ticker.tick().await; // first tick fires immediately

        loop {
            ticker.tick().await;

            match bridge.store.get_progress(&workspace_id, progress_id).await {
                Ok(Some(entry)) if entry.status == ProgressStatus::InProgress => {}
                _ => break,
            }

            let _ = bridge
                .store
                .update_active_context(&workspace_id, serde_json::json!({ "current_task": progress_id }))
                .await;

            let elapsed_minutes = (Utc::now() - started).num_minutes().max(0) as u32;
            if attention.recommend_break(elapsed_minutes).urgency == BreakUrgency::Mandatory {
                break;
            }
        }
    });
}

// ---------------------------------------------------------------------------
// session.end (attention-aware extension)
// ---------------------------------------------------------------------------

pub struct AttentionSessionEndHandler {
    bridge: Arc<CommandState>,
    attention: Arc<AttentionEngine>,
}

impl AttentionSessionEndHandler {
    pub fn new(bridge: Arc<CommandState>, attention: Arc<AttentionEngine>) -> Self {
        Self { bridge, attention }
    }
}

#[async_trait]
impl CommandHandler for AttentionSessionEndHandler {
    async fn execute(&self, ctx: CommandContext) -> Result<CommandOutput> {
        let ws = workspace_id(&ctx)?;

        let active_context = self.bridge.store.get_active_context(&ws).await.map_err(storage_err)?;
        let work_minutes = active_context
            .session_start
            .map(|t| (Utc::now() - t).num_minutes().max(0) as u32)
            .unwrap_or(0);
        let break_recommendation = self.attention.recommend_break(work_minutes);

        let updated = self
            .bridge
            .store
            .update_active_context(&ws, serde_json::json!({ "session_end": Utc::now() }))
            .await
            .map_err(storage_err)?;

        self.bridge
            .event_bus
            .publish(Event::new(SOURCE_SYSTEM, EventData::SessionEnded, EventPriority::Medium))
            .map_err(storage_err)?;

        Ok(CommandOutput::ok_data(serde_json::json!({
            "active_context": updated,
            "break_recommendation": break_recommendation,
        })))
    }
}

// ---------------------------------------------------------------------------
// stats (attention-aware extension)
// ---------------------------------------------------------------------------

pub struct AttentionStatsHandler {
    bridge: Arc<CommandState>,
    attention: Arc<AttentionEngine>,
}

impl AttentionStatsHandler {
    pub fn new(bridge: Arc<CommandState>, attention: Arc<AttentionEngine>) -> Self {
        Self { bridge, attention }
    }
}

#[async_trait]
impl CommandHandler for AttentionStatsHandler {
    async fn execute(&self, ctx: CommandContext) -> Result<CommandOutput> {
        let ws = workspace_id(&ctx)?;
        let uid = user_id(&ctx)?;

        let active_context = self.bridge.store.get_active_context(&ws).await.map_err(storage_err)?;
        let recent_activity = self
            .bridge
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
            .bridge
            .broker
            .budget_roles()
            .map(|role| {
                let remaining = self.bridge.broker.budget_remaining(&ws, role).unwrap_or(0);
                (role.to_string(), serde_json::json!(remaining))
            })
            .collect();

        let backend_health: Vec<serde_json::Value> = self
            .bridge
            .broker
            .registry()
            .list()
            .into_iter()
            .map(|b| serde_json::json!({ "name": b.name, "health": b.health }))
            .collect();

        let current_state = self.attention.current_state(&uid);
        let work_minutes = active_context
            .last_break
            .or(active_context.session_start)
            .map(|t| (Utc::now() - t).num_minutes().max(0) as u32)
            .unwrap_or(0);
        let break_recommendation = self.attention.recommend_break(work_minutes);

        Ok(CommandOutput::ok_data(serde_json::json!({
            "attention_state": current_state.attention_state,
            "energy_level": current_state.energy_level,
            "completed_count": completed_count,
            "budget_remaining": budget_remaining,
            "backend_health": backend_health,
            "break_recommendation": break_recommendation,
        })))
    }
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

pub fn register_attention_commands(
    registry: &mut CommandRegistry,
    bridge: Arc<CommandState>,
    attention: Arc<AttentionEngine>,
) {
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
        descriptor("task.assess", "Assess Task Fit", CommandCategory::Task),
        Arc::new(TaskAssessHandler::new(bridge.clone(), attention.clone())),
    );
    registry.register(
        descriptor("task.implement", "Start Task", CommandCategory::Task),
        Arc::new(TaskImplementHandler::new(bridge.clone(), attention.clone())),
    );
    registry.register(
        descriptor("session.end", "End Session", CommandCategory::Session),
        Arc::new(AttentionSessionEndHandler::new(bridge.clone(), attention.clone())),
    );
    registry.register(
        descriptor("stats", "Stats", CommandCategory::System),
        Arc::new(AttentionStatsHandler::new(bridge, attention)),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use dctx_bridge::command_registry::CommandSource;
    use dctx_bridge::event_bus::EventBus;
    use dctx_core::cache::Store;
    use dctx_core::config::AttentionConfig;
    use dctx_harness::broker::Broker;
    use dctx_harness::budget::BudgetTracker;
    use dctx_harness::mcp::BackendRegistry;
    use std::collections::HashMap;

    async fn test_setup() -> (Arc<CommandState>, Arc<AttentionEngine>) {
        let store = Store::new_in_memory().await.expect("in-memory store");
        let broker = Broker::new(
            BackendRegistry::new(),
            BudgetTracker::default(),
            2,
            Duration::from_millis(200),
            HashMap::new(),
        );
        let event_bus = EventBus::new();
        let bridge = Arc::new(CommandState {
            store: Arc::new(store),
            broker: Arc::new(broker),
            event_bus: event_bus.clone(),
        });
        let attention = Arc::new(AttentionEngine::new(AttentionConfig::default(), event_bus));
        (bridge, attention)
    }

    #[tokio::test]
    async fn task_assess_scores_an_existing_entry() {
        let (bridge, attention) = test_setup().await;
        let entry = bridge.store.log_progress("/ws", "write parser".into(), None).await.unwrap();
        bridge
            .store
            .set_task_attributes("/ws", entry.progress_id, Some(0.3), Some(20), Some(EnergyRequired::Low))
            .await
            .unwrap();

        let handler = TaskAssessHandler::new(bridge, attention);
        let ctx = CommandContext::new(CommandSource::Cli, "")
            .with_param("workspace_id", serde_json::json!("/ws"))
            .with_param("user_id", serde_json::json!("u1"))
            .with_param("progress_id", serde_json::json!(entry.progress_id));
        let out = handler.execute(ctx).await.unwrap();
        assert!(out.data.unwrap()["suitability"]["suitability_score"].as_f64().is_some());
    }

    #[tokio::test]
    async fn task_assess_requires_progress_id() {
        let (bridge, attention) = test_setup().await;
        let handler = TaskAssessHandler::new(bridge, attention);
        let ctx = CommandContext::new(CommandSource::Cli, "")
            .with_param("workspace_id", serde_json::json!("/ws"))
            .with_param("user_id", serde_json::json!("u1"));
        let result = handler.execute(ctx).await;
        assert!(matches!(result, Err(CommandError::InvalidArgs(_))));
    }

    #[tokio::test]
    async fn task_implement_marks_in_progress_by_id() {
        let (bridge, attention) = test_setup().await;
        let entry = bridge.store.log_progress("/ws", "write parser".into(), None).await.unwrap();

        let handler = TaskImplementHandler::new(bridge.clone(), attention);
        let ctx = CommandContext::new(CommandSource::Cli, "")
            .with_param("workspace_id", serde_json::json!("/ws"))
            .with_param("user_id", serde_json::json!("u1"))
            .with_param("progress_id", serde_json::json!(entry.progress_id));
        let out = handler.execute(ctx).await.unwrap();
        assert_eq!(out.data.unwrap()["status"], serde_json::json!("IN_PROGRESS"));
    }

    #[tokio::test]
    async fn task_implement_picks_best_suitability_todo_when_unspecified() {
        let (bridge, attention) = test_setup().await;
        let hard = bridge.store.log_progress("/ws", "big refactor".into(), None).await.unwrap();
        bridge
            .store
            .set_task_attributes("/ws", hard.progress_id, Some(0.95), Some(120), Some(EnergyRequired::High))
            .await
            .unwrap();
        let easy = bridge.store.log_progress("/ws", "typo fix".into(), None).await.unwrap();
        bridge
            .store
            .set_task_attributes("/ws", easy.progress_id, Some(0.05), Some(5), Some(EnergyRequired::Low))
            .await
            .unwrap();

        let handler = TaskImplementHandler::new(bridge.clone(), attention);
        let ctx = CommandContext::new(CommandSource::Cli, "")
            .with_param("workspace_id", serde_json::json!("/ws"))
            .with_param("user_id", serde_json::json!("u1"));
        let out = handler.execute(ctx).await.unwrap();
        assert_eq!(out.data.unwrap()["progress_id"], serde_json::json!(easy.progress_id));
    }

    #[tokio::test]
    async fn register_attention_commands_covers_the_surface() {
        let (bridge, attention) = test_setup().await;
        let mut registry = CommandRegistry::new();
        register_attention_commands(&mut registry, bridge, attention);
        for name in ["task.assess", "task.implement", "session.end", "stats"] {
            assert!(registry.has(name), "missing command {name}");
        }
    }
}
