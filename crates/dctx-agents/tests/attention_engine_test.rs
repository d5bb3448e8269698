//! Cross-module Attention Engine tests: unlike the inline `#[cfg(test)]`
//! unit tests in `src/attention.rs` (which check returned values directly),
//! these exercise the engine against a real `EventBus` subscriber to
//! confirm the events it claims to emit actually reach the wire (§4.4,
//! §4.5), and that `register_attention_commands` layers its `task.*`
//! handlers onto a registry a CLI/daemon would actually use end to end.

use std::time::Duration;

use dctx_agents::attention::AttentionEngine;
use dctx_agents::commands::register_attention_commands;
use dctx_bridge::command_registry::{CommandContext, CommandRegistry, CommandSource};
use dctx_bridge::commands::{register_default_commands, CommandState};
use dctx_bridge::event_bus::EventBus;
use dctx_bridge::protocol::BridgeMessage;
use dctx_core::cache::Store;
use dctx_core::config::AttentionConfig;
use dctx_core::types::{Event, EventData};
use dctx_harness::broker::Broker;
use dctx_harness::budget::BudgetTracker;
use dctx_harness::mcp::BackendRegistry;
use std::collections::HashMap;
use std::sync::Arc;

async fn recv_domain(rx: &dctx_bridge::event_bus::Receiver) -> Event {
    match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
        Ok(BridgeMessage::Domain(event)) => event,
        Ok(other) => panic!("expected a domain event, got {other:?}"),
        Err(_) => panic!("timed out waiting for event"),
    }
}

#[tokio::test]
async fn hyperfocus_sample_is_published_to_subscribers() {
    let event_bus = EventBus::new();
    let rx = event_bus.subscribe();
    let engine = AttentionEngine::new(AttentionConfig::default(), event_bus);

    // Long session, minimal task switching -> Hyperfocused (see attention.rs classify()).
    engine.report_sample("u1", 0.5, 50.0, 0.05);

    let event = recv_domain(&rx).await;
    assert!(matches!(event.data, EventData::HyperfocusDetected));
    assert_eq!(event.source_system, "attention-engine");
}

#[tokio::test]
async fn mandatory_break_is_published_once_threshold_crossed() {
    let event_bus = EventBus::new();
    let rx = event_bus.subscribe();
    let engine = AttentionEngine::new(AttentionConfig::default(), event_bus);

    let rec = engine.recommend_break(95);
    assert_eq!(rec.urgency, dctx_agents::attention::BreakUrgency::Mandatory);

    let event = recv_domain(&rx).await;
    assert!(matches!(event.data, EventData::BreakRequired));
}

async fn full_registry() -> (Arc<CommandState>, CommandRegistry) {
    let store = Arc::new(Store::new_in_memory().await.expect("in-memory store"));
    let broker = Arc::new(Broker::new(
        BackendRegistry::new(),
        BudgetTracker::default(),
        2,
        Duration::from_millis(200),
        HashMap::new(),
    ));
    let event_bus = EventBus::new();
    let state = Arc::new(CommandState { store, broker, event_bus: event_bus.clone() });
    let attention = Arc::new(AttentionEngine::new(AttentionConfig::default(), event_bus));

    let mut registry = CommandRegistry::new();
    register_default_commands(&mut registry, state.clone());
    register_attention_commands(&mut registry, state.clone(), attention);
    (state, registry)
}

#[tokio::test]
async fn task_implement_then_assess_round_trip_through_the_full_surface() {
    let (state, registry) = full_registry().await;
    let entry = state.store.log_progress("/ws", "wire up OAuth".into(), None).await.unwrap();

    let ctx = CommandContext::new(CommandSource::Cli, "")
        .with_param("workspace_id", serde_json::json!("/ws"))
        .with_param("user_id", serde_json::json!("u1"))
        .with_param("progress_id", serde_json::json!(entry.progress_id));

    let implemented = registry.execute("task.implement", ctx.clone()).await.unwrap();
    assert_eq!(implemented.data.unwrap()["status"], serde_json::json!("IN_PROGRESS"));

    let assessed = registry.execute("task.assess", ctx).await.unwrap();
    assert!(assessed.data.unwrap()["suitability"]["suitability_score"].as_f64().is_some());
}

#[tokio::test]
async fn attention_aware_stats_overwrites_the_plain_stats_registration() {
    let (_, registry) = full_registry().await;
    let ctx = CommandContext::new(CommandSource::Cli, "")
        .with_param("workspace_id", serde_json::json!("/ws"))
        .with_param("user_id", serde_json::json!("u1"));

    let out = registry.execute("stats", ctx).await.unwrap();
    let data = out.data.unwrap();
    // Only the attention-aware handler returns `energy_level` and
    // `break_recommendation` alongside the bridge's plain fields.
    assert!(data["energy_level"].is_string());
    assert!(data["break_recommendation"].is_object());
}
