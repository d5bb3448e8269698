//! Wire payloads carried over the event bus and the WebSocket fan-out.

use dctx_core::types::Event;
use serde::{Deserialize, Serialize};

/// What actually travels over [`crate::event_bus::EventBus`]. A thin
/// wrapper around the core [`Event`] so the bus can be extended with
/// bridge-only control frames (e.g. a heartbeat) without widening the
/// core type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeMessage {
    Domain(Event),
    Heartbeat { at: chrono::DateTime<chrono::Utc> },
}

impl From<Event> for BridgeMessage {
    fn from(event: Event) -> Self {
        BridgeMessage::Domain(event)
    }
}
