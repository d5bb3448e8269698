//! The Attention Engine (§4.4) and its attention-aware command surface
//! (`task.assess`, `task.implement`, and the extensions to
//! `session.end`/`stats`), layered on top of `dctx-bridge`'s command
//! registry and event bus.
//!
//! - [`attention`] — per-user attention/energy classification, task
//!   suitability scoring, and break policy
//! - [`commands`] — the `task.*` command handlers and the bridge's
//!   `session.end`/`stats` attention-aware overrides

pub mod attention;
pub mod commands;
