//! Core library for dope-broker — foundational types, the Session &
//! Context Store, configuration, daemon lockfile handling, and workspace
//! snapshotting.
//!
//! This crate provides:
//! - The data model shared by every other `dctx-*` crate
//! - The durable SQLite-backed Session & Context Store
//! - Configuration loading with per-concern defaults
//! - Daemon PID-lockfile acquisition and stale-PID recovery
//! - Content-addressed workspace snapshots for the Sync/Index Coordinator

pub mod cache;
pub mod config;
pub mod error;
pub mod lockfile;
pub mod snapshot;
pub mod types;
