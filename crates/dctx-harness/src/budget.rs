//! Rolling 24h per-`(workspace, role)` cost budget (§4.1.3).
//!
//! Unlike the continuous-refill token bucket this replaces, a budget here
//! is a sliding window of timestamped consumption records: a check prunes
//! everything older than the window before summing what remains. The cost
//! unit is an opaque `u64` — the broker never interprets it as tokens or
//! wall-clock, only that it accumulates monotonically within the window.

use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

/// Error returned when a role's rolling budget has no room for a request.
#[derive(Debug, thiserror::Error)]
#[error("budget exceeded for workspace={workspace_id} role={role} (used {used}/{cap} in the last {window_secs}s)")]
pub struct BudgetExceeded {
    pub workspace_id: String,
    pub role: String,
    pub used: u64,
    pub cap: u64,
    pub window_secs: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct BudgetConfig {
    pub window: Duration,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone)]
struct Record {
    at: DateTime<Utc>,
    cost: u64,
}

/// Tracks consumption per `(workspace_id, role)` key and enforces a
/// per-role daily cap (`Config.broker.role_daily_budget`).
#[derive(Debug)]
pub struct BudgetTracker {
    config: BudgetConfig,
    ledger: DashMap<(String, String), Vec<Record>>,
}

impl BudgetTracker {
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            config,
            ledger: DashMap::new(),
        }
    }

    /// Sum of cost consumed by `(workspace_id, role)` within the rolling
    /// window, as of now. Pruning happens as a side effect.
    pub fn used(&self, workspace_id: &str, role: &str) -> u64 {
        let key = (workspace_id.to_string(), role.to_string());
        self.prune(&key);
        self.ledger.get(&key).map(|r| r.iter().map(|rec| rec.cost).sum()).unwrap_or(0)
    }

    /// Check whether `cost` additional units fit under `cap` for this
    /// key, without consuming anything.
    pub fn check(&self, workspace_id: &str, role: &str, cost: u64, cap: u64) -> Result<(), BudgetExceeded> {
        let used = self.used(workspace_id, role);
        if used + cost > cap {
            return Err(BudgetExceeded {
                workspace_id: workspace_id.to_string(),
                role: role.to_string(),
                used,
                cap,
                window_secs: self.config.window.as_secs(),
            });
        }
        Ok(())
    }

    /// Check-then-consume in one step; the common case after a
    /// successful tool call.
    pub fn check_and_consume(
        &self,
        workspace_id: &str,
        role: &str,
        cost: u64,
        cap: u64,
    ) -> Result<(), BudgetExceeded> {
        self.check(workspace_id, role, cost, cap)?;
        self.consume(workspace_id, role, cost);
        Ok(())
    }

    /// Record `cost` units of consumption against `(workspace_id, role)`
    /// at the current instant.
    pub fn consume(&self, workspace_id: &str, role: &str, cost: u64) {
        let key = (workspace_id.to_string(), role.to_string());
        self.prune(&key);
        self.ledger
            .entry(key)
            .or_default()
            .push(Record { at: Utc::now(), cost });
    }

    /// Drop every record older than the window for `key`.
    fn prune(&self, key: &(String, String)) {
        if let Some(mut records) = self.ledger.get_mut(key) {
            let cutoff = Utc::now() - chrono::Duration::from_std(self.config.window).unwrap_or_default();
            records.retain(|r| r.at >= cutoff);
        }
    }
}

impl Default for BudgetTracker {
    fn default() -> Self {
        Self::new(BudgetConfig::default())
    }
}
