use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration loaded from `~/.dope-broker/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub attention: AttentionConfig,
    #[serde(default)]
    pub daemon: DaemonConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            store: StoreConfig::default(),
            broker: BrokerConfig::default(),
            attention: AttentionConfig::default(),
            daemon: DaemonConfig::default(),
        }
    }
}

impl Config {
    /// Load config from `~/.dope-broker/config.toml`, falling back to
    /// defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::Io(e.to_string()))?;
            let cfg: Config =
                toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
            Ok(cfg)
        } else {
            Ok(Config::default())
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text =
            std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config =
            toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".dope-broker")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_project_name")]
    pub project_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub workspace_root: Option<String>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            project_name: default_project_name(),
            log_level: default_log_level(),
            workspace_root: None,
        }
    }
}

fn default_project_name() -> String {
    "dope-broker".into()
}
fn default_log_level() -> String {
    "info".into()
}

/// Session & Context Store settings (§4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: String,
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: String,
    #[serde(default = "default_recent_activity_limit")]
    pub recent_activity_limit: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            snapshot_dir: default_snapshot_dir(),
            recent_activity_limit: default_recent_activity_limit(),
        }
    }
}

fn default_store_path() -> String {
    "~/.dope-broker/store.db".into()
}
fn default_snapshot_dir() -> String {
    "~/.dope-context/snapshots".into()
}
fn default_recent_activity_limit() -> u32 {
    20
}

/// Meta-Broker settings: per-role rolling budgets and retry policy (§4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_role_budgets")]
    pub role_daily_budget: std::collections::HashMap<String, u64>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backend_timeout_ms")]
    pub default_timeout_ms: u64,
    #[serde(default = "default_circuit_failure_threshold")]
    pub circuit_failure_threshold: u32,
    #[serde(default = "default_circuit_reset_secs")]
    pub circuit_reset_secs: u64,
    #[serde(default)]
    pub seed_backends: Vec<SeedBackend>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            role_daily_budget: default_role_budgets(),
            max_retries: default_max_retries(),
            default_timeout_ms: default_backend_timeout_ms(),
            circuit_failure_threshold: default_circuit_failure_threshold(),
            circuit_reset_secs: default_circuit_reset_secs(),
            seed_backends: Vec::new(),
        }
    }
}

fn default_role_budgets() -> std::collections::HashMap<String, u64> {
    let mut m = std::collections::HashMap::new();
    m.insert("research".to_string(), 20_000);
    m.insert("implementation".to_string(), 25_000);
    m.insert("quality".to_string(), 15_000);
    m.insert("coordination".to_string(), 10_000);
    m
}
fn default_max_retries() -> u32 {
    2
}
fn default_backend_timeout_ms() -> u64 {
    10_000
}
fn default_circuit_failure_threshold() -> u32 {
    5
}
fn default_circuit_reset_secs() -> u64 {
    30
}

/// A statically-configured backend entry, merged into the registry at
/// startup (§4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedBackend {
    pub name: String,
    pub endpoint: String,
    pub transport: String,
    pub role_tags: Vec<String>,
    pub priority: String,
}

/// Attention Engine thresholds (§4.4, Open Question 1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttentionConfig {
    #[serde(default = "default_break_soft_minutes")]
    pub break_soft_minutes: u32,
    #[serde(default = "default_break_firm_minutes")]
    pub break_firm_minutes: u32,
    #[serde(default = "default_break_hard_minutes")]
    pub break_hard_minutes: u32,
    #[serde(default = "default_hyperfocus_cadence_threshold")]
    pub hyperfocus_cadence_threshold: f64,
    #[serde(default = "default_overwhelm_switch_rate_threshold")]
    pub overwhelm_switch_rate_threshold: f64,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            break_soft_minutes: default_break_soft_minutes(),
            break_firm_minutes: default_break_firm_minutes(),
            break_hard_minutes: default_break_hard_minutes(),
            hyperfocus_cadence_threshold: default_hyperfocus_cadence_threshold(),
            overwhelm_switch_rate_threshold: default_overwhelm_switch_rate_threshold(),
        }
    }
}

fn default_break_soft_minutes() -> u32 {
    25
}
fn default_break_firm_minutes() -> u32 {
    60
}
fn default_break_hard_minutes() -> u32 {
    90
}
fn default_hyperfocus_cadence_threshold() -> f64 {
    0.85
}
fn default_overwhelm_switch_rate_threshold() -> f64 {
    0.6
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_daemon_port")]
    pub port: u16,
    #[serde(default = "default_daemon_host")]
    pub host: String,
    #[serde(default = "default_lockfile_path")]
    pub lockfile_path: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            port: default_daemon_port(),
            host: default_daemon_host(),
            lockfile_path: default_lockfile_path(),
        }
    }
}

fn default_daemon_port() -> u16 {
    9876
}
fn default_daemon_host() -> String {
    "127.0.0.1".into()
}
fn default_lockfile_path() -> String {
    "~/.dope-broker/daemon.lock".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let cfg = Config::default();
        let text = cfg.to_toml().unwrap();
        let back: Config = toml::from_str(&text).unwrap();
        assert_eq!(back.broker.max_retries, cfg.broker.max_retries);
        assert_eq!(back.attention.break_soft_minutes, 25);
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let cfg: Config = toml::from_str("[general]\nproject_name = \"x\"\n").unwrap();
        assert_eq!(cfg.general.project_name, "x");
        assert_eq!(cfg.broker.max_retries, default_max_retries());
    }
}
