//! MCP wire protocol (JSON-RPC) and the Backend Registry (§4.2).
//!
//! The registry tracks every configured backend MCP server, probes its
//! health, and hands out a per-backend [`CircuitBreaker`] so the broker
//! never has to special-case "is this the first call to this backend".

use std::collections::HashMap;
use std::process::Stdio as ProcStdio;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use dctx_core::types::{BackendDescriptor, Health, RoleTag, Transport};

use crate::circuit_breaker::CircuitBreaker;

/// MCP protocol version this broker speaks.
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

// ---------------------------------------------------------------------------
// JSON-RPC transport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Option<serde_json::Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    pub fn new(method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(serde_json::Value::Number(1.into())),
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

pub mod error_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
}

// ---------------------------------------------------------------------------
// Tool call / result
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    #[serde(default)]
    pub content: Vec<ToolResultContent>,
    #[serde(default, rename = "isError")]
    pub is_error: bool,
    /// Abstract cost unit this call consumed against the role's rolling
    /// budget. Never interpreted as tokens or wall-clock by the broker.
    #[serde(default)]
    pub cost: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolResultContent {
    Text { text: String },
    Image { data: String, mime_type: String },
}

impl ToolCallResult {
    pub fn text(text: impl Into<String>, cost: u64) -> Self {
        Self {
            content: vec![ToolResultContent::Text { text: text.into() }],
            is_error: false,
            cost,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![ToolResultContent::Text {
                text: message.into(),
            }],
            is_error: true,
            cost: 0,
        }
    }

    pub fn text_content(&self) -> Option<&str> {
        self.content.iter().find_map(|c| match c {
            ToolResultContent::Text { text } => Some(text.as_str()),
            _ => None,
        })
    }
}

// ---------------------------------------------------------------------------
// McpError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum McpError {
    #[error("backend `{0}` not registered")]
    NotFound(String),
    #[error("transport error calling `{backend}`: {message}")]
    Transport { backend: String, message: String },
    #[error("backend `{0}` returned a JSON-RPC error: {1}")]
    Rpc(String, String),
}

// ---------------------------------------------------------------------------
// Backend Registry (§4.2)
// ---------------------------------------------------------------------------

/// Tracks every configured backend, its live health, and its circuit
/// breaker. One registry instance is shared by the whole broker.
pub struct BackendRegistry {
    backends: DashMap<String, BackendDescriptor>,
    breakers: DashMap<String, CircuitBreaker>,
    http: reqwest::Client,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: DashMap::new(),
            breakers: DashMap::new(),
            http: reqwest::Client::new(),
        }
    }

    /// Register (or replace) a backend descriptor.
    pub fn register(&self, descriptor: BackendDescriptor) {
        info!(backend = %descriptor.name, role_tags = ?descriptor.role_tags, "registered backend");
        self.breakers
            .entry(descriptor.name.clone())
            .or_insert_with(|| CircuitBreaker::new(Default::default()));
        self.backends.insert(descriptor.name.clone(), descriptor);
    }

    pub fn unregister(&self, name: &str) {
        self.backends.remove(name);
        self.breakers.remove(name);
        info!(backend = name, "unregistered backend");
    }

    pub fn get(&self, name: &str) -> Option<BackendDescriptor> {
        self.backends.get(name).map(|b| b.clone())
    }

    pub fn list(&self) -> Vec<BackendDescriptor> {
        self.backends.iter().map(|e| e.value().clone()).collect()
    }

    /// List backends carrying `role`, ordered by descending priority
    /// (highest priority first), ties broken by name for determinism.
    pub fn by_role(&self, role: RoleTag) -> Vec<BackendDescriptor> {
        let mut matches: Vec<BackendDescriptor> = self
            .backends
            .iter()
            .filter(|e| e.value().role_tags.contains(&role))
            .map(|e| e.value().clone())
            .collect();
        matches.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
        matches
    }

    /// The circuit breaker guarding calls to `name`, if the backend is
    /// known.
    pub fn breaker(&self, name: &str) -> Option<CircuitBreaker> {
        self.breakers.get(name).map(|b| b.clone())
    }

    /// Record an externally-observed health result (e.g. from a failed
    /// or successful `call`) without going through a fresh probe.
    pub fn record_health(&self, name: &str, health: Health) {
        if let Some(mut entry) = self.backends.get_mut(name) {
            entry.health = health;
        }
    }

    /// Actively probe one backend and update its stored health.
    pub async fn probe(&self, name: &str) -> Result<Health, McpError> {
        let descriptor = self.get(name).ok_or_else(|| McpError::NotFound(name.to_string()))?;
        let health = match descriptor.transport {
            Transport::Http => self.probe_http(&descriptor).await,
            Transport::Stdio => self.probe_stdio(&descriptor).await,
        };
        self.record_health(name, health);
        Ok(health)
    }

    /// Probe every registered backend concurrently.
    pub async fn probe_all(&self) -> HashMap<String, Health> {
        let names: Vec<String> = self.backends.iter().map(|e| e.key().clone()).collect();
        let mut out = HashMap::with_capacity(names.len());
        for name in names {
            let health = self.probe(&name).await.unwrap_or(Health::Unknown);
            out.insert(name, health);
        }
        out
    }

    async fn probe_http(&self, descriptor: &BackendDescriptor) -> Health {
        let path = descriptor.probe_path.as_deref().unwrap_or("/health");
        let url = format!("{}{}", descriptor.endpoint.trim_end_matches('/'), path);
        let timeout = Duration::from_millis(descriptor.default_timeout_ms);
        match self.http.get(&url).timeout(timeout).send().await {
            Ok(resp) if resp.status().is_success() => Health::Up,
            Ok(_) => Health::Degraded,
            Err(e) => {
                warn!(backend = %descriptor.name, error = %e, "http probe failed");
                Health::Down
            }
        }
    }

    async fn probe_stdio(&self, descriptor: &BackendDescriptor) -> Health {
        let mut parts = descriptor.endpoint.split_whitespace();
        let Some(program) = parts.next() else {
            return Health::Unknown;
        };
        let timeout = Duration::from_millis(descriptor.default_timeout_ms);
        let spawn = Command::new(program)
            .args(parts)
            .stdin(ProcStdio::null())
            .stdout(ProcStdio::null())
            .stderr(ProcStdio::null())
            .spawn();
        match spawn {
            Ok(mut child) => match tokio::time::timeout(timeout, child.wait()).await {
                Ok(Ok(_)) => Health::Up,
                Ok(Err(e)) => {
                    warn!(backend = %descriptor.name, error = %e, "stdio probe wait failed");
                    Health::Down
                }
                Err(_) => {
                    let _ = child.kill().await;
                    Health::Degraded
                }
            },
            Err(e) => {
                warn!(backend = %descriptor.name, error = %e, "stdio probe spawn failed");
                Health::Down
            }
        }
    }

    /// Invoke a tool on a specific backend, bypassing resolution/retry
    /// (the broker composes this with `breaker()` and its own retry loop).
    pub async fn call(
        &self,
        descriptor: &BackendDescriptor,
        request: ToolCallRequest,
    ) -> Result<ToolCallResult, McpError> {
        match descriptor.transport {
            Transport::Http => self.call_http(descriptor, request).await,
            Transport::Stdio => self.call_stdio(descriptor, request).await,
        }
    }

    async fn call_http(
        &self,
        descriptor: &BackendDescriptor,
        request: ToolCallRequest,
    ) -> Result<ToolCallResult, McpError> {
        let rpc = JsonRpcRequest::new(
            "tools/call",
            Some(serde_json::json!({ "name": request.name, "arguments": request.arguments })),
        );
        let timeout = Duration::from_millis(descriptor.default_timeout_ms);
        let resp = self
            .http
            .post(&descriptor.endpoint)
            .json(&rpc)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| McpError::Transport {
                backend: descriptor.name.clone(),
                message: e.to_string(),
            })?;
        let body: JsonRpcResponse = resp.json().await.map_err(|e| McpError::Transport {
            backend: descriptor.name.clone(),
            message: e.to_string(),
        })?;
        parse_rpc_result(&descriptor.name, body)
    }

    async fn call_stdio(
        &self,
        descriptor: &BackendDescriptor,
        request: ToolCallRequest,
    ) -> Result<ToolCallResult, McpError> {
        let mut parts = descriptor.endpoint.split_whitespace();
        let program = parts.next().ok_or_else(|| McpError::Transport {
            backend: descriptor.name.clone(),
            message: "empty stdio command".to_string(),
        })?;
        let mut child = Command::new(program)
            .args(parts)
            .stdin(ProcStdio::piped())
            .stdout(ProcStdio::piped())
            .stderr(ProcStdio::null())
            .spawn()
            .map_err(|e| McpError::Transport {
                backend: descriptor.name.clone(),
                message: e.to_string(),
            })?;

        let rpc = JsonRpcRequest::new(
            "tools/call",
            Some(serde_json::json!({ "name": request.name, "arguments": request.arguments })),
        );
        let mut line = serde_json::to_string(&rpc).map_err(|e| McpError::Transport {
            backend: descriptor.name.clone(),
            message: e.to_string(),
        })?;
        line.push('\n');

        let mut stdin = child.stdin.take().ok_or_else(|| McpError::Transport {
            backend: descriptor.name.clone(),
            message: "no stdin handle".to_string(),
        })?;
        stdin.write_all(line.as_bytes()).await.map_err(|e| McpError::Transport {
            backend: descriptor.name.clone(),
            message: e.to_string(),
        })?;
        drop(stdin);

        let stdout = child.stdout.take().ok_or_else(|| McpError::Transport {
            backend: descriptor.name.clone(),
            message: "no stdout handle".to_string(),
        })?;
        let mut reader = BufReader::new(stdout).lines();
        let timeout = Duration::from_millis(descriptor.default_timeout_ms);
        let next_line = tokio::time::timeout(timeout, reader.next_line())
            .await
            .map_err(|_| McpError::Transport {
                backend: descriptor.name.clone(),
                message: "timed out waiting for response".to_string(),
            })?
            .map_err(|e| McpError::Transport {
                backend: descriptor.name.clone(),
                message: e.to_string(),
            })?;
        let _ = child.kill().await;

        let raw = next_line.ok_or_else(|| McpError::Transport {
            backend: descriptor.name.clone(),
            message: "backend closed stdout without a response".to_string(),
        })?;
        let body: JsonRpcResponse = serde_json::from_str(&raw).map_err(|e| McpError::Transport {
            backend: descriptor.name.clone(),
            message: e.to_string(),
        })?;
        parse_rpc_result(&descriptor.name, body)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_rpc_result(backend: &str, body: JsonRpcResponse) -> Result<ToolCallResult, McpError> {
    if body.is_error() {
        let err = body.error.unwrap();
        return Err(McpError::Rpc(backend.to_string(), err.message));
    }
    let result = body.result.unwrap_or(serde_json::Value::Null);
    serde_json::from_value(result.clone()).or_else(|_| {
        debug!(backend, "non-standard tool result shape, wrapping as text");
        Ok(ToolCallResult::text(result.to_string(), 0))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dctx_core::types::Priority;

    fn descriptor(name: &str, priority: Priority, roles: Vec<RoleTag>) -> BackendDescriptor {
        BackendDescriptor {
            name: name.to_string(),
            endpoint: "http://localhost:9".to_string(),
            transport: Transport::Http,
            role_tags: roles,
            priority,
            probe_path: None,
            probe_port: None,
            default_timeout_ms: 50,
            health: Health::Unknown,
            consecutive_failures: 0,
            last_latency_ms: None,
            extra: serde_json::Value::Null,
        }
    }

    #[test]
    fn register_and_list() {
        let reg = BackendRegistry::new();
        reg.register(descriptor("a", Priority::Utility, vec![RoleTag::Documentation]));
        assert_eq!(reg.list().len(), 1);
        assert!(reg.get("a").is_some());
        assert!(reg.breaker("a").is_some());
    }

    #[test]
    fn unregister_removes_breaker_too() {
        let reg = BackendRegistry::new();
        reg.register(descriptor("a", Priority::Utility, vec![RoleTag::Documentation]));
        reg.unregister("a");
        assert!(reg.get("a").is_none());
        assert!(reg.breaker("a").is_none());
    }

    #[test]
    fn by_role_orders_by_priority_desc_then_name() {
        let reg = BackendRegistry::new();
        reg.register(descriptor("low", Priority::Utility, vec![RoleTag::CodeSearch]));
        reg.register(descriptor("high", Priority::CriticalPath, vec![RoleTag::CodeSearch]));
        reg.register(descriptor("mid-b", Priority::Workflow, vec![RoleTag::CodeSearch]));
        reg.register(descriptor("mid-a", Priority::Workflow, vec![RoleTag::CodeSearch]));
        reg.register(descriptor("unrelated", Priority::CriticalPath, vec![RoleTag::Memory]));

        let ordered = reg.by_role(RoleTag::CodeSearch);
        let names: Vec<&str> = ordered.iter().map(|b| b.name.as_str()).collect();
        assert_eq!(names, vec!["high", "mid-a", "mid-b", "low"]);
    }

    #[test]
    fn record_health_updates_stored_descriptor() {
        let reg = BackendRegistry::new();
        reg.register(descriptor("a", Priority::Utility, vec![RoleTag::Documentation]));
        reg.record_health("a", Health::Down);
        assert_eq!(reg.get("a").unwrap().health, Health::Down);
    }

    #[tokio::test]
    async fn probe_http_unreachable_is_down() {
        let reg = BackendRegistry::new();
        reg.register(descriptor("a", Priority::Utility, vec![RoleTag::Documentation]));
        let health = reg.probe("a").await.unwrap();
        assert_eq!(health, Health::Down);
    }

    #[tokio::test]
    async fn probe_unknown_backend_errors() {
        let reg = BackendRegistry::new();
        assert!(matches!(reg.probe("nope").await, Err(McpError::NotFound(_))));
    }

    #[test]
    fn tool_call_result_text_and_error() {
        let ok = ToolCallResult::text("hi", 3);
        assert!(!ok.is_error);
        assert_eq!(ok.cost, 3);
        assert_eq!(ok.text_content(), Some("hi"));

        let err = ToolCallResult::error("bad");
        assert!(err.is_error);
        assert_eq!(err.cost, 0);
    }
}
