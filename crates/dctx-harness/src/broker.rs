//! The Meta-Broker (§4.1): the single entry point for tool invocations.
//!
//! `Broker::invoke` resolves a tool+role to a backend, executes it through
//! that backend's circuit breaker with same-backend retries, fails over to
//! the next candidate, and enforces the role's rolling budget and the
//! caller's attention state before any of that happens.

use std::time::Duration;

use rand::Rng;
use tracing::{info, instrument, warn};

use dctx_core::error::CoreError;
use dctx_core::types::{AttentionState, BackendDescriptor, Health, RoleTag};

use crate::budget::BudgetTracker;
use crate::mcp::{BackendRegistry, McpError, ToolCallRequest, ToolCallResult, ToolResultContent};

/// Attention context supplied by (or inferred for) the caller. The broker
/// never infers this itself — the Attention Engine (`dctx-agents`) owns
/// inference and hands the broker a snapshot.
#[derive(Debug, Clone, Copy)]
pub struct AttentionSnapshot {
    pub state: AttentionState,
    pub work_minutes_since_break: u32,
}

impl Default for AttentionSnapshot {
    fn default() -> Self {
        Self {
            state: AttentionState::Focused,
            work_minutes_since_break: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub role_tag: RoleTag,
    pub workspace_id: String,
    pub user_id: String,
    pub attention: Option<AttentionSnapshot>,
    pub deadline: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct ToolResult {
    pub backend: String,
    pub latency_ms: u64,
    pub cost: u64,
    pub retries: u32,
    pub content: Vec<ToolResultContent>,
}

/// Budget-accounting bucket for a tool's required role. Coarser than
/// `RoleTag`: several capability tags share one rolling budget (§4.1.3).
fn budget_role(tag: RoleTag) -> &'static str {
    match tag {
        RoleTag::Documentation | RoleTag::WebResearch => "research",
        RoleTag::CodeEditing | RoleTag::CodeSearch => "implementation",
        RoleTag::Reasoning | RoleTag::Rerank => "quality",
        RoleTag::Memory | RoleTag::TaskPlanning | RoleTag::DesktopAutomation => "coordination",
    }
}

pub struct Broker {
    registry: BackendRegistry,
    budgets: BudgetTracker,
    max_retries: u32,
    default_timeout: Duration,
    role_daily_budget: std::collections::HashMap<String, u64>,
}

impl Broker {
    pub fn new(
        registry: BackendRegistry,
        budgets: BudgetTracker,
        max_retries: u32,
        default_timeout: Duration,
        role_daily_budget: std::collections::HashMap<String, u64>,
    ) -> Self {
        Self {
            registry,
            budgets,
            max_retries,
            default_timeout,
            role_daily_budget,
        }
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn budgets(&self) -> &BudgetTracker {
        &self.budgets
    }

    /// Remaining budget for `role` in `workspace_id`'s rolling window, or
    /// `None` if that role has no configured cap.
    pub fn budget_remaining(&self, workspace_id: &str, role: &str) -> Option<u64> {
        let cap = *self.role_daily_budget.get(role)?;
        Some(cap.saturating_sub(self.budgets.used(workspace_id, role)))
    }

    /// The four budget-role names this broker enforces caps for.
    pub fn budget_roles(&self) -> impl Iterator<Item = &str> {
        self.role_daily_budget.keys().map(String::as_str)
    }

    #[instrument(skip(self, request), fields(workspace_id = %request.workspace_id, role = ?request.role_tag, tool = %request.tool_name))]
    pub async fn invoke(&self, request: InvokeRequest) -> Result<ToolResult, CoreError> {
        let attention = request.attention.unwrap_or_default();

        if attention.work_minutes_since_break > 90 {
            warn!(
                workspace_id = %request.workspace_id,
                minutes = attention.work_minutes_since_break,
                "mandatory break threshold exceeded, refusing invocation"
            );
            return Err(CoreError::BreakRequired);
        }

        let role = budget_role(request.role_tag);
        let cap = *self.role_daily_budget.get(role).unwrap_or(&u64::MAX);
        self.budgets
            .check(&request.workspace_id, role, 1, cap)
            .map_err(|_| CoreError::BudgetExceeded {
                workspace_id: request.workspace_id.clone(),
                role: role.to_string(),
            })?;

        let deadline = self.shaped_deadline(&attention, request.deadline);

        let candidates = self.resolve(request.role_tag);
        if candidates.is_empty() {
            return Err(CoreError::NoBackend);
        }
        let candidates = self.shape_order(&attention, candidates);

        let tool_request = ToolCallRequest {
            name: request.tool_name.clone(),
            arguments: request.arguments.clone(),
        };

        let mut total_retries = 0u32;
        for candidate in &candidates {
            match self.call_with_retries(candidate, tool_request.clone(), deadline).await {
                Ok((result, retries, latency_ms)) => {
                    total_retries += retries;
                    self.budgets.consume(&request.workspace_id, role, result.cost.max(1));
                    info!(backend = %candidate.name, latency_ms, retries = total_retries, "tool invocation succeeded");
                    return Ok(ToolResult {
                        backend: candidate.name.clone(),
                        latency_ms,
                        cost: result.cost,
                        retries: total_retries,
                        content: result.content,
                    });
                }
                Err(retries) => {
                    total_retries += retries;
                    continue;
                }
            }
        }

        Err(CoreError::Unavailable)
    }

    /// §4.1.1: backends carrying the role, filtered to live health,
    /// ordered by priority then latency then name (already lexicographic
    /// in `BackendRegistry::by_role`; latency tie-break applied here).
    fn resolve(&self, role: RoleTag) -> Vec<BackendDescriptor> {
        let mut candidates: Vec<BackendDescriptor> = self
            .registry
            .by_role(role)
            .into_iter()
            .filter(|b| matches!(b.health, Health::Up | Health::Degraded))
            .collect();

        // Documentation-first: web-research calls try a documentation
        // backend before falling back (Open Question 4).
        if role == RoleTag::WebResearch {
            let mut docs: Vec<BackendDescriptor> = self
                .registry
                .by_role(RoleTag::Documentation)
                .into_iter()
                .filter(|b| matches!(b.health, Health::Up | Health::Degraded))
                .collect();
            docs.extend(candidates);
            candidates = docs;
        }

        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.last_latency_ms.unwrap_or(u64::MAX).cmp(&b.last_latency_ms.unwrap_or(u64::MAX)))
                .then_with(|| a.name.cmp(&b.name))
        });
        candidates
    }

    /// §4.1.4: scattered state reorders candidates by lowest latency
    /// first, trading selection quality for speed.
    fn shape_order(&self, attention: &AttentionSnapshot, mut candidates: Vec<BackendDescriptor>) -> Vec<BackendDescriptor> {
        if attention.state == AttentionState::Scattered {
            candidates.sort_by_key(|b| b.last_latency_ms.unwrap_or(u64::MAX));
        }
        candidates
    }

    fn shaped_deadline(&self, attention: &AttentionSnapshot, caller_deadline: Option<Duration>) -> Duration {
        let base = caller_deadline.unwrap_or(self.default_timeout).min(self.default_timeout);
        match attention.state {
            AttentionState::Scattered => base / 2,
            AttentionState::Hyperfocused => base * 2,
            _ => base,
        }
    }

    /// §4.1.2: up to `max_retries` attempts on the same backend with
    /// exponential backoff (base 100ms, jitter +-50%), guarded by that
    /// backend's circuit breaker. Returns the retry count on failure so
    /// the caller can add it to the running total before trying the next
    /// candidate.
    async fn call_with_retries(
        &self,
        backend: &BackendDescriptor,
        request: ToolCallRequest,
        deadline: Duration,
    ) -> Result<(ToolCallResult, u32, u64), u32> {
        let Some(breaker) = self.registry.breaker(&backend.name) else {
            return Err(0);
        };

        let mut attempt = 0u32;
        loop {
            let started = std::time::Instant::now();
            let outcome = tokio::time::timeout(deadline, breaker.call(|| self.registry.call(backend, request.clone()))).await;

            match outcome {
                Ok(Ok(result)) => {
                    self.registry.record_health(&backend.name, Health::Up);
                    return Ok((result, attempt, started.elapsed().as_millis() as u64));
                }
                Ok(Err(_breaker_err)) => {
                    self.registry.record_health(&backend.name, Health::Degraded);
                    if attempt >= self.max_retries {
                        return Err(attempt);
                    }
                    backoff(attempt).await;
                    attempt += 1;
                }
                Err(_elapsed) => {
                    self.registry.record_health(&backend.name, Health::Degraded);
                    return Err(attempt);
                }
            }
        }
    }
}

/// Exponential backoff with +-50% jitter, base 100ms.
async fn backoff(attempt: u32) {
    let base_ms = 100u64 * 2u64.pow(attempt);
    let jitter_frac = rand::thread_rng().gen_range(-0.5..=0.5);
    let jittered_ms = (base_ms as f64 * (1.0 + jitter_frac)).max(0.0) as u64;
    tokio::time::sleep(Duration::from_millis(jittered_ms)).await;
}

impl From<McpError> for CoreError {
    fn from(e: McpError) -> Self {
        CoreError::Internal {
            event_id: uuid::Uuid::new_v4(),
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dctx_core::types::Priority;
    use std::collections::HashMap;

    fn descriptor(name: &str, role: RoleTag, health: Health, latency: Option<u64>) -> BackendDescriptor {
        BackendDescriptor {
            name: name.to_string(),
            endpoint: "http://localhost:9".to_string(),
            transport: dctx_core::types::Transport::Http,
            role_tags: vec![role],
            priority: Priority::Workflow,
            probe_path: None,
            probe_port: None,
            default_timeout_ms: 50,
            health,
            consecutive_failures: 0,
            last_latency_ms: latency,
            extra: serde_json::Value::Null,
        }
    }

    fn broker_with(registry: BackendRegistry) -> Broker {
        let mut budgets = HashMap::new();
        budgets.insert("coordination".to_string(), 100u64);
        Broker::new(registry, BudgetTracker::default(), 2, Duration::from_millis(200), budgets)
    }

    #[test]
    fn budget_role_groups_tags_correctly() {
        assert_eq!(budget_role(RoleTag::Documentation), "research");
        assert_eq!(budget_role(RoleTag::WebResearch), "research");
        assert_eq!(budget_role(RoleTag::CodeEditing), "implementation");
        assert_eq!(budget_role(RoleTag::Reasoning), "quality");
        assert_eq!(budget_role(RoleTag::Memory), "coordination");
    }

    #[test]
    fn resolve_filters_down_backends() {
        let registry = BackendRegistry::new();
        registry.register(descriptor("up", RoleTag::Memory, Health::Up, Some(10)));
        registry.register(descriptor("down", RoleTag::Memory, Health::Down, Some(5)));
        let broker = broker_with(registry);
        let resolved = broker.resolve(RoleTag::Memory);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].name, "up");
    }

    #[test]
    fn scattered_state_prefers_lowest_latency() {
        let registry = BackendRegistry::new();
        let broker = broker_with(registry);
        let candidates = vec![
            descriptor("slow", RoleTag::Memory, Health::Up, Some(500)),
            descriptor("fast", RoleTag::Memory, Health::Up, Some(10)),
        ];
        let attention = AttentionSnapshot {
            state: AttentionState::Scattered,
            work_minutes_since_break: 0,
        };
        let shaped = broker.shape_order(&attention, candidates);
        assert_eq!(shaped[0].name, "fast");
    }

    #[test]
    fn hyperfocus_doubles_deadline() {
        let registry = BackendRegistry::new();
        let broker = broker_with(registry);
        let attention = AttentionSnapshot {
            state: AttentionState::Hyperfocused,
            work_minutes_since_break: 70,
        };
        let deadline = broker.shaped_deadline(&attention, None);
        assert_eq!(deadline, Duration::from_millis(400));
    }

    #[tokio::test]
    async fn invoke_with_no_backend_registered_fails() {
        let registry = BackendRegistry::new();
        let broker = broker_with(registry);
        let req = InvokeRequest {
            tool_name: "search".to_string(),
            arguments: serde_json::json!({}),
            role_tag: RoleTag::Memory,
            workspace_id: "ws1".to_string(),
            user_id: "u1".to_string(),
            attention: None,
            deadline: None,
        };
        let result = broker.invoke(req).await;
        assert!(matches!(result, Err(CoreError::NoBackend)));
    }

    #[tokio::test]
    async fn invoke_past_90_minutes_requires_break() {
        let registry = BackendRegistry::new();
        let broker = broker_with(registry);
        let req = InvokeRequest {
            tool_name: "search".to_string(),
            arguments: serde_json::json!({}),
            role_tag: RoleTag::Memory,
            workspace_id: "ws1".to_string(),
            user_id: "u1".to_string(),
            attention: Some(AttentionSnapshot {
                state: AttentionState::Hyperfocused,
                work_minutes_since_break: 95,
            }),
            deadline: None,
        };
        let result = broker.invoke(req).await;
        assert!(matches!(result, Err(CoreError::BreakRequired)));
    }

    #[tokio::test]
    async fn invoke_over_budget_fails() {
        let registry = BackendRegistry::new();
        registry.register(descriptor("mem", RoleTag::Memory, Health::Up, Some(10)));
        let broker = broker_with(registry);
        broker.budgets.consume("ws1", "coordination", 100);

        let req = InvokeRequest {
            tool_name: "search".to_string(),
            arguments: serde_json::json!({}),
            role_tag: RoleTag::Memory,
            workspace_id: "ws1".to_string(),
            user_id: "u1".to_string(),
            attention: None,
            deadline: None,
        };
        let result = broker.invoke(req).await;
        assert!(matches!(result, Err(CoreError::BudgetExceeded { .. })));
    }
}
