//! The tool-invocation HTTP surface (§6.1): a single `POST /v1/invoke`
//! route. This is deliberately not a REST resource model — the contract
//! is one operation, so the router is a thin adapter in front of
//! [`dctx_harness::broker::Broker::invoke`].

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use dctx_core::cache::Store;
use dctx_core::error::CoreError;
use dctx_core::types::{ActiveContext, AttentionState, RoleTag};
use dctx_harness::broker::{AttentionSnapshot, Broker, InvokeRequest};

use crate::auth::AuthLayer;

#[derive(Clone)]
pub struct ApiState {
    pub broker: Arc<Broker>,
    pub store: Arc<Store>,
}

#[derive(Debug, Deserialize)]
pub struct InvokeHttpRequest {
    pub tool: String,
    pub arguments: serde_json::Value,
    pub role: RoleTag,
    pub workspace_id: String,
    pub user_id: String,
    #[serde(default)]
    pub deadline_ms: Option<u64>,
    #[serde(default)]
    pub attention_hint: Option<AttentionState>,
}

#[derive(Debug, Serialize)]
pub struct InvokeHttpError {
    pub kind: dctx_core::error::ErrorKind,
    pub message: String,
    pub retryable: bool,
}

#[derive(Debug, Serialize)]
pub struct InvokeHttpResponse {
    pub ok: bool,
    pub payload: Option<serde_json::Value>,
    pub cost: u64,
    pub backend_name: Option<String>,
    pub latency_ms: u64,
    pub error: Option<InvokeHttpError>,
}

impl InvokeHttpResponse {
    fn ok(payload: serde_json::Value, cost: u64, backend_name: String, latency_ms: u64) -> Self {
        Self {
            ok: true,
            payload: Some(payload),
            cost,
            backend_name: Some(backend_name),
            latency_ms,
            error: None,
        }
    }

    fn err(e: &CoreError) -> Self {
        Self {
            ok: false,
            payload: None,
            cost: 0,
            backend_name: None,
            latency_ms: 0,
            error: Some(InvokeHttpError {
                kind: e.kind(),
                message: e.to_string(),
                retryable: e.retryable(),
            }),
        }
    }
}

/// §6.1: `error.kind` is returned with `ok=false` and HTTP 200 — the
/// envelope, not the transport status, carries the failure. A malformed
/// request (missing/unparseable JSON) never reaches the handler, so it
/// is the one case that gets a 4xx from Axum's own extractor rejection.
fn status_for(e: &CoreError) -> StatusCode {
    match e.kind() {
        dctx_core::error::ErrorKind::ValidationError => StatusCode::BAD_REQUEST,
        _ => StatusCode::OK,
    }
}

/// Derive the attention snapshot the broker shapes its behavior around:
/// the workspace's persisted state, overridden by an explicit hint.
fn attention_snapshot(ctx: &ActiveContext, hint: Option<AttentionState>) -> AttentionSnapshot {
    let since = ctx
        .last_break
        .or(ctx.session_start)
        .map(|t| (chrono::Utc::now() - t).num_minutes().max(0) as u32)
        .unwrap_or(0);
    AttentionSnapshot {
        state: hint.or(ctx.attention_state).unwrap_or(AttentionState::Focused),
        work_minutes_since_break: since,
    }
}

async fn invoke(
    State(state): State<ApiState>,
    Json(req): Json<InvokeHttpRequest>,
) -> impl IntoResponse {
    let active_context = match state.store.get_active_context(&req.workspace_id).await {
        Ok(ctx) => ctx,
        Err(e) => {
            let body = InvokeHttpResponse::err(&e);
            return (status_for(&e), Json(body));
        }
    };
    let attention = attention_snapshot(&active_context, req.attention_hint);

    let result = state
        .broker
        .invoke(InvokeRequest {
            tool_name: req.tool,
            arguments: req.arguments,
            role_tag: req.role,
            workspace_id: req.workspace_id,
            user_id: req.user_id,
            attention: Some(attention),
            deadline: req.deadline_ms.map(Duration::from_millis),
        })
        .await;

    match result {
        Ok(tool_result) => {
            let payload = serde_json::json!(tool_result
                .content
                .iter()
                .filter_map(|c| match c {
                    dctx_harness::mcp::ToolResultContent::Text { text } => Some(text.clone()),
                    dctx_harness::mcp::ToolResultContent::Image { .. } => None,
                })
                .collect::<Vec<_>>());
            let body = InvokeHttpResponse::ok(
                payload,
                tool_result.cost,
                tool_result.backend,
                tool_result.latency_ms,
            );
            (StatusCode::OK, Json(body))
        }
        Err(e) => {
            let status = status_for(&e);
            let body = InvokeHttpResponse::err(&e);
            (status, Json(body))
        }
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new().route("/v1/invoke", post(invoke)).with_state(state)
}

pub fn router_with_auth(state: ApiState, api_key: Option<String>) -> Router {
    router(state).layer(AuthLayer::new(api_key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use dctx_harness::budget::BudgetTracker;
    use dctx_harness::mcp::BackendRegistry;
    use std::collections::HashMap;
    use tower::ServiceExt;

    async fn test_state() -> ApiState {
        let store = Store::new_in_memory().await.expect("in-memory store");
        let broker = Broker::new(
            BackendRegistry::new(),
            BudgetTracker::default(),
            2,
            Duration::from_millis(200),
            HashMap::new(),
        );
        ApiState {
            broker: Arc::new(broker),
            store: Arc::new(store),
        }
    }

    #[tokio::test]
    async fn no_backend_returns_no_backend_error_kind() {
        let app = router(test_state().await);
        let body = serde_json::json!({
            "tool": "search",
            "arguments": {},
            "role": "memory",
            "workspace_id": "/ws",
            "user_id": "u1",
        });
        let req = Request::builder()
            .method("POST")
            .uri("/v1/invoke")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed["ok"], serde_json::json!(false));
        assert_eq!(parsed["error"]["kind"], serde_json::json!("NoBackend"));
    }

    #[tokio::test]
    async fn attention_snapshot_prefers_explicit_hint() {
        let ctx = ActiveContext::new("/ws");
        let snap = attention_snapshot(&ctx, Some(AttentionState::Scattered));
        assert_eq!(snap.state, AttentionState::Scattered);
    }

    #[tokio::test]
    async fn attention_snapshot_falls_back_to_persisted_state() {
        let mut ctx = ActiveContext::new("/ws");
        ctx.attention_state = Some(AttentionState::Hyperfocused);
        let snap = attention_snapshot(&ctx, None);
        assert_eq!(snap.state, AttentionState::Hyperfocused);
    }
}
