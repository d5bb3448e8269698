//! The core error type shared by every `dctx-*` crate.
//!
//! One variant per row of the error-handling table: each surfaced error
//! carries enough correlation metadata (`event_id`, `backend_name`,
//! `workspace_id`) for a developer to locate the corresponding log entry.
//! `Display` produces the machine-stable message; [`CoreError::presentational`]
//! produces the separate, encouragement-toned string shown to the user.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("no backend registered for role/tool")]
    NoBackend,

    #[error("all candidate backends unavailable after retries")]
    Unavailable,

    #[error("budget exceeded for workspace={workspace_id} role={role}")]
    BudgetExceeded { workspace_id: String, role: String },

    #[error("request cancelled (deadline elapsed)")]
    Cancelled,

    #[error("illegal status transition: {from:?} -> {to:?}")]
    IllegalTransition { from: String, to: String },

    #[error("a break is required before new invocations are accepted")]
    BreakRequired,

    #[error("session store unavailable: {0}")]
    StorageUnavailable(String),

    #[error("internal error (event_id={event_id}): {message}")]
    Internal { event_id: Uuid, message: String },
}

/// The machine-stable `error.kind` discriminant from the response envelope (§6.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ErrorKind {
    ValidationError,
    NoBackend,
    Unavailable,
    BudgetExceeded,
    Cancelled,
    IllegalTransition,
    BreakRequired,
    StorageUnavailable,
    Internal,
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Validation(_) => ErrorKind::ValidationError,
            CoreError::NoBackend => ErrorKind::NoBackend,
            CoreError::Unavailable => ErrorKind::Unavailable,
            CoreError::BudgetExceeded { .. } => ErrorKind::BudgetExceeded,
            CoreError::Cancelled => ErrorKind::Cancelled,
            CoreError::IllegalTransition { .. } => ErrorKind::IllegalTransition,
            CoreError::BreakRequired => ErrorKind::BreakRequired,
            CoreError::StorageUnavailable(_) => ErrorKind::StorageUnavailable,
            CoreError::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Whether the caller may usefully retry this exact request.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            CoreError::Unavailable | CoreError::StorageUnavailable(_)
        )
    }

    /// User-facing, encouragement-toned presentation, kept separate from
    /// the machine-stable `Display` message per the error design.
    pub fn presentational(&self) -> String {
        match self {
            CoreError::BreakRequired => {
                "Break time! Great progress — let's pick this back up after a short pause.".into()
            }
            CoreError::BudgetExceeded { .. } => {
                "You've used up this role's budget for today — it resets on a rolling window.".into()
            }
            CoreError::IllegalTransition { .. } => {
                "That task can't move there from its current state.".into()
            }
            CoreError::NoBackend => "No tool is currently able to handle that request.".into(),
            CoreError::Unavailable => {
                "The tools we need are having trouble right now — try again shortly.".into()
            }
            CoreError::Cancelled => "That request took too long and was cancelled.".into(),
            CoreError::Validation(_) => "That request wasn't quite right — check the input.".into(),
            CoreError::StorageUnavailable(_) => {
                "We couldn't save that just now, but nothing was lost — it'll retry.".into()
            }
            CoreError::Internal { event_id, .. } => {
                format!("Something unexpected happened (reference: {event_id}).")
            }
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
