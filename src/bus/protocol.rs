//! Wire shapes exchanged between the orchestrator and UI observers.
//!
//! Everything is camelCase JSON tagged by an `action` field, independent of the
//! transport that carries it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BlockerError;
use crate::state_machine::{FailedUser, Operation, OperationStatus};

/// A request from a UI context to the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Request {
    GetBlockingStatus,
    StartBlocking { usernames: Vec<String> },
    StopBlocking,
}

/// Reply to a [`Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<StatusData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            success: true,
            data: None,
            error: None,
        }
    }

    pub fn status(op: Option<&Operation>) -> Self {
        Self {
            success: true,
            data: op.map(StatusData::from),
            error: None,
        }
    }

    pub fn error(code: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(code.into()),
        }
    }
}

impl From<&BlockerError> for Response {
    fn from(err: &BlockerError) -> Self {
        Response::error(err.code())
    }
}

/// Full snapshot of an operation, enough for a freshly attached UI to render it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusData {
    pub is_processing: bool,
    pub processed_users: usize,
    pub total_users: usize,
    pub blocked_users: usize,
    pub errors: Vec<FailedUser>,
    pub operation_id: String,
    pub status: OperationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_user: Option<String>,
    pub stopped_by_user: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub countdown_seconds: Option<u64>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&Operation> for StatusData {
    fn from(op: &Operation) -> Self {
        Self {
            is_processing: op.status.is_active(),
            processed_users: op.processed_count,
            total_users: op.total_count,
            blocked_users: op.blocked_count,
            errors: op.errors.clone(),
            operation_id: op.id.clone(),
            status: op.status,
            current_user: op.current_item.as_ref().map(|item| item.username.clone()),
            stopped_by_user: op.stopped_by_user,
            failure: op.failure.clone(),
            countdown_seconds: op.current_backoff_secs,
            started_at: op.started_at,
            finished_at: op.finished_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressAction {
    Show,
    Update,
    Hide,
}

/// Push notification payload for progress observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub action: ProgressAction,
    pub current: usize,
    pub total: usize,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub countdown_seconds: Option<u64>,
}

impl ProgressUpdate {
    fn from_op(action: ProgressAction, op: &Operation, message: String) -> Self {
        Self {
            action,
            current: op.processed_count,
            total: op.total_count,
            message,
            countdown_seconds: op.current_backoff_secs,
        }
    }

    /// Sent once when an operation starts (or is resumed).
    pub fn show(op: &Operation) -> Self {
        let message = if op.processed_count == 0 {
            format!("Blocking {} users", op.total_count)
        } else {
            format!(
                "Resuming: {} of {} users done",
                op.processed_count, op.total_count
            )
        };
        Self::from_op(ProgressAction::Show, op, message)
    }

    pub fn update(op: &Operation, message: impl Into<String>) -> Self {
        Self::from_op(ProgressAction::Update, op, message.into())
    }

    /// Sent once the operation reaches a terminal state.
    pub fn hide(op: &Operation) -> Self {
        Self::from_op(ProgressAction::Hide, op, summarize(op))
    }

    pub fn is_final(&self) -> bool {
        self.action == ProgressAction::Hide
    }
}

/// One-line, human readable result of an operation.
pub fn summarize(op: &Operation) -> String {
    let failed = match op.failed_count() {
        0 => String::new(),
        1 => ", 1 failed".to_string(),
        n => format!(", {n} failed"),
    };
    match op.status {
        OperationStatus::Failed => format!(
            "Failed after {} of {} users: {}",
            op.processed_count,
            op.total_count,
            op.failure.as_deref().unwrap_or("unknown error")
        ),
        OperationStatus::Completed if op.stopped_by_user => format!(
            "Stopped after {} of {} users ({} blocked{failed})",
            op.processed_count, op.total_count, op.blocked_count
        ),
        OperationStatus::Completed => format!(
            "Done: {} of {} users blocked{failed}",
            op.blocked_count, op.total_count
        ),
        OperationStatus::Stopping => format!(
            "Stopping after {} of {} users",
            op.processed_count, op.total_count
        ),
        OperationStatus::Running | OperationStatus::Idle => format!(
            "{} of {} users processed",
            op.processed_count, op.total_count
        ),
    }
}

/// Messages the orchestrator pushes without being asked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum Push {
    ProgressUpdate { data: ProgressUpdate },
}
