//! Error types for the forum HTTP client.
//!
//! [`ForumError`] is converted into a [`CallFailure`] so the orchestrator only
//! has to decide between retrying and giving up.

use thiserror::Error;

use crate::state_machine::CallFailure;

#[derive(Debug, Error)]
pub enum ForumError {
    /// HTTP 429. `retry_after_ms` comes from the `Retry-After` header.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// Any other non-success HTTP status.
    #[error("forum error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    /// Connection, DNS, timeout or body errors from `reqwest`.
    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("invalid forum URL: {0}")]
    InvalidUrl(String),

    /// The ignore expiry falls outside the representable date range.
    #[error("ignore duration out of range: {0}")]
    InvalidIgnoreDuration(String),
}

impl From<ForumError> for CallFailure {
    fn from(err: ForumError) -> Self {
        match err {
            ForumError::RateLimited { retry_after_ms } => CallFailure::Transient {
                reason: "rate limited by server".into(),
                retry_after_ms: Some(retry_after_ms),
            },
            ForumError::ApiError { status: 404, .. } => CallFailure::terminal("user not found"),
            ForumError::ApiError {
                status: 401 | 403,
                ..
            } => CallFailure::terminal("permission denied"),
            ForumError::ApiError { status, message } if status == 408 || status >= 500 => {
                CallFailure::transient(format!("server error {status}: {message}"))
            }
            ForumError::ApiError { status, message } => {
                CallFailure::terminal(format!("rejected ({status}): {message}"))
            }
            ForumError::NetworkError(e) if e.is_timeout() => CallFailure::transient("timeout"),
            ForumError::NetworkError(e) if e.is_decode() => {
                CallFailure::terminal(format!("unreadable response: {e}"))
            }
            ForumError::NetworkError(e) => CallFailure::transient(format!("network error: {e}")),
            ForumError::InvalidUrl(reason) => CallFailure::terminal(reason),
            ForumError::InvalidIgnoreDuration(reason) => {
                CallFailure::terminal(format!("ignore duration out of range: {reason}"))
            }
        }
    }
}
