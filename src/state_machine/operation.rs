use std::collections::{HashSet, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::BlockerError;

/// Why a single block call did not succeed.
///
/// Transient failures are retried with backoff; terminal ones are recorded
/// against the username immediately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallFailure {
    /// Network error, timeout or server-side throttling.
    Transient {
        reason: String,
        /// Server-provided wait before the next attempt, if any.
        retry_after_ms: Option<u64>,
    },
    /// The target cannot be blocked (unknown user, permission denied).
    Terminal(String),
}

impl CallFailure {
    pub fn transient(reason: impl Into<String>) -> Self {
        CallFailure::Transient {
            reason: reason.into(),
            retry_after_ms: None,
        }
    }

    pub fn terminal(reason: impl Into<String>) -> Self {
        CallFailure::Terminal(reason.into())
    }

    pub fn reason(&self) -> &str {
        match self {
            CallFailure::Transient { reason, .. } => reason,
            CallFailure::Terminal(reason) => reason,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, CallFailure::Transient { .. })
    }
}

impl fmt::Display for CallFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallFailure::Transient { reason, .. } => write!(f, "Transient failure: {reason}"),
            CallFailure::Terminal(reason) => write!(f, "Terminal failure: {reason}"),
        }
    }
}

/// The result of one block call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    Blocked,
    Failed(CallFailure),
}

impl From<Result<(), CallFailure>> for BlockOutcome {
    fn from(result: Result<(), CallFailure>) -> Self {
        match result {
            Ok(()) => BlockOutcome::Blocked,
            Err(failure) => BlockOutcome::Failed(failure),
        }
    }
}

/// Lifecycle status of an [`Operation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    Idle,
    Running,
    Stopping,
    Completed,
    Failed,
}

impl OperationStatus {
    /// Running or Stopping: the operation still owns the worker.
    pub fn is_active(self) -> bool {
        matches!(self, OperationStatus::Running | OperationStatus::Stopping)
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationStatus::Idle => write!(f, "IDLE"),
            OperationStatus::Running => write!(f, "RUNNING"),
            OperationStatus::Stopping => write!(f, "STOPPING"),
            OperationStatus::Completed => write!(f, "COMPLETED"),
            OperationStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total calls allowed per username before a transient failure becomes terminal.
    pub max_attempts: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
        }
    }
}

impl RetryConfig {
    /// Calculate the delay after a given failed attempt using exponential backoff.
    /// delay = base_delay_ms * 2^(attempt - 1)
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        self.base_delay_ms
            .saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)))
    }
}

/// One username waiting to be blocked, plus its retry bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub username: String,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl QueueItem {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            attempts: 0,
            last_error: None,
        }
    }
}

/// A username that was resolved unsuccessfully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedUser {
    pub username: String,
    pub reason: String,
}

/// One batch-blocking run and everything needed to reconstruct its progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    pub status: OperationStatus,
    /// Unresolved usernames in processing order. The head is the next (or in-flight) item.
    pub queue: VecDeque<QueueItem>,
    pub processed_count: usize,
    pub total_count: usize,
    pub blocked_count: usize,
    pub current_item: Option<QueueItem>,
    pub errors: Vec<FailedUser>,
    pub stopped_by_user: bool,
    pub failure: Option<String>,
    /// Seconds the worker is waiting before retrying the head item.
    pub current_backoff_secs: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Operation {
    /// Build an idle operation from raw user input.
    ///
    /// Input is normalized with [`normalize_usernames`]; an empty result is rejected
    /// with [`BlockerError::EmptyBatch`].
    pub fn build<I, S>(usernames: I) -> Result<Self, BlockerError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let queue: VecDeque<QueueItem> = normalize_usernames(usernames)
            .into_iter()
            .map(QueueItem::new)
            .collect();
        if queue.is_empty() {
            return Err(BlockerError::EmptyBatch);
        }

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            status: OperationStatus::Idle,
            total_count: queue.len(),
            queue,
            processed_count: 0,
            blocked_count: 0,
            current_item: None,
            errors: Vec::new(),
            stopped_by_user: false,
            failure: None,
            current_backoff_secs: None,
            started_at: None,
            updated_at: Utc::now(),
            finished_at: None,
        })
    }

    /// Items not yet resolved (including the in-flight one).
    pub fn remaining(&self) -> usize {
        self.queue.len()
    }

    pub fn failed_count(&self) -> usize {
        self.errors.len()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Trim, strip a leading `@`, drop blanks and remove case-insensitive duplicates,
/// keeping the first spelling in first-occurrence order.
pub fn normalize_usernames<I, S>(usernames: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    usernames
        .into_iter()
        .filter_map(|raw| {
            let name = raw.as_ref().trim();
            let name = name.strip_prefix('@').unwrap_or(name).trim();
            if name.is_empty() || !seen.insert(name.to_lowercase()) {
                None
            } else {
                Some(name.to_string())
            }
        })
        .collect()
}
