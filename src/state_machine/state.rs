use chrono::Utc;

use super::operation::{
    BlockOutcome, CallFailure, FailedUser, Operation, OperationStatus, RetryConfig,
};

/// The result of resolving the head of the queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// The head item left the queue; `blocked` tells whether the block succeeded.
    Resolved {
        username: String,
        blocked: bool,
        reason: Option<String>,
    },
    /// The head item stays in place and is attempted again after `delay_ms`.
    Retry {
        username: String,
        attempt: u32,
        delay_ms: u64,
        reason: String,
    },
}

/// Applies lifecycle transitions to an [`Operation`].
///
/// Idle → Running → (Stopping) → Completed, with Failed reachable from any state
/// on an internal fault.
pub struct StateMachine;

impl StateMachine {
    /// Idle → Running. Returns false if the operation was not idle.
    pub fn begin(op: &mut Operation) -> bool {
        if op.status != OperationStatus::Idle {
            return false;
        }
        let now = Utc::now();
        op.status = OperationStatus::Running;
        op.started_at = Some(now);
        op.updated_at = now;
        true
    }

    /// Mark the head of the queue as in flight.
    pub fn dispatch_head(op: &mut Operation) -> Option<String> {
        let head = op.queue.front()?.clone();
        let username = head.username.clone();
        op.current_item = Some(head);
        op.current_backoff_secs = None;
        Some(username)
    }

    /// Apply the outcome of the call made for the head of the queue.
    ///
    /// - Success removes the item and counts it as processed and blocked.
    /// - A transient failure with attempts left keeps the item at the head.
    /// - A terminal failure, or a transient one with no attempts left, removes
    ///   the item, records it in `errors` and still counts it as processed.
    pub fn resolve_head(
        op: &mut Operation,
        outcome: BlockOutcome,
        retry: &RetryConfig,
    ) -> Option<Transition> {
        let head = op.queue.front_mut()?;
        head.attempts += 1;
        let username = head.username.clone();
        op.current_item = None;

        let transition = match outcome {
            BlockOutcome::Blocked => {
                op.queue.pop_front();
                op.processed_count += 1;
                op.blocked_count += 1;
                Transition::Resolved {
                    username,
                    blocked: true,
                    reason: None,
                }
            }
            BlockOutcome::Failed(CallFailure::Transient {
                reason,
                retry_after_ms,
            }) if head.attempts < retry.max_attempts => {
                head.last_error = Some(reason.clone());
                let backoff = retry.delay_for_attempt(head.attempts);
                let delay_ms = backoff.max(retry_after_ms.unwrap_or(0));
                op.current_backoff_secs = Some(delay_ms.div_ceil(1000));
                Transition::Retry {
                    username,
                    attempt: head.attempts,
                    delay_ms,
                    reason,
                }
            }
            BlockOutcome::Failed(failure) => {
                let reason = match &failure {
                    CallFailure::Transient { reason, .. } => {
                        format!("{reason} (gave up after {} attempts)", head.attempts)
                    }
                    CallFailure::Terminal(reason) => reason.clone(),
                };
                op.queue.pop_front();
                op.processed_count += 1;
                op.errors.push(FailedUser {
                    username: username.clone(),
                    reason: reason.clone(),
                });
                Transition::Resolved {
                    username,
                    blocked: false,
                    reason: Some(reason),
                }
            }
        };

        op.touch();
        Some(transition)
    }

    /// The retry wait for the head item is over.
    pub fn clear_backoff(op: &mut Operation) {
        op.current_backoff_secs = None;
    }

    /// Running → Stopping. Returns false (and changes nothing) in any other state.
    pub fn request_stop(op: &mut Operation) -> bool {
        if op.status != OperationStatus::Running {
            return false;
        }
        op.status = OperationStatus::Stopping;
        op.touch();
        true
    }

    /// Running/Stopping → Completed. Items still queued are abandoned, not processed.
    /// Leaving through Stopping marks the operation as user-stopped.
    pub fn finish(op: &mut Operation) {
        if !op.status.is_active() {
            return;
        }
        op.stopped_by_user = op.status == OperationStatus::Stopping;
        op.status = OperationStatus::Completed;
        op.current_item = None;
        op.current_backoff_secs = None;
        let now = Utc::now();
        op.updated_at = now;
        op.finished_at = Some(now);
    }

    /// Any state → Failed on an unrecoverable internal fault. Progress counters are kept.
    pub fn fail(op: &mut Operation, reason: impl Into<String>) {
        op.status = OperationStatus::Failed;
        op.failure = Some(reason.into());
        op.current_item = None;
        op.current_backoff_secs = None;
        let now = Utc::now();
        op.updated_at = now;
        op.finished_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running(names: &[&str]) -> Operation {
        let mut op = Operation::build(names.iter().copied()).unwrap();
        assert!(StateMachine::begin(&mut op));
        op
    }

    fn retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay_ms: 1000,
        }
    }

    #[test]
    fn begin_only_from_idle() {
        let mut op = running(&["a"]);
        assert_eq!(op.status, OperationStatus::Running);
        assert!(op.started_at.is_some());
        assert!(!StateMachine::begin(&mut op));
    }

    #[test]
    fn happy_path_resolves_every_item() {
        let mut op = running(&["a", "b"]);

        assert_eq!(StateMachine::dispatch_head(&mut op).as_deref(), Some("a"));
        assert_eq!(op.current_item.as_ref().unwrap().username, "a");
        let t = StateMachine::resolve_head(&mut op, BlockOutcome::Blocked, &retry(3)).unwrap();
        assert_eq!(
            t,
            Transition::Resolved {
                username: "a".into(),
                blocked: true,
                reason: None
            }
        );
        assert!(op.current_item.is_none());

        StateMachine::dispatch_head(&mut op);
        StateMachine::resolve_head(&mut op, BlockOutcome::Blocked, &retry(3));
        assert_eq!(op.processed_count, 2);
        assert_eq!(op.blocked_count, 2);
        assert!(op.queue.is_empty());

        StateMachine::finish(&mut op);
        assert_eq!(op.status, OperationStatus::Completed);
        assert!(!op.stopped_by_user);
        assert!(op.finished_at.is_some());
    }

    #[test]
    fn transient_failure_retries_then_records_one_error() {
        let mut op = running(&["a", "b"]);
        let failure = || BlockOutcome::Failed(CallFailure::transient("timeout"));

        let t = StateMachine::resolve_head(&mut op, failure(), &retry(3)).unwrap();
        assert!(matches!(t, Transition::Retry { attempt: 1, delay_ms: 1000, .. }));
        assert_eq!(op.current_backoff_secs, Some(1));
        assert_eq!(op.processed_count, 0);

        let t = StateMachine::resolve_head(&mut op, failure(), &retry(3)).unwrap();
        assert!(matches!(t, Transition::Retry { attempt: 2, delay_ms: 2000, .. }));
        assert_eq!(op.queue.front().unwrap().last_error.as_deref(), Some("timeout"));

        let t = StateMachine::resolve_head(&mut op, failure(), &retry(3)).unwrap();
        assert!(matches!(t, Transition::Resolved { blocked: false, .. }));
        assert_eq!(op.processed_count, 1);
        assert_eq!(op.errors.len(), 1);
        assert_eq!(op.errors[0].username, "a");
        assert_eq!(op.errors[0].reason, "timeout (gave up after 3 attempts)");
        assert_eq!(op.queue.front().unwrap().username, "b");
    }

    #[test]
    fn server_retry_after_extends_backoff() {
        let mut op = running(&["a"]);
        let outcome = BlockOutcome::Failed(CallFailure::Transient {
            reason: "rate limited".into(),
            retry_after_ms: Some(5000),
        });
        let t = StateMachine::resolve_head(&mut op, outcome, &retry(3)).unwrap();
        assert!(matches!(t, Transition::Retry { delay_ms: 5000, .. }));
        assert_eq!(op.current_backoff_secs, Some(5));
    }

    #[test]
    fn terminal_failure_is_never_retried() {
        let mut op = running(&["a"]);
        let outcome = BlockOutcome::Failed(CallFailure::terminal("user not found"));
        let t = StateMachine::resolve_head(&mut op, outcome, &retry(3)).unwrap();
        assert_eq!(
            t,
            Transition::Resolved {
                username: "a".into(),
                blocked: false,
                reason: Some("user not found".into())
            }
        );
        assert_eq!(op.processed_count, 1);
        assert_eq!(op.blocked_count, 0);
        assert_eq!(op.errors[0].reason, "user not found");
    }

    #[test]
    fn single_attempt_policy_fails_immediately() {
        let mut op = running(&["a"]);
        let outcome = BlockOutcome::Failed(CallFailure::transient("timeout"));
        let t = StateMachine::resolve_head(&mut op, outcome, &retry(1)).unwrap();
        assert!(matches!(t, Transition::Resolved { blocked: false, .. }));
    }

    #[test]
    fn stop_abandons_remaining_items() {
        let mut op = running(&["a", "b", "c"]);
        StateMachine::resolve_head(&mut op, BlockOutcome::Blocked, &retry(3));

        assert!(StateMachine::request_stop(&mut op));
        assert!(!StateMachine::request_stop(&mut op));
        assert_eq!(op.status, OperationStatus::Stopping);

        StateMachine::finish(&mut op);
        assert_eq!(op.status, OperationStatus::Completed);
        assert!(op.stopped_by_user);
        assert_eq!(op.processed_count, 1);
        assert_eq!(op.remaining(), 2);
    }

    #[test]
    fn stop_during_last_item_still_counts_as_user_stop() {
        let mut op = running(&["a"]);
        StateMachine::dispatch_head(&mut op);
        assert!(StateMachine::request_stop(&mut op));

        StateMachine::resolve_head(&mut op, BlockOutcome::Blocked, &retry(3));
        StateMachine::finish(&mut op);

        assert_eq!(op.status, OperationStatus::Completed);
        assert!(op.stopped_by_user);
        assert_eq!(op.processed_count, op.total_count);
        assert_eq!(op.remaining(), 0);
    }

    #[test]
    fn stop_is_ignored_when_not_running() {
        let mut op = Operation::build(["a"]).unwrap();
        assert!(!StateMachine::request_stop(&mut op));
        assert_eq!(op.status, OperationStatus::Idle);
    }

    #[test]
    fn fail_keeps_partial_progress() {
        let mut op = running(&["a", "b"]);
        StateMachine::resolve_head(&mut op, BlockOutcome::Blocked, &retry(3));
        StateMachine::fail(&mut op, "disk full");
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.failure.as_deref(), Some("disk full"));
        assert_eq!(op.processed_count, 1);

        // Terminal states do not go back to Completed.
        StateMachine::finish(&mut op);
        assert_eq!(op.status, OperationStatus::Failed);
    }

    #[test]
    fn resolve_on_empty_queue_is_none() {
        let mut op = running(&["a"]);
        StateMachine::resolve_head(&mut op, BlockOutcome::Blocked, &retry(3));
        assert!(StateMachine::resolve_head(&mut op, BlockOutcome::Blocked, &retry(3)).is_none());
        assert!(StateMachine::dispatch_head(&mut op).is_none());
    }
}
