//! Scripted in-memory forum used by `massblock demo` and the orchestrator tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::BlockUserCall;
use crate::state_machine::CallFailure;

/// A forum that blocks everyone unless told otherwise.
///
/// Failures are scripted per username and consumed in order; once a script is
/// exhausted the user is blocked successfully.
#[derive(Default)]
pub struct SimulatedForum {
    latency: Duration,
    scripts: Mutex<HashMap<String, VecDeque<CallFailure>>>,
    calls: Mutex<Vec<String>>,
}

impl SimulatedForum {
    pub fn new() -> Self {
        Self::default()
    }

    /// Each call takes `latency` before answering.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// `username` cannot be blocked at all.
    pub fn fail_terminal(self, username: &str, reason: &str) -> Self {
        self.script(username, CallFailure::terminal(reason), 1)
    }

    /// The first `times` calls for `username` fail transiently.
    pub fn fail_transient(self, username: &str, reason: &str, times: usize) -> Self {
        self.script(username, CallFailure::transient(reason), times)
    }

    fn script(self, username: &str, failure: CallFailure, times: usize) -> Self {
        if let Ok(mut scripts) = self.scripts.lock() {
            let script = scripts.entry(username.to_string()).or_default();
            for _ in 0..times {
                script.push_back(failure.clone());
            }
        }
        self
    }

    /// Every username passed to `block_user`, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn next_outcome(&self, username: &str) -> Result<(), CallFailure> {
        let mut scripts = self
            .scripts
            .lock()
            .map_err(|_| CallFailure::terminal("simulated forum unavailable"))?;
        let failure = scripts.get_mut(username).and_then(|script| {
            // Terminal failures stay in place so repeated calls keep failing.
            match script.front() {
                Some(CallFailure::Terminal(_)) => script.front().cloned(),
                _ => script.pop_front(),
            }
        });
        match failure {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BlockUserCall for SimulatedForum {
    async fn block_user(&self, username: &str) -> Result<(), CallFailure> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(username.to_string());
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.next_outcome(username)
    }
}
