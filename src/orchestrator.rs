use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::bus::protocol::ProgressUpdate;
use crate::config::BlockerConfig;
use crate::error::{BlockerError, StoreError};
use crate::forum::BlockUserCall;
use crate::rate_limiter::RateLimiter;
use crate::state_machine::{
    BlockOutcome, Operation, OperationStatus, RetryConfig, StateMachine, Transition,
};
use crate::store::{OperationStore, WriterLease};

const COMMAND_BUFFER: usize = 32;
const PROGRESS_BUFFER: usize = 256;

/// Policy knobs for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub retry: RetryConfig,
    /// Minimum spacing between two block calls.
    pub min_call_spacing: Duration,
    /// Resume an operation found in `Running` state at startup instead of closing it.
    pub resume_interrupted: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            min_call_spacing: Duration::from_millis(1500),
            resume_interrupted: true,
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &BlockerConfig) -> Self {
        Self {
            retry: config.retry_config(),
            min_call_spacing: config.min_call_spacing(),
            resume_interrupted: config.resume_interrupted,
        }
    }
}

enum Command {
    Start {
        usernames: Vec<String>,
        reply: oneshot::Sender<Result<Operation, BlockerError>>,
    },
    Stop {
        reply: oneshot::Sender<bool>,
    },
}

/// Cloneable client side of the orchestrator.
///
/// Status reads come from the last committed snapshot and never wait on the
/// worker; start and stop are forwarded to it.
#[derive(Clone)]
pub struct OrchestratorHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<Option<Operation>>,
    progress: broadcast::Sender<ProgressUpdate>,
    resuming: bool,
}

impl OrchestratorHandle {
    /// Whether the worker picked up an operation interrupted by a previous process.
    pub fn is_resuming(&self) -> bool {
        self.resuming
    }

    /// Current (or most recent) operation, as last committed by the worker.
    pub fn status(&self) -> Option<Operation> {
        self.snapshot.borrow().clone()
    }

    /// Start a new operation. Fails with `AlreadyRunning` or `EmptyBatch`
    /// without touching the current operation.
    pub async fn start_blocking(&self, usernames: Vec<String>) -> Result<Operation, BlockerError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Start { usernames, reply })
            .await
            .map_err(|_| BlockerError::OrchestratorUnavailable)?;
        response
            .await
            .map_err(|_| BlockerError::OrchestratorUnavailable)?
    }

    /// Ask the running operation to stop after its in-flight user.
    /// Returns whether a stop was actually requested.
    pub async fn stop_blocking(&self) -> Result<bool, BlockerError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Stop { reply })
            .await
            .map_err(|_| BlockerError::OrchestratorUnavailable)?;
        response
            .await
            .map_err(|_| BlockerError::OrchestratorUnavailable)
    }

    /// Receive progress pushes from now on. Earlier pushes are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressUpdate> {
        self.progress.subscribe()
    }

    /// Wait until no operation is running and return the final snapshot.
    pub async fn wait_until_settled(&self) -> Option<Operation> {
        let mut snapshot = self.snapshot.clone();
        let settled = snapshot
            .wait_for(|op| !op.as_ref().is_some_and(|op| op.status.is_active()))
            .await;
        match settled {
            Ok(op) => op.clone(),
            Err(_) => self.status(),
        }
    }
}

/// Single worker that owns the current [`Operation`].
///
/// It is the only writer of the operation and of the store. Items are processed
/// one at a time; while a call, a rate-limit wait or a retry backoff is pending
/// the worker keeps answering commands, so a stop is recorded immediately and
/// applied at the next item boundary.
pub struct BlockingOrchestrator {
    caller: Arc<dyn BlockUserCall>,
    store: Arc<dyn OperationStore>,
    limiter: Arc<RateLimiter>,
    settings: OrchestratorSettings,
    inbox: mpsc::Receiver<Command>,
    snapshot: watch::Sender<Option<Operation>>,
    progress: broadcast::Sender<ProgressUpdate>,
    current: Option<Operation>,
    _lease: WriterLease,
}

impl BlockingOrchestrator {
    /// Claim the store, load the persisted operation and start the worker task.
    ///
    /// Fails with `AlreadyRunning` when another orchestrator, in this or another
    /// process, holds the store. Must be called from within a tokio runtime.
    pub fn spawn(
        settings: OrchestratorSettings,
        caller: Arc<dyn BlockUserCall>,
        store: Arc<dyn OperationStore>,
    ) -> Result<OrchestratorHandle, BlockerError> {
        let Some(lease) = store.claim()? else {
            warn!("store is held by another orchestrator");
            return Err(BlockerError::AlreadyRunning);
        };
        let persisted = store.load()?;
        let resuming = settings.resume_interrupted
            && persisted
                .as_ref()
                .is_some_and(|op| op.status == OperationStatus::Running);
        let (commands, inbox) = mpsc::channel(COMMAND_BUFFER);
        let (snapshot, snapshot_rx) = watch::channel(persisted.clone());
        let (progress, _) = broadcast::channel(PROGRESS_BUFFER);

        let handle = OrchestratorHandle {
            commands,
            snapshot: snapshot_rx,
            progress: progress.clone(),
            resuming,
        };

        let orchestrator = Self {
            caller,
            store,
            limiter: Arc::new(RateLimiter::new(settings.min_call_spacing)),
            settings,
            inbox,
            snapshot,
            progress,
            current: persisted,
            _lease: lease,
        };
        tokio::spawn(orchestrator.run());

        Ok(handle)
    }

    async fn run(mut self) {
        self.recover().await;

        while let Some(command) = self.inbox.recv().await {
            match command {
                Command::Start { usernames, reply } => match self.begin(usernames).await {
                    Ok(op) => {
                        let _ = reply.send(Ok(op));
                        self.drive().await;
                    }
                    Err(e) => {
                        debug!(error = %e, "start rejected");
                        let _ = reply.send(Err(e));
                    }
                },
                Command::Stop { reply } => {
                    debug!("stop requested with no running operation");
                    let _ = reply.send(false);
                }
            }
        }

        debug!("all handles dropped, orchestrator exiting");
    }

    /// Deal with an operation left active by a previous process.
    async fn recover(&mut self) {
        let Some(op) = self.current.as_mut() else {
            return;
        };

        match op.status {
            OperationStatus::Running if self.settings.resume_interrupted => {
                info!(
                    op_id = %op.id,
                    processed = op.processed_count,
                    total = op.total_count,
                    "resuming interrupted operation"
                );
                op.current_item = None;
                op.current_backoff_secs = None;
                let update = ProgressUpdate::show(op);
                self.publish();
                self.push(update);
                self.drive().await;
            }
            OperationStatus::Running | OperationStatus::Stopping => {
                info!(op_id = %op.id, "closing operation interrupted by a restart");
                StateMachine::request_stop(op);
                self.finish().await;
            }
            _ => {}
        }
    }

    async fn begin(&mut self, usernames: Vec<String>) -> Result<Operation, BlockerError> {
        if self
            .current
            .as_ref()
            .is_some_and(|op| op.status.is_active())
        {
            return Err(BlockerError::AlreadyRunning);
        }

        let mut op = Operation::build(usernames)?;
        StateMachine::begin(&mut op);
        info!(op_id = %op.id, total = op.total_count, "starting blocking operation");
        let update = ProgressUpdate::show(&op);
        self.current = Some(op);

        if let Err(e) = self.commit().await {
            self.fail(&e).await;
            return Err(e.into());
        }
        self.push(update);

        self.current.clone().ok_or(BlockerError::OrchestratorUnavailable)
    }

    /// The per-item loop. Returns once the operation is terminal.
    async fn drive(&mut self) {
        loop {
            let username = {
                let Some(op) = self.current.as_mut() else {
                    return;
                };
                if op.status != OperationStatus::Running {
                    break;
                }
                match StateMachine::dispatch_head(op) {
                    Some(username) => username,
                    None => break,
                }
            };
            self.publish();

            let outcome = self.call(username).await;

            let transition = {
                let Some(op) = self.current.as_mut() else {
                    return;
                };
                StateMachine::resolve_head(op, outcome, &self.settings.retry)
            };
            let Some(transition) = transition else {
                break;
            };

            if let Err(e) = self.commit().await {
                self.fail(&e).await;
                return;
            }

            match transition {
                Transition::Resolved {
                    username,
                    blocked: true,
                    ..
                } => {
                    info!(%username, "user blocked");
                    self.push_update(format!("Blocked @{username}"));
                }
                Transition::Resolved {
                    username, reason, ..
                } => {
                    let reason = reason.unwrap_or_default();
                    warn!(%username, %reason, "could not block user");
                    self.push_update(format!("Could not block @{username}: {reason}"));
                }
                Transition::Retry {
                    username,
                    attempt,
                    delay_ms,
                    reason,
                } => {
                    let max = self.settings.retry.max_attempts;
                    warn!(%username, attempt, max, delay_ms, %reason, "block failed, retrying");
                    self.push_update(format!(
                        "Retrying @{username} in {}s (attempt {}/{max}): {reason}",
                        delay_ms.div_ceil(1000),
                        attempt + 1
                    ));

                    self.backoff(Duration::from_millis(delay_ms)).await;
                    if let Some(op) = self.current.as_mut() {
                        StateMachine::clear_backoff(op);
                    }
                    self.publish();
                }
            }
        }

        self.finish().await;
    }

    /// Wait for a rate-limit slot, then make the call, serving commands meanwhile.
    async fn call(&mut self, username: String) -> BlockOutcome {
        let caller = Arc::clone(&self.caller);
        let limiter = Arc::clone(&self.limiter);
        let dispatch = async move {
            limiter.acquire().await;
            debug!(%username, "blocking user");
            let result = caller.block_user(&username).await;
            if let Err(failure) = &result {
                debug!(
                    %username,
                    transient = failure.is_transient(),
                    reason = failure.reason(),
                    "block call failed"
                );
            }
            result
        };
        self.serve_until(dispatch).await.into()
    }

    /// Drive `fut` to completion while answering commands. Never cancels `fut`.
    async fn serve_until<F: Future>(&mut self, fut: F) -> F::Output {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                output = &mut fut => return output,
                command = self.inbox.recv() => match command {
                    Some(command) => self.handle_busy(command),
                    None => return fut.await,
                },
            }
        }
    }

    /// Sleep before a retry. A stop request ends the wait early.
    async fn backoff(&mut self, delay: Duration) {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            if self.stop_requested() {
                return;
            }
            tokio::select! {
                _ = &mut sleep => return,
                command = self.inbox.recv() => match command {
                    Some(command) => self.handle_busy(command),
                    None => {
                        sleep.await;
                        return;
                    }
                },
            }
        }
    }

    fn handle_busy(&mut self, command: Command) {
        match command {
            Command::Start { reply, .. } => {
                debug!("start rejected, an operation is already running");
                let _ = reply.send(Err(BlockerError::AlreadyRunning));
            }
            Command::Stop { reply } => {
                let requested = self
                    .current
                    .as_mut()
                    .is_some_and(StateMachine::request_stop);
                if requested {
                    info!("stop requested, finishing the current user first");
                    self.publish();
                    self.push_update("Stopping after the current user".to_string());
                }
                let _ = reply.send(requested);
            }
        }
    }

    fn stop_requested(&self) -> bool {
        self.current
            .as_ref()
            .is_some_and(|op| op.status == OperationStatus::Stopping)
    }

    async fn finish(&mut self) {
        let Some(op) = self.current.as_mut() else {
            return;
        };
        if !op.status.is_active() {
            return;
        }
        StateMachine::finish(op);
        info!(
            op_id = %op.id,
            processed = op.processed_count,
            total = op.total_count,
            blocked = op.blocked_count,
            failed = op.failed_count(),
            stopped = op.stopped_by_user,
            "operation completed"
        );

        if let Err(e) = self.commit().await {
            self.fail(&e).await;
            return;
        }
        if let Some(op) = &self.current {
            let update = ProgressUpdate::hide(op);
            self.push(update);
        }
    }

    /// Persistence is broken: mark the operation Failed and stop advancing.
    async fn fail(&mut self, err: &StoreError) {
        let Some(op) = self.current.as_mut() else {
            return;
        };
        error!(op_id = %op.id, error = %err, "could not persist progress, failing operation");
        StateMachine::fail(op, format!("could not save progress: {err}"));
        let update = ProgressUpdate::hide(op);
        let failed = op.clone();
        if let Err(e) = self.save(failed).await {
            warn!(error = %e, "could not record failed status");
        }
        self.publish();
        self.push(update);
    }

    /// Save the current operation and publish it as the new snapshot.
    async fn commit(&mut self) -> Result<(), StoreError> {
        if let Some(op) = self.current.as_mut() {
            op.touch();
            let snapshot = op.clone();
            self.save(snapshot).await?;
        }
        self.publish();
        Ok(())
    }

    // Store writes block on disk IO, keep them off the runtime's worker threads.
    async fn save(&self, op: Operation) -> Result<(), StoreError> {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || store.save(&op))
            .await
            .map_err(|e| StoreError::Unavailable(format!("store task failed: {e}")))?
    }

    fn publish(&self) {
        self.snapshot.send_replace(self.current.clone());
    }

    fn push_update(&self, message: String) {
        if let Some(op) = &self.current {
            self.push(ProgressUpdate::update(op, message));
        }
    }

    // Nobody listening is fine; observers resync with a status query.
    fn push(&self, update: ProgressUpdate) {
        let _ = self.progress.send(update);
    }
}
