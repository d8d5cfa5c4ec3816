//! Request/response and push channel between the orchestrator and UI observers.
//!
//! Any number of [`MessageBus`] clones can dispatch requests concurrently.
//! Pushes are best-effort: an observer that was not attached, or fell behind,
//! resynchronizes with [`Request::GetBlockingStatus`].

pub mod protocol;

use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use crate::orchestrator::OrchestratorHandle;

pub use protocol::{
    ProgressAction, ProgressUpdate, Push, Request, Response, StatusData, summarize,
};

#[derive(Clone)]
pub struct MessageBus {
    orchestrator: OrchestratorHandle,
}

impl MessageBus {
    pub fn new(orchestrator: OrchestratorHandle) -> Self {
        Self { orchestrator }
    }

    /// Answer one request.
    pub async fn dispatch(&self, request: Request) -> Response {
        match request {
            Request::GetBlockingStatus => Response::status(self.orchestrator.status().as_ref()),
            Request::StartBlocking { usernames } => {
                match self.orchestrator.start_blocking(usernames).await {
                    Ok(_) => Response::ok(),
                    Err(e) => Response::from(&e),
                }
            }
            Request::StopBlocking => match self.orchestrator.stop_blocking().await {
                Ok(requested) => {
                    debug!(requested, "stop handled");
                    Response::ok()
                }
                Err(e) => Response::from(&e),
            },
        }
    }

    /// Answer a request given and returned as JSON text.
    pub async fn dispatch_json(&self, raw: &str) -> String {
        let response = match serde_json::from_str::<Request>(raw) {
            Ok(request) => self.dispatch(request).await,
            Err(e) => {
                warn!(error = %e, "malformed request");
                Response::error("InvalidRequest")
            }
        };
        serde_json::to_string(&response)
            .unwrap_or_else(|_| r#"{"success":false,"error":"InternalError"}"#.to_string())
    }

    /// Attach a new observer. Only pushes sent after this call are received.
    pub fn observe(&self) -> Observer {
        Observer {
            receiver: self.orchestrator.subscribe(),
        }
    }
}

/// A subscribed progress observer.
pub struct Observer {
    receiver: broadcast::Receiver<ProgressUpdate>,
}

impl Observer {
    /// Next progress push, or `None` once the orchestrator is gone.
    /// Pushes lost because the observer lagged are skipped.
    pub async fn next(&mut self) -> Option<ProgressUpdate> {
        loop {
            match self.receiver.recv().await {
                Ok(update) => return Some(update),
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "observer lagged behind, skipping progress updates");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next push encoded as the wire `progressUpdate` message.
    pub async fn next_json(&mut self) -> Option<String> {
        let data = self.next().await?;
        serde_json::to_string(&Push::ProgressUpdate { data }).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forum::SimulatedForum;
    use crate::orchestrator::{BlockingOrchestrator, OrchestratorSettings};
    use crate::state_machine::RetryConfig;
    use crate::store::MemoryStore;
    use serde_json::{Value, json};
    use std::sync::Arc;
    use std::time::Duration;

    fn bus_with(forum: SimulatedForum) -> (MessageBus, OrchestratorHandle) {
        let settings = OrchestratorSettings {
            retry: RetryConfig {
                max_attempts: 3,
                base_delay_ms: 10,
            },
            min_call_spacing: Duration::ZERO,
            resume_interrupted: true,
        };
        let handle = BlockingOrchestrator::spawn(
            settings,
            Arc::new(forum),
            Arc::new(MemoryStore::new()),
        )
        .unwrap();
        (MessageBus::new(handle.clone()), handle)
    }

    async fn call(bus: &MessageBus, request: Value) -> Value {
        let raw = bus.dispatch_json(&request.to_string()).await;
        serde_json::from_str(&raw).unwrap()
    }

    #[tokio::test]
    async fn status_before_any_operation_has_no_data() {
        let (bus, _) = bus_with(SimulatedForum::new());
        let reply = call(&bus, json!({"action": "getBlockingStatus"})).await;
        assert_eq!(reply, json!({"success": true}));
    }

    #[tokio::test]
    async fn start_then_status_over_json() {
        let (bus, handle) =
            bus_with(SimulatedForum::new().with_latency(Duration::from_millis(50)));

        let reply = call(
            &bus,
            json!({"action": "startBlocking", "usernames": ["a", "b", "a", "c"]}),
        )
        .await;
        assert_eq!(reply, json!({"success": true}));

        let status = call(&bus, json!({"action": "getBlockingStatus"})).await;
        assert_eq!(status["data"]["isProcessing"], true);
        assert_eq!(status["data"]["totalUsers"], 3);

        handle.wait_until_settled().await;
        let status = call(&bus, json!({"action": "getBlockingStatus"})).await;
        assert_eq!(status["data"]["isProcessing"], false);
        assert_eq!(status["data"]["processedUsers"], 3);
        assert_eq!(status["data"]["status"], "Completed");
    }

    #[tokio::test]
    async fn start_errors_use_protocol_codes() {
        let (bus, handle) =
            bus_with(SimulatedForum::new().with_latency(Duration::from_millis(50)));

        let reply = call(&bus, json!({"action": "startBlocking", "usernames": []})).await;
        assert_eq!(reply, json!({"success": false, "error": "EmptyBatch"}));

        call(&bus, json!({"action": "startBlocking", "usernames": ["a", "b"]})).await;
        let reply = call(&bus, json!({"action": "startBlocking", "usernames": ["c"]})).await;
        assert_eq!(reply, json!({"success": false, "error": "AlreadyRunning"}));

        handle.wait_until_settled().await;
    }

    #[tokio::test]
    async fn stop_is_always_successful() {
        let (bus, handle) =
            bus_with(SimulatedForum::new().with_latency(Duration::from_millis(50)));

        let reply = call(&bus, json!({"action": "stopBlocking"})).await;
        assert_eq!(reply, json!({"success": true}));

        call(&bus, json!({"action": "startBlocking", "usernames": ["a", "b", "c"]})).await;
        let reply = call(&bus, json!({"action": "stopBlocking"})).await;
        assert_eq!(reply, json!({"success": true}));

        let done = handle.wait_until_settled().await.unwrap();
        assert!(done.stopped_by_user);
        assert!(done.processed_count < done.total_count);
    }

    #[tokio::test]
    async fn malformed_request_is_rejected() {
        let (bus, _) = bus_with(SimulatedForum::new());
        let raw = bus.dispatch_json("{\"action\": 42}").await;
        let reply: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(reply, json!({"success": false, "error": "InvalidRequest"}));
    }

    #[tokio::test]
    async fn observer_receives_wire_pushes() {
        let (bus, _) = bus_with(SimulatedForum::new());
        let mut observer = bus.observe();

        call(&bus, json!({"action": "startBlocking", "usernames": ["a"]})).await;

        let mut actions = Vec::new();
        while let Some(raw) = observer.next_json().await {
            let push: Value = serde_json::from_str(&raw).unwrap();
            assert_eq!(push["action"], "progressUpdate");
            let action = push["data"]["action"].as_str().unwrap().to_string();
            let done = action == "hide";
            actions.push(action);
            if done {
                break;
            }
        }
        assert_eq!(actions, vec!["show", "update", "hide"]);
    }
}
