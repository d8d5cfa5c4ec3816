pub mod client;
pub mod error;
pub mod simulated;
pub mod types;

use async_trait::async_trait;

use crate::state_machine::CallFailure;

pub use client::ForumClient;
pub use error::ForumError;
pub use simulated::SimulatedForum;
pub use types::NotificationLevelRequest;

/// Performs a single "block user" action against the forum.
#[async_trait]
pub trait BlockUserCall: Send + Sync {
    async fn block_user(&self, username: &str) -> Result<(), CallFailure>;
}
