mod operation;
mod state;

pub use operation::{
    BlockOutcome, CallFailure, FailedUser, Operation, OperationStatus, QueueItem, RetryConfig,
    normalize_usernames,
};
pub use state::{StateMachine, Transition};
