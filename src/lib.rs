//! Bulk "block many accounts" orchestration for Discourse-style forums.
//!
//! A single [`orchestrator::BlockingOrchestrator`] worker owns the current
//! operation, persists it after every processed user and pushes progress to any
//! number of observers attached through [`bus::MessageBus`].

pub mod bus;
pub mod cli;
pub mod config;
pub mod error;
pub mod forum;
pub mod orchestrator;
pub mod rate_limiter;
pub mod state_machine;
pub mod store;
pub mod ui;
