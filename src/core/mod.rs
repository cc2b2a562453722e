//! Core pipeline logic.
//!
//! This module contains:
//! - Retry: the policy model and the shared retry executor
//! - Stage: the closed stage set and per-item processing
//! - Orchestrator: the worker pool and graceful drain

pub mod orchestrator;
pub mod retry;
pub mod stage;

// Re-export commonly used types
pub use orchestrator::{Orchestrator, ShutdownReport};
pub use retry::{ExecOutcome, RetryExecutor, RetryPolicy};
pub use stage::{StagePolicies, StageSet};
