//! recap - call transcript summarization service
//!
//! Polls a call catalog for freshly transcribed calls, deduplicates them,
//! and drives each one through a fixed four-stage pipeline: enrich the
//! transcript with account data from the warehouse, summarize it, publish
//! the summary to the account's documents, and notify the account team.
//!
//! # Architecture
//!
//! - Discovery is pull-based: a poller queries the catalog on an interval
//!   over a sliding lookback window and admits each transcript id once.
//! - Admitted items flow through a bounded in-memory queue to a small
//!   worker pool; a full queue blocks discovery rather than dropping work.
//! - Every stage call runs under one retry executor with exponential
//!   backoff, jitter, and a transient/permanent failure split.
//! - A single cancellation token drains the whole system: in-flight items
//!   finish their current attempt, queued items are abandoned.
//!
//! # Modules
//!
//! - `ingest`: catalog polling, dedup, the bounded work queue
//! - `core`: the stage walk, retry executor, worker orchestration
//! - `adapters`: warehouse, summarizer, docstore, and mailer clients
//! - `domain`: data structures (WorkItem, CallRecord, Summary)
//! - `metrics`: Prometheus registry and scrape endpoint
//! - `cli`: command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run the service
//! recap run
//!
//! # Re-run one transcript by hand
//! recap process tr-1234
//!
//! # Preview what a poll would admit
//! recap poll --lookback-secs 3600
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod ingest;
pub mod metrics;

// Re-export main types at crate root for convenience
pub use crate::core::{Orchestrator, RetryExecutor, RetryPolicy, StagePolicies, StageSet};
pub use crate::domain::{
    CallRecord, ItemStatus, StageError, StageKind, Summary, TranscriptRef, WorkItem,
};
pub use crate::ingest::{work_queue, Poller, PollerSettings, SeenSet};
pub use crate::metrics::Metrics;

// Collaborator traits, for wiring custom backends in tests
pub use crate::adapters::{DocStore, Mailer, Summarizer, Warehouse};
