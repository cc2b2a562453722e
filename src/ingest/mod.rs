//! Transcript ingestion: discovery, dedup, and the work queue.
//!
//! The producing half of the pipeline:
//!
//! 1. **Source**: polls the external call catalog for a sliding window
//! 2. **Dedup**: admits each transcript id exactly once per process
//! 3. **Queue**: bounded FIFO between the poller and the workers
//! 4. **Poller**: the loop tying the three together on a fixed interval
//!
//! # Architecture
//!
//! ```text
//! Catalog ── poll ──> Poller ── admit? ──> SeenSet
//!                       │
//!                       └── enqueue ──> WorkQueue ──> workers
//! ```

pub mod dedup;
pub mod poller;
pub mod queue;
pub mod source;

// Re-export key types
pub use dedup::SeenSet;
pub use poller::{Poller, PollerSettings};
pub use queue::{work_queue, EnqueueError, WorkReceiver, WorkSender};
pub use source::{CatalogClient, SourceError, TranscriptSource};
