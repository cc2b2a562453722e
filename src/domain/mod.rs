//! Domain types for the recap pipeline.
//!
//! This module contains the core data structures:
//! - Call: catalog references, warehouse records, and stage outputs
//! - Item: the work item flowing from discovery to completion
//! - Stage: stage identity and failure classification

pub mod call;
pub mod item;
pub mod stage;

// Re-export commonly used types
pub use call::{CallRecord, DispatchReceipt, DocLinks, Summary, TranscriptRef};
pub use item::{ItemStatus, StageFailure, WorkItem};
pub use stage::{StageError, StageKind, StageResult};
