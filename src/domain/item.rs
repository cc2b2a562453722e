//! Work items: the unit of work flowing from discovery to completion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::call::{CallRecord, DispatchReceipt, DocLinks, Summary, TranscriptRef};
use super::stage::StageKind;

/// Lifecycle status of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Admitted and queued, not yet picked up by a worker
    Pending,

    /// A worker is driving it through the stages
    InProgress,

    /// All four stages completed
    Succeeded,

    /// A stage failed permanently or exhausted its retry budget
    Failed,

    /// Shutdown interrupted it before completion
    Cancelled,
}

impl ItemStatus {
    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ItemStatus::Succeeded | ItemStatus::Failed | ItemStatus::Cancelled
        )
    }

    /// Stable lowercase name, used in logs and metric labels.
    pub fn name(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::InProgress => "in_progress",
            ItemStatus::Succeeded => "succeeded",
            ItemStatus::Failed => "failed",
            ItemStatus::Cancelled => "cancelled",
        }
    }
}

/// Record of the failure that ended an item, kept for logs and inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageFailure {
    /// Stage that failed
    pub stage: StageKind,

    /// "transient" (budget exhausted) or "permanent"
    pub class: String,

    /// Attempts made at the failing stage
    pub attempts: u32,

    /// Rendered error message from the final attempt
    pub message: String,
}

/// One discovered transcript and everything the stages have produced for it.
///
/// Stage outputs accumulate as `Option` fields; each stage reads what the
/// previous stages filled in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// Unique id for this processing attempt (not the transcript id)
    pub id: Uuid,

    /// The catalog reference that created this item
    pub transcript: TranscriptRef,

    /// When the poller admitted it
    pub discovered_at: DateTime<Utc>,

    pub status: ItemStatus,

    /// Filled by the enrich stage
    #[serde(default)]
    pub record: Option<CallRecord>,

    /// Filled by the summarize stage
    #[serde(default)]
    pub summary: Option<Summary>,

    /// Filled by the document stage
    #[serde(default)]
    pub docs: Option<DocLinks>,

    /// Filled by the notify stage
    #[serde(default)]
    pub receipt: Option<DispatchReceipt>,

    /// Set when the item ends in `Failed`
    #[serde(default)]
    pub failure: Option<StageFailure>,
}

impl WorkItem {
    pub fn new(transcript: TranscriptRef) -> Self {
        Self {
            id: Uuid::new_v4(),
            transcript,
            discovered_at: Utc::now(),
            status: ItemStatus::Pending,
            record: None,
            summary: None,
            docs: None,
            receipt: None,
            failure: None,
        }
    }

    pub fn transcript_id(&self) -> &str {
        &self.transcript.transcript_id
    }

    pub fn mark_in_progress(&mut self) {
        self.status = ItemStatus::InProgress;
    }

    pub fn mark_succeeded(&mut self) {
        self.status = ItemStatus::Succeeded;
    }

    pub fn mark_failed(&mut self, failure: StageFailure) {
        self.status = ItemStatus::Failed;
        self.failure = Some(failure);
    }

    pub fn mark_cancelled(&mut self) {
        self.status = ItemStatus::Cancelled;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_item_is_pending_with_no_outputs() {
        let item = WorkItem::new(TranscriptRef::bare("T1"));
        assert_eq!(item.status, ItemStatus::Pending);
        assert_eq!(item.transcript_id(), "T1");
        assert!(item.record.is_none());
        assert!(item.summary.is_none());
        assert!(item.docs.is_none());
        assert!(item.receipt.is_none());
        assert!(item.failure.is_none());
    }

    #[test]
    fn terminal_statuses_are_terminal() {
        assert!(!ItemStatus::Pending.is_terminal());
        assert!(!ItemStatus::InProgress.is_terminal());
        assert!(ItemStatus::Succeeded.is_terminal());
        assert!(ItemStatus::Failed.is_terminal());
        assert!(ItemStatus::Cancelled.is_terminal());
    }

    #[test]
    fn mark_failed_records_the_failure() {
        let mut item = WorkItem::new(TranscriptRef::bare("T2"));
        item.mark_in_progress();
        item.mark_failed(StageFailure {
            stage: StageKind::Summarize,
            class: "permanent".into(),
            attempts: 1,
            message: "content rejected".into(),
        });
        assert_eq!(item.status, ItemStatus::Failed);
        let failure = item.failure.as_ref().unwrap();
        assert_eq!(failure.stage, StageKind::Summarize);
        assert_eq!(failure.attempts, 1);
    }
}
