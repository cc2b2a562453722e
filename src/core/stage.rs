//! The four pipeline stages and the path of one item through them.
//!
//! Stages are a closed set dispatched by [`StageKind`]; adding a stage
//! means touching the match in [`StageSet::run_stage`]. Every stage call
//! goes through the shared [`RetryExecutor`], so retry behavior cannot
//! drift between stages.

use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument};

use crate::adapters::{DocStore, Mailer, Summarizer, Warehouse};
use crate::domain::{StageError, StageFailure, StageKind, WorkItem};
use crate::metrics::Metrics;

use super::retry::{ExecOutcome, RetryExecutor, RetryPolicy};

/// Retry policy per stage.
///
/// Defaults reflect how each collaborator fails in practice: the warehouse
/// needs time for upstream sync (more attempts), the summarizer is slow
/// per attempt (long timeout), and notifications get only one retry to
/// limit duplicate-looking mail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagePolicies {
    #[serde(default = "default_enrich_policy")]
    pub enrich: RetryPolicy,

    #[serde(default = "default_summarize_policy")]
    pub summarize: RetryPolicy,

    #[serde(default = "default_document_policy")]
    pub document: RetryPolicy,

    #[serde(default = "default_notify_policy")]
    pub notify: RetryPolicy,
}

fn default_enrich_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 5,
        attempt_timeout_ms: 30_000,
        ..RetryPolicy::default()
    }
}

fn default_summarize_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        attempt_timeout_ms: 120_000,
        ..RetryPolicy::default()
    }
}

fn default_document_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        attempt_timeout_ms: 60_000,
        ..RetryPolicy::default()
    }
}

fn default_notify_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 2,
        attempt_timeout_ms: 30_000,
        ..RetryPolicy::default()
    }
}

impl Default for StagePolicies {
    fn default() -> Self {
        Self {
            enrich: default_enrich_policy(),
            summarize: default_summarize_policy(),
            document: default_document_policy(),
            notify: default_notify_policy(),
        }
    }
}

impl StagePolicies {
    pub fn policy_for(&self, kind: StageKind) -> &RetryPolicy {
        match kind {
            StageKind::Enrich => &self.enrich,
            StageKind::Summarize => &self.summarize,
            StageKind::Document => &self.document,
            StageKind::Notify => &self.notify,
        }
    }
}

/// How one stage run ended, after retries.
enum StageVerdict {
    Done { attempts: u32 },
    Failed(StageFailure),
    Cancelled { attempts: u32 },
}

/// The wired-up pipeline: collaborators, policies, retry executor, metrics.
///
/// Shared by all workers; processing mutates only the item it is given.
pub struct StageSet {
    warehouse: Arc<dyn Warehouse>,
    summarizer: Arc<dyn Summarizer>,
    docstore: Arc<dyn DocStore>,
    mailer: Arc<dyn Mailer>,
    policies: StagePolicies,
    executor: RetryExecutor,
    metrics: Metrics,
}

impl StageSet {
    pub fn new(
        warehouse: Arc<dyn Warehouse>,
        summarizer: Arc<dyn Summarizer>,
        docstore: Arc<dyn DocStore>,
        mailer: Arc<dyn Mailer>,
        policies: StagePolicies,
        executor: RetryExecutor,
        metrics: Metrics,
    ) -> Self {
        Self {
            warehouse,
            summarizer,
            docstore,
            mailer,
            policies,
            executor,
            metrics,
        }
    }

    /// Drives `item` through enrich, summarize, document, notify, in that
    /// order, leaving it in a terminal state.
    ///
    /// A stage failure or a shutdown cancellation stops the walk; later
    /// stages are never attempted for an abandoned item.
    #[instrument(
        skip(self, item),
        fields(item_id = %item.id, transcript_id = %item.transcript_id())
    )]
    pub async fn process(&self, item: &mut WorkItem) {
        item.mark_in_progress();
        let started = Instant::now();

        for kind in StageKind::ORDERED {
            let stage_started = Instant::now();
            let verdict = self.run_stage(kind, item).await;
            self.metrics.observe_stage(kind, stage_started.elapsed());

            match verdict {
                StageVerdict::Done { attempts } => {
                    self.metrics
                        .add_stage_retries(kind, attempts.saturating_sub(1));
                    debug!(stage = %kind, attempts, "stage completed");
                }
                StageVerdict::Failed(failure) => {
                    self.metrics
                        .add_stage_retries(kind, failure.attempts.saturating_sub(1));
                    self.metrics.record_failure(kind, &failure.class);
                    error!(
                        stage = %kind,
                        class = %failure.class,
                        attempts = failure.attempts,
                        error = %failure.message,
                        "stage failed; abandoning item"
                    );
                    item.mark_failed(failure);
                    self.metrics
                        .item_duration
                        .observe(started.elapsed().as_secs_f64());
                    return;
                }
                StageVerdict::Cancelled { attempts } => {
                    self.metrics
                        .add_stage_retries(kind, attempts.saturating_sub(1));
                    self.metrics.items_cancelled.inc();
                    info!(stage = %kind, "processing cancelled by shutdown");
                    item.mark_cancelled();
                    self.metrics
                        .item_duration
                        .observe(started.elapsed().as_secs_f64());
                    return;
                }
            }
        }

        item.mark_succeeded();
        self.metrics.items_succeeded.inc();
        self.metrics
            .item_duration
            .observe(started.elapsed().as_secs_f64());
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            "item completed"
        );
    }

    async fn run_stage(&self, kind: StageKind, item: &mut WorkItem) -> StageVerdict {
        let policy = self.policies.policy_for(kind);

        match kind {
            StageKind::Enrich => {
                let transcript_id = item.transcript_id().to_string();
                let outcome = self
                    .executor
                    .run(kind, policy, |_| {
                        let transcript_id = transcript_id.clone();
                        async move {
                            let record = self.warehouse.lookup(&transcript_id).await?;
                            if let Some(column) = record.first_empty_column() {
                                return Err(StageError::permanent(anyhow!(
                                    "warehouse record for transcript {transcript_id} \
                                     has empty {column}"
                                )));
                            }
                            Ok(record)
                        }
                    })
                    .await;
                settle(kind, outcome, |record| item.record = Some(record))
            }
            StageKind::Summarize => {
                let Some(record) = item.record.clone() else {
                    return missing_input(kind, StageKind::Enrich);
                };
                let outcome = self
                    .executor
                    .run(kind, policy, |_| {
                        let record = record.clone();
                        async move { self.summarizer.summarize(&record).await }
                    })
                    .await;
                settle(kind, outcome, |summary| item.summary = Some(summary))
            }
            StageKind::Document => {
                let (Some(record), Some(summary)) = (item.record.clone(), item.summary.clone())
                else {
                    return missing_input(kind, StageKind::Summarize);
                };
                let outcome = self
                    .executor
                    .run(kind, policy, |_| {
                        let record = record.clone();
                        let summary = summary.clone();
                        async move { self.docstore.publish(&record, &summary).await }
                    })
                    .await;
                settle(kind, outcome, |docs| item.docs = Some(docs))
            }
            StageKind::Notify => {
                let (Some(record), Some(summary), Some(docs)) = (
                    item.record.clone(),
                    item.summary.clone(),
                    item.docs.clone(),
                ) else {
                    return missing_input(kind, StageKind::Document);
                };
                let outcome = self
                    .executor
                    .run(kind, policy, |_| {
                        let record = record.clone();
                        let summary = summary.clone();
                        let docs = docs.clone();
                        async move { self.mailer.dispatch(&record, &summary, &docs).await }
                    })
                    .await;
                settle(kind, outcome, |receipt| item.receipt = Some(receipt))
            }
        }
    }
}

fn settle<T>(kind: StageKind, outcome: ExecOutcome<T>, apply: impl FnOnce(T)) -> StageVerdict {
    match outcome {
        ExecOutcome::Ok { value, attempts } => {
            apply(value);
            StageVerdict::Done { attempts }
        }
        ExecOutcome::Failed { error, attempts } => StageVerdict::Failed(StageFailure {
            stage: kind,
            class: error.class().to_string(),
            attempts,
            message: error.detail(),
        }),
        ExecOutcome::Cancelled { attempts } => StageVerdict::Cancelled { attempts },
    }
}

/// Stages run in order, so a missing prerequisite output is a bug, not a
/// collaborator failure. Recorded as permanent so the item still lands in
/// a terminal state.
fn missing_input(kind: StageKind, producer: StageKind) -> StageVerdict {
    StageVerdict::Failed(StageFailure {
        stage: kind,
        class: "permanent".to_string(),
        attempts: 0,
        message: format!("no {producer} output available for the {kind} stage"),
    })
}
