//! The discovery loop: poll the catalog, dedup, enqueue.
//!
//! One poller task owns the producer half of the work queue. Each tick
//! polls a sliding window ending at now, admits ids the seen-set has not
//! recorded, and enqueues them. A full queue blocks the poller rather than
//! dropping admitted items; the catalog being down costs one tick.

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::WorkItem;
use crate::metrics::Metrics;

use super::dedup::SeenSet;
use super::queue::{EnqueueError, WorkSender};
use super::source::TranscriptSource;

/// Timing knobs for the discovery loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerSettings {
    /// Seconds between catalog polls
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,

    /// Window size looking back from now, in seconds
    #[serde(default = "default_lookback_secs")]
    pub lookback_secs: u64,

    /// How long one enqueue waits for queue capacity before re-blocking,
    /// in milliseconds
    #[serde(default = "default_enqueue_wait_ms")]
    pub enqueue_wait_ms: u64,
}

fn default_interval_secs() -> u64 {
    60
}
fn default_lookback_secs() -> u64 {
    24 * 60 * 60
}
fn default_enqueue_wait_ms() -> u64 {
    5000
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            lookback_secs: default_lookback_secs(),
            enqueue_wait_ms: default_enqueue_wait_ms(),
        }
    }
}

impl PollerSettings {
    /// Largest accepted lookback window, one year in seconds.
    ///
    /// [`Config::validate`](crate::config::Config::validate) rejects
    /// anything larger; [`lookback`](Self::lookback) clamps to it so the
    /// window stays inside chrono's arithmetic range even for settings
    /// built without validation.
    pub const MAX_LOOKBACK_SECS: u64 = 366 * 24 * 60 * 60;

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn lookback(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lookback_secs.min(Self::MAX_LOOKBACK_SECS) as i64)
    }

    pub fn enqueue_wait(&self) -> Duration {
        Duration::from_millis(self.enqueue_wait_ms.max(1))
    }
}

/// The producer task: catalog in, work queue out.
pub struct Poller {
    source: Arc<dyn TranscriptSource>,
    seen: SeenSet,
    sender: WorkSender,
    settings: PollerSettings,
    shutdown: CancellationToken,
    metrics: Metrics,
}

impl Poller {
    pub fn new(
        source: Arc<dyn TranscriptSource>,
        seen: SeenSet,
        sender: WorkSender,
        settings: PollerSettings,
        shutdown: CancellationToken,
        metrics: Metrics,
    ) -> Self {
        Self {
            source,
            seen,
            sender,
            settings,
            shutdown,
            metrics,
        }
    }

    /// Polls until shutdown, with the first poll happening immediately.
    pub async fn run(self) {
        info!(
            interval_secs = self.settings.interval_secs,
            lookback_secs = self.settings.lookback_secs,
            "poller started"
        );

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            if let ControlFlow::Break(()) = self.tick().await {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.interval()) => {}
                _ = self.shutdown.cancelled() => break,
            }
        }

        info!("poller stopped");
    }

    /// One poll window: list, dedup, enqueue.
    async fn tick(&self) -> ControlFlow<()> {
        let to = Utc::now();
        let from = to - self.settings.lookback();

        self.metrics.polls.inc();
        let refs = match self.source.poll(from, to).await {
            Ok(refs) => refs,
            Err(e) => {
                self.metrics.poll_failures.inc();
                warn!(error = %e, "catalog poll failed; retrying next tick");
                return ControlFlow::Continue(());
            }
        };

        let reported = refs.len();
        let mut admitted = 0usize;

        for transcript in refs {
            if self.shutdown.is_cancelled() {
                return ControlFlow::Break(());
            }

            if !self.seen.admit(&transcript.transcript_id) {
                self.metrics.items_deduplicated.inc();
                continue;
            }
            self.metrics.items_discovered.inc();
            admitted += 1;

            let item = WorkItem::new(transcript);
            if let ControlFlow::Break(()) = self.enqueue_blocking(item).await {
                return ControlFlow::Break(());
            }
        }

        debug!(reported, admitted, seen = self.seen.len(), "poll tick finished");
        ControlFlow::Continue(())
    }

    /// Enqueues one admitted item, re-blocking while the queue is full.
    ///
    /// An admitted id is never un-admitted, so the only ways out are a
    /// successful enqueue or shutdown.
    async fn enqueue_blocking(&self, mut item: WorkItem) -> ControlFlow<()> {
        let transcript_id = item.transcript_id().to_string();

        loop {
            let attempt = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.metrics.items_cancelled.inc();
                    info!(%transcript_id, "shutdown while waiting for queue capacity; item cancelled");
                    return ControlFlow::Break(());
                }
                result = self.sender.enqueue(item, self.settings.enqueue_wait()) => result,
            };

            match attempt {
                Ok(()) => {
                    self.metrics.items_enqueued.inc();
                    self.metrics.queue_depth.set(self.sender.depth() as i64);
                    debug!(%transcript_id, depth = self.sender.depth(), "item enqueued");
                    return ControlFlow::Continue(());
                }
                Err(EnqueueError::Full(returned)) => {
                    warn!(
                        %transcript_id,
                        capacity = self.sender.capacity(),
                        "work queue full; waiting for capacity"
                    );
                    item = returned;
                }
                Err(err @ EnqueueError::Closed(_)) => {
                    let mut cancelled = err.into_item();
                    cancelled.mark_cancelled();
                    self.metrics.items_cancelled.inc();
                    info!(%transcript_id, "work queue closed; poller stopping");
                    return ControlFlow::Break(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    use crate::domain::TranscriptRef;
    use crate::ingest::queue::work_queue;
    use crate::ingest::source::SourceError;

    struct ScriptedSource {
        batches: Mutex<VecDeque<Result<Vec<TranscriptRef>, SourceError>>>,
    }

    impl ScriptedSource {
        fn new(
            batches: impl IntoIterator<Item = Result<Vec<TranscriptRef>, SourceError>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                batches: Mutex::new(batches.into_iter().collect()),
            })
        }
    }

    #[async_trait]
    impl TranscriptSource for ScriptedSource {
        async fn poll(
            &self,
            _from: DateTime<Utc>,
            _to: DateTime<Utc>,
        ) -> Result<Vec<TranscriptRef>, SourceError> {
            self.batches
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn refs(ids: &[&str]) -> Vec<TranscriptRef> {
        ids.iter().map(|id| TranscriptRef::bare(*id)).collect()
    }

    fn settings() -> PollerSettings {
        PollerSettings {
            interval_secs: 1,
            lookback_secs: 3600,
            enqueue_wait_ms: 50,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_catalog_ids_are_admitted_exactly_once() {
        let source = ScriptedSource::new([Ok(refs(&["T1", "T2"])), Ok(refs(&["T2", "T3"]))]);
        let (tx, rx) = work_queue(8);
        let shutdown = CancellationToken::new();
        let metrics = Metrics::new().unwrap();

        let poller = Poller::new(
            source,
            SeenSet::new(),
            tx,
            settings(),
            shutdown.clone(),
            metrics.clone(),
        );
        let handle = tokio::spawn(poller.run());

        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(rx.dequeue().await.unwrap().transcript_id().to_string());
        }
        assert_eq!(ids, ["T1", "T2", "T3"]);

        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(metrics.items_discovered.get(), 3);
        assert_eq!(metrics.items_deduplicated.get(), 1);
        assert_eq!(metrics.items_enqueued.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_errors_cost_one_tick_and_are_counted() {
        let source = ScriptedSource::new([
            Err(SourceError::Api {
                status: 503,
                body: "unavailable".into(),
            }),
            Ok(refs(&["T1"])),
        ]);
        let (tx, rx) = work_queue(8);
        let shutdown = CancellationToken::new();
        let metrics = Metrics::new().unwrap();

        let poller = Poller::new(
            source,
            SeenSet::new(),
            tx,
            settings(),
            shutdown.clone(),
            metrics.clone(),
        );
        let handle = tokio::spawn(poller.run());

        let item = rx.dequeue().await.unwrap();
        assert_eq!(item.transcript_id(), "T1");

        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(metrics.poll_failures.get(), 1);
        assert!(metrics.polls.get() >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_blocks_the_poller_without_dropping_items() {
        let source = ScriptedSource::new([Ok(refs(&["T1", "T2", "T3"]))]);
        let (tx, rx) = work_queue(1);
        let shutdown = CancellationToken::new();
        let metrics = Metrics::new().unwrap();

        let poller = Poller::new(
            source,
            SeenSet::new(),
            tx,
            settings(),
            shutdown.clone(),
            metrics.clone(),
        );
        let handle = tokio::spawn(poller.run());

        // Capacity one: each dequeue frees the slot the poller is blocked on.
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(rx.dequeue().await.unwrap().transcript_id().to_string());
        }
        assert_eq!(ids, ["T1", "T2", "T3"]);
        assert_eq!(metrics.items_enqueued.get(), 3);

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn closed_queue_cancels_the_blocked_item_and_stops_the_poller() {
        let source = ScriptedSource::new([Ok(refs(&["T1", "T2"]))]);
        let (tx, rx) = work_queue(1);
        let shutdown = CancellationToken::new();
        let metrics = Metrics::new().unwrap();

        let poller = Poller::new(
            source,
            SeenSet::new(),
            tx,
            settings(),
            shutdown.clone(),
            metrics.clone(),
        );
        let handle = tokio::spawn(poller.run());

        // T1 fills the queue, leaving the poller blocked re-offering T2.
        for _ in 0..10_000 {
            if metrics.items_enqueued.get() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(metrics.items_enqueued.get(), 1);

        rx.close().await;
        handle.await.unwrap();

        assert_eq!(metrics.items_enqueued.get(), 1);
        assert_eq!(metrics.items_cancelled.get(), 1);

        // The buffered item survives the close; the rejected one does not.
        assert_eq!(rx.dequeue().await.unwrap().transcript_id(), "T1");
        assert!(rx.dequeue().await.is_none());
    }

    #[tokio::test]
    async fn cancelled_token_stops_the_poller_before_any_poll() {
        let source = ScriptedSource::new([Ok(refs(&["T1"]))]);
        let (tx, rx) = work_queue(8);
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let metrics = Metrics::new().unwrap();

        let poller = Poller::new(
            source,
            SeenSet::new(),
            tx,
            settings(),
            shutdown,
            metrics.clone(),
        );
        poller.run().await;

        assert_eq!(metrics.polls.get(), 0);
        assert_eq!(rx.depth(), 0);
    }

    #[test]
    fn lookback_is_clamped_to_its_maximum() {
        for secs in [u64::MAX, i64::MAX as u64, 9_000_000_000_000] {
            let settings = PollerSettings {
                lookback_secs: secs,
                ..settings()
            };
            let window = settings.lookback();
            assert_eq!(window.num_seconds() as u64, PollerSettings::MAX_LOOKBACK_SECS);
            // The clamped window must stay subtractable from the clock.
            assert!(Utc::now() - window < Utc::now());
        }
    }
}
