//! Worker pool: the consumption side of the pipeline.
//!
//! The orchestrator spawns a fixed set of workers over the shared work
//! queue and supervises the graceful drain on shutdown. Workers race
//! dequeue against the shutdown token; an item already being processed is
//! finished up to the point where the retry executor observes cancellation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::domain::WorkItem;
use crate::ingest::queue::WorkReceiver;
use crate::metrics::Metrics;

use super::stage::StageSet;

/// What the drain looked like when `run` returned.
#[derive(Debug)]
pub struct ShutdownReport {
    /// All workers finished inside the grace period
    pub workers_done: bool,

    /// Queued items that never started; marked cancelled during drain
    pub abandoned: usize,
}

impl ShutdownReport {
    /// A drain is clean when every worker stopped in time.
    pub fn is_clean(&self) -> bool {
        self.workers_done
    }
}

/// Supervises the worker pool from start to drained shutdown.
pub struct Orchestrator {
    stages: Arc<StageSet>,
    receiver: WorkReceiver,
    workers: usize,
    shutdown: CancellationToken,
    grace: Duration,
    metrics: Metrics,
}

impl Orchestrator {
    pub fn new(
        stages: Arc<StageSet>,
        receiver: WorkReceiver,
        workers: usize,
        shutdown: CancellationToken,
        grace: Duration,
        metrics: Metrics,
    ) -> Self {
        Self {
            stages,
            receiver,
            workers: workers.max(1),
            shutdown,
            grace,
            metrics,
        }
    }

    /// Runs until shutdown is signalled, then drains.
    ///
    /// Drain order: close the queue so nothing new is accepted, give the
    /// workers the grace period to finish their current items, then mark
    /// whatever is still buffered as cancelled.
    pub async fn run(self) -> Result<ShutdownReport> {
        info!(workers = self.workers, "orchestrator starting");

        let mut handles = Vec::with_capacity(self.workers);
        for worker_id in 0..self.workers {
            let stages = Arc::clone(&self.stages);
            let receiver = self.receiver.clone();
            let shutdown = self.shutdown.clone();
            let metrics = self.metrics.clone();
            handles.push(tokio::spawn(worker_loop(
                worker_id, stages, receiver, shutdown, metrics,
            )));
        }

        self.shutdown.cancelled().await;
        info!("shutdown requested; draining workers");

        // No new enqueues from here on; blocked producers fail fast.
        self.receiver.close().await;

        let workers_done =
            match tokio::time::timeout(self.grace, futures::future::join_all(handles)).await {
                Ok(results) => {
                    for (worker_id, result) in results.into_iter().enumerate() {
                        if let Err(e) = result {
                            error!(worker_id, error = %e, "worker task failed");
                        }
                    }
                    true
                }
                Err(_) => {
                    warn!(
                        grace_ms = self.grace.as_millis() as u64,
                        "grace period elapsed before all workers finished"
                    );
                    false
                }
            };

        let leftovers = self.receiver.drain().await;
        let abandoned = leftovers.len();
        for mut item in leftovers {
            item.mark_cancelled();
            self.metrics.items_cancelled.inc();
            info!(
                item_id = %item.id,
                transcript_id = %item.transcript_id(),
                "queued item cancelled during drain"
            );
        }
        self.metrics.queue_depth.set(0);

        info!(workers_done, abandoned, "orchestrator stopped");
        Ok(ShutdownReport {
            workers_done,
            abandoned,
        })
    }
}

#[instrument(skip(stages, receiver, shutdown, metrics))]
async fn worker_loop(
    worker_id: usize,
    stages: Arc<StageSet>,
    receiver: WorkReceiver,
    shutdown: CancellationToken,
    metrics: Metrics,
) {
    info!("worker started");

    loop {
        // Biased so a cancelled token always wins over available work.
        let next: Option<WorkItem> = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            next = receiver.dequeue() => next,
        };

        // None: queue closed and fully drained.
        let Some(mut item) = next else { break };

        metrics.queue_depth.set(receiver.depth() as i64);
        metrics.in_flight.inc();
        stages.process(&mut item).await;
        metrics.in_flight.dec();
    }

    info!("worker stopped");
}
