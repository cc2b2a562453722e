//! Bounded in-memory work queue between the poller and the workers.
//!
//! A thin wrapper over a bounded tokio mpsc channel. The bound is the
//! backpressure mechanism: when workers fall behind, `enqueue` blocks and
//! eventually reports [`EnqueueError::Full`], and the poller stops pulling
//! new work instead of buffering without limit.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TryRecvError};
use tokio::sync::Mutex;

use crate::domain::WorkItem;

/// Why an enqueue did not happen. The item is handed back so the caller
/// can retry it without cloning up front.
#[derive(Debug, Error)]
pub enum EnqueueError {
    /// Queue stayed at capacity for the whole wait.
    #[error("work queue full")]
    Full(WorkItem),

    /// Queue was closed; no new items are accepted.
    #[error("work queue closed")]
    Closed(WorkItem),
}

impl EnqueueError {
    /// Recovers the item that was not enqueued.
    pub fn into_item(self) -> WorkItem {
        match self {
            EnqueueError::Full(item) | EnqueueError::Closed(item) => item,
        }
    }
}

/// Creates a bounded queue of the given capacity.
///
/// The sender half goes to the poller, the receiver half is cloned across
/// workers. Capacity zero is rounded up to one (tokio channels cannot be
/// zero-sized).
pub fn work_queue(capacity: usize) -> (WorkSender, WorkReceiver) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    let depth = Arc::new(AtomicUsize::new(0));
    let sender = WorkSender {
        tx,
        depth: Arc::clone(&depth),
        capacity,
    };
    let receiver = WorkReceiver {
        rx: Arc::new(Mutex::new(rx)),
        depth,
    };
    (sender, receiver)
}

/// Producer half, held by the poller.
#[derive(Debug, Clone)]
pub struct WorkSender {
    tx: mpsc::Sender<WorkItem>,
    depth: Arc<AtomicUsize>,
    capacity: usize,
}

impl WorkSender {
    /// Enqueues `item`, waiting up to `timeout` for a slot.
    pub async fn enqueue(
        &self,
        item: WorkItem,
        timeout: Duration,
    ) -> Result<(), EnqueueError> {
        match self.tx.send_timeout(item, timeout).await {
            Ok(()) => {
                self.depth.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Err(SendTimeoutError::Timeout(item)) => Err(EnqueueError::Full(item)),
            Err(SendTimeoutError::Closed(item)) => Err(EnqueueError::Closed(item)),
        }
    }

    /// Items currently buffered in the queue.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Consumer half, shared by all workers.
///
/// Clones share one underlying receiver behind an async mutex, so any
/// number of workers can pull from the same queue. `recv` on a tokio mpsc
/// channel is cancel safe, so racing a dequeue against shutdown cannot
/// lose an item.
#[derive(Debug, Clone)]
pub struct WorkReceiver {
    rx: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
    depth: Arc<AtomicUsize>,
}

impl WorkReceiver {
    /// Waits for the next item. Returns `None` once the queue is closed
    /// and fully drained.
    pub async fn dequeue(&self) -> Option<WorkItem> {
        let mut rx = self.rx.lock().await;
        let item = rx.recv().await;
        if item.is_some() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
        item
    }

    /// Closes the queue: further enqueues fail, already-buffered items can
    /// still be dequeued or drained.
    pub async fn close(&self) {
        self.rx.lock().await.close();
    }

    /// Removes and returns everything currently buffered, without waiting.
    pub async fn drain(&self) -> Vec<WorkItem> {
        let mut rx = self.rx.lock().await;
        let mut items = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(item) => {
                    self.depth.fetch_sub(1, Ordering::SeqCst);
                    items.push(item);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        items
    }

    /// Items currently buffered in the queue.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TranscriptRef;

    fn item(id: &str) -> WorkItem {
        WorkItem::new(TranscriptRef::bare(id))
    }

    #[tokio::test]
    async fn items_come_out_in_fifo_order() {
        let (tx, rx) = work_queue(4);
        tx.enqueue(item("T1"), Duration::from_secs(1)).await.unwrap();
        tx.enqueue(item("T2"), Duration::from_secs(1)).await.unwrap();
        tx.enqueue(item("T3"), Duration::from_secs(1)).await.unwrap();

        assert_eq!(rx.dequeue().await.unwrap().transcript_id(), "T1");
        assert_eq!(rx.dequeue().await.unwrap().transcript_id(), "T2");
        assert_eq!(rx.dequeue().await.unwrap().transcript_id(), "T3");
    }

    #[tokio::test]
    async fn dequeue_parks_until_an_item_arrives() {
        let (tx, rx) = work_queue(1);
        let mut waiting = tokio_test::task::spawn(rx.dequeue());
        tokio_test::assert_pending!(waiting.poll());

        tx.enqueue(item("T1"), Duration::from_secs(1)).await.unwrap();
        assert!(waiting.is_woken());
        let got = tokio_test::assert_ready!(waiting.poll());
        assert_eq!(got.unwrap().transcript_id(), "T1");
    }

    #[tokio::test]
    async fn depth_tracks_enqueues_and_dequeues() {
        let (tx, rx) = work_queue(4);
        assert_eq!(tx.depth(), 0);
        tx.enqueue(item("T1"), Duration::from_secs(1)).await.unwrap();
        tx.enqueue(item("T2"), Duration::from_secs(1)).await.unwrap();
        assert_eq!(tx.depth(), 2);
        let _ = rx.dequeue().await;
        assert_eq!(rx.depth(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_times_out_and_returns_the_item() {
        let (tx, _rx) = work_queue(1);
        tx.enqueue(item("T1"), Duration::from_millis(50)).await.unwrap();

        let err = tx
            .enqueue(item("T2"), Duration::from_millis(50))
            .await
            .unwrap_err();
        match err {
            EnqueueError::Full(returned) => {
                assert_eq!(returned.transcript_id(), "T2");
            }
            other => panic!("expected Full, got {other:?}"),
        }
        // The buffered item is untouched.
        assert_eq!(tx.depth(), 1);
    }

    #[tokio::test]
    async fn closed_queue_rejects_new_items_but_drains_buffered_ones() {
        let (tx, rx) = work_queue(4);
        tx.enqueue(item("T1"), Duration::from_secs(1)).await.unwrap();
        tx.enqueue(item("T2"), Duration::from_secs(1)).await.unwrap();

        rx.close().await;

        let err = tx
            .enqueue(item("T3"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, EnqueueError::Closed(_)));

        let leftovers = rx.drain().await;
        let ids: Vec<_> = leftovers.iter().map(|i| i.transcript_id()).collect();
        assert_eq!(ids, ["T1", "T2"]);
        assert_eq!(rx.depth(), 0);

        // Closed and drained: dequeue reports end-of-queue.
        assert!(rx.dequeue().await.is_none());
    }

    #[tokio::test]
    async fn two_receivers_share_one_stream_of_items() {
        let (tx, rx) = work_queue(4);
        let rx2 = rx.clone();
        tx.enqueue(item("T1"), Duration::from_secs(1)).await.unwrap();
        tx.enqueue(item("T2"), Duration::from_secs(1)).await.unwrap();

        let a = rx.dequeue().await.unwrap();
        let b = rx2.dequeue().await.unwrap();
        let mut ids = vec![a.transcript_id().to_string(), b.transcript_id().to_string()];
        ids.sort();
        assert_eq!(ids, ["T1", "T2"]);
    }
}
