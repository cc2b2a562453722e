//! Duplicate suppression for discovered transcripts.
//!
//! The catalog is polled with overlapping windows, so the same transcript id
//! shows up across consecutive polls. The seen-set guarantees each id is
//! admitted exactly once per process lifetime: membership is checked and
//! recorded in one step, under one lock.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Set of transcript ids already admitted into the pipeline.
///
/// Clone is cheap; all clones share the same underlying set. The set only
/// grows; ids are never removed, even when the item later fails, so a
/// failed transcript is not re-admitted until the process restarts.
#[derive(Debug, Clone, Default)]
pub struct SeenSet {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl SeenSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populated set, for tests and warm starts.
    pub fn with_seen<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            inner: Arc::new(Mutex::new(ids.into_iter().map(Into::into).collect())),
        }
    }

    /// Records `id` as seen. Returns `true` if it was new (admit it),
    /// `false` if it was already known (drop it).
    ///
    /// Check and insert happen atomically, so two pollers racing on the
    /// same id cannot both admit it.
    pub fn admit(&self, id: &str) -> bool {
        let mut seen = self.lock();
        if seen.contains(id) {
            return false;
        }
        seen.insert(id.to_string());
        true
    }

    /// Whether `id` has been admitted before, without recording it.
    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        // Held only for map operations; a poisoned lock means a panic
        // mid-insert, and the set is still structurally valid.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_admit_succeeds_second_is_rejected() {
        let seen = SeenSet::new();
        assert!(seen.admit("T1"));
        assert!(!seen.admit("T1"));
        assert!(seen.admit("T2"));
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn clones_share_the_same_set() {
        let seen = SeenSet::new();
        let other = seen.clone();
        assert!(seen.admit("T1"));
        assert!(!other.admit("T1"));
        assert!(other.contains("T1"));
    }

    #[test]
    fn preseeded_ids_are_already_admitted() {
        let seen = SeenSet::with_seen(["T1", "T2"]);
        assert!(!seen.admit("T1"));
        assert!(seen.admit("T3"));
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn concurrent_admits_of_one_id_allow_exactly_one_through() {
        let seen = SeenSet::new();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let seen = seen.clone();
                std::thread::spawn(move || seen.admit("T1"))
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|was_new| *was_new)
            .count();
        assert_eq!(admitted, 1);
    }
}
