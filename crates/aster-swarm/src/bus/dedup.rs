//! Time-windowed duplicate suppression for EXACTLY_ONCE delivery

use lru::LruCache;
use std::fmt;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

/// Remembers message ids for a fixed window
///
/// Memory is bounded twice: entries older than the window are purged, and
/// the least recently recorded entry is evicted once `capacity` is reached.
pub struct DedupCache {
    window: Duration,
    seen: LruCache<String, Instant>,
}

impl fmt::Debug for DedupCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DedupCache")
            .field("window", &self.window)
            .field("len", &self.seen.len())
            .field("capacity", &self.seen.cap())
            .finish()
    }
}

impl DedupCache {
    pub fn new(window: Duration, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            window,
            seen: LruCache::new(capacity),
        }
    }

    /// Record `id`; returns `false` if it was already seen inside the window
    pub fn check_and_record(&mut self, id: &str) -> bool {
        self.check_and_record_at(id, Instant::now())
    }

    pub(crate) fn check_and_record_at(&mut self, id: &str, now: Instant) -> bool {
        // peek keeps a duplicate from refreshing its own recency
        if let Some(seen_at) = self.seen.peek(id) {
            if now.saturating_duration_since(*seen_at) < self.window {
                return false;
            }
        }
        self.seen.put(id.to_string(), now);
        true
    }

    /// Whether `id` is currently remembered
    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    /// Drop entries older than the window; returns how many were removed
    pub fn purge(&mut self) -> usize {
        self.purge_at(Instant::now())
    }

    /// Entries are only touched by `put`, so LRU order is recording order
    pub(crate) fn purge_at(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        while let Some((_, seen_at)) = self.seen.peek_lru() {
            if now.saturating_duration_since(*seen_at) < self.window {
                break;
            }
            self.seen.pop_lru();
            removed += 1;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
