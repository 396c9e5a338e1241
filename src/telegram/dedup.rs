//! Telegram update deduplication cache

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

/// Default dedup TTL (5 minutes)
const DEDUP_TTL_SECS: u64 = 300;

/// Maximum dedup cache entries
const DEDUP_MAX_ENTRIES: usize = 2000;

/// Telegram update deduplication cache
///
/// Telegram redelivers an update when the webhook response is slow or lost.
/// Update ids seen within the TTL are reported as duplicates; the map is
/// capped so a flood of distinct ids cannot grow it without bound.
#[derive(Debug)]
pub struct UpdateDedup {
    cache: HashMap<i64, Instant>,
    ttl: Duration,
    max_entries: usize,
}

impl Default for UpdateDedup {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEDUP_TTL_SECS), DEDUP_MAX_ENTRIES)
    }
}

impl UpdateDedup {
    #[must_use]
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            cache: HashMap::new(),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Check if the given update id has been seen recently.
    ///
    /// Returns `true` if this is a duplicate (already seen within TTL).
    /// Returns `false` on first sight and records the id.
    pub fn is_duplicate(&mut self, update_id: i64) -> bool {
        let now = Instant::now();

        if let Some(ts) = self.cache.get(&update_id) {
            if now.saturating_duration_since(*ts) < self.ttl {
                return true;
            }
        }

        // Evict expired entries when at capacity
        if self.cache.len() >= self.max_entries {
            self.cache
                .retain(|_, ts| now.saturating_duration_since(*ts) < self.ttl);
        }

        // Still at capacity: drop the oldest entry
        if self.cache.len() >= self.max_entries {
            if let Some(oldest) = self
                .cache
                .iter()
                .min_by_key(|(_, ts)| **ts)
                .map(|(id, _)| *id)
            {
                self.cache.remove(&oldest);
            }
        }

        self.cache.insert(update_id, now);
        false
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
