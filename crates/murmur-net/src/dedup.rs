//! Time-windowed set of recently seen envelope ids.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use murmur_shared::types::EnvelopeId;

/// Remembers envelope ids for `window`, holding at most `capacity` entries.
///
/// An id is kept until `window` after the later of its local receive time
/// and its sender timestamp, so a future-dated envelope stays remembered for
/// as long as a receiver would still accept it as fresh. The sender
/// timestamp can push expiry out by at most one extra window.
#[derive(Debug)]
pub struct DedupCache {
    window_ms: i64,
    capacity: usize,
    /// id -> expiry time (Unix epoch millis).
    seen: HashMap<EnvelopeId, i64>,
    by_expiry: BTreeSet<(i64, EnvelopeId)>,
}

impl DedupCache {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window_ms: i64::try_from(window.as_millis()).unwrap_or(i64::MAX),
            capacity: capacity.max(1),
            seen: HashMap::new(),
            by_expiry: BTreeSet::new(),
        }
    }

    /// Record `id`, received at `now` and stamped `sent_at` by its sender.
    /// Returns `true` on first sighting within the window.
    pub fn check_and_insert(&mut self, id: EnvelopeId, now: i64, sent_at: i64) -> bool {
        self.prune(now);
        if self.seen.contains_key(&id) {
            return false;
        }

        let anchor = sent_at.clamp(now, now.saturating_add(self.window_ms));
        let expires_at = anchor.saturating_add(self.window_ms);
        self.seen.insert(id, expires_at);
        self.by_expiry.insert((expires_at, id));
        self.evict_over_capacity();
        true
    }

    pub fn contains(&self, id: &EnvelopeId) -> bool {
        self.seen.contains_key(id)
    }

    /// Forget ids whose expiry has passed.
    pub fn prune(&mut self, now: i64) {
        while let Some(&(expires_at, id)) = self.by_expiry.first() {
            if expires_at >= now {
                break;
            }
            self.by_expiry.pop_first();
            self.seen.remove(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    // Soonest-expiring ids go first.
    fn evict_over_capacity(&mut self) {
        while self.seen.len() > self.capacity {
            match self.by_expiry.pop_first() {
                Some((_, id)) => {
                    self.seen.remove(&id);
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> EnvelopeId {
        EnvelopeId([n; 32])
    }

    #[test]
    fn test_second_sighting_rejected() {
        let mut cache = DedupCache::new(Duration::from_secs(60), 100);
        assert!(cache.check_and_insert(id(1), 1_000, 1_000));
        assert!(!cache.check_and_insert(id(1), 2_000, 1_000));
        assert!(cache.check_and_insert(id(2), 2_000, 2_000));
    }

    #[test]
    fn test_window_expiry_allows_again() {
        let mut cache = DedupCache::new(Duration::from_secs(1), 100);
        assert!(cache.check_and_insert(id(1), 0, 0));
        assert!(!cache.check_and_insert(id(1), 1_000, 0));
        assert!(cache.check_and_insert(id(1), 1_001, 0));
    }

    #[test]
    fn test_future_dated_id_kept_past_receive_window() {
        let mut cache = DedupCache::new(Duration::from_millis(300), 100);
        // Sender clock 250 ms ahead: still fresh to a receiver until 550.
        assert!(cache.check_and_insert(id(1), 0, 250));
        assert!(!cache.check_and_insert(id(1), 350, 250));
        assert!(!cache.check_and_insert(id(1), 550, 250));
        assert!(cache.check_and_insert(id(1), 551, 250));
    }

    #[test]
    fn test_far_future_timestamp_extends_one_window_only() {
        let mut cache = DedupCache::new(Duration::from_millis(300), 100);
        assert!(cache.check_and_insert(id(1), 0, 1_000_000));
        cache.prune(600);
        assert!(cache.contains(&id(1)));
        cache.prune(601);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_past_dated_id_uses_receive_time() {
        let mut cache = DedupCache::new(Duration::from_millis(300), 100);
        assert!(cache.check_and_insert(id(1), 10_000, 0));
        cache.prune(10_300);
        assert!(cache.contains(&id(1)));
    }

    #[test]
    fn test_capacity_bound() {
        let mut cache = DedupCache::new(Duration::from_secs(60), 3);
        for n in 0..5 {
            assert!(cache.check_and_insert(id(n), 10 + i64::from(n), 0));
        }
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains(&id(0)));
        assert!(!cache.contains(&id(1)));
        assert!(cache.contains(&id(4)));
    }

    #[test]
    fn test_prune_empties_old_entries() {
        let mut cache = DedupCache::new(Duration::from_millis(500), 10);
        cache.check_and_insert(id(1), 0, 0);
        cache.check_and_insert(id(2), 400, 400);
        cache.prune(800);
        assert!(!cache.contains(&id(1)));
        assert!(cache.contains(&id(2)));
        cache.prune(2_000);
        assert!(cache.is_empty());
    }
}
