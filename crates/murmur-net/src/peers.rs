//! Peer liveness tracking.
//!
//! Keeps an in-memory map of every peer heard from, its last announcement
//! time and its transport-level state. Presence announcements only ever
//! refresh liveness; a peer is downgraded by an explicit transport
//! disconnect or removed once its announcements stop for longer than the
//! TTL.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tracing::debug;

use murmur_shared::identity::PeerIdentity;
use murmur_shared::types::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Heard via presence, no transport-level connection reported.
    Discovered,
    Connected,
    Disconnected,
}

/// Everything we know about one remote peer.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub id: UserId,
    /// Identity from the most recent presence announcement.
    pub user_data: Option<PeerIdentity>,
    /// Local receive time of the last announcement (Unix epoch millis).
    pub last_seen_at: i64,
    pub state: PeerState,
    // Whether the last notification sent for this peer was "online".
    online_reported: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Connected,
    Disconnected,
}

/// A connectivity change worth telling subscribers about.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerEvent {
    pub peer_id: UserId,
    pub status: PeerStatus,
    pub identity: Option<PeerIdentity>,
    /// Set when the peer was dropped from the registry by TTL expiry.
    pub expired: bool,
}

impl PeerEvent {
    fn from_record(record: &PeerRecord, status: PeerStatus, expired: bool) -> Self {
        Self {
            peer_id: record.id,
            status,
            identity: record.user_data.clone(),
            expired,
        }
    }
}

#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<UserId, PeerRecord>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a presence announcement received at `now`.
    ///
    /// A first sighting creates a `Discovered` record and yields a
    /// connected notification. Known peers only have their liveness and
    /// identity refreshed; their state is never changed here.
    pub fn record_announcement(&mut self, user_data: PeerIdentity, now: i64) -> Option<PeerEvent> {
        let peer_id = user_data.id;
        match self.peers.get_mut(&peer_id) {
            Some(record) => {
                record.last_seen_at = now;
                record.user_data = Some(user_data);
                None
            }
            None => {
                let record = PeerRecord {
                    id: peer_id,
                    user_data: Some(user_data),
                    last_seen_at: now,
                    state: PeerState::Discovered,
                    online_reported: true,
                };
                debug!(peer = %peer_id.short(), "Discovered peer via presence");
                let event = PeerEvent::from_record(&record, PeerStatus::Connected, false);
                self.peers.insert(peer_id, record);
                Some(event)
            }
        }
    }

    /// Refresh liveness for a peer we just heard from. Unknown peers are ignored.
    pub fn touch(&mut self, peer_id: &UserId, now: i64) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(record) => {
                record.last_seen_at = now;
                true
            }
            None => false,
        }
    }

    /// A transport reported a live connection to `peer_id`.
    pub fn mark_connected(&mut self, peer_id: UserId, now: i64) -> Option<PeerEvent> {
        let record = self.peers.entry(peer_id).or_insert_with(|| PeerRecord {
            id: peer_id,
            user_data: None,
            last_seen_at: now,
            state: PeerState::Discovered,
            online_reported: false,
        });
        record.state = PeerState::Connected;
        record.last_seen_at = now;
        debug!(peer = %peer_id.short(), "Transport reports peer connected");

        if record.online_reported {
            return None;
        }
        record.online_reported = true;
        Some(PeerEvent::from_record(record, PeerStatus::Connected, false))
    }

    /// A transport reported the connection to `peer_id` is gone.
    pub fn mark_disconnected(&mut self, peer_id: &UserId) -> Option<PeerEvent> {
        let record = self.peers.get_mut(peer_id)?;
        record.state = PeerState::Disconnected;
        debug!(peer = %peer_id.short(), "Transport reports peer disconnected");

        if !record.online_reported {
            return None;
        }
        record.online_reported = false;
        Some(PeerEvent::from_record(record, PeerStatus::Disconnected, false))
    }

    /// Remove peers silent for longer than `ttl`, one event per removed peer.
    pub fn expire_stale(&mut self, now: i64, ttl: Duration) -> Vec<PeerEvent> {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let stale: Vec<UserId> = self
            .peers
            .values()
            .filter(|record| now.saturating_sub(record.last_seen_at) > ttl_ms)
            .map(|record| record.id)
            .collect();

        stale
            .into_iter()
            .filter_map(|peer_id| self.peers.remove(&peer_id))
            .map(|record| {
                debug!(peer = %record.id.short(), "Peer expired");
                PeerEvent::from_record(&record, PeerStatus::Disconnected, true)
            })
            .collect()
    }

    pub fn get(&self, peer_id: &UserId) -> Option<&PeerRecord> {
        self.peers.get(peer_id)
    }

    /// Peers with a live transport-level connection.
    pub fn connected_peers(&self) -> HashSet<UserId> {
        self.peers
            .values()
            .filter(|record| record.state == PeerState::Connected)
            .map(|record| record.id)
            .collect()
    }

    pub fn snapshot(&self) -> Vec<PeerRecord> {
        self.peers.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_shared::identity::KeyMaterial;

    fn identity(name: &str) -> PeerIdentity {
        KeyMaterial::generate().to_identity(name)
    }

    const TTL: Duration = Duration::from_secs(30);

    #[test]
    fn test_first_announcement_reports_online() {
        let mut registry = PeerRegistry::new();
        let bob = identity("bob");

        let event = registry.record_announcement(bob.clone(), 1_000).unwrap();
        assert_eq!(event.peer_id, bob.id);
        assert_eq!(event.status, PeerStatus::Connected);
        assert_eq!(registry.get(&bob.id).unwrap().state, PeerState::Discovered);

        assert!(registry.record_announcement(bob.clone(), 2_000).is_none());
        assert_eq!(registry.get(&bob.id).unwrap().last_seen_at, 2_000);
    }

    #[test]
    fn test_announcement_never_changes_state() {
        let mut registry = PeerRegistry::new();
        let bob = identity("bob");
        registry.record_announcement(bob.clone(), 0);
        registry.mark_connected(bob.id, 10);
        registry.mark_disconnected(&bob.id);

        assert!(registry.record_announcement(bob.clone(), 20).is_none());
        assert_eq!(registry.get(&bob.id).unwrap().state, PeerState::Disconnected);
    }

    #[test]
    fn test_expiry_fires_exactly_one_disconnect() {
        let mut registry = PeerRegistry::new();
        let bob = identity("bob");
        registry.record_announcement(bob.clone(), 0);

        assert!(registry.expire_stale(30_000, TTL).is_empty());

        let events = registry.expire_stale(30_001, TTL);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, PeerStatus::Disconnected);
        assert!(events[0].expired);
        assert!(registry.get(&bob.id).is_none());

        assert!(registry.expire_stale(60_000, TTL).is_empty());
    }

    #[test]
    fn test_reannounce_after_expiry_fires_one_connect() {
        let mut registry = PeerRegistry::new();
        let bob = identity("bob");
        registry.record_announcement(bob.clone(), 0);
        registry.expire_stale(40_000, TTL);

        let first = registry.record_announcement(bob.clone(), 41_000);
        let second = registry.record_announcement(bob.clone(), 42_000);
        assert_eq!(first.map(|e| e.status), Some(PeerStatus::Connected));
        assert!(second.is_none());
    }

    #[test]
    fn test_transport_events_alternate() {
        let mut registry = PeerRegistry::new();
        let bob = identity("bob");

        let up = registry.mark_connected(bob.id, 0).unwrap();
        assert_eq!(up.status, PeerStatus::Connected);
        assert!(registry.mark_connected(bob.id, 1).is_none());

        let down = registry.mark_disconnected(&bob.id).unwrap();
        assert_eq!(down.status, PeerStatus::Disconnected);
        assert!(registry.mark_disconnected(&bob.id).is_none());

        assert!(registry.mark_connected(bob.id, 2).is_some());
        assert!(registry.connected_peers().contains(&bob.id));
    }

    #[test]
    fn test_discovered_then_connected_does_not_repeat_online() {
        let mut registry = PeerRegistry::new();
        let bob = identity("bob");
        registry.record_announcement(bob.clone(), 0);
        assert!(registry.mark_connected(bob.id, 5).is_none());
        assert_eq!(registry.get(&bob.id).unwrap().state, PeerState::Connected);
    }

    #[test]
    fn test_touch_unknown_peer_is_noop() {
        let mut registry = PeerRegistry::new();
        assert!(!registry.touch(&UserId([1; 32]), 10));
        assert!(registry.is_empty());
    }
}
