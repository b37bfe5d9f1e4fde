//! Store-and-poll channel.
//!
//! Envelopes are appended to a shared [`MailboxStore`] and every endpoint
//! polls it on an interval, reading forward from a cursor. Entries older
//! than the retention window are pruned by whichever endpoint polls.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use murmur_shared::constants::DEDUP_WINDOW_SECS;
use murmur_shared::protocol::Envelope;
use murmur_shared::types::{now_millis, UserId};

use crate::channel::{emit, ChannelEvent, DeliveryChannel, InboundSink, Reachability};
use crate::error::TransportError;

/// Entries fetched per poll.
const FETCH_BATCH: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxEntry {
    /// Monotonic sequence number assigned by the store.
    pub seq: u64,
    /// Local time the entry was appended (Unix epoch millis).
    pub posted_at: i64,
    pub envelope_json: String,
}

/// Shared append-only log of envelopes.
#[async_trait]
pub trait MailboxStore: Send + Sync {
    async fn append(&self, posted_at: i64, envelope_json: String) -> Result<u64, TransportError>;

    /// Entries with `seq > cursor`, oldest first, at most `limit`.
    async fn fetch_after(&self, cursor: u64, limit: usize) -> Result<Vec<MailboxEntry>, TransportError>;

    /// Delete entries posted before `cutoff`; returns how many.
    async fn prune_before(&self, cutoff: i64) -> Result<usize, TransportError>;

    /// Sequence number of the newest entry posted before `cutoff`, or 0.
    async fn last_seq_before(&self, cutoff: i64) -> Result<u64, TransportError>;
}

/// In-memory mailbox, shared by cloning the `Arc` around it.
#[derive(Debug, Default)]
pub struct MemoryMailbox {
    entries: Mutex<VecDeque<MailboxEntry>>,
    next_seq: AtomicU64,
}

impl MemoryMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MailboxStore for MemoryMailbox {
    async fn append(&self, posted_at: i64, envelope_json: String) -> Result<u64, TransportError> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(MailboxEntry {
                seq,
                posted_at,
                envelope_json,
            });
        Ok(seq)
    }

    async fn fetch_after(&self, cursor: u64, limit: usize) -> Result<Vec<MailboxEntry>, TransportError> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .iter()
            .filter(|entry| entry.seq > cursor)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn prune_before(&self, cutoff: i64) -> Result<usize, TransportError> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|entry| entry.posted_at >= cutoff);
        Ok(before - entries.len())
    }

    async fn last_seq_before(&self, cutoff: i64) -> Result<u64, TransportError> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .iter()
            .filter(|entry| entry.posted_at < cutoff)
            .map(|entry| entry.seq)
            .max()
            .unwrap_or(0))
    }
}

pub struct PollingChannel<S: MailboxStore + 'static> {
    name: String,
    store: Arc<S>,
    poll_interval: Duration,
    retention: Duration,
    replay_window: Duration,
    sink: Mutex<Option<InboundSink>>,
    poller: Mutex<Option<JoinHandle<()>>>,
    usable: Arc<AtomicBool>,
}

impl<S: MailboxStore + 'static> PollingChannel<S> {
    pub fn new(store: Arc<S>, poll_interval: Duration, retention: Duration) -> Self {
        Self {
            name: "mailbox-poll".to_string(),
            store,
            poll_interval,
            retention,
            replay_window: Duration::from_secs(DEDUP_WINDOW_SECS),
            sink: Mutex::new(None),
            poller: Mutex::new(None),
            usable: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// How far back a freshly opened channel reads. Older entries stay in
    /// the mailbox for other endpoints but are skipped here.
    pub fn with_replay_window(mut self, replay_window: Duration) -> Self {
        self.replay_window = replay_window;
        self
    }
}

#[async_trait]
impl<S: MailboxStore + 'static> DeliveryChannel for PollingChannel<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn reachability(&self) -> Reachability {
        Reachability::SameDevice
    }

    fn subscribe(&self, sink: InboundSink) {
        *self.sink.lock().unwrap_or_else(|e| e.into_inner()) = Some(sink);
    }

    async fn open(&self, _local_id: &UserId) -> Result<(), TransportError> {
        let mut poller = self.poller.lock().unwrap_or_else(|e| e.into_inner());
        if poller.is_some() {
            return Ok(());
        }
        let sink = self
            .sink
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| TransportError::ChannelUnavailable("no subscriber registered".into()))?;

        let store = Arc::clone(&self.store);
        let usable = Arc::clone(&self.usable);
        let name = self.name.clone();
        let poll_interval = self.poll_interval;
        let retention_ms = i64::try_from(self.retention.as_millis()).unwrap_or(i64::MAX);
        let replay_ms = i64::try_from(self.replay_window.as_millis()).unwrap_or(i64::MAX);

        self.usable.store(true, Ordering::SeqCst);
        *poller = Some(tokio::spawn(async move {
            let mut cursor = match store
                .last_seq_before(now_millis().saturating_sub(replay_ms))
                .await
            {
                Ok(seq) => seq,
                Err(e) => {
                    warn!(channel = %name, error = %e, "Mailbox cursor lookup failed; reading from start");
                    0
                }
            };
            debug!(channel = %name, cursor, "Mailbox cursor positioned");
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                if let Err(e) = store.prune_before(now_millis().saturating_sub(retention_ms)).await {
                    debug!(channel = %name, error = %e, "Mailbox prune failed");
                }

                let entries = match store.fetch_after(cursor, FETCH_BATCH).await {
                    Ok(entries) => {
                        usable.store(true, Ordering::SeqCst);
                        entries
                    }
                    Err(e) => {
                        warn!(channel = %name, error = %e, "Mailbox poll failed");
                        usable.store(false, Ordering::SeqCst);
                        continue;
                    }
                };

                for entry in entries {
                    cursor = entry.seq;
                    match Envelope::from_json(&entry.envelope_json) {
                        Ok(envelope) => {
                            if !emit(&sink, &name, ChannelEvent::Envelope(envelope)).await {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(channel = %name, seq = entry.seq, error = %e, "Skipping malformed mailbox entry");
                        }
                    }
                }
            }
        }));
        debug!(channel = %self.name, interval = ?self.poll_interval, "Mailbox polling started");
        Ok(())
    }

    async fn close(&self) {
        self.usable.store(false, Ordering::SeqCst);
        if let Some(handle) = self.poller.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }

    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let open = self.poller.lock().unwrap_or_else(|e| e.into_inner()).is_some();
        if !open {
            return Err(TransportError::ChannelUnavailable(format!("{} is closed", self.name)));
        }
        let json = envelope
            .to_json()
            .map_err(|e| TransportError::Codec(e.to_string()))?;
        self.store.append(now_millis(), json).await.map(|_| ())
    }

    fn is_usable(&self) -> bool {
        self.usable.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_memory_mailbox_cursor_and_prune() {
        let mailbox = MemoryMailbox::new();
        let first = mailbox.append(100, "a".into()).await.unwrap();
        let second = mailbox.append(200, "b".into()).await.unwrap();
        assert!(second > first);

        let after_first = mailbox.fetch_after(first, 10).await.unwrap();
        assert_eq!(after_first.len(), 1);
        assert_eq!(after_first[0].envelope_json, "b");

        assert_eq!(mailbox.prune_before(150).await.unwrap(), 1);
        assert_eq!(mailbox.len(), 1);
    }

    #[tokio::test]
    async fn test_last_seq_before() {
        let mailbox = MemoryMailbox::new();
        assert_eq!(mailbox.last_seq_before(1_000).await.unwrap(), 0);
        let first = mailbox.append(100, "a".into()).await.unwrap();
        mailbox.append(200, "b".into()).await.unwrap();
        assert_eq!(mailbox.last_seq_before(150).await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_reopen_skips_entries_older_than_replay_window() {
        let mailbox = Arc::new(MemoryMailbox::new());
        let old = Envelope::direct(UserId([1; 32]), UserId([2; 32]), vec![1; 48], 0);
        let recent = Envelope::direct(UserId([1; 32]), UserId([2; 32]), vec![2; 48], now_millis());
        mailbox
            .append(now_millis() - 60 * 60 * 1000, old.to_json().unwrap())
            .await
            .unwrap();
        mailbox
            .append(now_millis(), recent.to_json().unwrap())
            .await
            .unwrap();

        let channel = PollingChannel::new(
            Arc::clone(&mailbox),
            Duration::from_millis(10),
            Duration::from_secs(24 * 60 * 60),
        )
        .with_replay_window(Duration::from_secs(60));
        let (tx, mut rx) = mpsc::channel(8);
        channel.subscribe(tx);
        channel.open(&UserId([2; 32])).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event.event, ChannelEvent::Envelope(e) if e == recent));
        assert!(tokio::time::timeout(Duration::from_millis(100), rx.recv())
            .await
            .is_err());
        assert_eq!(mailbox.len(), 2);

        channel.close().await;
    }

    #[tokio::test]
    async fn test_two_endpoints_exchange_through_mailbox() {
        let mailbox = Arc::new(MemoryMailbox::new());
        let retention = Duration::from_secs(60);
        let a = PollingChannel::new(Arc::clone(&mailbox), Duration::from_millis(10), retention);
        let b = PollingChannel::new(Arc::clone(&mailbox), Duration::from_millis(10), retention);

        let (a_tx, _a_rx) = mpsc::channel(8);
        let (b_tx, mut b_rx) = mpsc::channel(8);
        a.subscribe(a_tx);
        b.subscribe(b_tx);
        a.open(&UserId([1; 32])).await.unwrap();
        b.open(&UserId([2; 32])).await.unwrap();

        let envelope = Envelope::direct(UserId([1; 32]), UserId([2; 32]), vec![9; 48], now_millis());
        a.send(&envelope).await.unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), b_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event.event, ChannelEvent::Envelope(e) if e == envelope));

        a.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_send_before_open_fails() {
        let channel = PollingChannel::new(
            Arc::new(MemoryMailbox::new()),
            Duration::from_millis(10),
            Duration::from_secs(1),
        );
        assert!(channel
            .send(&Envelope::direct(UserId([1; 32]), UserId([2; 32]), vec![], 0))
            .await
            .is_err());
    }
}
