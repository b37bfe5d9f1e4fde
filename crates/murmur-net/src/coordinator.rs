//! Multi-channel transport coordinator.
//!
//! Owns every delivery channel, the peer registry and the dedup cache.
//! Background tasks announce presence on an interval, sweep stale peers,
//! process inbound events in arrival order and reopen failed channels
//! with exponential backoff. Application code talks to it through
//! [`TransportCoordinator::send`] and the receiver from
//! [`TransportCoordinator::take_inbound`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};

use futures::future::join_all;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use murmur_shared::crypto::SigningKeyPair;
use murmur_shared::identity::PeerIdentity;
use murmur_shared::protocol::{Envelope, EnvelopeKind, PresencePayload};
use murmur_shared::types::{now_millis, UserId};

use crate::backoff::Backoff;
use crate::channel::{ChannelEvent, DeliveryChannel, InboundEvent};
use crate::config::{DeliveryMode, TransportConfig};
use crate::dedup::DedupCache;
use crate::error::TransportError;
use crate::peers::{PeerEvent, PeerRecord, PeerRegistry};

const PEER_EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Idle,
    Open,
    Reconnecting,
    /// Reconnect attempts exhausted.
    Failed,
}

/// Identity announced on every channel.
#[derive(Debug, Clone)]
pub struct LocalPresence {
    pub identity: PeerIdentity,
    /// Presence announcements are signed when present.
    pub signer: Option<SigningKeyPair>,
}

struct ChannelSlot {
    channel: Arc<dyn DeliveryChannel>,
    status: StdMutex<ChannelStatus>,
    reconnecting: AtomicBool,
    is_fallback: bool,
}

impl ChannelSlot {
    fn new(channel: Arc<dyn DeliveryChannel>, is_fallback: bool) -> Arc<Self> {
        Arc::new(Self {
            channel,
            status: StdMutex::new(ChannelStatus::Idle),
            reconnecting: AtomicBool::new(false),
            is_fallback,
        })
    }

    fn name(&self) -> &str {
        self.channel.name()
    }

    fn status(&self) -> ChannelStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_status(&self, status: ChannelStatus) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }

    fn is_open(&self) -> bool {
        self.status() == ChannelStatus::Open && self.channel.is_usable()
    }
}

struct Inner {
    config: TransportConfig,
    /// Primaries in priority order, then the fallback if configured.
    slots: Vec<Arc<ChannelSlot>>,
    local: OnceLock<LocalPresence>,
    registry: Mutex<PeerRegistry>,
    dedup: Mutex<DedupCache>,
    peer_events: broadcast::Sender<PeerEvent>,
    inbound_tx: mpsc::Sender<InboundEvent>,
    inbound_rx: StdMutex<Option<mpsc::Receiver<InboundEvent>>>,
    delivered_tx: mpsc::Sender<Envelope>,
    delivered_rx: StdMutex<Option<mpsc::Receiver<Envelope>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

/// Cheap to clone; all clones drive the same transport.
#[derive(Clone)]
pub struct TransportCoordinator {
    inner: Arc<Inner>,
}

impl TransportCoordinator {
    /// `channels` are listed in priority order. The optional `fallback` is
    /// only opened while no primary channel is open.
    pub fn new(
        config: TransportConfig,
        channels: Vec<Arc<dyn DeliveryChannel>>,
        fallback: Option<Arc<dyn DeliveryChannel>>,
    ) -> Self {
        let mut slots: Vec<Arc<ChannelSlot>> = channels
            .into_iter()
            .map(|channel| ChannelSlot::new(channel, false))
            .collect();
        if let Some(channel) = fallback {
            slots.push(ChannelSlot::new(channel, true));
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (delivered_tx, delivered_rx) = mpsc::channel(config.queue_capacity.max(1));
        let (peer_events, _) = broadcast::channel(PEER_EVENT_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);
        let dedup = DedupCache::new(config.dedup_window, config.dedup_capacity);

        Self {
            inner: Arc::new(Inner {
                config,
                slots,
                local: OnceLock::new(),
                registry: Mutex::new(PeerRegistry::new()),
                dedup: Mutex::new(dedup),
                peer_events,
                inbound_tx,
                inbound_rx: StdMutex::new(Some(inbound_rx)),
                delivered_tx,
                delivered_rx: StdMutex::new(Some(delivered_rx)),
                shutdown_tx,
                tasks: StdMutex::new(Vec::new()),
            }),
        }
    }

    /// Open every primary channel and start the background tasks.
    ///
    /// Channels that fail to open are retried in the background. Fails only
    /// when neither a primary nor the fallback could be opened.
    pub async fn initialize(&self, presence: LocalPresence) -> Result<(), TransportError> {
        let inner = &self.inner;
        inner.config.validate()?;
        let local_id = presence.identity.id;
        inner
            .local
            .set(presence)
            .map_err(|_| TransportError::Config("transport already initialized".into()))?;

        let inbound_rx = inner
            .inbound_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| TransportError::Config("inbound queue already taken".into()))?;
        inner.track(tokio::spawn(Arc::clone(inner).run_inbound(inbound_rx)));

        for slot in inner.slots.iter().filter(|slot| !slot.is_fallback) {
            slot.channel.subscribe(inner.inbound_tx.clone());
            if let Err(e) = inner.open_slot(slot).await {
                warn!(channel = %slot.name(), error = %e, "Channel failed to open; will retry");
                inner.spawn_reconnect(Arc::clone(slot));
            }
        }

        if let Err(e) = inner.ensure_fallback().await {
            error!(error = %e, "No delivery channel available");
            self.shutdown().await;
            return Err(e);
        }

        inner.track(tokio::spawn(Arc::clone(inner).run_presence()));
        inner.track(tokio::spawn(Arc::clone(inner).run_expiry()));

        info!(
            user = %local_id.short(),
            channels = ?self.channel_statuses(),
            "Transport initialized"
        );
        Ok(())
    }

    /// Send according to the configured [`DeliveryMode`]. Returns how many
    /// channels accepted the envelope.
    pub async fn send(&self, envelope: &Envelope) -> Result<usize, TransportError> {
        match self.inner.config.delivery_mode {
            DeliveryMode::FanOut => self.broadcast(envelope).await,
            DeliveryMode::Failover => self.send_prioritized(envelope).await,
        }
    }

    /// Send on every open channel. Errors only when none accepted it.
    pub async fn broadcast(&self, envelope: &Envelope) -> Result<usize, TransportError> {
        self.inner.broadcast(envelope).await
    }

    /// Try open channels in priority order, stopping at the first success.
    pub async fn send_prioritized(&self, envelope: &Envelope) -> Result<usize, TransportError> {
        let inner = &self.inner;
        inner.remember(envelope).await;

        let mut tried: Vec<Arc<ChannelSlot>> = Vec::new();
        for round in 0..2 {
            if round == 1 {
                inner.ensure_fallback().await?;
            }
            for slot in inner.open_slots() {
                if tried.iter().any(|t| Arc::ptr_eq(t, &slot)) {
                    continue;
                }
                if inner.send_on(&slot, envelope).await.is_ok() {
                    return Ok(1);
                }
                tried.push(slot);
            }
        }

        Err(TransportError::SendFailed(format!(
            "{} channel(s) tried, none accepted",
            tried.len()
        )))
    }

    /// Receiver of deduplicated, non-presence envelopes from other peers.
    /// Can be taken once.
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<Envelope>> {
        self.inner
            .delivered_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    pub fn subscribe_peer_events(&self) -> broadcast::Receiver<PeerEvent> {
        self.inner.peer_events.subscribe()
    }

    pub async fn connected_peers(&self) -> HashSet<UserId> {
        self.inner.registry.lock().await.connected_peers()
    }

    pub async fn known_peers(&self) -> Vec<PeerRecord> {
        self.inner.registry.lock().await.snapshot()
    }

    pub fn channel_statuses(&self) -> Vec<(String, ChannelStatus)> {
        self.inner
            .slots
            .iter()
            .map(|slot| (slot.name().to_string(), slot.status()))
            .collect()
    }

    /// Broadcast a presence announcement now rather than on the next tick.
    pub async fn announce(&self) -> Result<usize, TransportError> {
        self.inner.announce().await
    }

    /// Stop background tasks and close every channel. Idempotent.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        inner.shutdown_tx.send_replace(true);

        let handles = std::mem::take(&mut *inner.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            handle.abort();
        }

        for slot in &inner.slots {
            if timeout(inner.config.operation_timeout, slot.channel.close())
                .await
                .is_err()
            {
                warn!(channel = %slot.name(), "Channel close timed out");
            }
            slot.set_status(ChannelStatus::Idle);
        }
        info!("Transport shut down");
    }
}

impl Inner {
    fn local(&self) -> Result<&LocalPresence, TransportError> {
        self.local
            .get()
            .ok_or_else(|| TransportError::ChannelUnavailable("transport not initialized".into()))
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
    }

    fn open_slots(&self) -> Vec<Arc<ChannelSlot>> {
        self.slots.iter().filter(|slot| slot.is_open()).cloned().collect()
    }

    fn slot_named(&self, name: &str) -> Option<Arc<ChannelSlot>> {
        self.slots.iter().find(|slot| slot.name() == name).cloned()
    }

    async fn remember(&self, envelope: &Envelope) {
        self.dedup
            .lock()
            .await
            .check_and_insert(envelope.id(), now_millis(), envelope.timestamp());
    }

    /// Open one channel under the operation timeout; a failed attempt is
    /// closed again so nothing half-open lingers.
    async fn open_slot(&self, slot: &ChannelSlot) -> Result<(), TransportError> {
        let local_id = self.local()?.identity.id;
        let limit = self.config.operation_timeout;

        let result = match timeout(limit, slot.channel.open(&local_id)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(limit)),
        };

        match result {
            Ok(()) => {
                slot.set_status(ChannelStatus::Open);
                info!(
                    channel = %slot.name(),
                    reach = ?slot.channel.reachability(),
                    "Channel open"
                );
                Ok(())
            }
            Err(e) => {
                let _ = timeout(limit, slot.channel.close()).await;
                slot.set_status(ChannelStatus::Idle);
                Err(e)
            }
        }
    }

    /// Make sure at least one channel is open, opening the fallback if
    /// every primary is down.
    async fn ensure_fallback(&self) -> Result<(), TransportError> {
        if self.slots.iter().any(|slot| !slot.is_fallback && slot.is_open()) {
            return Ok(());
        }
        let Some(fallback) = self.slots.iter().find(|slot| slot.is_fallback) else {
            return Err(TransportError::ChannelUnavailable(
                "no channel open and no fallback configured".into(),
            ));
        };
        if fallback.is_open() {
            return Ok(());
        }

        warn!(channel = %fallback.name(), "No primary channel open; falling back");
        fallback.channel.subscribe(self.inbound_tx.clone());
        self.open_slot(fallback).await
    }

    fn spawn_reconnect(self: &Arc<Self>, slot: Arc<ChannelSlot>) {
        if self.is_shutting_down() {
            return;
        }
        if slot.is_fallback {
            // Reopened on demand by `ensure_fallback`.
            slot.set_status(ChannelStatus::Idle);
            return;
        }
        if slot.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        slot.set_status(ChannelStatus::Reconnecting);

        let inner = Arc::clone(self);
        self.track(tokio::spawn(async move {
            let mut backoff = Backoff::new(inner.config.reconnect);
            let mut shutdown = inner.shutdown_tx.subscribe();

            loop {
                let Some(delay) = backoff.next_delay() else {
                    warn!(
                        channel = %slot.name(),
                        attempts = backoff.attempts(),
                        "Giving up on channel"
                    );
                    slot.set_status(ChannelStatus::Failed);
                    slot.reconnecting.store(false, Ordering::SeqCst);
                    if let Err(e) = inner.ensure_fallback().await {
                        error!(error = %e, "No delivery channel left");
                    }
                    return;
                };

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => {
                        slot.reconnecting.store(false, Ordering::SeqCst);
                        return;
                    }
                }

                match inner.open_slot(&slot).await {
                    Ok(()) => {
                        info!(channel = %slot.name(), attempt = backoff.attempts(), "Channel reconnected");
                        break;
                    }
                    Err(e) => {
                        slot.set_status(ChannelStatus::Reconnecting);
                        debug!(channel = %slot.name(), attempt = backoff.attempts(), error = %e, "Reconnect attempt failed");
                    }
                }
            }
            slot.reconnecting.store(false, Ordering::SeqCst);
        }));
    }

    async fn send_on(self: &Arc<Self>, slot: &Arc<ChannelSlot>, envelope: &Envelope) -> Result<(), TransportError> {
        let limit = self.config.operation_timeout;
        let result = match timeout(limit, slot.channel.send(envelope)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(limit)),
        };

        if let Err(e) = &result {
            warn!(
                channel = %slot.name(),
                envelope = %envelope.id().short(),
                error = %e,
                "Send failed; reconnecting channel"
            );
            slot.set_status(ChannelStatus::Idle);
            self.spawn_reconnect(Arc::clone(slot));
        }
        result
    }

    async fn broadcast(self: &Arc<Self>, envelope: &Envelope) -> Result<usize, TransportError> {
        self.remember(envelope).await;

        let mut targets = self.open_slots();
        if targets.is_empty() {
            self.ensure_fallback().await?;
            targets = self.open_slots();
        }
        if targets.is_empty() {
            return Err(TransportError::ChannelUnavailable("no open channel".into()));
        }

        let results = join_all(targets.iter().map(|slot| self.send_on(slot, envelope))).await;
        let delivered = results.iter().filter(|result| result.is_ok()).count();
        debug!(
            envelope = %envelope.id().short(),
            kind = envelope.kind().wire_name(),
            delivered,
            attempted = targets.len(),
            "Envelope broadcast"
        );

        if delivered == 0 {
            return Err(TransportError::SendFailed(format!(
                "all {} channel(s) failed",
                targets.len()
            )));
        }
        Ok(delivered)
    }

    async fn announce(self: &Arc<Self>) -> Result<usize, TransportError> {
        let local = self.local()?;
        let payload = PresencePayload::from_identity(&local.identity, now_millis());
        let mut envelope =
            Envelope::presence(&payload).map_err(|e| TransportError::Codec(e.to_string()))?;
        if let Some(signer) = &local.signer {
            envelope = envelope.signed(signer);
        }
        self.broadcast(&envelope).await
    }

    fn emit_peer_event(&self, event: Option<PeerEvent>) {
        if let Some(event) = event {
            info!(
                peer = %event.peer_id.short(),
                status = ?event.status,
                expired = event.expired,
                "Peer status changed"
            );
            let _ = self.peer_events.send(event);
        }
    }

    // -----------------------------------------------------------------------
    // Background tasks
    // -----------------------------------------------------------------------

    async fn run_inbound(self: Arc<Self>, mut rx: mpsc::Receiver<InboundEvent>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => self.handle_inbound(event).await,
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!("Inbound loop stopped");
    }

    async fn run_presence(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut ticker = interval(self.config.presence_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.announce().await {
                        debug!(error = %e, "Presence announcement not sent");
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    async fn run_expiry(self: Arc<Self>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut ticker = interval(self.config.expiry_sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = now_millis();
                    let expired = self.registry.lock().await.expire_stale(now, self.config.peer_ttl);
                    for event in expired {
                        self.emit_peer_event(Some(event));
                    }
                    self.dedup.lock().await.prune(now);
                }
                _ = shutdown.changed() => break,
            }
        }
    }

    // -----------------------------------------------------------------------
    // Inbound processing
    // -----------------------------------------------------------------------

    async fn handle_inbound(self: &Arc<Self>, inbound: InboundEvent) {
        let now = now_millis();
        let Ok(local) = self.local() else {
            return;
        };
        let local_id = local.identity.id;

        match inbound.event {
            ChannelEvent::Envelope(envelope) => {
                self.handle_envelope(&inbound.channel, envelope, &local_id, now)
                    .await
            }
            ChannelEvent::PeerConnected(peer_id) if peer_id != local_id => {
                let event = self.registry.lock().await.mark_connected(peer_id, now);
                self.emit_peer_event(event);
            }
            ChannelEvent::PeerDisconnected(peer_id) if peer_id != local_id => {
                let event = self.registry.lock().await.mark_disconnected(&peer_id);
                self.emit_peer_event(event);
            }
            ChannelEvent::PeerConnected(_) | ChannelEvent::PeerDisconnected(_) => {}
            ChannelEvent::Lost { reason } => {
                if let Some(slot) = self.slot_named(&inbound.channel) {
                    warn!(channel = %inbound.channel, reason = %reason, "Channel lost");
                    slot.set_status(ChannelStatus::Idle);
                    self.spawn_reconnect(slot);
                    if let Err(e) = self.ensure_fallback().await {
                        debug!(error = %e, "Fallback unavailable");
                    }
                }
            }
        }
    }

    async fn handle_envelope(&self, channel: &str, envelope: Envelope, local_id: &UserId, now: i64) {
        let first_sighting = self
            .dedup
            .lock()
            .await
            .check_and_insert(envelope.id(), now, envelope.timestamp());
        if !first_sighting {
            debug!(channel, envelope = %envelope.id().short(), "Dropping duplicate envelope");
            return;
        }
        if envelope.sender_id() == local_id {
            debug!(channel, envelope = %envelope.id().short(), "Dropping echo of own envelope");
            return;
        }

        match envelope.kind() {
            EnvelopeKind::PresenceAnnouncement => self.handle_presence(channel, &envelope, now).await,
            EnvelopeKind::DirectMessage | EnvelopeKind::GroupMessage => {
                self.registry.lock().await.touch(envelope.sender_id(), now);
                if self.delivered_tx.send(envelope).await.is_err() {
                    debug!(channel, "No consumer for inbound envelopes");
                }
            }
        }
    }

    /// Announcements stamped more than the peer TTL away from `now` are
    /// ignored.
    async fn handle_presence(&self, channel: &str, envelope: &Envelope, now: i64) {
        let payload = match PresencePayload::decode(envelope.content()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(channel, error = %e, "Malformed presence payload");
                return;
            }
        };
        if payload.timestamp != envelope.timestamp() {
            warn!(channel, sender = %envelope.sender_id().short(), "Presence timestamp does not match envelope");
            return;
        }
        let ttl_ms = i64::try_from(self.config.peer_ttl.as_millis()).unwrap_or(i64::MAX);
        let skew_ms = now.saturating_sub(payload.timestamp);
        if skew_ms.saturating_abs() > ttl_ms {
            debug!(channel, sender = %envelope.sender_id().short(), skew_ms, "Ignoring stale presence");
            return;
        }
        let identity = match payload.identity() {
            Ok(identity) => identity,
            Err(e) => {
                warn!(channel, sender = %envelope.sender_id().short(), error = %e, "Rejecting presence with invalid identity");
                return;
            }
        };

        if identity.id != *envelope.sender_id() {
            warn!(channel, sender = %envelope.sender_id().short(), "Presence sender does not match announced identity");
            return;
        }
        if let Some(signing_key) = identity.signing_public_key {
            if !envelope.verify_signature(&signing_key) {
                warn!(channel, sender = %identity.id.short(), "Presence signature missing or invalid");
                return;
            }
        }

        let event = self.registry.lock().await.record_announcement(identity, now);
        self.emit_peer_event(event);
    }
}
