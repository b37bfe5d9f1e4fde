//! The contract every delivery channel implements.

use async_trait::async_trait;
use tokio::sync::mpsc;

use murmur_shared::protocol::Envelope;
use murmur_shared::types::UserId;

use crate::error::TransportError;

/// How far a channel reaches. Used only for logging and ordering decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reachability {
    SameProcess,
    SameDevice,
    Network,
}

/// What a channel reports back to the coordinator.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Envelope(Envelope),
    PeerConnected(UserId),
    PeerDisconnected(UserId),
    /// The channel dropped on its own and needs to be reopened.
    Lost { reason: String },
}

#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub channel: String,
    pub event: ChannelEvent,
}

pub type InboundSink = mpsc::Sender<InboundEvent>;

/// A way of moving envelopes between peers.
///
/// `open` and `close` are idempotent. Events flow into the sink registered
/// through `subscribe`, which the coordinator does before opening.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    fn name(&self) -> &str;

    fn reachability(&self) -> Reachability;

    fn subscribe(&self, sink: InboundSink);

    async fn open(&self, local_id: &UserId) -> Result<(), TransportError>;

    async fn close(&self);

    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError>;

    /// Whether the channel currently believes it can send.
    fn is_usable(&self) -> bool;
}

/// Forward an event to the coordinator; a closed sink means shutdown.
pub(crate) async fn emit(sink: &InboundSink, channel: &str, event: ChannelEvent) -> bool {
    sink.send(InboundEvent {
        channel: channel.to_string(),
        event,
    })
    .await
    .is_ok()
}
