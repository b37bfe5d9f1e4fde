//! In-process broadcast bus. Every coordinator attached to the same
//! [`LocalBus`] sees every envelope sent on it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use murmur_shared::protocol::Envelope;
use murmur_shared::types::UserId;

use crate::channel::{emit, ChannelEvent, DeliveryChannel, InboundSink, Reachability};
use crate::error::TransportError;

static NEXT_ENDPOINT: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
struct BusFrame {
    origin: u64,
    envelope: Envelope,
}

/// Shared medium. Clone it to hand the same bus to several channels.
#[derive(Debug, Clone)]
pub struct LocalBus {
    tx: broadcast::Sender<Arc<BusFrame>>,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(256)
    }
}

pub struct LocalBusChannel {
    name: String,
    bus: LocalBus,
    endpoint: u64,
    sink: Mutex<Option<InboundSink>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    open: AtomicBool,
}

impl LocalBusChannel {
    pub fn new(bus: LocalBus) -> Self {
        Self {
            name: "local-bus".to_string(),
            bus,
            endpoint: NEXT_ENDPOINT.fetch_add(1, Ordering::Relaxed),
            sink: Mutex::new(None),
            listener: Mutex::new(None),
            open: AtomicBool::new(false),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

#[async_trait]
impl DeliveryChannel for LocalBusChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn reachability(&self) -> Reachability {
        Reachability::SameProcess
    }

    fn subscribe(&self, sink: InboundSink) {
        *self.sink.lock().unwrap_or_else(|e| e.into_inner()) = Some(sink);
    }

    async fn open(&self, _local_id: &UserId) -> Result<(), TransportError> {
        let mut listener = self.listener.lock().unwrap_or_else(|e| e.into_inner());
        if listener.is_some() {
            return Ok(());
        }
        let sink = self
            .sink
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| TransportError::ChannelUnavailable("no subscriber registered".into()))?;

        let mut rx = self.bus.tx.subscribe();
        let endpoint = self.endpoint;
        let name = self.name.clone();

        *listener = Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(frame) if frame.origin == endpoint => {}
                    Ok(frame) => {
                        let event = ChannelEvent::Envelope(frame.envelope.clone());
                        if !emit(&sink, &name, event).await {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(channel = %name, skipped, "Local bus listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!(channel = %name, "Local bus listener stopped");
        }));
        self.open.store(true, Ordering::SeqCst);
        debug!(channel = %self.name, endpoint, "Local bus opened");
        Ok(())
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        if let Some(handle) = self.listener.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }

    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        if !self.is_usable() {
            return Err(TransportError::ChannelUnavailable(format!("{} is closed", self.name)));
        }
        let frame = Arc::new(BusFrame {
            origin: self.endpoint,
            envelope: envelope.clone(),
        });
        self.bus
            .tx
            .send(frame)
            .map(|_| ())
            .map_err(|_| TransportError::SendFailed("no listeners on local bus".into()))
    }

    fn is_usable(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Drop for LocalBusChannel {
    fn drop(&mut self) {
        if let Some(handle) = self.listener.get_mut().ok().and_then(Option::take) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn envelope(n: u8) -> Envelope {
        Envelope::direct(UserId([n; 32]), UserId([0; 32]), vec![n; 48], 1_000)
    }

    #[tokio::test]
    async fn test_delivers_to_other_endpoints_only() {
        let bus = LocalBus::new(16);
        let a = LocalBusChannel::new(bus.clone());
        let b = LocalBusChannel::new(bus);

        let (a_tx, mut a_rx) = mpsc::channel(8);
        let (b_tx, mut b_rx) = mpsc::channel(8);
        a.subscribe(a_tx);
        b.subscribe(b_tx);
        a.open(&UserId([1; 32])).await.unwrap();
        b.open(&UserId([2; 32])).await.unwrap();

        a.send(&envelope(1)).await.unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), b_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(received.event, ChannelEvent::Envelope(e) if e == envelope(1)));
        assert!(tokio::time::timeout(Duration::from_millis(50), a_rx.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_send_when_closed_fails() {
        let channel = LocalBusChannel::new(LocalBus::default());
        assert!(matches!(
            channel.send(&envelope(1)).await,
            Err(TransportError::ChannelUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_open_requires_subscriber_and_is_idempotent() {
        let channel = LocalBusChannel::new(LocalBus::default());
        assert!(channel.open(&UserId([1; 32])).await.is_err());

        let (tx, _rx) = mpsc::channel(1);
        channel.subscribe(tx);
        channel.open(&UserId([1; 32])).await.unwrap();
        channel.open(&UserId([1; 32])).await.unwrap();
        assert!(channel.is_usable());

        channel.close().await;
        channel.close().await;
        assert!(!channel.is_usable());
    }
}
