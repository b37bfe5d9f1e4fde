//! TCP client for the relay hub.
//!
//! The hub fans every envelope out to all other connected clients and
//! reports joins and leaves, which become transport-level peer events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use murmur_shared::constants::PROTOCOL_VERSION;
use murmur_shared::protocol::Envelope;
use murmur_shared::types::UserId;

use crate::channel::{emit, ChannelEvent, DeliveryChannel, InboundSink, Reachability};
use crate::error::TransportError;
use crate::frame::{read_frame, write_frame, RelayFrame, DEFAULT_MAX_FRAME_SIZE};

struct Connection {
    writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
}

pub struct RelaySocketChannel {
    name: String,
    addr: String,
    max_frame_size: usize,
    sink: Mutex<Option<InboundSink>>,
    connection: tokio::sync::Mutex<Option<Connection>>,
    usable: Arc<AtomicBool>,
}

impl RelaySocketChannel {
    /// `addr` is a `host:port` string.
    pub fn new(addr: impl Into<String>) -> Self {
        let addr = addr.into();
        Self {
            name: format!("relay:{addr}"),
            addr,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            sink: Mutex::new(None),
            connection: tokio::sync::Mutex::new(None),
            usable: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl DeliveryChannel for RelaySocketChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn reachability(&self) -> Reachability {
        Reachability::Network
    }

    fn subscribe(&self, sink: InboundSink) {
        *self.sink.lock().unwrap_or_else(|e| e.into_inner()) = Some(sink);
    }

    async fn open(&self, local_id: &UserId) -> Result<(), TransportError> {
        let mut connection = self.connection.lock().await;
        if connection.is_some() && self.is_usable() {
            return Ok(());
        }
        if let Some(stale) = connection.take() {
            stale.reader.abort();
        }

        let sink = self
            .sink
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| TransportError::ChannelUnavailable("no subscriber registered".into()))?;

        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| TransportError::ChannelUnavailable(format!("{}: {e}", self.addr)))?;
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();

        write_frame(
            &mut writer,
            &RelayFrame::Hello {
                user_id: *local_id,
                protocol: PROTOCOL_VERSION.to_string(),
            },
        )
        .await?;

        let usable = Arc::clone(&self.usable);
        let name = self.name.clone();
        let max_frame_size = self.max_frame_size;

        // Set before the reader runs; only the reader may clear it afterwards.
        self.usable.store(true, Ordering::SeqCst);

        let reader_task = tokio::spawn(async move {
            let reason = loop {
                let frame = match read_frame(&mut reader, max_frame_size).await {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break "relay closed the connection".to_string(),
                    Err(e) => break e.to_string(),
                };

                let event = match frame {
                    RelayFrame::Envelope { json } => match Envelope::from_json(&json) {
                        Ok(envelope) => ChannelEvent::Envelope(envelope),
                        Err(e) => {
                            warn!(channel = %name, error = %e, "Dropping malformed envelope from relay");
                            continue;
                        }
                    },
                    RelayFrame::PeerJoined { user_id } => ChannelEvent::PeerConnected(user_id),
                    RelayFrame::PeerLeft { user_id } => ChannelEvent::PeerDisconnected(user_id),
                    RelayFrame::Error { reason } => break format!("relay error: {reason}"),
                    RelayFrame::Hello { .. } => {
                        debug!(channel = %name, "Ignoring unexpected hello from relay");
                        continue;
                    }
                };

                if !emit(&sink, &name, event).await {
                    return;
                }
            };

            usable.store(false, Ordering::SeqCst);
            warn!(channel = %name, reason = %reason, "Relay connection lost");
            emit(&sink, &name, ChannelEvent::Lost { reason }).await;
        });

        *connection = Some(Connection {
            writer,
            reader: reader_task,
        });
        info!(channel = %self.name, "Connected to relay");
        Ok(())
    }

    async fn close(&self) {
        self.usable.store(false, Ordering::SeqCst);
        if let Some(mut conn) = self.connection.lock().await.take() {
            conn.reader.abort();
            let _ = conn.writer.shutdown().await;
            debug!(channel = %self.name, "Relay connection closed");
        }
    }

    async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let json = envelope
            .to_json()
            .map_err(|e| TransportError::Codec(e.to_string()))?;

        let mut connection = self.connection.lock().await;
        let conn = connection
            .as_mut()
            .filter(|_| self.usable.load(Ordering::SeqCst))
            .ok_or_else(|| TransportError::ChannelUnavailable(format!("{} is not connected", self.name)))?;

        if let Err(e) = write_frame(&mut conn.writer, &RelayFrame::Envelope { json }).await {
            self.usable.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }

    fn is_usable(&self) -> bool {
        self.usable.load(Ordering::SeqCst)
    }
}
