//! TCP hub: clients register with a hello, then every envelope one client
//! sends is forwarded to all the others. The hub never decrypts anything.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use murmur_net::{read_frame, write_frame, RelayFrame};
use murmur_shared::constants::PROTOCOL_VERSION;
use murmur_shared::{Envelope, UserId};

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::rate_limit::RateLimiter;

struct Client {
    user_id: UserId,
    outbound: mpsc::Sender<Bytes>,
}

#[derive(Default)]
struct Counters {
    total_connections: AtomicU64,
    envelopes_forwarded: AtomicU64,
    frames_dropped: AtomicU64,
    rate_limited: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub connected_clients: usize,
    pub total_connections: u64,
    pub envelopes_forwarded: u64,
    pub frames_dropped: u64,
    pub rate_limited: u64,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
}

pub struct Hub {
    config: RelayConfig,
    limiter: RateLimiter,
    clients: RwLock<HashMap<u64, Client>>,
    next_conn: AtomicU64,
    counters: Counters,
    started_at: DateTime<Utc>,
}

impl Hub {
    pub fn new(config: RelayConfig, limiter: RateLimiter) -> Arc<Self> {
        Arc::new(Self {
            config,
            limiter,
            clients: RwLock::new(HashMap::new()),
            next_conn: AtomicU64::new(1),
            counters: Counters::default(),
            started_at: Utc::now(),
        })
    }

    /// Accept connections until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        info!(addr = %listener.local_addr()?, "Relay hub listening");
        loop {
            let (stream, addr) = listener.accept().await?;
            let hub = Arc::clone(&self);
            tokio::spawn(async move { hub.handle_connection(stream, addr).await });
        }
    }

    pub async fn stats(&self) -> HubStats {
        let now = Utc::now();
        HubStats {
            connected_clients: self.clients.read().await.len(),
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            envelopes_forwarded: self.counters.envelopes_forwarded.load(Ordering::Relaxed),
            frames_dropped: self.counters.frames_dropped.load(Ordering::Relaxed),
            rate_limited: self.counters.rate_limited.load(Ordering::Relaxed),
            started_at: self.started_at,
            uptime_secs: (now - self.started_at).num_seconds(),
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        self.counters.total_connections.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %addr, error = %e, "Failed to set TCP_NODELAY");
        }
        let (mut reader, mut writer) = stream.into_split();

        let registered = match self.handshake(&mut reader).await {
            Ok(user_id) => self.register(user_id).await.map(|(conn, rx)| (user_id, conn, rx)),
            Err(e) => Err(e),
        };
        let (user_id, conn_id, outbound) = match registered {
            Ok(registered) => registered,
            Err(e) => {
                warn!(peer = %addr, error = %e, "Client refused");
                if let Some(reason) = e.client_reason() {
                    let _ = write_frame(&mut writer, &RelayFrame::Error { reason }).await;
                }
                let _ = writer.shutdown().await;
                return;
            }
        };

        info!(peer = %addr, user = %user_id.short(), "Client registered");
        let writer_task = tokio::spawn(write_loop(writer, outbound));

        match self.read_loop(conn_id, user_id, addr.ip(), &mut reader).await {
            Ok(()) => debug!(user = %user_id.short(), "Client disconnected"),
            Err(e) => warn!(user = %user_id.short(), error = %e, "Client connection failed"),
        }

        self.unregister(conn_id, user_id).await;
        writer_task.abort();
    }

    async fn handshake(&self, reader: &mut OwnedReadHalf) -> Result<UserId, RelayError> {
        let frame = timeout(
            self.config.hello_timeout,
            read_frame(reader, self.config.max_frame_size),
        )
        .await
        .map_err(|_| RelayError::HelloTimeout(self.config.hello_timeout))??;

        match frame {
            Some(RelayFrame::Hello { user_id, protocol }) if protocol == PROTOCOL_VERSION => {
                Ok(user_id)
            }
            Some(RelayFrame::Hello { protocol, .. }) => Err(RelayError::Handshake(format!(
                "unsupported protocol {protocol}, expected {PROTOCOL_VERSION}"
            ))),
            Some(_) => Err(RelayError::Handshake("expected hello".into())),
            None => Err(RelayError::Handshake("closed before hello".into())),
        }
    }

    async fn register(&self, user_id: UserId) -> Result<(u64, mpsc::Receiver<Bytes>), RelayError> {
        let mut clients = self.clients.write().await;
        if self.config.max_clients > 0 && clients.len() >= self.config.max_clients {
            return Err(RelayError::Full(self.config.max_clients));
        }

        let (tx, rx) = mpsc::channel(self.config.client_queue.max(1));

        // Tell the newcomer who is already here, and everyone else about it.
        let mut present: Vec<UserId> = clients.values().map(|c| c.user_id).collect();
        present.sort_unstable_by_key(|id| id.0);
        present.dedup();
        for other in present.into_iter().filter(|id| *id != user_id) {
            enqueue(&tx, &RelayFrame::PeerJoined { user_id: other });
        }
        broadcast_locked(&clients, None, &RelayFrame::PeerJoined { user_id });

        let conn_id = self.next_conn.fetch_add(1, Ordering::Relaxed);
        clients.insert(
            conn_id,
            Client {
                user_id,
                outbound: tx,
            },
        );
        Ok((conn_id, rx))
    }

    async fn unregister(&self, conn_id: u64, user_id: UserId) {
        let mut clients = self.clients.write().await;
        clients.remove(&conn_id);
        if !clients.values().any(|c| c.user_id == user_id) {
            broadcast_locked(&clients, None, &RelayFrame::PeerLeft { user_id });
        }
    }

    async fn read_loop(
        &self,
        conn_id: u64,
        user_id: UserId,
        ip: IpAddr,
        reader: &mut OwnedReadHalf,
    ) -> Result<(), RelayError> {
        while let Some(frame) = read_frame(reader, self.config.max_frame_size).await? {
            let json = match frame {
                RelayFrame::Envelope { json } => json,
                other => {
                    debug!(user = %user_id.short(), frame = ?other, "Ignoring unexpected frame");
                    continue;
                }
            };

            if !self.limiter.check(ip).await {
                self.counters.rate_limited.fetch_add(1, Ordering::Relaxed);
                warn!(ip = %ip, user = %user_id.short(), "Envelope rate limit exceeded");
                continue;
            }

            match Envelope::from_json(&json) {
                Ok(envelope) if *envelope.sender_id() == user_id => {}
                Ok(envelope) => {
                    self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        user = %user_id.short(),
                        claimed = %envelope.sender_id().short(),
                        "Dropping envelope with foreign sender"
                    );
                    continue;
                }
                Err(e) => {
                    self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(user = %user_id.short(), error = %e, "Dropping malformed envelope");
                    continue;
                }
            }

            let clients = self.clients.read().await;
            let delivered = broadcast_locked(&clients, Some(conn_id), &RelayFrame::Envelope { json });
            self.counters.envelopes_forwarded.fetch_add(1, Ordering::Relaxed);
            debug!(user = %user_id.short(), delivered, "Envelope forwarded");
        }
        Ok(())
    }
}

/// Queue `frame` for every client except `skip`. Returns how many queues
/// accepted it; a full queue drops the frame for that client only.
fn broadcast_locked(clients: &HashMap<u64, Client>, skip: Option<u64>, frame: &RelayFrame) -> usize {
    let bytes = match frame.encode() {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "Failed to encode relay frame");
            return 0;
        }
    };

    clients
        .iter()
        .filter(|(id, _)| Some(**id) != skip)
        .filter(|(_, client)| client.outbound.try_send(bytes.clone()).is_ok())
        .count()
}

fn enqueue(tx: &mpsc::Sender<Bytes>, frame: &RelayFrame) {
    match frame.encode() {
        Ok(bytes) => {
            let _ = tx.try_send(bytes);
        }
        Err(e) => warn!(error = %e, "Failed to encode relay frame"),
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut outbound: mpsc::Receiver<Bytes>) {
    while let Some(bytes) = outbound.recv().await {
        if writer.write_all(&bytes).await.is_err() {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use murmur_net::{ChannelEvent, DeliveryChannel, InboundEvent, RelaySocketChannel};
    use murmur_shared::now_millis;

    use super::*;

    async fn start_hub(config: RelayConfig) -> (Arc<Hub>, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hub = Hub::new(config, RateLimiter::new(100.0, 100.0));
        tokio::spawn(Arc::clone(&hub).serve(listener));
        (hub, addr)
    }

    async fn connect(addr: SocketAddr, id: UserId) -> (RelaySocketChannel, mpsc::Receiver<InboundEvent>) {
        let channel = RelaySocketChannel::new(addr.to_string());
        let (tx, rx) = mpsc::channel(16);
        channel.subscribe(tx);
        channel.open(&id).await.unwrap();
        (channel, rx)
    }

    async fn next_event(rx: &mut mpsc::Receiver<InboundEvent>) -> ChannelEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no event in time")
            .expect("channel closed")
            .event
    }

    async fn raw_hello(addr: SocketAddr, protocol: &str) -> Option<RelayFrame> {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_frame(
            &mut stream,
            &RelayFrame::Hello {
                user_id: UserId([9; 32]),
                protocol: protocol.to_string(),
            },
        )
        .await
        .unwrap();
        read_frame(&mut stream, 4096).await.unwrap()
    }

    #[tokio::test]
    async fn test_envelope_forwarded_to_other_clients() {
        let (hub, addr) = start_hub(RelayConfig::default()).await;
        let alice_id = UserId([1; 32]);
        let bob_id = UserId([2; 32]);

        let (alice, mut alice_rx) = connect(addr, alice_id).await;
        let (_bob, mut bob_rx) = connect(addr, bob_id).await;

        assert!(matches!(next_event(&mut alice_rx).await, ChannelEvent::PeerConnected(id) if id == bob_id));
        assert!(matches!(next_event(&mut bob_rx).await, ChannelEvent::PeerConnected(id) if id == alice_id));

        let envelope = Envelope::direct(alice_id, bob_id, vec![5u8; 48], now_millis());
        alice.send(&envelope).await.unwrap();

        match next_event(&mut bob_rx).await {
            ChannelEvent::Envelope(received) => assert_eq!(received.id(), envelope.id()),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(tokio::time::timeout(Duration::from_millis(200), alice_rx.recv())
            .await
            .is_err());
        assert_eq!(hub.stats().await.envelopes_forwarded, 1);
    }

    #[tokio::test]
    async fn test_peer_left_on_close() {
        let (_hub, addr) = start_hub(RelayConfig::default()).await;
        let bob_id = UserId([2; 32]);

        let (_alice, mut alice_rx) = connect(addr, UserId([1; 32])).await;
        let (bob, _bob_rx) = connect(addr, bob_id).await;
        assert!(matches!(next_event(&mut alice_rx).await, ChannelEvent::PeerConnected(_)));

        bob.close().await;
        assert!(matches!(next_event(&mut alice_rx).await, ChannelEvent::PeerDisconnected(id) if id == bob_id));
    }

    #[tokio::test]
    async fn test_foreign_sender_dropped() {
        let (hub, addr) = start_hub(RelayConfig::default()).await;
        let alice_id = UserId([1; 32]);
        let bob_id = UserId([2; 32]);

        let (alice, mut alice_rx) = connect(addr, alice_id).await;
        let (_bob, mut bob_rx) = connect(addr, bob_id).await;
        next_event(&mut alice_rx).await;
        next_event(&mut bob_rx).await;

        let spoofed = Envelope::direct(UserId([3; 32]), bob_id, vec![5u8; 48], now_millis());
        alice.send(&spoofed).await.unwrap();

        assert!(tokio::time::timeout(Duration::from_millis(300), bob_rx.recv())
            .await
            .is_err());
        assert_eq!(hub.stats().await.frames_dropped, 1);
    }

    #[tokio::test]
    async fn test_full_hub_refuses() {
        let (_hub, addr) = start_hub(RelayConfig {
            max_clients: 1,
            ..RelayConfig::default()
        })
        .await;
        let (_alice, _alice_rx) = connect(addr, UserId([1; 32])).await;
        // Give the hub time to register the first client.
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(matches!(
            raw_hello(addr, PROTOCOL_VERSION).await,
            Some(RelayFrame::Error { reason }) if reason.contains("full")
        ));
    }

    #[tokio::test]
    async fn test_protocol_mismatch_refused() {
        let (hub, addr) = start_hub(RelayConfig::default()).await;

        assert!(matches!(
            raw_hello(addr, "/murmur/0.1.0").await,
            Some(RelayFrame::Error { reason }) if reason.contains("unsupported protocol")
        ));
        assert_eq!(hub.stats().await.connected_clients, 0);
    }
}
