//! Wires one identity's store, channels, transport and router together.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use murmur_net::{
    ChannelStatus, DeliveryChannel, LocalBus, LocalBusChannel, LocalPresence, PollingChannel,
    RelaySocketChannel, TransportCoordinator, TransportError,
};
use murmur_shared::constants::EPHEMERAL_SWEEP_SECS;
use murmur_shared::{KeyMaterial, PeerIdentity, Persistence};
use murmur_store::{SqliteMailbox, SqliteStore};

use crate::config::ClientConfig;
use crate::error::SessionError;
use crate::router::MessageRouter;

/// Serializable snapshot for a UI layer.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub user_id: String,
    pub username: String,
    pub channels: Vec<ChannelReport>,
    pub connected_peers: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelReport {
    pub name: String,
    pub status: String,
}

pub struct Session {
    router: Arc<MessageRouter>,
    transport: TransportCoordinator,
    tasks: Vec<JoinHandle<()>>,
}

impl Session {
    /// Open the on-disk store (creating the identity on first run) and start.
    pub async fn open(config: ClientConfig, password: &[u8]) -> Result<Self, SessionError> {
        let store = match &config.db_path {
            Some(path) => SqliteStore::open(path, password, config.kdf).await?,
            None => SqliteStore::open_default(password, config.kdf).await?,
        };
        Self::start(config, Arc::new(store), LocalBus::default()).await
    }

    /// Start a session over an existing store. `bus` is the same-process
    /// fallback; sessions sharing a bus reach each other without a relay.
    pub async fn start(
        config: ClientConfig,
        store: Arc<dyn Persistence>,
        bus: LocalBus,
    ) -> Result<Self, SessionError> {
        let (identity, keys) = ensure_identity(store.as_ref(), &config.username).await?;
        info!(user = %identity.id.short(), username = %identity.username, "Starting session");

        let mut channels: Vec<Arc<dyn DeliveryChannel>> = Vec::new();
        if let Some(addr) = &config.relay_addr {
            channels.push(Arc::new(RelaySocketChannel::new(addr.clone())));
        }
        if let Some(path) = &config.mailbox_path {
            let mailbox = Arc::new(SqliteMailbox::open(path)?);
            channels.push(Arc::new(
                PollingChannel::new(mailbox, config.mailbox_poll_interval, config.mailbox_retention)
                    .with_replay_window(config.router.freshness_window)
                    .with_name(format!("mailbox:{}", path.display())),
            ));
        }
        let fallback: Arc<dyn DeliveryChannel> = Arc::new(LocalBusChannel::new(bus));

        let transport =
            TransportCoordinator::new(config.to_transport_config(), channels, Some(fallback));
        let inbound = transport
            .take_inbound()
            .ok_or_else(|| TransportError::Config("inbound queue already taken".into()))?;
        let peer_events = transport.subscribe_peer_events();

        let router = Arc::new(MessageRouter::new(
            identity.clone(),
            keys.clone(),
            store,
            transport.clone(),
            config.router,
        ));

        transport
            .initialize(LocalPresence {
                identity,
                signer: keys.signing().cloned(),
            })
            .await?;

        let tasks = vec![
            tokio::spawn(Arc::clone(&router).run(inbound)),
            tokio::spawn(Arc::clone(&router).run_peer_events(peer_events)),
            tokio::spawn(sweep_loop(
                Arc::clone(&router),
                Duration::from_secs(EPHEMERAL_SWEEP_SECS),
            )),
        ];

        Ok(Self {
            router,
            transport,
            tasks,
        })
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn identity(&self) -> &PeerIdentity {
        self.router.identity()
    }

    pub fn transport(&self) -> &TransportCoordinator {
        &self.transport
    }

    pub async fn status(&self) -> SessionStatus {
        let identity = self.identity();
        SessionStatus {
            user_id: identity.id.to_hex(),
            username: identity.username.clone(),
            channels: self
                .transport
                .channel_statuses()
                .into_iter()
                .map(|(name, status)| ChannelReport {
                    name,
                    status: status_label(status).to_string(),
                })
                .collect(),
            connected_peers: self.transport.connected_peers().await.len(),
        }
    }

    pub async fn shutdown(mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.transport.shutdown().await;
        info!(user = %self.identity().id.short(), "Session closed");
    }
}

fn status_label(status: ChannelStatus) -> &'static str {
    match status {
        ChannelStatus::Idle => "idle",
        ChannelStatus::Open => "open",
        ChannelStatus::Reconnecting => "reconnecting",
        ChannelStatus::Failed => "failed",
    }
}

/// Load the stored identity, or generate and save one on first run.
async fn ensure_identity(
    store: &dyn Persistence,
    username: &str,
) -> Result<(PeerIdentity, KeyMaterial), SessionError> {
    let existing = store.get_key_pair().await.unwrap_or_else(|e| {
        warn!(error = %e, "Failed to read key material");
        None
    });

    let keys = match existing {
        Some(keys) => keys,
        None => {
            let keys = KeyMaterial::generate();
            store.save_key_pair(&keys).await?;
            info!(user = %keys.user_id().short(), "Generated new identity");
            keys
        }
    };

    let identity = keys.to_identity(username);
    let stored = store.get_current_user().await.unwrap_or(None);
    if stored.as_ref() != Some(&identity) {
        store.save_current_user(&identity).await?;
    }
    Ok((identity, keys))
}

async fn sweep_loop(router: Arc<MessageRouter>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if let Err(e) = router.sweep_expired().await {
            warn!(error = %e, "Ephemeral sweep failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use murmur_store::MemoryStore;

    use super::*;

    #[tokio::test]
    async fn test_identity_created_once() {
        let store = Arc::new(MemoryStore::new());

        let (first, _) = ensure_identity(store.as_ref(), "alice").await.unwrap();
        let (second, _) = ensure_identity(store.as_ref(), "alice").await.unwrap();
        assert_eq!(first, second);

        let (renamed, _) = ensure_identity(store.as_ref(), "alice2").await.unwrap();
        assert_eq!(renamed.id, first.id);
        assert_eq!(store.get_current_user().await.unwrap().unwrap().username, "alice2");
    }

    #[tokio::test]
    async fn test_start_on_local_bus_only() {
        let store = Arc::new(MemoryStore::new());
        let session = Session::start(ClientConfig::default(), store, LocalBus::default())
            .await
            .unwrap();

        let status = session.status().await;
        assert_eq!(status.username, "anonymous");
        assert_eq!(status.channels.len(), 1);
        assert_eq!(status.channels[0].status, "open");

        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_open_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClientConfig {
            db_path: Some(dir.path().join("murmur.db")),
            kdf: murmur_shared::kdf::KdfParams {
                ops_cost: 1,
                mem_cost: 256,
                parallelism: 1,
            },
            ..ClientConfig::default()
        };

        let session = Session::open(config.clone(), b"pw").await.unwrap();
        let id = session.identity().id;
        session.shutdown().await;

        let reopened = Session::open(config, b"pw").await.unwrap();
        assert_eq!(reopened.identity().id, id);
        reopened.shutdown().await;
    }
}
