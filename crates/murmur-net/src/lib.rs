// Multi-channel envelope transport: peer liveness, deduplication and
// failover across pluggable delivery channels.

pub mod backoff;
pub mod channel;
pub mod channels;
pub mod config;
pub mod coordinator;
pub mod dedup;
pub mod error;
pub mod frame;
pub mod peers;

pub use channel::{ChannelEvent, DeliveryChannel, InboundEvent, InboundSink, Reachability};
pub use channels::{
    LocalBus, LocalBusChannel, MailboxEntry, MailboxStore, MemoryMailbox, PollingChannel,
    RelaySocketChannel,
};
pub use config::{DeliveryMode, ReconnectPolicy, TransportConfig};
pub use coordinator::{ChannelStatus, LocalPresence, TransportCoordinator};
pub use error::TransportError;
pub use frame::{read_frame, write_frame, RelayFrame, DEFAULT_MAX_FRAME_SIZE};
pub use peers::{PeerEvent, PeerRecord, PeerRegistry, PeerState, PeerStatus};
