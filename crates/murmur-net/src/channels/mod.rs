pub mod local_bus;
pub mod polling;
pub mod relay_socket;

pub use local_bus::{LocalBus, LocalBusChannel};
pub use polling::{MailboxEntry, MailboxStore, MemoryMailbox, PollingChannel};
pub use relay_socket::RelaySocketChannel;
