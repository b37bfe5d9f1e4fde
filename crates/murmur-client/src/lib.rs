//! # murmur-client
//!
//! Client side of Murmur: the [`MessageRouter`] that turns envelopes into
//! messages and back, subscriber registries, environment configuration and
//! the [`Session`] that wires a store and the transport together.

pub mod config;
pub mod error;
pub mod events;
pub mod router;
pub mod session;

pub use config::{ClientConfig, RouterPolicy};
pub use error::{Rejection, RoutingError, SessionError};
pub use events::{Subscribers, SubscriptionHandle};
pub use router::MessageRouter;
pub use session::{ChannelReport, Session, SessionStatus};

use tracing_subscriber::{fmt, EnvFilter};

/// Install the global tracing subscriber. `RUST_LOG` overrides the default
/// filter. Does nothing if a subscriber is already installed.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("murmur_client=debug,murmur_net=debug,murmur_store=info,warn")
    });

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}
