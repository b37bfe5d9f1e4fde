//! Transport tuning knobs.

use std::time::Duration;

use murmur_shared::constants::{
    CHANNEL_OPEN_TIMEOUT_SECS, DEDUP_CAPACITY, DEDUP_WINDOW_SECS, EXPIRY_SWEEP_SECS,
    PEER_TTL_SECS, PRESENCE_INTERVAL_SECS, RECONNECT_BASE_SECS, RECONNECT_CAP_SECS,
    RECONNECT_FACTOR, RECONNECT_MAX_ATTEMPTS,
};

use crate::error::TransportError;

/// How an outbound envelope is handed to the open channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// Send on every open channel; receivers deduplicate.
    #[default]
    FanOut,
    /// Try channels in priority order and stop at the first success.
    Failover,
}

/// Exponential reconnect schedule for a failed channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub factor: u32,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(RECONNECT_BASE_SECS),
            factor: RECONNECT_FACTOR,
            cap: Duration::from_secs(RECONNECT_CAP_SECS),
            max_attempts: RECONNECT_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Interval between presence announcements.
    pub presence_interval: Duration,
    /// A peer silent for longer than this is dropped from the registry.
    pub peer_ttl: Duration,
    /// How often the registry is swept for stale peers.
    pub expiry_sweep_interval: Duration,
    /// How long a received envelope id is remembered.
    pub dedup_window: Duration,
    /// Upper bound on remembered envelope ids.
    pub dedup_capacity: usize,
    /// Bound on every channel open and send.
    pub operation_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub delivery_mode: DeliveryMode,
    /// Capacity of the inbound and delivered-envelope queues.
    pub queue_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            presence_interval: Duration::from_secs(PRESENCE_INTERVAL_SECS),
            peer_ttl: Duration::from_secs(PEER_TTL_SECS),
            expiry_sweep_interval: Duration::from_secs(EXPIRY_SWEEP_SECS),
            dedup_window: Duration::from_secs(DEDUP_WINDOW_SECS),
            dedup_capacity: DEDUP_CAPACITY,
            operation_timeout: Duration::from_secs(CHANNEL_OPEN_TIMEOUT_SECS),
            reconnect: ReconnectPolicy::default(),
            delivery_mode: DeliveryMode::FanOut,
            queue_capacity: 1024,
        }
    }
}

impl TransportConfig {
    /// Reject settings under which live peers would flap offline.
    ///
    /// The TTL must cover at least three presence intervals so that a single
    /// lost announcement never expires a peer.
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.presence_interval.is_zero() {
            return Err(TransportError::Config(
                "presence interval must be non-zero".into(),
            ));
        }
        if self.peer_ttl < self.presence_interval * 3 {
            return Err(TransportError::Config(format!(
                "peer ttl {:?} must be at least three presence intervals ({:?})",
                self.peer_ttl,
                self.presence_interval * 3
            )));
        }
        if self.expiry_sweep_interval.is_zero() || self.operation_timeout.is_zero() {
            return Err(TransportError::Config(
                "sweep interval and operation timeout must be non-zero".into(),
            ));
        }
        if self.dedup_capacity == 0 || self.queue_capacity == 0 {
            return Err(TransportError::Config(
                "dedup capacity and queue capacity must be non-zero".into(),
            ));
        }
        if self.reconnect.factor == 0 {
            return Err(TransportError::Config("reconnect factor must be >= 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(TransportConfig::default().validate().is_ok());
    }

    #[test]
    fn test_ttl_must_cover_three_intervals() {
        let config = TransportConfig {
            presence_interval: Duration::from_secs(5),
            peer_ttl: Duration::from_secs(14),
            ..TransportConfig::default()
        };
        assert!(matches!(config.validate(), Err(TransportError::Config(_))));

        let config = TransportConfig {
            peer_ttl: Duration::from_secs(15),
            ..config
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_interval_rejected() {
        let config = TransportConfig {
            presence_interval: Duration::ZERO,
            ..TransportConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
