//! Client configuration loaded from environment variables.
//!
//! Every setting has a default so a session can start with zero
//! configuration: in that case it only talks over the in-process bus.

use std::path::PathBuf;
use std::time::Duration;

use murmur_net::{DeliveryMode, TransportConfig};
use murmur_shared::constants::{FRESHNESS_WINDOW_SECS, PEER_TTL_SECS, PRESENCE_INTERVAL_SECS};
use murmur_shared::kdf::KdfParams;

/// Acceptance rules applied by the router to inbound envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterPolicy {
    /// Maximum accepted distance between an envelope timestamp and local time.
    pub freshness_window: Duration,
    pub enforce_freshness: bool,
    /// Reject envelopes that carry no signature.
    pub require_signatures: bool,
}

impl Default for RouterPolicy {
    fn default() -> Self {
        Self {
            freshness_window: Duration::from_secs(FRESHNESS_WINDOW_SECS),
            enforce_freshness: true,
            require_signatures: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Display name announced in presence.
    /// Env: `MURMUR_USERNAME`
    /// Default: `"anonymous"`
    pub username: String,

    /// `host:port` of a relay hub. No relay channel when unset.
    /// Env: `MURMUR_RELAY_ADDR`
    pub relay_addr: Option<String>,

    /// SQLite file shared with other processes on this device. No polling
    /// channel when unset.
    /// Env: `MURMUR_MAILBOX_PATH`
    pub mailbox_path: Option<PathBuf>,

    pub mailbox_poll_interval: Duration,

    /// Mailbox entries older than this are pruned on every poll.
    pub mailbox_retention: Duration,

    /// Local database. The platform data directory is used when unset.
    /// Env: `MURMUR_DB_PATH`
    pub db_path: Option<PathBuf>,

    /// Env: `MURMUR_PRESENCE_INTERVAL_SECS`
    pub presence_interval: Duration,

    /// Env: `MURMUR_PEER_TTL_SECS`
    pub peer_ttl: Duration,

    /// Env: `MURMUR_DELIVERY_MODE` (`fanout` / `failover`)
    pub delivery_mode: DeliveryMode,

    /// Env: `MURMUR_FRESHNESS_WINDOW_SECS`, `MURMUR_ENFORCE_FRESHNESS`,
    /// `MURMUR_REQUIRE_SIGNATURES`
    pub router: RouterPolicy,

    pub kdf: KdfParams,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            username: "anonymous".to_string(),
            relay_addr: None,
            mailbox_path: None,
            mailbox_poll_interval: Duration::from_secs(2),
            mailbox_retention: Duration::from_secs(24 * 60 * 60),
            db_path: None,
            presence_interval: Duration::from_secs(PRESENCE_INTERVAL_SECS),
            peer_ttl: Duration::from_secs(PEER_TTL_SECS),
            delivery_mode: DeliveryMode::default(),
            router: RouterPolicy::default(),
            kdf: KdfParams::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`ClientConfig::from_env`] with an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(name) = lookup("MURMUR_USERNAME") {
            if !name.trim().is_empty() {
                config.username = name.trim().to_string();
            }
        }

        if let Some(addr) = lookup("MURMUR_RELAY_ADDR") {
            if !addr.is_empty() {
                config.relay_addr = Some(addr);
            }
        }

        if let Some(path) = lookup("MURMUR_MAILBOX_PATH") {
            if !path.is_empty() {
                config.mailbox_path = Some(PathBuf::from(path));
            }
        }

        if let Some(path) = lookup("MURMUR_DB_PATH") {
            if !path.is_empty() {
                config.db_path = Some(PathBuf::from(path));
            }
        }

        if let Some(secs) = parse_secs(&lookup, "MURMUR_PRESENCE_INTERVAL_SECS") {
            config.presence_interval = secs;
        }

        if let Some(secs) = parse_secs(&lookup, "MURMUR_PEER_TTL_SECS") {
            config.peer_ttl = secs;
        }

        if let Some(val) = lookup("MURMUR_DELIVERY_MODE") {
            match val.to_ascii_lowercase().as_str() {
                "fanout" | "fan-out" => config.delivery_mode = DeliveryMode::FanOut,
                "failover" => config.delivery_mode = DeliveryMode::Failover,
                _ => tracing::warn!(value = %val, "Invalid MURMUR_DELIVERY_MODE, using default"),
            }
        }

        if let Some(secs) = parse_secs(&lookup, "MURMUR_FRESHNESS_WINDOW_SECS") {
            config.router.freshness_window = secs;
        }

        if let Some(val) = lookup("MURMUR_ENFORCE_FRESHNESS") {
            config.router.enforce_freshness = val != "false" && val != "0";
        }

        if let Some(val) = lookup("MURMUR_REQUIRE_SIGNATURES") {
            config.router.require_signatures = val == "true" || val == "1";
        }

        config
    }

    /// The dedup window never ends before the router stops accepting an
    /// envelope as fresh.
    pub fn to_transport_config(&self) -> TransportConfig {
        let defaults = TransportConfig::default();
        TransportConfig {
            presence_interval: self.presence_interval,
            peer_ttl: self.peer_ttl,
            delivery_mode: self.delivery_mode,
            dedup_window: defaults.dedup_window.max(self.router.freshness_window),
            ..defaults
        }
    }
}

fn parse_secs<F>(lookup: &F, key: &str) -> Option<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Some(Duration::from_secs(secs)),
        _ => {
            tracing::warn!(key, value = %raw, "Invalid duration, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::from_lookup(|_| None);
        assert_eq!(config.username, "anonymous");
        assert!(config.relay_addr.is_none());
        assert_eq!(config.router.freshness_window, Duration::from_secs(300));
        assert!(config.router.enforce_freshness);
        assert!(!config.router.require_signatures);
        assert!(config.to_transport_config().validate().is_ok());
    }

    #[test]
    fn test_overrides() {
        let config = ClientConfig::from_lookup(lookup_from(&[
            ("MURMUR_USERNAME", "alice"),
            ("MURMUR_RELAY_ADDR", "127.0.0.1:4040"),
            ("MURMUR_PRESENCE_INTERVAL_SECS", "2"),
            ("MURMUR_PEER_TTL_SECS", "10"),
            ("MURMUR_DELIVERY_MODE", "failover"),
            ("MURMUR_ENFORCE_FRESHNESS", "false"),
            ("MURMUR_REQUIRE_SIGNATURES", "1"),
        ]));

        assert_eq!(config.username, "alice");
        assert_eq!(config.relay_addr.as_deref(), Some("127.0.0.1:4040"));

        let transport = config.to_transport_config();
        assert_eq!(transport.presence_interval, Duration::from_secs(2));
        assert_eq!(transport.peer_ttl, Duration::from_secs(10));
        assert_eq!(transport.delivery_mode, DeliveryMode::Failover);
        assert!(!config.router.enforce_freshness);
        assert!(config.router.require_signatures);
    }

    #[test]
    fn test_dedup_window_covers_freshness_window() {
        let config = ClientConfig::from_lookup(lookup_from(&[(
            "MURMUR_FRESHNESS_WINDOW_SECS",
            "900",
        )]));
        assert_eq!(
            config.to_transport_config().dedup_window,
            Duration::from_secs(900)
        );

        let config = ClientConfig::from_lookup(lookup_from(&[(
            "MURMUR_FRESHNESS_WINDOW_SECS",
            "10",
        )]));
        assert_eq!(
            config.to_transport_config().dedup_window,
            TransportConfig::default().dedup_window
        );
    }

    #[test]
    fn test_invalid_values_ignored() {
        let config = ClientConfig::from_lookup(lookup_from(&[
            ("MURMUR_PEER_TTL_SECS", "soon"),
            ("MURMUR_FRESHNESS_WINDOW_SECS", "0"),
            ("MURMUR_DELIVERY_MODE", "carrier-pigeon"),
        ]));

        assert_eq!(config.peer_ttl, Duration::from_secs(PEER_TTL_SECS));
        assert_eq!(config.router.freshness_window, Duration::from_secs(FRESHNESS_WINDOW_SECS));
        assert_eq!(config.delivery_mode, DeliveryMode::FanOut);
    }
}
