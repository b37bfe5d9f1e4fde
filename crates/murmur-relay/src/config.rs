//! Relay configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the relay can start with zero
//! configuration for local development.

use std::net::SocketAddr;
use std::time::Duration;

use murmur_net::DEFAULT_MAX_FRAME_SIZE;
use murmur_shared::constants::{DEFAULT_HTTP_PORT, DEFAULT_RELAY_PORT};

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// TCP address clients connect to.
    /// Env: `LISTEN_ADDR`
    /// Default: `0.0.0.0:4040`
    pub listen_addr: SocketAddr,

    /// Socket address for the HTTP (axum) status API.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// Maximum number of concurrently registered clients (0 = unlimited).
    /// Env: `MAX_CLIENTS`
    /// Default: `1024`
    pub max_clients: usize,

    /// Largest accepted frame in bytes, length prefix excluded.
    /// Env: `MAX_FRAME_SIZE`
    pub max_frame_size: usize,

    /// Sustained envelopes per second allowed from one IP.
    /// Env: `RATE_LIMIT_PER_SEC`
    /// Default: `20`
    pub rate_per_sec: f64,

    /// Burst size of the per-IP token bucket.
    /// Env: `RATE_LIMIT_BURST`
    /// Default: `60`
    pub rate_burst: f64,

    /// A client must send its hello within this time.
    pub hello_timeout: Duration,

    /// Outbound frames queued per client before new ones are dropped.
    pub client_queue: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: ([0, 0, 0, 0], DEFAULT_RELAY_PORT).into(),
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            max_clients: 1024,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            rate_per_sec: 20.0,
            rate_burst: 60.0,
            hello_timeout: Duration::from_secs(10),
            client_queue: 256,
        }
    }
}

impl RelayConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup("LISTEN_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.listen_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Invalid LISTEN_ADDR, using default"),
            }
        }

        if let Some(addr) = lookup("HTTP_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.http_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default"),
            }
        }

        if let Some(val) = lookup("MAX_CLIENTS") {
            match val.parse::<usize>() {
                Ok(n) => config.max_clients = n,
                Err(_) => tracing::warn!(value = %val, "Invalid MAX_CLIENTS, using default"),
            }
        }

        if let Some(val) = lookup("MAX_FRAME_SIZE") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.max_frame_size = n,
                _ => tracing::warn!(value = %val, "Invalid MAX_FRAME_SIZE, using default"),
            }
        }

        if let Some(val) = lookup("RATE_LIMIT_PER_SEC") {
            match val.parse::<f64>() {
                Ok(n) if n > 0.0 => config.rate_per_sec = n,
                _ => tracing::warn!(value = %val, "Invalid RATE_LIMIT_PER_SEC, using default"),
            }
        }

        if let Some(val) = lookup("RATE_LIMIT_BURST") {
            match val.parse::<f64>() {
                Ok(n) if n >= 1.0 => config.rate_burst = n,
                _ => tracing::warn!(value = %val, "Invalid RATE_LIMIT_BURST, using default"),
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter.

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.listen_addr.port(), DEFAULT_RELAY_PORT);
        assert_eq!(config.http_addr, ([0, 0, 0, 0], 8080).into());
        assert_eq!(config.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
    }

    #[test]
    fn test_env_overrides_and_invalid_values() {
        let config = RelayConfig::from_lookup(|key| match key {
            "LISTEN_ADDR" => Some("127.0.0.1:5050".to_string()),
            "HTTP_ADDR" => Some("not an address".to_string()),
            "MAX_CLIENTS" => Some("8".to_string()),
            "MAX_FRAME_SIZE" => Some("0".to_string()),
            _ => None,
        });

        assert_eq!(config.listen_addr, "127.0.0.1:5050".parse().unwrap());
        assert_eq!(config.http_addr.port(), DEFAULT_HTTP_PORT);
        assert_eq!(config.max_clients, 8);
        assert_eq!(config.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
    }
}
