//! # murmur-relay
//!
//! Relay hub for Murmur clients that cannot reach each other directly.
//!
//! This binary provides:
//! - **TCP hub** forwarding opaque envelopes between registered clients and
//!   announcing joins and departures
//! - **Per-IP rate limiting** on envelopes and HTTP requests
//! - **Status API** (axum) with `/health` and `/stats`

mod api;
mod config;
mod error;
mod hub;
mod rate_limit;

use std::time::Duration;

use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::RelayConfig;
use crate::hub::Hub;
use crate::rate_limit::RateLimiter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,murmur_relay=debug")),
        )
        .init();

    info!("Starting Murmur relay v{}", env!("CARGO_PKG_VERSION"));

    let config = RelayConfig::from_env();
    info!(?config, "Loaded configuration");

    let envelope_limiter = RateLimiter::new(config.rate_per_sec, config.rate_burst);
    let http_limiter = RateLimiter::new(10.0, 30.0);

    // Evict buckets idle for more than 10 minutes, every 5 minutes.
    for limiter in [envelope_limiter.clone(), http_limiter.clone()] {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(300));
            loop {
                interval.tick().await;
                limiter.purge_stale(Duration::from_secs(600)).await;
            }
        });
    }

    let listener = TcpListener::bind(config.listen_addr).await?;
    let http_addr = config.http_addr;
    let hub = Hub::new(config, envelope_limiter);

    let app_state = AppState {
        hub: hub.clone(),
        rate_limiter: http_limiter,
    };

    tokio::select! {
        result = hub.serve(listener) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Relay hub failed");
                return Err(e.into());
            }
        }
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
