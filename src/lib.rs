//! Trading simulator guard library
//!
//! In-process building blocks the trading simulator backend puts in front
//! of its upstream calls and HTTP routes.
//!
//! # Features
//!
//! - **TTL cache**: per-entry expiry, bounded capacity with FIFO eviction,
//!   single-flight `get_or_set`
//! - **Rate limiting**: fixed windows per (client, endpoint)
//! - **Abuse guard**: suspicious-activity log escalating to temporary
//!   global blocks
//! - **HTTP admission**: axum middleware mapping rejections to 429/403

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod feed;
pub mod security;
pub mod server;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber
                .with(fmt::layer().json())
                .try_init()
                .map_err(|e| Error::Internal(e.to_string()))?;
        }
        _ => {
            subscriber
                .with(fmt::layer())
                .try_init()
                .map_err(|e| Error::Internal(e.to_string()))?;
        }
    }

    Ok(())
}
