//! Function Watcher Library
//!
//! Tracks invocation outcomes of user-defined functions and decides, per
//! function, whether it may keep running.
//!
//! # Features
//!
//! - **Observation recorder**: lock-free per-period outcome buffer, flushed to a shared store
//! - **Ratings**: one reliability score per closed observation period
//! - **Trust states**: Healthy, Overflowed, temporarily and permanently disabled
//! - **Guarded store access**: bounded acquire, guaranteed release, slow-operation watchdog
//!
//! The decision logic ([`watcher::StateDeriver`]) is pure, so any number of
//! processes can evaluate the same function against the shared store and
//! agree on its state.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod clock;
pub mod config;
pub mod error;
pub mod store;
pub mod watcher;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
    };

    installed.map_err(|e| Error::Internal(format!("Failed to install tracing subscriber: {e}")))
}
