//! Subscriber setup for applications embedding a pipeline.
//!
//! The library itself only emits `tracing` events. Applications that do not
//! configure a subscriber of their own can call [`init`] once at startup.

use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt};

/// Filter used when `RUST_LOG` is not set.
pub const DEFAULT_FILTER: &str = "info,nagare=debug";

/// Installs a global fmt subscriber filtered by `RUST_LOG`, falling back to
/// [`DEFAULT_FILTER`]. Fails if a global subscriber is already set.
pub fn init() -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)))
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .try_init()
}
