//! Logging initialization.
//!
//! Every gateway thread is named (`worker-N`, `health`, `metrics`), so
//! the subscriber is set up to carry the thread name on each event when
//! configured; that is usually the fastest way to tell which worker loop
//! a connection problem belongs to.

use crate::config::{LogFormat, LoggingConfig};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the tracing subscriber. An explicit `RUST_LOG` wins over
/// the configured level.
pub fn init(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let registry = tracing_subscriber::registry().with(filter);

    match config.format {
        LogFormat::Json => registry
            .with(
                fmt::layer()
                    .json()
                    .with_thread_names(config.thread_names),
            )
            .init(),
        LogFormat::Compact => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_thread_names(config.thread_names),
            )
            .init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().with_thread_names(config.thread_names))
            .init(),
    }
}
