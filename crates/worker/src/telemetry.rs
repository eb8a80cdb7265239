//! Tracing setup for the worker process

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::{LogFormat, WorkerConfig};

/// Build the log filter: `RUST_LOG` wins, then the configured level
pub fn log_filter(config: &WorkerConfig) -> EnvFilter {
    std::env::var("RUST_LOG")
        .ok()
        .and_then(|f| EnvFilter::try_new(f).ok())
        .or_else(|| EnvFilter::try_new(&config.log_level).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// Install the global subscriber
///
/// Call once, before anything logs.
pub fn init_tracing(config: &WorkerConfig) {
    let filter = log_filter(config);

    let fmt_layer = match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_filter(filter)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(filter)
            .boxed(),
    };

    tracing_subscriber::registry().with(fmt_layer).init();

    tracing::debug!(
        environment = %config.environment,
        format = ?config.log_format,
        "tracing initialized"
    );
}
