//! Tracing setup for the relay binary.
//!
//! The filter comes from `NUT_RELAY_LOG`, then `RUST_LOG`, then the default
//! level for the chosen mode.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    /// Compact stderr output at `info`.
    Normal,
    /// Every poll cycle and upsd exchange, with thread names and source lines.
    Verbose,
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to initialize tracing subscriber: {0}")]
    TracingInit(String),
}

pub fn init_logging(mode: LoggingMode) -> Result<(), LoggingError> {
    let result = match mode {
        LoggingMode::Normal => Registry::default()
            .with(fmt::layer().with_target(false).compact())
            .with(env_filter("info"))
            .try_init(),
        LoggingMode::Verbose => Registry::default()
            .with(
                fmt::layer()
                    .with_thread_names(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .with(env_filter("nut_relay=debug,info"))
            .try_init(),
    };

    result.map_err(|e| LoggingError::TracingInit(e.to_string()))
}

fn env_filter(default: &str) -> EnvFilter {
    std::env::var("NUT_RELAY_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .map(EnvFilter::new)
        .unwrap_or_else(|_| EnvFilter::new(default))
}
