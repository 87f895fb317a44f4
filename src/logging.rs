//! Tracing subscriber setup for binaries embedding the exchange core.
//!
//! The library only emits `tracing` events; installing a subscriber is the
//! host's call. `RUST_LOG` overrides the default filter, e.g.
//! `RUST_LOG=bonded_exchange=debug`.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    /// "json" (any case) selects JSON, anything else pretty output.
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

/// Install the global subscriber. Returns an error if one is already set.
pub fn init_logging(default_level: &str, format: LogFormat) -> anyhow::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    match format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true).with_line_number(true))
            .try_init()?,
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_target(true))
            .try_init()?,
    }

    tracing::info!("logging initialized (format={:?})", format);
    Ok(())
}
