//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;
use vibe_core::config::{LogFormat, LoggingConfig};

/// `RUST_LOG` wins over the configured level.
fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

pub fn init(config: &LoggingConfig) {
    let builder = tracing_subscriber::fmt().with_env_filter(filter(&config.level));
    let result = match config.format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    // A subscriber may already be set in tests.
    let _ = result;
}

/// For commands that run before a configuration is loaded.
pub fn init_default() {
    init(&LoggingConfig::default());
}
