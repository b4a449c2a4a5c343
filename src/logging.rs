//! Console logging setup.
//!
//! `RUST_LOG` wins when it is set. Otherwise the level follows the configured
//! verbosity:
//!
//! | verbosity | level |
//! |---|---|
//! | 0 | warn |
//! | 1-2 | info |
//! | 3 | debug |
//! | 4-5 | trace |
//!
//! The `debug` flag raises the level to at least debug.

use crate::config::LoggingConfig;
use crate::error::{AppResult, DaqError};
use tracing::Level;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Log level for a verbosity setting and debug flag.
pub fn level_for(verbosity: u8, debug: bool) -> Level {
    let level = match verbosity {
        0 => Level::WARN,
        1 | 2 => Level::INFO,
        3 => Level::DEBUG,
        _ => Level::TRACE,
    };
    if debug && level < Level::DEBUG {
        Level::DEBUG
    } else {
        level
    }
}

/// Install the global subscriber, writing to stderr.
pub fn init(config: &LoggingConfig) -> AppResult<()> {
    let level = level_for(config.verbosity, config.debug);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(LevelFilter::from_level(level).into()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(config.debug)
        .try_init()
        .map_err(|e| DaqError::Configuration(format!("cannot initialise logging: {}", e)))
}
