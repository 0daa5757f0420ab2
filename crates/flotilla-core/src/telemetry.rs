//! Tracing setup shared by the CLI and integration tests.
//!
//! Installs a `tracing-subscriber` registry with an `EnvFilter` and
//! optional JSON formatting. `RUST_LOG` always wins over the verbosity
//! flag. Safe to call more than once; only the first call per process
//! takes effect.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Map repeated `-v` flags to a default log level.
pub fn level_for_verbosity(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Initialise the global tracing subscriber.
///
/// * `json` - emit newline-delimited JSON log lines, for aggregation.
/// * `verbosity` - number of `-v` flags; ignored when `RUST_LOG` is set.
pub fn init_tracing(json: bool, verbosity: u8) {
    let level = level_for_verbosity(verbosity);
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false))
            .try_init()
            .ok();
    }
}
