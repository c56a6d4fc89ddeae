//! Diagnostic logging setup.
//!
//! Logs go to stderr through `tracing-subscriber`. `RUST_LOG` wins over the
//! configured `logging.level` when set.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// The filter used when `RUST_LOG` is unset.
pub fn default_filter(level: &str) -> String {
    format!("{},tower_http={},axum::rejection=trace", level, level)
}

/// Install the global subscriber. Safe to call more than once; later calls
/// are ignored.
pub fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(level)));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
