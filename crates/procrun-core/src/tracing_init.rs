//! Logging setup for the `procrun` binary.
//!
//! Supervisor diagnostics go to stderr: stdout carries the supervised
//! command's own output and must stay clean for pipes and redirects.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `default_filter` (e.g. `"procrun=info"`) when set.
/// With `log_json` every event is one JSON object per line, for collectors.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry().with(filter);

    if log_json {
        registry.with(layer.json()).init();
    } else {
        registry.with(layer).init();
    }
}
