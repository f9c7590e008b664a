//! Logging bootstrap: console output with an env-controlled filter, plus a
//! daily-rotated log file when debug mode is on.

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::DebugConfig;

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "acegate=info,fleet=info,tower_http=info";

/// Install the global subscriber. Returns the file writer guard when a file
/// layer is active; dropping it flushes buffered log lines.
pub fn init_logging(debug: &DebugConfig) -> std::io::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let console = tracing_subscriber::fmt::layer().with_target(true);

    if debug.enabled {
        std::fs::create_dir_all(&debug.log_dir)?;
        let appender = tracing_appender::rolling::daily(&debug.log_dir, "acegate.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let file = tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_ansi(false);
        tracing_subscriber::registry()
            .with(filter)
            .with(console.and_then(file))
            .init();
        Ok(Some(guard))
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(console)
            .init();
        Ok(None)
    }
}
