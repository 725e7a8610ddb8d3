//! Logging initialization.
//!
//! Sets up the tracing registry with an env-filter and optional file
//! output. Plugins receive their own log path through the spawn
//! arguments and never share the control plane's sink.

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "metrod=info";

/// Initialize logging for the control plane.
///
/// The filter is taken from `RUST_LOG` when set, falling back to
/// [`DEFAULT_LOG_FILTER`]. When `log_dir` is given, a non-blocking
/// daily-rotated file layer is added alongside stderr; the returned
/// guard must be held for the lifetime of the process.
pub fn init(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into());

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "metrod.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
            None
        }
    }
}
