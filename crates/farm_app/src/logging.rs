use std::path::Path;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const DEFAULT_FILTER: &str = "info,farm_network=debug,farm_app=debug";

/// Initializes logging to a daily-rotated file in `logs_dir` plus a compact
/// stderr layer that only shows warnings, so the console stays readable.
///
/// Returns a guard that must be kept alive for the duration of the app.
/// `RUST_LOG` overrides the file filter.
pub fn init_logging(logs_dir: &Path) -> Result<WorkerGuard> {
    std::fs::create_dir_all(logs_dir)?;

    let file_appender = tracing_appender::rolling::daily(logs_dir, "farmnet");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_ansi(false)
                .with_writer(non_blocking)
                .with_filter(file_filter),
        )
        .with(
            fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_writer(std::io::stderr)
                .compact()
                .with_filter(EnvFilter::new("warn")),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {e}"))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let logs_dir = tmp.path().join("nested").join("logs");
        assert!(!logs_dir.exists());

        // The global subscriber can only be set once per process, so the
        // result may be an error; the directory must exist either way.
        let result = init_logging(&logs_dir);
        assert!(logs_dir.exists());

        if let Err(e) = result {
            let msg = e.to_string();
            assert!(msg.contains("logging"), "unexpected error: {msg}");
        }
    }

    #[test]
    fn test_default_filter_parses() {
        assert!(EnvFilter::try_new(DEFAULT_FILTER).is_ok());
    }
}
