use std::path::PathBuf;

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Initialize tracing for an embedding host: env-filtered stdout logging,
/// plus JSON logs into a daily-rolling file when `log_dir` is given.
///
/// Returns the appender guard; dropping it flushes the file writer. Safe to
/// call more than once (later calls are no-ops).
pub fn init_tracing(
    log_dir: Option<PathBuf>,
    log_file: &str,
    log_level: &str,
) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, log_file);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .with(fmt::layer().json().with_ansi(false).with_writer(writer))
                .try_init();
            Ok(Some(guard))
        }
        None => {
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .try_init();
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_with_file_layer() {
        let dir = tempfile::tempdir().unwrap();
        let guard = init_tracing(Some(dir.path().to_path_buf()), "botflow.log", "debug").unwrap();
        assert!(guard.is_some());
        tracing::info!("logging is wired up");
    }

    #[test]
    fn test_init_tracing_is_idempotent() {
        init_tracing(None, "unused.log", "info").unwrap();
        // a second init must not panic
        init_tracing(None, "unused.log", "not a filter!!").unwrap();
    }
}
