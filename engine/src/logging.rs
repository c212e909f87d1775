//! Logging setup
//!
//! Stdout logging plus an optional daily-rolling log file.

use std::path::Path;
use std::sync::OnceLock;

use tracing_subscriber::prelude::*;

/// Log file prefix inside the log directory
pub const LOG_FILE_NAME: &str = "reelindex.log";

static LOG_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

/// Installs the global subscriber.
///
/// `RUST_LOG` refines the default `info` level. With `log_dir` set, output is
/// also written to a daily-rolling file there. Calling this more than once
/// is a no-op.
pub fn init_logging(log_dir: Option<&Path>) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_ansi(cfg!(debug_assertions));

    let file_layer = log_dir.and_then(|dir| {
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!("Failed to create log directory {}: {}", dir.display(), e);
            return None;
        }
        if LOG_GUARD.get().is_some() {
            return None;
        }

        let file_appender = tracing_appender::rolling::daily(dir, LOG_FILE_NAME);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let _ = LOG_GUARD.set(guard);

        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
    });

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer);

    // Already initialized (tests, embedding hosts) is fine.
    let _ = tracing::subscriber::set_global_default(subscriber);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_init_logging_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        init_logging(Some(temp_dir.path()));
        init_logging(Some(temp_dir.path()));
        init_logging(None);

        tracing::info!("logging initialized");
        assert!(temp_dir.path().exists());
    }
}
