use std::fs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub const LOG_DIR: &str = "logs";
pub const LOG_FILE: &str = "basic_cleaning.log";

/// Initializes the logging system with both console and file output.
///
/// The returned guard flushes the file writer when dropped, so `main` holds it
/// until the run has been finished.
pub fn init_logging() -> Option<WorkerGuard> {
    // Respect RUST_LOG if set; otherwise info for our crate
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("basic_cleaning=info,warn"));

    // Non-blocking JSON file layer with daily rotation. A read-only working
    // directory still gets console logging.
    let (file_layer, guard) = match fs::create_dir_all(LOG_DIR) {
        Ok(()) => {
            let file_appender = tracing_appender::rolling::daily(LOG_DIR, LOG_FILE);
            let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);
            (
                Some(fmt::layer().json().with_writer(non_blocking_writer)),
                Some(guard),
            )
        }
        Err(_) => (None, None),
    };

    let console_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .init();

    guard
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::info;

    // Only test in this binary that installs the global subscriber
    #[test]
    fn test_init_logging_installs_console_and_file_layers() {
        let guard = init_logging();
        assert!(guard.is_some());
        info!(rows = 3, "Logging initialized");
        assert!(std::path::Path::new(LOG_DIR).is_dir());
    }
}
