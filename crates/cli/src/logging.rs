//! Logging setup driven by `[logging]`

use parley_core::LoggingConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_FILE_NAME: &str = "parley.log";

/// Parse log level from config string
fn parse_log_level(level: &str) -> tracing::level_filters::LevelFilter {
  use tracing::level_filters::LevelFilter;

  match level.to_lowercase().as_str() {
    "off" => LevelFilter::OFF,
    "error" => LevelFilter::ERROR,
    "warn" => LevelFilter::WARN,
    "info" => LevelFilter::INFO,
    "debug" => LevelFilter::DEBUG,
    "trace" => LevelFilter::TRACE,
    _ => LevelFilter::INFO,
  }
}

/// Initialize the global subscriber.
///
/// Logs go to stderr with colors unless `directory` is set, in which case
/// they go to a rolling file without ANSI. `RUST_LOG` overrides the level.
///
/// Returns the guard that must be kept alive for the duration of the program
pub fn init_logging(config: &LoggingConfig) -> Option<WorkerGuard> {
  let env_filter = EnvFilter::builder()
    .with_default_directive(parse_log_level(&config.level).into())
    .from_env_lossy();

  let Some(log_dir) = config.directory.as_deref() else {
    tracing_subscriber::fmt()
      .with_env_filter(env_filter)
      .with_writer(std::io::stderr)
      .with_target(true)
      .init();
    return None;
  };

  if let Err(e) = std::fs::create_dir_all(log_dir) {
    // Fall back to console-only logging
    tracing_subscriber::fmt()
      .with_env_filter(env_filter)
      .with_writer(std::io::stderr)
      .init();
    tracing::warn!(path = %log_dir.display(), error = %e, "Cannot create log directory");
    return None;
  }

  let file_appender = match config.rotation.as_str() {
    "hourly" => tracing_appender::rolling::hourly(log_dir, LOG_FILE_NAME),
    "never" => tracing_appender::rolling::never(log_dir, LOG_FILE_NAME),
    _ => tracing_appender::rolling::daily(log_dir, LOG_FILE_NAME),
  };

  let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

  tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .with_target(true)
    .with_ansi(false)
    .with_writer(file_writer)
    .init();

  Some(guard)
}
