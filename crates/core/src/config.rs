//! Runtime configuration for streams, actors, the event bus and the chat runner.
//!
//! Config priority: explicit path > user (~/.config/parley/config.toml) > defaults

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("Failed to read config file {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("Invalid config: {0}")]
  Parse(#[from] toml::de::Error),
  #[error("Invalid value for {field}: {reason}")]
  Invalid { field: &'static str, reason: String },
}

// ============================================================================
// Stream Configuration
// ============================================================================

/// Defaults for standalone streams
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
  /// Item buffer capacity
  /// Default: 100
  pub capacity: usize,
}

impl Default for StreamConfig {
  fn default() -> Self {
    Self { capacity: 100 }
  }
}

// ============================================================================
// Actor Configuration
// ============================================================================

/// Actor mailbox settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActorConfig {
  /// Inbox capacity
  /// Default: 100
  #[serde(default = "default_mailbox_capacity")]
  pub inbox_capacity: usize,

  /// Outbox capacity
  /// Default: 100
  #[serde(default = "default_mailbox_capacity")]
  pub outbox_capacity: usize,

  /// How long `stop` waits for the in-flight handler before returning
  /// Default: 5000
  #[serde(default = "default_grace_period_ms")]
  pub grace_period_ms: u64,
}

fn default_mailbox_capacity() -> usize {
  100
}
fn default_grace_period_ms() -> u64 {
  5_000
}

impl Default for ActorConfig {
  fn default() -> Self {
    Self {
      inbox_capacity: default_mailbox_capacity(),
      outbox_capacity: default_mailbox_capacity(),
      grace_period_ms: default_grace_period_ms(),
    }
  }
}

// ============================================================================
// Event Bus Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
  /// Shared inbound buffer size
  /// Default: 1000
  pub buffer_size: usize,

  /// Number of dispatch workers
  /// Default: 10
  pub worker_count: usize,
}

impl Default for BusConfig {
  fn default() -> Self {
    Self {
      buffer_size: 1000,
      worker_count: 10,
    }
  }
}

// ============================================================================
// Chat Runner Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSettings {
  /// Upper bound on a single provider streaming call
  /// Default: 300 (5 minutes)
  pub invoke_timeout_secs: u64,

  /// Capacity of the per-response event stream
  /// Default: 100
  pub event_buffer: usize,

  /// Capacity of the per-response control channel
  /// Default: 10
  pub control_capacity: usize,
}

impl Default for RunnerSettings {
  fn default() -> Self {
    Self {
      invoke_timeout_secs: 300,
      event_buffer: 100,
      control_capacity: 10,
    }
  }
}

// ============================================================================
// Logging Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Log level: "off", "error", "warn", "info", "debug", "trace"
  /// Default: "info"
  #[serde(default = "default_log_level")]
  pub level: String,

  /// Log file rotation: "daily", "hourly", "never"
  /// Default: "daily"
  #[serde(default = "default_log_rotation")]
  pub rotation: String,

  /// Directory for log files. Console only when unset.
  pub directory: Option<PathBuf>,
}

fn default_log_level() -> String {
  "info".to_string()
}
fn default_log_rotation() -> String {
  "daily".to_string()
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      rotation: default_log_rotation(),
      directory: None,
    }
  }
}

// ============================================================================
// Main Configuration
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  pub stream: StreamConfig,
  pub actor: ActorConfig,
  pub bus: BusConfig,
  pub runner: RunnerSettings,
  pub logging: LoggingConfig,
}

impl Config {
  /// Parse and validate a TOML document
  pub fn load_from_str(content: &str) -> Result<Self, ConfigError> {
    let config: Config = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
  }

  /// Load from an explicit path. A missing file yields defaults; an unreadable
  /// or malformed one is an error.
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    if !path.exists() {
      tracing::debug!(path = %path.display(), "Config file not found, using defaults");
      return Ok(Self::default());
    }

    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    Self::load_from_str(&content)
  }

  /// Load the user-level config, falling back to defaults on any problem
  pub fn load_or_default() -> Self {
    let Some(path) = Self::user_config_path() else {
      return Self::default();
    };

    match Self::load(&path) {
      Ok(config) => config,
      Err(e) => {
        tracing::warn!(path = %path.display(), error = %e, "Ignoring invalid user config");
        Self::default()
      }
    }
  }

  /// Get the user-level config path
  pub fn user_config_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("PARLEY_CONFIG_DIR") {
      return Some(PathBuf::from(path).join("config.toml"));
    }

    dirs::config_dir().map(|p: PathBuf| p.join("parley").join("config.toml"))
  }

  fn validate(&self) -> Result<(), ConfigError> {
    let non_zero: [(&'static str, usize); 7] = [
      ("stream.capacity", self.stream.capacity),
      ("actor.inbox_capacity", self.actor.inbox_capacity),
      ("actor.outbox_capacity", self.actor.outbox_capacity),
      ("bus.buffer_size", self.bus.buffer_size),
      ("bus.worker_count", self.bus.worker_count),
      ("runner.event_buffer", self.runner.event_buffer),
      ("runner.control_capacity", self.runner.control_capacity),
    ];

    for (field, value) in non_zero {
      if value == 0 {
        return Err(ConfigError::Invalid {
          field,
          reason: "must be greater than zero".to_string(),
        });
      }
    }

    if !matches!(self.logging.rotation.as_str(), "daily" | "hourly" | "never") {
      return Err(ConfigError::Invalid {
        field: "logging.rotation",
        reason: format!("expected daily, hourly or never, got {:?}", self.logging.rotation),
      });
    }

    Ok(())
  }

  /// Generate a default config file as a string
  pub fn template() -> String {
    let defaults = Self::default();
    format!(
      r#"# Parley Configuration
# Place in ~/.config/parley/config.toml or pass --config <path>

# ============================================================================
# Streams
# ============================================================================

[stream]
# Buffered items per stream before senders wait
capacity = {stream_capacity}

# ============================================================================
# Actors
# ============================================================================

[actor]
inbox_capacity = {inbox}
outbox_capacity = {outbox}
# Milliseconds `stop` waits for the in-flight handler
grace_period_ms = {grace}

# ============================================================================
# Event Bus
# ============================================================================

[bus]
buffer_size = {buffer}
worker_count = {workers}

# ============================================================================
# Chat Runner
# ============================================================================

[runner]
# Upper bound on one provider streaming call
invoke_timeout_secs = {timeout}
event_buffer = {event_buffer}
control_capacity = {control}

# ============================================================================
# Logging
# ============================================================================

[logging]
# off, error, warn, info, debug, trace (RUST_LOG overrides)
level = "{level}"
# daily, hourly, never
rotation = "{rotation}"
# directory = "/var/log/parley"
"#,
      stream_capacity = defaults.stream.capacity,
      inbox = defaults.actor.inbox_capacity,
      outbox = defaults.actor.outbox_capacity,
      grace = defaults.actor.grace_period_ms,
      buffer = defaults.bus.buffer_size,
      workers = defaults.bus.worker_count,
      timeout = defaults.runner.invoke_timeout_secs,
      event_buffer = defaults.runner.event_buffer,
      control = defaults.runner.control_capacity,
      level = defaults.logging.level,
      rotation = defaults.logging.rotation,
    )
  }
}
