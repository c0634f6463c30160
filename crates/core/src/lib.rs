//! Shared building blocks for the parley workspace.
//!
//! Holds the [`Event`] capability every message type implements and the
//! TOML-backed [`Config`] consumed by the runtime crates.

mod config;
mod event;

pub use config::{ActorConfig, BusConfig, Config, ConfigError, LoggingConfig, RunnerSettings, StreamConfig};
pub use event::{Event, WILDCARD_EVENT_TYPE};
