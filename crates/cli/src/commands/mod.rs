//! CLI command implementations

mod config;
mod demo;

pub use config::{cmd_config_init, cmd_config_path, cmd_config_show, load as load_config};
pub use demo::{DemoArgs, cmd_demo};
