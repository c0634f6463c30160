//! Configuration commands (show, init, path)

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parley_core::Config;
use tracing::error;

/// Resolve the config file: an explicit `--config` wins over the user path
pub fn resolve_path(explicit: Option<&Path>) -> Option<PathBuf> {
  explicit.map(Path::to_path_buf).or_else(Config::user_config_path)
}

/// Load the effective configuration
pub fn load(explicit: Option<&Path>) -> Result<Config> {
  match explicit {
    Some(path) => Config::load(path).with_context(|| format!("Failed to load config from {}", path.display())),
    None => Ok(Config::load_or_default()),
  }
}

/// Print the effective configuration as TOML
pub fn cmd_config_show(explicit: Option<&Path>) -> Result<()> {
  let config = load(explicit)?;

  match resolve_path(explicit) {
    Some(path) if path.exists() => println!("Using config: {}", path.display()),
    _ => println!("Using default configuration (no config file found)"),
  }
  println!();

  let toml_str = toml::to_string_pretty(&config)?;
  println!("{}", toml_str);

  Ok(())
}

/// Write the commented default template
pub fn cmd_config_init(explicit: Option<&Path>, force: bool) -> Result<()> {
  let Some(config_path) = resolve_path(explicit) else {
    anyhow::bail!("Cannot determine a config directory; pass --config <path>");
  };

  if config_path.exists() && !force {
    error!(path = %config_path.display(), "Config file already exists");
    println!("Use --force to overwrite it");
    std::process::exit(1);
  }

  if let Some(parent) = config_path.parent() {
    std::fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
  }

  std::fs::write(&config_path, Config::template())
    .with_context(|| format!("Failed to write {}", config_path.display()))?;

  println!("Created config: {}", config_path.display());
  Ok(())
}

pub fn cmd_config_path(explicit: Option<&Path>) -> Result<()> {
  match resolve_path(explicit) {
    Some(path) => println!("{}", path.display()),
    None => println!("(no config directory available)"),
  }
  Ok(())
}
