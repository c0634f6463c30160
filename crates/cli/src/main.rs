//! Parley CLI - streaming chat responses over actors and event buses

use std::{path::PathBuf, time::Duration};

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;
mod logging;

use commands::{DemoArgs, cmd_config_init, cmd_config_path, cmd_config_show, cmd_demo, load_config};
use logging::init_logging;

#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "Streaming chat responses over actors and event buses")]
#[command(after_help = "\
QUICK START:
  parley config init                      # Write the default config
  parley demo                             # Stream a scripted reply
  parley demo --hang --interrupt-after-ms 300
  parley demo --json                      # Print every lifecycle event")]
struct Cli {
  /// Config file (default: ~/.config/parley/config.toml)
  #[arg(long, global = true, value_name = "PATH")]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Commands,
}

/// Subcommands for `parley config`
#[derive(Subcommand)]
enum ConfigCommand {
  /// Show effective configuration
  Show,
  /// Write the default configuration file
  Init {
    /// Overwrite an existing file
    #[arg(long)]
    force: bool,
  },
  /// Print the config file location
  Path,
}

#[derive(Subcommand)]
enum Commands {
  /// Stream one scripted response through a chat actor
  Demo {
    /// User message sent to the model
    #[arg(short, long, default_value = "Say hello")]
    prompt: String,
    /// Text the scripted model streams back
    #[arg(short, long, default_value = "Hello from a scripted model, one word at a time.")]
    reply: String,
    /// Model name reported on chunks and requests
    #[arg(long, default_value = "scripted-1")]
    model: String,
    /// Delay between streamed chunks
    #[arg(long, default_value = "50")]
    chunk_delay_ms: u64,
    /// Interrupt the response after this many milliseconds
    #[arg(long)]
    interrupt_after_ms: Option<u64>,
    /// Never send a finish reason (pair with --interrupt-after-ms or Ctrl-C)
    #[arg(long)]
    hang: bool,
    /// Make the provider fail to open with this message
    #[arg(long, value_name = "MESSAGE")]
    fail: Option<String>,
    /// Print every event as a JSON line
    #[arg(long)]
    json: bool,
  },
  /// Manage configuration
  Config {
    #[command(subcommand)]
    command: ConfigCommand,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();
  let config_path = cli.config.as_deref();

  // `config` subcommands must work even when the file on disk is broken
  let config = match &cli.command {
    Commands::Config { .. } => load_config(config_path).unwrap_or_default(),
    Commands::Demo { .. } => load_config(config_path)?,
  };
  let _guard = init_logging(&config.logging);

  match cli.command {
    Commands::Demo {
      prompt,
      reply,
      model,
      chunk_delay_ms,
      interrupt_after_ms,
      hang,
      fail,
      json,
    } => {
      let args = DemoArgs {
        prompt,
        reply,
        model,
        chunk_delay: Duration::from_millis(chunk_delay_ms),
        interrupt_after: interrupt_after_ms.map(Duration::from_millis),
        hang,
        fail,
        json,
      };
      cmd_demo(config, args).await
    }
    Commands::Config { command } => match command {
      ConfigCommand::Show => cmd_config_show(config_path),
      ConfigCommand::Init { force } => cmd_config_init(config_path, force),
      ConfigCommand::Path => cmd_config_path(config_path),
    },
  }
}
