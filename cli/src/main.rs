// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # localvc
//!
//! The `localvc` binary hosts student and exercise repositories and builds
//! every push in a throwaway Docker container.
//!
//! ## Commands
//!
//! - `localvc serve` - Run the HTTP and SSH git transports with the build scheduler
//! - `localvc config show|validate|generate|generate-directory` - Configuration management
//! - `localvc repo create <url>` - Create an empty bare repository
//! - `localvc key-hash <file.pub>` - Print the directory hash of an SSH public key

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

use localvc_cli::commands::{self, ConfigCommand, RepoCommand};
use localvc_core::domain::server_config::ServerConfigManifest;

/// localvc - local version control with build-on-push
#[derive(Parser)]
#[command(name = "localvc")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "LOCALVC_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error). Defaults to the configured level.
    #[arg(long, global = true, env = "LOCALVC_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format (text, json). Defaults to the configured format.
    #[arg(long, global = true, env = "LOCALVC_LOG_FORMAT")]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the git server
    #[command(name = "serve")]
    Serve,

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Repository management
    #[command(name = "repo")]
    Repo {
        #[command(subcommand)]
        command: RepoCommand,
    },

    /// Print the SHA-256 digest a directory stores for an SSH public key
    #[command(name = "key-hash")]
    KeyHash {
        /// OpenSSH public key file (`id_ed25519.pub`)
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (level, format) = logging_settings(&cli);
    init_logging(&level, &format)?;

    match cli.command {
        Some(Commands::Serve) => commands::serve::run(cli.config).await,
        Some(Commands::Config { command }) => commands::config::handle_command(command, cli.config).await,
        Some(Commands::Repo { command }) => commands::repo::handle_command(command, cli.config).await,
        Some(Commands::KeyHash { file }) => commands::key_hash::run(&file),
        None => {
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}

/// Command-line flags win over the `observability.logging` section.
fn logging_settings(cli: &Cli) -> (String, String) {
    let configured = cli
        .config
        .clone()
        .or_else(ServerConfigManifest::discover_config)
        .and_then(|path| ServerConfigManifest::from_yaml_file(path).ok())
        .and_then(|config| config.spec.observability)
        .and_then(|observability| observability.logging);

    let level = cli
        .log_level
        .clone()
        .or_else(|| configured.as_ref().map(|l| l.level.clone()))
        .unwrap_or_else(|| "info".to_string());
    let format = cli
        .log_format
        .clone()
        .or_else(|| configured.map(|l| l.format))
        .unwrap_or_else(|| "text".to_string());
    (level, format)
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str, format: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    match format {
        "json" => builder.json().with_current_span(false).init(),
        "text" => builder.with_target(false).compact().init(),
        other => anyhow::bail!("Unknown log format '{}'. Expected 'text' or 'json'", other),
    }

    Ok(())
}
