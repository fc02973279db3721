// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate, generate-directory

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use localvc_core::domain::server_config::ServerConfigManifest;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate sample configuration
    Generate {
        /// Output path (default: ./localvc-config.yaml)
        #[arg(short, long, default_value = "./localvc-config.yaml")]
        output: PathBuf,

        /// Include examples and comments
        #[arg(long)]
        examples: bool,
    },

    /// Generate a sample user directory
    GenerateDirectory {
        /// Output path (default: ./localvc-directory.yaml)
        #[arg(short, long, default_value = "./localvc-directory.yaml")]
        output: PathBuf,
    },
}

pub async fn handle_command(command: ConfigCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(config_override, paths).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
        ConfigCommand::Generate { output, examples } => generate(output, examples).await,
        ConfigCommand::GenerateDirectory { output } => generate_directory(output).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool) -> Result<()> {
    let config = ServerConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. LOCALVC_CONFIG_PATH: {}",
            std::env::var("LOCALVC_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./localvc-config.yaml");
        println!("  4. ~/.localvc/config.yaml");
        println!("  5. /etc/localvc/config.yaml");
        println!();
    }

    println!("{}", "Current configuration:".bold());
    println!("  Server: {}", config.metadata.name);
    println!();

    let spec = &config.spec;
    println!("{}", "Transports:".bold());
    println!("  HTTP: {}:{}", spec.http.bind_address, spec.http.port);
    println!("  Base URL: {}", spec.http.base_url);
    if spec.ssh.enabled {
        println!("  SSH: {}:{}", spec.ssh.bind_address, spec.ssh.port);
        println!(
            "  Host key: {}",
            spec.ssh.host_key_path.as_deref().unwrap_or("(not set)")
        );
        if let Some(limit) = spec.ssh.max_concurrent_commands {
            println!("  Max concurrent commands: {}", limit);
        }
    } else {
        println!("  SSH: {}", "disabled".dimmed());
    }
    println!();

    println!("{}", "Storage:".bold());
    println!("  Repositories: {}", spec.repositories.root);
    println!("  Directory: {}", spec.directory.path);
    println!();

    println!("{}", "Security:".bold());
    match spec.security.auth_attempts_per_minute {
        0 => println!("  Authentication attempts: {}", "unlimited".dimmed()),
        limit => println!("  Authentication attempts: {} per minute and client", limit),
    }
    match &spec.security.build_agent {
        Some(agent) => println!("  Build agent: {}", agent.login),
        None => println!("  Build agent: {}", "(not set)".dimmed()),
    }
    println!();

    println!("{}", "Builds:".bold());
    println!("  Workers: {}", config.build_pool_size());
    println!("  Image: {}", spec.build.image);
    println!("  Container flags: {}", spec.build.container_flags.join(" "));
    println!("  Network disabled: {}", spec.build.network_disabled);
    println!("  Timeout: {}s", spec.build.timeout_seconds);
    println!(
        "  Docker socket: {}",
        spec.build.docker_socket_path.as_deref().unwrap_or("(default)")
    );
    println!();

    Ok(())
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = ServerConfigManifest::load_or_default(config_path).context("Failed to load configuration")?;

    config.validate().context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

async fn generate(output: PathBuf, with_examples: bool) -> Result<()> {
    let sample = if with_examples {
        include_str!("../../templates/config-with-examples.yaml")
    } else {
        include_str!("../../templates/config-minimal.yaml")
    };

    std::fs::write(&output, sample).with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );

    Ok(())
}

async fn generate_directory(output: PathBuf) -> Result<()> {
    if output.exists() {
        anyhow::bail!("Refusing to overwrite existing directory file {:?}", output);
    }
    std::fs::write(&output, DIRECTORY_EXAMPLE)
        .with_context(|| format!("Failed to write directory to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Directory generated: {}", output.display()).green()
    );
    println!("  Sample password for every user: {}", "secret".bold());

    Ok(())
}

const DIRECTORY_EXAMPLE: &str = include_str!("../../templates/directory-example.yaml");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_templates_parse_and_validate() {
        for template in [
            include_str!("../../templates/config-minimal.yaml"),
            include_str!("../../templates/config-with-examples.yaml"),
        ] {
            let config = ServerConfigManifest::from_yaml_str(template).unwrap();
            config.validate().unwrap();
        }
    }

    #[test]
    fn test_directory_example_loads() {
        localvc_core::infrastructure::FileDirectory::from_yaml_str(DIRECTORY_EXAMPLE).unwrap();
    }
}
