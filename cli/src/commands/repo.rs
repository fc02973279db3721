// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Repository management commands
//!
//! Repositories are created by the exercise workflow, not by pushes; this is
//! the standalone way to provision one.

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;
use url::Url;

use localvc_core::domain::locator::RepositoryLocator;
use localvc_core::domain::server_config::ServerConfigManifest;
use localvc_core::infrastructure::RepositoryStore;

#[derive(Subcommand)]
pub enum RepoCommand {
    /// Create an empty bare repository
    Create {
        /// Repository URL or path, e.g. `http://localhost:8080/git/PROG1/eist24/ab12cde.git`
        #[arg(value_name = "URL")]
        repository: String,
    },
}

pub async fn handle_command(command: RepoCommand, config_override: Option<PathBuf>) -> Result<()> {
    let config = ServerConfigManifest::load_or_default(config_override).context("Failed to load configuration")?;

    match command {
        RepoCommand::Create { repository } => create(&config, &repository),
    }
}

fn create(config: &ServerConfigManifest, repository: &str) -> Result<()> {
    let base_url = config.base_url()?;
    let locator = resolve(&base_url, repository)?;

    let store = RepositoryStore::new(config.repositories_root());
    let handle = store
        .create_bare(&locator)
        .with_context(|| format!("Failed to create repository {}", locator))?;

    println!(
        "{}",
        format!("✓ Repository created: {}", handle.path.display()).green()
    );
    println!("  Clone URL: {}", locator.clone_url(&base_url));

    Ok(())
}

/// Accept a full URL on this server, a path below the base path, or a path without it.
fn resolve(base_url: &Url, repository: &str) -> Result<RepositoryLocator> {
    let locator = if Url::parse(repository).is_ok() {
        RepositoryLocator::from_url(base_url, repository)
    } else {
        RepositoryLocator::from_path(base_url.path(), repository)
            .or_else(|_| RepositoryLocator::from_path("", repository))
    };
    locator.with_context(|| format!("'{}' is not a valid repository location", repository))
}
