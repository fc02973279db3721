// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Bare repositories on the local filesystem.
//!
//! Every repository lives at `<root>/<PROJECTKEY>/<course>/<roleOrUser>[-practice].git`.
//! The store only resolves and creates directories; it never keeps a
//! `git2::Repository` open beyond a single call.

use git2::{Repository, RepositoryInitOptions};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::domain::build::RepositoryHandle;
use crate::domain::locator::{LocatorError, RepositoryLocator};
use crate::infrastructure::protocol::ProtocolError;

pub const DEFAULT_BRANCH: &str = "main";

#[derive(Debug, Clone)]
pub struct RepositoryStore {
    root: PathBuf,
}

impl RepositoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve an existing repository. A directory that is not a bare git
    /// repository counts as missing.
    pub fn open(&self, locator: &RepositoryLocator) -> Result<RepositoryHandle, ProtocolError> {
        let path = locator.disk_path(&self.root);
        if !path.join("HEAD").is_file() || !path.join("objects").is_dir() {
            return Err(ProtocolError::RepositoryNotFound(locator.to_string()));
        }
        Ok(RepositoryHandle {
            locator: locator.clone(),
            path,
        })
    }

    /// Create an empty bare repository whose HEAD points at `refs/heads/main`.
    /// Fails if the repository already exists.
    pub fn create_bare(&self, locator: &RepositoryLocator) -> Result<RepositoryHandle, ProtocolError> {
        let path = locator.disk_path(&self.root);
        if path.exists() {
            return Err(ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                format!("repository {} already exists at {}", locator, path.display()),
            )));
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut options = RepositoryInitOptions::new();
        options
            .bare(true)
            .no_reinit(true)
            .initial_head(&format!("refs/heads/{}", DEFAULT_BRANCH));
        Repository::init_opts(&path, &options)?;

        info!("Created repository {} at {}", locator, path.display());
        Ok(RepositoryHandle {
            locator: locator.clone(),
            path,
        })
    }

    /// Map a directory below the root back to its locator.
    pub fn locate(&self, repository_dir: &Path) -> Result<RepositoryHandle, LocatorError> {
        let locator = RepositoryLocator::from_disk_path(&self.root, repository_dir)?;
        Ok(RepositoryHandle {
            locator,
            path: repository_dir.to_path_buf(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locator(path: &str) -> RepositoryLocator {
        RepositoryLocator::from_path("/git", path).unwrap()
    }

    #[test]
    fn test_create_then_open() {
        let dir = tempfile::tempdir().unwrap();
        let store = RepositoryStore::new(dir.path());
        let locator = locator("/git/PROG1/eist24/ab12cde.git");

        assert!(matches!(store.open(&locator), Err(ProtocolError::RepositoryNotFound(_))));

        let created = store.create_bare(&locator).unwrap();
        assert_eq!(created.path, dir.path().join("PROG1/eist24/ab12cde.git"));

        let repo = Repository::open_bare(&created.path).unwrap();
        assert_eq!(repo.find_reference("HEAD").unwrap().symbolic_target(), Some("refs/heads/main"));

        let opened = store.open(&locator).unwrap();
        assert_eq!(opened, created);
        assert!(store.create_bare(&locator).is_err());
    }

    #[test]
    fn test_locate_reverse_mapping() {
        let dir = tempfile::tempdir().unwrap();
        let store = RepositoryStore::new(dir.path());
        let handle = store.locate(&dir.path().join("PROG1/eist24/tests.git")).unwrap();
        assert_eq!(handle.locator, locator("/git/PROG1/eist24/tests"));
        assert!(store.locate(Path::new("/elsewhere/PROG1/eist24/tests.git")).is_err());
    }
}
