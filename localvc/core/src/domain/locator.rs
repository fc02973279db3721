// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Repository locators.
//!
//! A locator is the decomposed form of a repository URL or SSH command path:
//!
//! ```text
//! <base>/<PROJECTKEY>/<courseShortName>/<roleOrUser>[-practice][.git]
//! ```
//!
//! Parsing is pure string work against the configured base URL. It either
//! yields a complete [`RepositoryLocator`] or a [`LocatorError`]; partial
//! locators are never produced.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Suffix marking a test-run (practice) repository.
pub const TEST_RUN_SUFFIX: &str = "-practice";

/// Smart HTTP endpoints that trail a repository path.
const HTTP_ENDPOINTS: [&str; 3] = ["/info/refs", "/git-upload-pack", "/git-receive-pack"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LocatorError {
    #[error("repository path '{0}' is outside the configured base path '{1}'")]
    WrongPrefix(String, String),

    #[error("repository URL '{0}' does not match the configured server")]
    WrongServer(String),

    #[error("repository path '{0}' must have exactly three segments below the base path")]
    SegmentCount(String),

    #[error("malformed project key '{0}'")]
    ProjectKey(String),

    #[error("malformed course short name '{0}'")]
    CourseShortName(String),

    #[error("malformed repository name '{0}'")]
    RepositoryName(String),

    #[error("invalid URL '{0}': {1}")]
    InvalidUrl(String, String),
}

/// Which repository of an exercise is addressed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepositoryRole {
    Template,
    Solution,
    Tests,
    /// A student or tutor repository, named after its owner's login.
    User(String),
}

impl RepositoryRole {
    fn parse(name: &str) -> Result<Self, LocatorError> {
        match name {
            "exercise" | "template" => Ok(Self::Template),
            "solution" => Ok(Self::Solution),
            "tests" => Ok(Self::Tests),
            other if is_valid_login(other) => Ok(Self::User(other.to_string())),
            other => Err(LocatorError::RepositoryName(other.to_string())),
        }
    }

    /// Path segment used on disk and in URLs.
    pub fn segment(&self) -> &str {
        match self {
            Self::Template => "exercise",
            Self::Solution => "solution",
            Self::Tests => "tests",
            Self::User(login) => login,
        }
    }
}

/// Decomposed repository address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepositoryLocator {
    pub project_key: String,
    pub course_short_name: String,
    pub role: RepositoryRole,
    pub is_test_run: bool,
}

impl RepositoryLocator {
    /// Parse a request path (for example `/git/PROG1/eist24/ab12cde.git/info/refs`)
    /// or an SSH command argument (optionally single-quoted).
    ///
    /// `base_path` is the path component of the configured server base URL.
    pub fn from_path(base_path: &str, raw: &str) -> Result<Self, LocatorError> {
        let raw = raw.trim().trim_matches('\'');
        let path = strip_endpoint(raw);

        let base = base_path.trim_end_matches('/');
        let relative = if base.is_empty() {
            path
        } else {
            path.strip_prefix(base)
                .filter(|rest| rest.is_empty() || rest.starts_with('/'))
                .ok_or_else(|| LocatorError::WrongPrefix(raw.to_string(), base.to_string()))?
        };

        let segments: Vec<&str> = relative.trim_start_matches('/').split('/').collect();
        let [project_key, course_short_name, repository] = segments.as_slice() else {
            return Err(LocatorError::SegmentCount(raw.to_string()));
        };

        if !is_valid_project_key(project_key) {
            return Err(LocatorError::ProjectKey(project_key.to_string()));
        }
        if !is_valid_course_short_name(course_short_name) {
            return Err(LocatorError::CourseShortName(course_short_name.to_string()));
        }

        let repository = repository.strip_suffix(".git").unwrap_or(repository);
        let (name, is_test_run) = match repository.strip_suffix(TEST_RUN_SUFFIX) {
            Some(name) => (name, true),
            None => (repository, false),
        };
        if name.is_empty() {
            return Err(LocatorError::RepositoryName(repository.to_string()));
        }

        Ok(Self {
            project_key: project_key.to_string(),
            course_short_name: course_short_name.to_string(),
            role: RepositoryRole::parse(name)?,
            is_test_run,
        })
    }

    /// Parse a full URL, requiring scheme, host and port to match `base`.
    pub fn from_url(base: &Url, raw: &str) -> Result<Self, LocatorError> {
        let url = Url::parse(raw).map_err(|e| LocatorError::InvalidUrl(raw.to_string(), e.to_string()))?;
        if url.scheme() != base.scheme()
            || url.host_str() != base.host_str()
            || url.port_or_known_default() != base.port_or_known_default()
        {
            return Err(LocatorError::WrongServer(raw.to_string()));
        }
        Self::from_path(base.path(), url.path())
    }

    /// Recover a locator from an on-disk repository directory below `root`.
    pub fn from_disk_path(root: &Path, repository_dir: &Path) -> Result<Self, LocatorError> {
        let display = repository_dir.display().to_string();
        let relative = repository_dir
            .strip_prefix(root)
            .map_err(|_| LocatorError::WrongPrefix(display.clone(), root.display().to_string()))?;
        let relative = relative
            .to_str()
            .ok_or_else(|| LocatorError::RepositoryName(display.clone()))?;
        Self::from_path("", &format!("/{}", relative.replace('\\', "/")))
    }

    /// Name of the repository directory, e.g. `ab12cde-practice.git`.
    pub fn repository_name(&self) -> String {
        let suffix = if self.is_test_run { TEST_RUN_SUFFIX } else { "" };
        format!("{}{}.git", self.role.segment(), suffix)
    }

    /// Location of the bare repository below `root`.
    pub fn disk_path(&self, root: &Path) -> PathBuf {
        root.join(&self.project_key)
            .join(&self.course_short_name)
            .join(self.repository_name())
    }

    /// Path of the repository below the base URL, starting with `/`.
    pub fn relative_path(&self) -> String {
        format!(
            "/{}/{}/{}",
            self.project_key,
            self.course_short_name,
            self.repository_name()
        )
    }

    /// Clone URL of the repository on the server at `base`.
    pub fn clone_url(&self, base: &Url) -> String {
        format!("{}{}", base.as_str().trim_end_matches('/'), self.relative_path())
    }
}

impl fmt::Display for RepositoryLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.relative_path())
    }
}

fn strip_endpoint(path: &str) -> &str {
    HTTP_ENDPOINTS
        .iter()
        .find_map(|endpoint| path.strip_suffix(endpoint))
        .unwrap_or(path)
}

fn is_valid_project_key(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_uppercase())
        && chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}

fn is_valid_course_short_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic()) && chars.all(|c| c.is_ascii_alphanumeric())
}

/// Logins start alphanumeric and may contain `_ . @ -` afterwards.
pub fn is_valid_login(login: &str) -> bool {
    let mut chars = login.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '@' | '-'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_student_repository() {
        let locator = RepositoryLocator::from_path("/git", "/git/PROG1/eist24/ab12cde.git/info/refs").unwrap();
        assert_eq!(locator.project_key, "PROG1");
        assert_eq!(locator.course_short_name, "eist24");
        assert_eq!(locator.role, RepositoryRole::User("ab12cde".to_string()));
        assert!(!locator.is_test_run);
    }

    #[test]
    fn test_clone_url_joins_base_without_double_slash() {
        let locator = RepositoryLocator::from_path("/git", "/git/PROG1/eist24/ab12cde.git").unwrap();
        for base in ["http://localhost:8080/git", "http://localhost:8080/git/"] {
            assert_eq!(
                locator.clone_url(&Url::parse(base).unwrap()),
                "http://localhost:8080/git/PROG1/eist24/ab12cde.git"
            );
        }
    }

    #[test]
    fn test_parse_fixed_repositories() {
        for (segment, role) in [
            ("exercise", RepositoryRole::Template),
            ("template", RepositoryRole::Template),
            ("solution", RepositoryRole::Solution),
            ("tests", RepositoryRole::Tests),
        ] {
            let path = format!("/git/PROG1/eist24/{}.git/git-receive-pack", segment);
            assert_eq!(RepositoryLocator::from_path("/git", &path).unwrap().role, role);
        }
    }

    #[test]
    fn test_parse_practice_repository_without_git_suffix() {
        let locator = RepositoryLocator::from_path("/git/", "'/git/PROG1/eist24/ab12cde-practice'").unwrap();
        assert!(locator.is_test_run);
        assert_eq!(locator.role, RepositoryRole::User("ab12cde".to_string()));
        assert_eq!(locator.repository_name(), "ab12cde-practice.git");
    }

    #[test]
    fn test_rejects_malformed_paths() {
        assert!(matches!(
            RepositoryLocator::from_path("/git", "/svn/PROG1/eist24/ab12cde.git"),
            Err(LocatorError::WrongPrefix(..))
        ));
        assert!(matches!(
            RepositoryLocator::from_path("/git", "/gitx/PROG1/eist24/ab12cde.git"),
            Err(LocatorError::WrongPrefix(..))
        ));
        assert!(matches!(
            RepositoryLocator::from_path("/git", "/git/PROG1/ab12cde.git"),
            Err(LocatorError::SegmentCount(_))
        ));
        assert!(matches!(
            RepositoryLocator::from_path("/git", "/git/prog1/eist24/ab12cde.git"),
            Err(LocatorError::ProjectKey(_))
        ));
        assert!(matches!(
            RepositoryLocator::from_path("/git", "/git/PROG1/eist-24/ab12cde.git"),
            Err(LocatorError::CourseShortName(_))
        ));
        assert!(matches!(
            RepositoryLocator::from_path("/git", "/git/PROG1/eist24/-practice.git"),
            Err(LocatorError::RepositoryName(_))
        ));
        assert!(matches!(
            RepositoryLocator::from_path("/git", "/git/PROG1/eist24/../x.git"),
            Err(LocatorError::SegmentCount(_)) | Err(LocatorError::RepositoryName(_))
        ));
    }

    #[test]
    fn test_from_url_checks_server() {
        let base = Url::parse("https://vcs.example.org/git").unwrap();
        assert!(RepositoryLocator::from_url(&base, "https://vcs.example.org/git/PROG1/eist24/tests.git").is_ok());
        assert!(matches!(
            RepositoryLocator::from_url(&base, "https://evil.example.org/git/PROG1/eist24/tests.git"),
            Err(LocatorError::WrongServer(_))
        ));
        assert!(matches!(
            RepositoryLocator::from_url(&base, "https://vcs.example.org:8443/git/PROG1/eist24/tests.git"),
            Err(LocatorError::WrongServer(_))
        ));
    }

    #[test]
    fn test_disk_path_round_trip() {
        let root = Path::new("/srv/repos");
        let locator = RepositoryLocator::from_path("/git", "/git/PROG1/eist24/ab12cde-practice.git").unwrap();
        let dir = locator.disk_path(root);
        assert_eq!(dir, PathBuf::from("/srv/repos/PROG1/eist24/ab12cde-practice.git"));
        assert_eq!(RepositoryLocator::from_disk_path(root, &dir).unwrap(), locator);
    }
}
