// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Directory Interfaces
//!
//! Narrow read contracts against the user and course store. The transport
//! never owns this data; it only asks the questions below and maps the
//! answers to an access decision.
//!
//! | Trait | Questions | Implementations |
//! |-------|-----------|-----------------|
//! | `UserDirectory` | password check, access token check, user by login, user by key hash | `FileDirectory` |
//! | `ExerciseDirectory` | course, exercise, role, participation, participation access | `FileDirectory` |
//!
//! Every lookup distinguishes `NotFound`, `Forbidden` and `Unexpected` so the
//! authorizer can map them without guessing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::domain::identity::RepositoryAction;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("unexpected directory state: {0}")]
    Unexpected(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub login: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Course {
    pub short_name: String,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exercise {
    pub project_key: String,
    pub course_short_name: String,
    pub allow_offline_ide: bool,
    #[serde(default)]
    pub due_date: Option<DateTime<Utc>>,
    /// Branch creation rules. Unrestricted when absent.
    #[serde(default)]
    pub branching: Option<BranchingSettings>,
}

/// Which branches students may create besides the default branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchingSettings {
    pub allow_branching: bool,
    /// Pattern a new branch name must match in full. Branching stays disabled without one.
    #[serde(default)]
    pub branch_regex: Option<String>,
    pub default_branch: String,
}

/// Role of a user inside one course. Ordered from least to most privileged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CourseRole {
    Student,
    Tutor,
    Editor,
    Instructor,
}

impl CourseRole {
    pub fn at_least(self, required: CourseRole) -> bool {
        self >= required
    }
}

impl fmt::Display for CourseRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Student => "student",
            Self::Tutor => "tutor",
            Self::Editor => "editor",
            Self::Instructor => "instructor",
        };
        f.write_str(name)
    }
}

/// Whose repository a participation holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipationOwner {
    Template,
    Solution,
    Student(String),
}

impl ParticipationOwner {
    pub fn is_fixed(&self) -> bool {
        matches!(self, Self::Template | Self::Solution)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participation {
    pub exercise_project_key: String,
    pub owner: ParticipationOwner,
    #[serde(default)]
    pub test_run: bool,
}

/// What a matching VCS access token grants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessTokenScope {
    /// The user's personal token, valid for every repository the user may access.
    User,
    /// A token bound to one participation of the user.
    Participation(Participation),
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// External password check. `Ok(false)` means the credentials are wrong.
    async fn verify_password(&self, login: &str, password: &str) -> Result<bool, DirectoryError>;

    /// Match a VCS access token of `login`. `Ok(None)` if no unexpired token matches.
    async fn verify_access_token(&self, login: &str, token: &str) -> Result<Option<AccessTokenScope>, DirectoryError>;

    async fn find_user_by_login(&self, login: &str) -> Result<User, DirectoryError>;

    /// Look up the owner of a public key by the SHA-256 hex digest of its canonical form.
    async fn find_user_by_key_hash(&self, key_hash: &str) -> Result<User, DirectoryError>;
}

#[async_trait]
pub trait ExerciseDirectory: Send + Sync {
    async fn find_course(&self, short_name: &str) -> Result<Course, DirectoryError>;

    async fn find_exercise(&self, project_key: &str) -> Result<Exercise, DirectoryError>;

    /// Role of `login` in the course, `None` if the user is not a member.
    async fn course_role(&self, course: &Course, login: &str) -> Result<Option<CourseRole>, DirectoryError>;

    async fn find_participation(
        &self,
        exercise: &Exercise,
        owner: &ParticipationOwner,
        test_run: bool,
    ) -> Result<Participation, DirectoryError>;

    /// `Err(Forbidden)` if `login` may not perform `action` on the participation.
    async fn check_participation_access(
        &self,
        participation: &Participation,
        login: &str,
        action: RepositoryAction,
    ) -> Result<(), DirectoryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_course_role_ordering() {
        assert!(CourseRole::Instructor.at_least(CourseRole::Editor));
        assert!(CourseRole::Editor.at_least(CourseRole::Editor));
        assert!(!CourseRole::Tutor.at_least(CourseRole::Editor));
        assert!(!CourseRole::Student.at_least(CourseRole::Tutor));
    }
}
