// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! YAML-backed user and course directory.
//!
//! Serves standalone deployments and tests. The whole file is loaded into
//! memory at startup; passwords and access tokens are stored as SHA-256 hex
//! digests and public keys either verbatim (`<algorithm> <base64> [comment]`)
//! or as digests.
//!
//! ```yaml
//! users:
//!   - login: ab12cde
//!     password_sha256: 5e884898da28047151d0e56f8dc6292773603d0d6aabbdd62a11ef721d1542d8
//!     public_keys: ["ssh-ed25519 AAAAC3Nza... laptop"]
//!     vcs_access_token_sha256: 9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08
//!     vcs_access_token_expires: 2026-12-31T00:00:00Z
//! courses:
//!   - short_name: eist24
//!     students: [ab12cde]
//!     instructors: [prof]
//! exercises:
//!   - project_key: PROG1
//!     course: eist24
//!     allow_offline_ide: true
//!     due_date: 2026-12-24T12:00:00Z
//!     allow_branching: true
//!     branch_regex: "feature/.*"
//! participations:
//!   - exercise: PROG1
//!     owner: template
//!   - exercise: PROG1
//!     owner: ab12cde
//!     test_run: false
//!     vcs_access_tokens:
//!       ab12cde: 60303ae22b998861bce3b28f33eec1be758a213c86c93c076dbe9f558c11c752
//! ```
//!
//! Exercises without `allow_branching` accept any new branch; with it, only
//! `default_branch` (`main` unless set) and names matching `branch_regex`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use subtle::ConstantTimeEq;
use tracing::info;

use crate::application::authentication::public_key_hash;
use crate::domain::directory::{
    AccessTokenScope, BranchingSettings, Course, CourseRole, DirectoryError, Exercise, ExerciseDirectory,
    Participation, ParticipationOwner, User, UserDirectory,
};
use crate::domain::identity::RepositoryAction;

#[derive(Debug, Default, Deserialize)]
struct DirectoryFile {
    #[serde(default)]
    users: Vec<UserEntry>,
    #[serde(default)]
    courses: Vec<CourseEntry>,
    #[serde(default)]
    exercises: Vec<ExerciseEntry>,
    #[serde(default)]
    participations: Vec<ParticipationEntry>,
}

#[derive(Debug, Deserialize)]
struct UserEntry {
    login: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    password_sha256: Option<String>,
    #[serde(default)]
    public_keys: Vec<String>,
    #[serde(default)]
    public_key_hashes: Vec<String>,
    #[serde(default)]
    vcs_access_token_sha256: Option<String>,
    #[serde(default)]
    vcs_access_token_expires: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct CourseEntry {
    short_name: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    students: Vec<String>,
    #[serde(default)]
    tutors: Vec<String>,
    #[serde(default)]
    editors: Vec<String>,
    #[serde(default)]
    instructors: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ExerciseEntry {
    project_key: String,
    course: String,
    #[serde(default = "default_true")]
    allow_offline_ide: bool,
    #[serde(default)]
    due_date: Option<DateTime<Utc>>,
    #[serde(default)]
    allow_branching: Option<bool>,
    #[serde(default)]
    branch_regex: Option<String>,
    #[serde(default)]
    default_branch: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ParticipationEntry {
    exercise: String,
    owner: String,
    #[serde(default)]
    test_run: bool,
    /// Login to SHA-256 digest of that user's token for this participation.
    #[serde(default)]
    vcs_access_tokens: HashMap<String, String>,
}

const DEFAULT_BRANCH: &str = "main";

fn default_true() -> bool {
    true
}

fn parse_owner(owner: &str) -> ParticipationOwner {
    match owner {
        "template" | "exercise" => ParticipationOwner::Template,
        "solution" => ParticipationOwner::Solution,
        login => ParticipationOwner::Student(login.to_string()),
    }
}

struct StoredUser {
    user: User,
    password_sha256: Option<String>,
    access_token: Option<(String, DateTime<Utc>)>,
}

struct StoredParticipation {
    participation: Participation,
    token_sha256: HashMap<String, String>,
}

pub struct FileDirectory {
    users: HashMap<String, StoredUser>,
    key_owners: HashMap<String, String>,
    courses: HashMap<String, (Course, HashMap<String, CourseRole>)>,
    exercises: HashMap<String, Exercise>,
    participations: Vec<StoredParticipation>,
}

impl FileDirectory {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read directory file {:?}", path))?;
        let directory = Self::from_yaml_str(&content)
            .with_context(|| format!("Failed to parse directory file {:?}", path))?;
        info!(
            "Loaded directory from {:?}: {} users, {} courses, {} exercises, {} participations",
            path,
            directory.users.len(),
            directory.courses.len(),
            directory.exercises.len(),
            directory.participations.len()
        );
        Ok(directory)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let file: DirectoryFile = serde_yaml::from_str(yaml)?;

        let mut users = HashMap::new();
        let mut key_owners = HashMap::new();
        for entry in file.users {
            let key_hashes = entry
                .public_keys
                .iter()
                .map(|key| canonical_key_hash(key))
                .chain(entry.public_key_hashes.iter().map(|h| h.to_ascii_lowercase()));
            for hash in key_hashes {
                if let Some(previous) = key_owners.insert(hash.clone(), entry.login.clone()) {
                    anyhow::bail!("public key {} is registered for both '{}' and '{}'", hash, previous, entry.login);
                }
            }
            let access_token = match (entry.vcs_access_token_sha256, entry.vcs_access_token_expires) {
                (Some(hash), Some(expires)) => Some((hash.to_ascii_lowercase(), expires)),
                (Some(_), None) => anyhow::bail!("access token of '{}' has no vcs_access_token_expires", entry.login),
                (None, _) => None,
            };
            users.insert(
                entry.login.clone(),
                StoredUser {
                    user: User {
                        login: entry.login,
                        name: entry.name,
                    },
                    password_sha256: entry.password_sha256.map(|h| h.to_ascii_lowercase()),
                    access_token,
                },
            );
        }

        let courses = file
            .courses
            .into_iter()
            .map(|entry| {
                let mut roles = HashMap::new();
                // Later lists win, so the highest listed role applies.
                for (members, role) in [
                    (&entry.students, CourseRole::Student),
                    (&entry.tutors, CourseRole::Tutor),
                    (&entry.editors, CourseRole::Editor),
                    (&entry.instructors, CourseRole::Instructor),
                ] {
                    for login in members {
                        roles.insert(login.clone(), role);
                    }
                }
                let course = Course {
                    short_name: entry.short_name.clone(),
                    title: entry.title,
                };
                (entry.short_name, (course, roles))
            })
            .collect();

        let exercises = file
            .exercises
            .into_iter()
            .map(|entry| {
                let branching = entry.allow_branching.map(|allow_branching| BranchingSettings {
                    allow_branching,
                    branch_regex: entry.branch_regex,
                    default_branch: entry.default_branch.unwrap_or_else(|| DEFAULT_BRANCH.to_string()),
                });
                let exercise = Exercise {
                    project_key: entry.project_key.clone(),
                    course_short_name: entry.course,
                    allow_offline_ide: entry.allow_offline_ide,
                    due_date: entry.due_date,
                    branching,
                };
                (entry.project_key, exercise)
            })
            .collect();

        let participations = file
            .participations
            .into_iter()
            .map(|entry| StoredParticipation {
                participation: Participation {
                    exercise_project_key: entry.exercise,
                    owner: parse_owner(&entry.owner),
                    test_run: entry.test_run,
                },
                token_sha256: entry
                    .vcs_access_tokens
                    .into_iter()
                    .map(|(login, hash)| (login, hash.to_ascii_lowercase()))
                    .collect(),
            })
            .collect();

        Ok(Self {
            users,
            key_owners,
            courses,
            exercises,
            participations,
        })
    }

    fn role_in_exercise_course(&self, project_key: &str, login: &str) -> Result<Option<CourseRole>, DirectoryError> {
        let exercise = self
            .exercises
            .get(project_key)
            .ok_or_else(|| DirectoryError::Unexpected(format!("participation for unknown exercise '{}'", project_key)))?;
        let (_, roles) = self.courses.get(&exercise.course_short_name).ok_or_else(|| {
            DirectoryError::Unexpected(format!("exercise '{}' references unknown course", project_key))
        })?;
        Ok(roles.get(login).copied())
    }
}

/// Hash of the `<algorithm> <base64>` part of an authorized_keys style line.
fn canonical_key_hash(key: &str) -> String {
    let canonical: Vec<&str> = key.split_whitespace().take(2).collect();
    public_key_hash(&canonical.join(" "))
}

fn digest_matches(secret: &str, stored_sha256: &str) -> bool {
    let presented = hex::encode(Sha256::digest(secret.as_bytes()));
    presented.as_bytes().ct_eq(stored_sha256.as_bytes()).into()
}

#[async_trait]
impl UserDirectory for FileDirectory {
    async fn verify_password(&self, login: &str, password: &str) -> Result<bool, DirectoryError> {
        let Some(stored) = self.users.get(login).and_then(|u| u.password_sha256.as_ref()) else {
            return Ok(false);
        };
        Ok(digest_matches(password, stored))
    }

    async fn verify_access_token(&self, login: &str, token: &str) -> Result<Option<AccessTokenScope>, DirectoryError> {
        let stored = self
            .users
            .get(login)
            .ok_or_else(|| DirectoryError::NotFound(format!("user '{}'", login)))?;

        if let Some((hash, expires)) = &stored.access_token {
            if Utc::now() < *expires && digest_matches(token, hash) {
                return Ok(Some(AccessTokenScope::User));
            }
        }

        let participation = self.participations.iter().find(|stored| {
            stored
                .token_sha256
                .get(login)
                .is_some_and(|hash| digest_matches(token, hash))
        });
        Ok(participation.map(|stored| AccessTokenScope::Participation(stored.participation.clone())))
    }

    async fn find_user_by_login(&self, login: &str) -> Result<User, DirectoryError> {
        self.users
            .get(login)
            .map(|stored| stored.user.clone())
            .ok_or_else(|| DirectoryError::NotFound(format!("user '{}'", login)))
    }

    async fn find_user_by_key_hash(&self, key_hash: &str) -> Result<User, DirectoryError> {
        let login = self
            .key_owners
            .get(&key_hash.to_ascii_lowercase())
            .ok_or_else(|| DirectoryError::NotFound(format!("public key {}", key_hash)))?;
        self.find_user_by_login(login).await
    }
}

#[async_trait]
impl ExerciseDirectory for FileDirectory {
    async fn find_course(&self, short_name: &str) -> Result<Course, DirectoryError> {
        self.courses
            .get(short_name)
            .map(|(course, _)| course.clone())
            .ok_or_else(|| DirectoryError::NotFound(format!("course '{}'", short_name)))
    }

    async fn find_exercise(&self, project_key: &str) -> Result<Exercise, DirectoryError> {
        self.exercises
            .get(project_key)
            .cloned()
            .ok_or_else(|| DirectoryError::NotFound(format!("exercise '{}'", project_key)))
    }

    async fn course_role(&self, course: &Course, login: &str) -> Result<Option<CourseRole>, DirectoryError> {
        let (_, roles) = self
            .courses
            .get(&course.short_name)
            .ok_or_else(|| DirectoryError::NotFound(format!("course '{}'", course.short_name)))?;
        Ok(roles.get(login).copied())
    }

    async fn find_participation(
        &self,
        exercise: &Exercise,
        owner: &ParticipationOwner,
        test_run: bool,
    ) -> Result<Participation, DirectoryError> {
        let mut matches = self.participations.iter().map(|stored| &stored.participation).filter(|p| {
            p.exercise_project_key == exercise.project_key
                && &p.owner == owner
                && (owner.is_fixed() || p.test_run == test_run)
        });
        match (matches.next(), matches.next()) {
            (Some(participation), None) => Ok(participation.clone()),
            (None, _) => Err(DirectoryError::NotFound(format!(
                "participation {:?} (test run: {}) in '{}'",
                owner, test_run, exercise.project_key
            ))),
            (Some(_), Some(_)) => Err(DirectoryError::Unexpected(format!(
                "ambiguous participation {:?} in '{}'",
                owner, exercise.project_key
            ))),
        }
    }

    async fn check_participation_access(
        &self,
        participation: &Participation,
        login: &str,
        action: RepositoryAction,
    ) -> Result<(), DirectoryError> {
        let role = self.role_in_exercise_course(&participation.exercise_project_key, login)?;
        let at_least = |required: CourseRole| role.is_some_and(|r| r.at_least(required));

        let allowed = match (&participation.owner, action) {
            (owner, RepositoryAction::Read) if owner.is_fixed() => at_least(CourseRole::Tutor),
            (owner, RepositoryAction::Write) if owner.is_fixed() => at_least(CourseRole::Editor),
            (ParticipationOwner::Student(owner), RepositoryAction::Read) => owner == login || at_least(CourseRole::Tutor),
            (ParticipationOwner::Student(owner), RepositoryAction::Write) => {
                let before_due = participation.test_run
                    || self
                        .exercises
                        .get(&participation.exercise_project_key)
                        .and_then(|e| e.due_date)
                        .map_or(true, |due| Utc::now() < due);
                (owner == login && before_due) || at_least(CourseRole::Instructor)
            }
            _ => false,
        };

        if allowed {
            Ok(())
        } else {
            Err(DirectoryError::Forbidden(format!(
                "'{}' may not {} the {:?} repository of '{}'",
                login, action, participation.owner, participation.exercise_project_key
            )))
        }
    }
}
