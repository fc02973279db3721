// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Access Authorizer
//!
//! Decides whether an authenticated identity may read or write a repository.
//! Build agent credentials may read every repository and write none. For
//! everyone else checks run in a fixed order and the first failure wins:
//!
//! 1. course exists (otherwise `Internal`)
//! 2. exercise exists and belongs to that course (otherwise `Internal`)
//! 3. offline IDE usage is allowed for the exercise (otherwise `Forbidden`, for every role)
//! 4. a participation token addresses its own participation (otherwise `Authentication`)
//! 5. role or participation check for the addressed repository
//!
//! Nothing is cached; every call reads the current directory state.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::domain::access::GitAccessError;
use crate::domain::directory::{Course, CourseRole, Exercise, ExerciseDirectory, Participation, ParticipationOwner};
use crate::domain::identity::{CredentialProof, Identity, RepositoryAction};
use crate::domain::locator::{RepositoryLocator, RepositoryRole};

#[async_trait]
pub trait AccessAuthorizer: Send + Sync {
    async fn authorize(
        &self,
        identity: &Identity,
        locator: &RepositoryLocator,
        action: RepositoryAction,
    ) -> Result<(), GitAccessError>;
}

pub struct StandardAccessAuthorizer {
    directory: Arc<dyn ExerciseDirectory>,
}

impl StandardAccessAuthorizer {
    pub fn new(directory: Arc<dyn ExerciseDirectory>) -> Self {
        Self { directory }
    }

    async fn resolve_exercise(&self, locator: &RepositoryLocator) -> Result<(Course, Exercise), GitAccessError> {
        let course = self.directory.find_course(&locator.course_short_name).await.map_err(|e| {
            GitAccessError::Internal(format!("course '{}' could not be resolved: {}", locator.course_short_name, e))
        })?;

        let exercise = self.directory.find_exercise(&locator.project_key).await.map_err(|e| {
            GitAccessError::Internal(format!("exercise '{}' could not be resolved: {}", locator.project_key, e))
        })?;

        if exercise.course_short_name != course.short_name {
            return Err(GitAccessError::Internal(format!(
                "exercise '{}' belongs to course '{}', not '{}'",
                exercise.project_key, exercise.course_short_name, course.short_name
            )));
        }

        Ok((course, exercise))
    }

    async fn check_repository(
        &self,
        identity: &Identity,
        locator: &RepositoryLocator,
        course: &Course,
        exercise: &Exercise,
        action: RepositoryAction,
    ) -> Result<(), GitAccessError> {
        let (owner, test_run) = match &locator.role {
            RepositoryRole::Tests => {
                check_token_scope(identity, None, locator)?;
                let role = self.directory.course_role(course, &identity.login).await?;
                return match role {
                    Some(role) if role.at_least(CourseRole::Editor) => Ok(()),
                    _ => Err(GitAccessError::Forbidden(format!(
                        "'{}' needs at least editor rights for the tests repository",
                        identity.login
                    ))),
                };
            }
            RepositoryRole::Template => (ParticipationOwner::Template, false),
            RepositoryRole::Solution => (ParticipationOwner::Solution, false),
            RepositoryRole::User(login) => (ParticipationOwner::Student(login.clone()), locator.is_test_run),
        };

        let participation = self
            .directory
            .find_participation(exercise, &owner, test_run)
            .await
            .map_err(|e| GitAccessError::Internal(format!("no participation for {}: {}", locator, e)))?;
        check_token_scope(identity, Some(&participation), locator)?;

        self.directory
            .check_participation_access(&participation, &identity.login, action)
            .await
            .map_err(GitAccessError::from)
    }
}

fn check_token_scope(
    identity: &Identity,
    participation: Option<&Participation>,
    locator: &RepositoryLocator,
) -> Result<(), GitAccessError> {
    match &identity.proof {
        CredentialProof::ParticipationToken(scope) if Some(scope) != participation => {
            Err(GitAccessError::Authentication(format!(
                "access token of '{}' is not valid for {}",
                identity.login, locator
            )))
        }
        _ => Ok(()),
    }
}

#[async_trait]
impl AccessAuthorizer for StandardAccessAuthorizer {
    async fn authorize(
        &self,
        identity: &Identity,
        locator: &RepositoryLocator,
        action: RepositoryAction,
    ) -> Result<(), GitAccessError> {
        if identity.proof == CredentialProof::BuildAgent {
            return match action {
                RepositoryAction::Read => Ok(()),
                RepositoryAction::Write => Err(GitAccessError::Forbidden(
                    "build agent credentials are read-only".to_string(),
                )),
            };
        }

        let started = Instant::now();
        let (course, exercise) = self.resolve_exercise(locator).await?;

        if !exercise.allow_offline_ide {
            return Err(GitAccessError::Forbidden(format!(
                "offline IDE usage is disabled for exercise '{}'",
                exercise.project_key
            )));
        }

        self.check_repository(identity, locator, &course, &exercise, action).await?;

        debug!(
            "Authorized {} for {} on {} in {:?}",
            identity.login,
            action,
            locator,
            started.elapsed()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::directory::FileDirectory;

    const DIRECTORY: &str = r#"
users: []
courses:
  - short_name: eist24
    students: [student1, student2]
    tutors: [tutor1]
    editors: [editor1]
    instructors: [instructor1]
  - short_name: other
exercises:
  - project_key: PROG1
    course: eist24
    allow_offline_ide: true
  - project_key: ONLINE
    course: eist24
    allow_offline_ide: false
  - project_key: ELSEWHERE
    course: other
    allow_offline_ide: true
participations:
  - exercise: PROG1
    owner: template
  - exercise: PROG1
    owner: solution
  - exercise: PROG1
    owner: student1
  - exercise: ONLINE
    owner: student1
"#;

    fn authorizer() -> StandardAccessAuthorizer {
        let directory = FileDirectory::from_yaml_str(DIRECTORY).unwrap();
        StandardAccessAuthorizer::new(Arc::new(directory))
    }

    fn locator(path: &str) -> RepositoryLocator {
        RepositoryLocator::from_path("/git", path).unwrap()
    }

    fn who(login: &str) -> Identity {
        Identity::with_password(login)
    }

    #[tokio::test]
    async fn test_unknown_course_is_internal() {
        let result = authorizer()
            .authorize(&who("student1"), &locator("/git/PROG1/nocourse/student1.git"), RepositoryAction::Read)
            .await;
        assert!(matches!(result, Err(GitAccessError::Internal(_))));
    }

    #[tokio::test]
    async fn test_unknown_or_foreign_exercise_is_internal() {
        let authorizer = authorizer();
        for path in ["/git/NOPE/eist24/student1.git", "/git/ELSEWHERE/eist24/student1.git"] {
            let result = authorizer.authorize(&who("student1"), &locator(path), RepositoryAction::Read).await;
            assert!(matches!(result, Err(GitAccessError::Internal(_))), "{}", path);
        }
    }

    #[tokio::test]
    async fn test_offline_ide_disabled_forbids_every_role() {
        let authorizer = authorizer();
        for login in ["student1", "tutor1", "editor1", "instructor1"] {
            for action in [RepositoryAction::Read, RepositoryAction::Write] {
                let result = authorizer
                    .authorize(&who(login), &locator("/git/ONLINE/eist24/student1.git"), action)
                    .await;
                assert!(matches!(result, Err(GitAccessError::Forbidden(_))), "{} {}", login, action);
            }
        }
    }

    #[tokio::test]
    async fn test_tests_repository_needs_editor() {
        let authorizer = authorizer();
        let tests = locator("/git/PROG1/eist24/tests.git");
        assert!(authorizer.authorize(&who("editor1"), &tests, RepositoryAction::Write).await.is_ok());
        assert!(authorizer.authorize(&who("instructor1"), &tests, RepositoryAction::Read).await.is_ok());
        assert!(matches!(
            authorizer.authorize(&who("tutor1"), &tests, RepositoryAction::Read).await,
            Err(GitAccessError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_fixed_participations() {
        let authorizer = authorizer();
        let template = locator("/git/PROG1/eist24/exercise.git");
        assert!(authorizer.authorize(&who("tutor1"), &template, RepositoryAction::Read).await.is_ok());
        assert!(matches!(
            authorizer.authorize(&who("tutor1"), &template, RepositoryAction::Write).await,
            Err(GitAccessError::Forbidden(_))
        ));
        assert!(authorizer
            .authorize(&who("editor1"), &locator("/git/PROG1/eist24/solution.git"), RepositoryAction::Write)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_student_participation() {
        let authorizer = authorizer();
        let own = locator("/git/PROG1/eist24/student1.git");
        assert!(authorizer.authorize(&who("student1"), &own, RepositoryAction::Write).await.is_ok());
        assert!(authorizer.authorize(&who("tutor1"), &own, RepositoryAction::Read).await.is_ok());
        assert!(matches!(
            authorizer.authorize(&who("student2"), &own, RepositoryAction::Read).await,
            Err(GitAccessError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_build_agent_reads_only() {
        let authorizer = authorizer();
        let agent = Identity::build_agent("buildagent");
        for path in ["/git/PROG1/eist24/tests.git", "/git/ONLINE/eist24/student1.git"] {
            assert!(authorizer.authorize(&agent, &locator(path), RepositoryAction::Read).await.is_ok());
        }
        assert!(matches!(
            authorizer
                .authorize(&agent, &locator("/git/PROG1/eist24/student1.git"), RepositoryAction::Write)
                .await,
            Err(GitAccessError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_participation_token_bound_to_its_repository() {
        let authorizer = authorizer();
        let token = Identity {
            login: "student1".to_string(),
            proof: CredentialProof::ParticipationToken(Participation {
                exercise_project_key: "PROG1".to_string(),
                owner: ParticipationOwner::Student("student1".to_string()),
                test_run: false,
            }),
        };

        let own = locator("/git/PROG1/eist24/student1.git");
        assert!(authorizer.authorize(&token, &own, RepositoryAction::Write).await.is_ok());
        for path in ["/git/PROG1/eist24/exercise.git", "/git/PROG1/eist24/tests.git"] {
            assert!(matches!(
                authorizer.authorize(&token, &locator(path), RepositoryAction::Read).await,
                Err(GitAccessError::Authentication(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_missing_participation_is_internal() {
        let result = authorizer()
            .authorize(&who("student2"), &locator("/git/PROG1/eist24/student2.git"), RepositoryAction::Read)
            .await;
        assert!(matches!(result, Err(GitAccessError::Internal(_))));

        let practice = authorizer()
            .authorize(&who("student1"), &locator("/git/PROG1/eist24/student1-practice.git"), RepositoryAction::Read)
            .await;
        assert!(matches!(practice, Err(GitAccessError::Internal(_))));
    }
}
