// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Access failures shared by both transports.
//!
//! An access decision is `Result<(), GitAccessError>`: computed per request
//! and never cached. HTTP maps each variant to a status code, SSH collapses
//! all of them into one generic denial.
//!
//! Authorization decisions of authenticated users end up in the [`AccessLog`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;
use thiserror::Error;

use crate::domain::directory::DirectoryError;
use crate::domain::identity::{Identity, RepositoryAction};
use crate::domain::locator::{LocatorError, RepositoryLocator};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GitAccessError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("too many failed attempts: {0}")]
    RateLimited(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GitAccessError {
    /// HTTP status code for this failure.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::BadRequest(_) => 400,
            Self::Authentication(_) => 401,
            Self::Forbidden(_) => 403,
            Self::RateLimited(_) => 429,
            Self::Internal(_) => 500,
        }
    }

    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "bad_request",
            Self::Authentication(_) => "authentication",
            Self::Forbidden(_) => "forbidden",
            Self::RateLimited(_) => "rate_limited",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<LocatorError> for GitAccessError {
    fn from(err: LocatorError) -> Self {
        Self::BadRequest(err.to_string())
    }
}

impl From<DirectoryError> for GitAccessError {
    fn from(err: DirectoryError) -> Self {
        match err {
            DirectoryError::Forbidden(msg) => Self::Forbidden(msg),
            DirectoryError::NotFound(msg) | DirectoryError::Unexpected(msg) => Self::Internal(msg),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessOutcome {
    Pull,
    Push,
    CloneFail,
    PushFail,
}

impl AccessOutcome {
    pub fn of(action: RepositoryAction, granted: bool) -> Self {
        match (action, granted) {
            (RepositoryAction::Read, true) => Self::Pull,
            (RepositoryAction::Write, true) => Self::Push,
            (RepositoryAction::Read, false) => Self::CloneFail,
            (RepositoryAction::Write, false) => Self::PushFail,
        }
    }
}

impl fmt::Display for AccessOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pull => "PULL",
            Self::Push => "PUSH",
            Self::CloneFail => "CLONE_FAIL",
            Self::PushFail => "PUSH_FAIL",
        };
        f.write_str(name)
    }
}

/// One authorization decision for an authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccessLogEntry {
    pub login: String,
    pub mechanism: &'static str,
    pub repository: String,
    pub outcome: AccessOutcome,
    pub peer: Option<IpAddr>,
    pub at: DateTime<Utc>,
}

impl AccessLogEntry {
    pub fn new(
        identity: &Identity,
        locator: &RepositoryLocator,
        action: RepositoryAction,
        granted: bool,
        peer: Option<IpAddr>,
    ) -> Self {
        Self {
            login: identity.login.clone(),
            mechanism: identity.proof.mechanism(),
            repository: locator.to_string(),
            outcome: AccessOutcome::of(action, granted),
            peer,
            at: Utc::now(),
        }
    }
}

pub trait AccessLog: Send + Sync {
    fn record(&self, entry: &AccessLogEntry);
}
