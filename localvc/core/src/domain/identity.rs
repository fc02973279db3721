// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::directory::Participation;

/// How an identity proved itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CredentialProof {
    Password,
    /// SHA-256 hex digest of the canonical `<algorithm> <base64>` key string.
    PublicKey(String),
    /// The user's personal VCS access token.
    UserToken,
    /// A token that is only valid for this one participation.
    ParticipationToken(Participation),
    /// Shared read-only credentials of the build agents.
    BuildAgent,
}

impl CredentialProof {
    /// Label used in the access log.
    pub fn mechanism(&self) -> &'static str {
        match self {
            Self::Password => "password",
            Self::PublicKey(_) => "ssh",
            Self::UserToken => "user_token",
            Self::ParticipationToken(_) => "participation_token",
            Self::BuildAgent => "build_agent",
        }
    }
}

/// An authenticated user.
///
/// Resolved once per HTTP request and once per SSH connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub login: String,
    pub proof: CredentialProof,
}

impl Identity {
    pub fn with_password(login: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            proof: CredentialProof::Password,
        }
    }

    pub fn with_public_key(login: impl Into<String>, key_hash: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            proof: CredentialProof::PublicKey(key_hash.into()),
        }
    }

    pub fn build_agent(login: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            proof: CredentialProof::BuildAgent,
        }
    }
}

/// Requested access to a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RepositoryAction {
    Read,
    Write,
}

impl fmt::Display for RepositoryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "READ"),
            Self::Write => write!(f, "WRITE"),
        }
    }
}
