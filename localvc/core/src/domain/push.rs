// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Ref update commands as received in one push.
//!
//! The set of commands of one push is the unit of policy evaluation. A rejected
//! command carries its reason as a result value; it is never an error.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Hex-encoded SHA-1 object id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectId(String);

impl ObjectId {
    pub const HEX_LEN: usize = 40;

    pub fn zero() -> Self {
        Self("0".repeat(Self::HEX_LEN))
    }

    /// Parse a 40 character hex id, normalising to lower case.
    pub fn parse(hex: &str) -> Option<Self> {
        if hex.len() == Self::HEX_LEN && hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            Some(Self(hex.to_ascii_lowercase()))
        } else {
            None
        }
    }

    pub fn is_zero(&self) -> bool {
        self.0.bytes().all(|b| b == b'0')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefUpdateType {
    Create,
    Update,
    UpdateNonFastForward,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandResult {
    NotAttempted,
    Ok,
    Rejected(String),
}

/// Why the pre-receive policy refused a command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PushRejection {
    #[error("multiple commands not allowed")]
    MultipleCommands,

    #[error("no delete")]
    NoDelete,

    #[error("no force push")]
    NoForcePush,

    #[error("no rename")]
    NoRename,

    #[error("could not inspect existing ref")]
    InspectFailed,

    #[error("stale old object id")]
    StaleOldObjectId,

    #[error("branching not allowed")]
    BranchingDisabled,

    #[error("branch name not allowed")]
    BranchNameNotAllowed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefUpdateCommand {
    pub ref_name: String,
    pub old_id: ObjectId,
    pub new_id: ObjectId,
    pub update_type: RefUpdateType,
    pub result: CommandResult,
}

impl RefUpdateCommand {
    pub fn new(ref_name: impl Into<String>, old_id: ObjectId, new_id: ObjectId, update_type: RefUpdateType) -> Self {
        Self {
            ref_name: ref_name.into(),
            old_id,
            new_id,
            update_type,
            result: CommandResult::NotAttempted,
        }
    }

    pub fn reject(&mut self, reason: impl Into<String>) {
        self.result = CommandResult::Rejected(reason.into());
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self.result, CommandResult::Rejected(_))
    }

    pub fn rejection_reason(&self) -> Option<&str> {
        match &self.result {
            CommandResult::Rejected(reason) => Some(reason),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
#[error("failed to inspect ref '{ref_name}': {message}")]
pub struct RefInspectError {
    pub ref_name: String,
    pub message: String,
}

/// Read access to the current ref state of the repository being pushed to.
pub trait RefInspector {
    /// Current target of `ref_name`, `None` if the ref does not exist.
    fn current(&self, ref_name: &str) -> Result<Option<ObjectId>, RefInspectError>;
}
