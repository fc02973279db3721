// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Push Policy Enforcer (pre-receive)
//!
//! Runs inside the protocol engine before any ref is touched. Each command is
//! checked against the rules below in order; the first violation becomes the
//! command's result. Rejections are values, not errors.
//!
//! | Rule | Reason |
//! |------|--------|
//! | not the first command of the push | `multiple commands not allowed` |
//! | new id is zero | `no delete` |
//! | non-fast-forward update | `no force push` |
//! | ref outside `refs/heads/` | `no rename` |
//! | new branch while the exercise disables branching | `branching not allowed` |
//! | new branch not matching the exercise's pattern | `branch name not allowed` |
//! | current ref cannot be read | `could not inspect existing ref` |
//! | current ref differs from old id | `stale old object id` |

use regex::Regex;
use tracing::{info, warn};

use crate::domain::directory::BranchingSettings;
use crate::domain::push::{ObjectId, PushRejection, RefInspector, RefUpdateCommand, RefUpdateType};

pub const BRANCH_PREFIX: &str = "refs/heads/";

/// Which new branches a push may create. The default branch is always allowed.
#[derive(Debug, Clone, Default)]
pub enum BranchRule {
    #[default]
    Unrestricted,
    DefaultOnly(String),
    /// `pattern` is `None` when the configured expression does not compile; nothing matches then.
    Matching {
        default_branch: String,
        pattern: Option<Regex>,
    },
}

impl BranchRule {
    pub fn from_settings(settings: Option<&BranchingSettings>) -> Self {
        let Some(settings) = settings else {
            return Self::Unrestricted;
        };
        let default_branch = settings.default_branch.clone();
        match (&settings.branch_regex, settings.allow_branching) {
            (Some(expression), true) => {
                let pattern = Regex::new(&format!("^(?:{})$", expression))
                    .map_err(|e| warn!("Ignoring invalid branch pattern '{}': {}", expression, e))
                    .ok();
                Self::Matching { default_branch, pattern }
            }
            _ => Self::DefaultOnly(default_branch),
        }
    }

    fn check(&self, branch: &str) -> Option<PushRejection> {
        match self {
            Self::Unrestricted => None,
            Self::DefaultOnly(default_branch) => (branch != default_branch).then_some(PushRejection::BranchingDisabled),
            Self::Matching { default_branch, pattern } => {
                let allowed = branch == default_branch || pattern.as_ref().is_some_and(|p| p.is_match(branch));
                (!allowed).then_some(PushRejection::BranchNameNotAllowed)
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PushPolicy {
    branching: BranchRule,
}

impl PushPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_branching(mut self, branching: BranchRule) -> Self {
        self.branching = branching;
        self
    }

    /// First rule the command at `index` violates, if any.
    pub fn check(
        &self,
        index: usize,
        command: &RefUpdateCommand,
        inspector: &dyn RefInspector,
    ) -> Option<PushRejection> {
        if index >= 1 {
            return Some(PushRejection::MultipleCommands);
        }
        if command.new_id.is_zero() {
            return Some(PushRejection::NoDelete);
        }
        if command.update_type == RefUpdateType::UpdateNonFastForward {
            return Some(PushRejection::NoForcePush);
        }
        let Some(branch) = command.ref_name.strip_prefix(BRANCH_PREFIX) else {
            return Some(PushRejection::NoRename);
        };
        if command.old_id.is_zero() {
            if let Some(rejection) = self.branching.check(branch) {
                return Some(rejection);
            }
        }

        match inspector.current(&command.ref_name) {
            Err(e) => {
                warn!("Rejecting push to {}: {}", command.ref_name, e);
                Some(PushRejection::InspectFailed)
            }
            Ok(current) => {
                let current = current.unwrap_or_else(ObjectId::zero);
                (current != command.old_id).then_some(PushRejection::StaleOldObjectId)
            }
        }
    }

    /// Evaluate the whole command set, recording rejections on the commands.
    /// Commands already rejected by the engine keep their reason.
    /// Returns the number of rejected commands.
    pub fn enforce(&self, commands: &mut [RefUpdateCommand], inspector: &dyn RefInspector) -> usize {
        let mut rejected = 0;
        for (index, command) in commands.iter_mut().enumerate() {
            if command.is_rejected() {
                rejected += 1;
                continue;
            }
            if let Some(rejection) = self.check(index, command, inspector) {
                info!("Push policy rejected {}: {}", command.ref_name, rejection);
                metrics::counter!("localvc_push_rejected_total", "reason" => rejection.to_string()).increment(1);
                command.reject(rejection.to_string());
                rejected += 1;
            }
        }
        rejected
    }
}
