// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Build Trigger (post-receive)
//!
//! Runs after refs are durably applied. Only a single fast-forward update of
//! an existing branch produces a build; everything else is a logged no-op.
//! The handoff to the scheduler never waits for the build.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::domain::build::{BuildJobRequest, BuildSubmitter, PushListener, RepositoryHandle};
use crate::domain::push::{RefUpdateCommand, RefUpdateType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    NoCommands,
    /// More than one command reached post-receive.
    MultipleCommands,
    /// Creation, deletion or forced update; never builds.
    NotAnUpdate,
    Submitted,
    SchedulerRejected,
}

pub struct BuildTrigger {
    listener: Option<Arc<dyn PushListener>>,
    submitter: Arc<dyn BuildSubmitter>,
}

impl BuildTrigger {
    pub fn new(submitter: Arc<dyn BuildSubmitter>) -> Self {
        Self {
            listener: None,
            submitter,
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn PushListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn on_post_receive(&self, commands: &[RefUpdateCommand], repository: &RepositoryHandle) -> TriggerOutcome {
        let command = match commands {
            [] => {
                debug!("Post-receive for {} without commands", repository.locator);
                return TriggerOutcome::NoCommands;
            }
            [command] => command,
            _ => {
                warn!(
                    "Post-receive for {} rejected: only one command expected, got {}",
                    repository.locator,
                    commands.len()
                );
                return TriggerOutcome::MultipleCommands;
            }
        };

        if command.update_type != RefUpdateType::Update {
            debug!(
                "Skipping build for {} {:?} on {}",
                command.ref_name, command.update_type, repository.locator
            );
            return TriggerOutcome::NotAnUpdate;
        }

        let commit_hash = command.new_id.clone();
        if let Some(listener) = &self.listener {
            listener.on_push(&commit_hash, repository);
        }

        let request = BuildJobRequest::new(commit_hash.clone(), repository.clone());
        match self.submitter.submit(request) {
            Ok(()) => {
                info!("Queued build of {} for {}", commit_hash, repository.locator);
                TriggerOutcome::Submitted
            }
            Err(rejection) => {
                warn!("{}", rejection);
                TriggerOutcome::SchedulerRejected
            }
        }
    }
}
