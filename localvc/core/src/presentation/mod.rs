// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Presentation Layer (`localvc-core`)
//!
//! Git transports that translate client connections into application service
//! calls. Both transports share one [`GitServices`] bundle so a push runs the
//! same hooks no matter how it arrived.
//!
//! | Module | Transport | Description |
//! |--------|-----------|-------------|
//! | [`http`] | Smart HTTP (Axum) | `info/refs`, `git-upload-pack`, `git-receive-pack` behind an access filter |
//! | [`ssh`] | SSH (russh) | Public-key sessions, one git command per channel |

pub mod http;
pub mod ssh;

use std::net::IpAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::warn;
use url::Url;

use crate::application::{
    AccessAuthorizer, AuthRateLimiter, BranchRule, BuildTrigger, CredentialAuthenticator, PushPolicy,
};
use crate::domain::access::{AccessLog, AccessLogEntry, GitAccessError};
use crate::domain::build::RepositoryHandle;
use crate::domain::directory::ExerciseDirectory;
use crate::domain::identity::{Identity, RepositoryAction};
use crate::domain::locator::RepositoryLocator;
use crate::domain::push::{RefInspector, RefUpdateCommand};
use crate::infrastructure::protocol::{ProtocolEngine, ProtocolError, ReceiveHooks, ReceiveReport};
use crate::infrastructure::repository_store::RepositoryStore;

/// Everything a transport needs to serve one git command.
pub struct GitServices {
    pub base_url: Url,
    pub store: RepositoryStore,
    pub engine: ProtocolEngine,
    pub authenticator: Arc<dyn CredentialAuthenticator>,
    pub authorizer: Arc<dyn AccessAuthorizer>,
    pub auth_limiter: AuthRateLimiter,
    pub access_log: Arc<dyn AccessLog>,
    /// Source of each exercise's branching rules.
    pub exercises: Arc<dyn ExerciseDirectory>,
    pub policy: PushPolicy,
    pub trigger: Arc<BuildTrigger>,
}

impl GitServices {
    /// Resolve a request path or SSH argument against the configured base URL.
    pub fn locate(&self, raw: &str) -> Result<RepositoryLocator, GitAccessError> {
        Ok(RepositoryLocator::from_path(self.base_url.path(), raw)?)
    }

    /// Authorize and record the decision in the access log.
    pub async fn authorize(
        &self,
        identity: &Identity,
        locator: &RepositoryLocator,
        action: RepositoryAction,
        peer: Option<IpAddr>,
    ) -> Result<(), GitAccessError> {
        let decision = self.authorizer.authorize(identity, locator, action).await;
        let entry = AccessLogEntry::new(identity, locator, action, decision.is_ok(), peer);
        self.access_log.record(&entry);
        decision
    }

    /// Push policy with the branching rules of the addressed exercise.
    /// Branch creation is limited to `main` if the exercise cannot be read.
    pub async fn policy_for(&self, locator: &RepositoryLocator) -> PushPolicy {
        let rule = match self.exercises.find_exercise(&locator.project_key).await {
            Ok(exercise) => BranchRule::from_settings(exercise.branching.as_ref()),
            Err(e) => {
                warn!("Branching rules for {} unavailable: {}", locator, e);
                BranchRule::DefaultOnly("main".to_string())
            }
        };
        self.policy.clone().with_branching(rule)
    }

    /// Receive a push with the push policy as pre-receive and the build
    /// trigger as post-receive hook.
    pub async fn receive_pack<R, W>(
        &self,
        repository: &RepositoryHandle,
        input: &mut R,
        output: &mut W,
        advertise: bool,
    ) -> Result<ReceiveReport, ProtocolError>
    where
        R: AsyncRead + Unpin + Send,
        W: AsyncWrite + Unpin + Send,
    {
        let policy = self.policy_for(&repository.locator).await;
        let trigger = &self.trigger;
        let hooks = ReceiveHooks::new(
            move |commands: &mut [RefUpdateCommand], inspector: &dyn RefInspector| {
                policy.enforce(commands, inspector);
            },
            move |applied: &[RefUpdateCommand]| {
                trigger.on_post_receive(applied, repository);
            },
        );
        self.engine
            .receive_pack(&repository.path, input, output, advertise, hooks)
            .await
    }
}
