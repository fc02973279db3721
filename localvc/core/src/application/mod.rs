// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod access_log;
pub mod authentication;
pub mod authorization;
pub mod push_policy;
pub mod build_trigger;
pub mod rate_limit;
pub mod scheduler;

pub use access_log::TracingAccessLog;
pub use authentication::{
    BuildAgentCredentials, CredentialAuthenticator, StandardCredentialAuthenticator, public_key_hash,
};
pub use authorization::{AccessAuthorizer, StandardAccessAuthorizer};
pub use build_trigger::{BuildTrigger, TriggerOutcome};
pub use push_policy::{BranchRule, PushPolicy};
pub use rate_limit::AuthRateLimiter;
pub use scheduler::{BuildJobScheduler, BuildSettings, TracingResultSink};
