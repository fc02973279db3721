// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # `localvc-core`
//!
//! Self-hosted Git transport with exercise-aware access control and a bounded
//! build scheduler.
//!
//! ## Crate Layout
//!
//! | Module | Layer | Contents |
//! |--------|-------|----------|
//! | [`domain`] | Domain | Locators, identities, ref update commands, build jobs, resource limits, configuration |
//! | [`application`] | Application | Authentication, authorization, push policy, build trigger, scheduler |
//! | [`infrastructure`] | Infrastructure | pkt-line codec, protocol engine, repository store, Docker runtime, YAML directory |
//! | [`presentation`] | Presentation | Smart HTTP router (axum) and SSH server (russh) |
//!
//! ## Request Flow
//!
//! ```text
//! client ─▶ transport ─▶ CredentialAuthenticator ─▶ AccessAuthorizer
//!                                                       │
//!        ProtocolEngine ◀───────────────────────────────┘
//!          ├─ pre-receive  (PushPolicy)
//!          ├─ objects + refs
//!          └─ post-receive (BuildTrigger ─▶ BuildJobScheduler ─▶ ContainerRuntime)
//! ```

pub mod domain;
pub mod application;
pub mod infrastructure;
pub mod presentation;

pub use domain::*;
