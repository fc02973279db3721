// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for localvc CLI

pub mod config;
pub mod key_hash;
pub mod repo;
pub mod serve;

pub use self::config::ConfigCommand;
pub use self::repo::RepoCommand;
