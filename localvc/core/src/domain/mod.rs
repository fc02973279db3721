// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain types shared by both transports and the build pipeline.
//!
//! # Architecture
//!
//! - **Layer:** Domain Layer
//! - **Purpose:** Pure types and collaborator contracts, no I/O

pub mod locator;
pub mod identity;
pub mod access;
pub mod directory;
pub mod push;
pub mod build;
pub mod runtime;
pub mod server_config;
