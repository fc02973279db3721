// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod pkt_line;
pub mod protocol;
pub mod repository_store;
pub mod docker;
pub mod directory;

pub use directory::FileDirectory;
pub use docker::DockerRuntime;
pub use protocol::{GitService, ProtocolEngine, ProtocolError, ReceiveHooks, ReceiveReport};
pub use repository_store::RepositoryStore;
