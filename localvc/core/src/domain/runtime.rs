// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::domain::server_config::ConfigError;

const NANO_CPUS_PER_CPU: f64 = 1_000_000_000.0;

/// Per-container resource limits, parsed once at startup and shared read-only.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContainerResourceLimits {
    pub cpu_count: f64,
    pub memory_bytes: i64,
    /// `-1` means unlimited swap.
    pub memory_swap_bytes: i64,
    pub pids_limit: i64,
}

impl Default for ContainerResourceLimits {
    fn default() -> Self {
        Self {
            cpu_count: 2.0,
            memory_bytes: 2 * 1024 * 1024 * 1024,
            memory_swap_bytes: 2 * 1024 * 1024 * 1024,
            pids_limit: 1000,
        }
    }
}

impl ContainerResourceLimits {
    /// Parse a flat docker-style flag list such as
    /// `["--cpus", "2", "--memory", "2g", "--memory-swap=2g", "--pids-limit", "1000"]`.
    ///
    /// Flags not present keep their defaults. An unknown flag or a missing value fails.
    pub fn from_flags<S: AsRef<str>>(flags: &[S]) -> Result<Self, ConfigError> {
        let mut limits = Self::default();
        let mut iter = flags.iter().map(AsRef::as_ref);

        while let Some(token) = iter.next() {
            let (flag, inline_value) = match token.split_once('=') {
                Some((flag, value)) => (flag, Some(value)),
                None => (token, None),
            };
            if !matches!(flag, "--cpus" | "--memory" | "-m" | "--memory-swap" | "--pids-limit") {
                return Err(ConfigError::UnknownContainerFlag(token.to_string()));
            }
            let value = match inline_value {
                Some(value) => value,
                None => iter
                    .next()
                    .filter(|v| !v.starts_with("--"))
                    .ok_or_else(|| ConfigError::MissingFlagValue(flag.to_string()))?,
            };
            let invalid = || ConfigError::InvalidFlagValue {
                flag: flag.to_string(),
                value: value.to_string(),
            };

            match flag {
                "--cpus" => {
                    let cpus: f64 = value.parse().map_err(|_| invalid())?;
                    if !cpus.is_finite() || cpus <= 0.0 {
                        return Err(invalid());
                    }
                    limits.cpu_count = cpus;
                }
                "--memory" | "-m" => limits.memory_bytes = parse_size(value).ok_or_else(invalid)?,
                "--memory-swap" => {
                    limits.memory_swap_bytes = if value == "-1" {
                        -1
                    } else {
                        parse_size(value).ok_or_else(invalid)?
                    }
                }
                _ => {
                    let pids: i64 = value.parse().map_err(|_| invalid())?;
                    if pids == 0 || pids < -1 {
                        return Err(invalid());
                    }
                    limits.pids_limit = pids;
                }
            }
        }

        Ok(limits)
    }

    /// CPU limit in the unit Docker expects (`1e9` per CPU).
    pub fn nano_cpus(&self) -> i64 {
        (self.cpu_count * NANO_CPUS_PER_CPU).round() as i64
    }
}

/// Parse a docker size (`512m`, `2g`, `1048576`, `64k`, `10b`) into bytes.
fn parse_size(value: &str) -> Option<i64> {
    let value = value.trim().to_ascii_lowercase();
    let (digits, multiplier) = match value.char_indices().last()? {
        (idx, 'b') => (&value[..idx], 1),
        (idx, 'k') => (&value[..idx], 1024),
        (idx, 'm') => (&value[..idx], 1024 * 1024),
        (idx, 'g') => (&value[..idx], 1024 * 1024 * 1024),
        _ => (value.as_str(), 1),
    };
    let amount: i64 = digits.parse().ok()?;
    if amount <= 0 {
        return None;
    }
    amount.checked_mul(multiplier)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindMount {
    pub host_path: PathBuf,
    pub container_path: String,
    pub read_only: bool,
}

impl BindMount {
    /// Docker `binds` entry (`host:container[:ro]`).
    pub fn to_bind_spec(&self) -> String {
        let mode = if self.read_only { ":ro" } else { "" };
        format!("{}:{}{}", self.host_path.display(), self.container_path, mode)
    }
}

/// One container run: create, start, collect output, remove.
#[derive(Debug, Clone)]
pub struct ContainerRequest {
    pub name: String,
    pub image: String,
    pub script: String,
    pub env: HashMap<String, String>,
    pub binds: Vec<BindMount>,
    pub limits: ContainerResourceLimits,
    pub network_disabled: bool,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerOutput {
    pub exit_code: i64,
    pub logs: Vec<String>,
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Image unavailable: {0}")]
    ImageUnavailable(String),
    #[error("Failed to spawn container: {0}")]
    SpawnFailed(String),
    #[error("Failed to execute build: {0}")]
    ExecutionFailed(String),
    #[error("Build exceeded timeout of {0:?}")]
    TimedOut(Duration),
    #[error("Failed to remove container: {0}")]
    RemovalFailed(String),
}

/// Contract used against the container runtime.
///
/// Implementations must remove the container on every exit path.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn run(&self, request: ContainerRequest) -> Result<ContainerOutput, RuntimeError>;
}
