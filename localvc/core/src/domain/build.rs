// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Build jobs and their results.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::LazyLock;
use thiserror::Error;

use crate::domain::locator::RepositoryLocator;
use crate::domain::push::ObjectId;

static SUREFIRE_SUMMARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Tests run:\s*(\d+),\s*Failures:\s*(\d+),\s*Errors:\s*(\d+)")
        .expect("test summary pattern is valid")
});

/// A repository on disk together with its decomposed address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryHandle {
    pub locator: RepositoryLocator,
    pub path: PathBuf,
}

/// A request to build one pushed commit. Consumed exactly once by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildJobRequest {
    pub commit_hash: ObjectId,
    pub repository: RepositoryHandle,
    pub enqueued_at: DateTime<Utc>,
}

impl BuildJobRequest {
    pub fn new(commit_hash: ObjectId, repository: RepositoryHandle) -> Self {
        Self {
            commit_hash,
            repository,
            enqueued_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSummary {
    pub tests_run: u32,
    pub failures: u32,
    pub errors: u32,
}

impl TestSummary {
    /// Extract the last `Tests run: X, Failures: Y, Errors: Z` line from build output.
    pub fn parse(logs: &[String]) -> Option<Self> {
        logs.iter().rev().find_map(|line| {
            let caps = SUREFIRE_SUMMARY.captures(line)?;
            Some(Self {
                tests_run: caps[1].parse().ok()?,
                failures: caps[2].parse().ok()?,
                errors: caps[3].parse().ok()?,
            })
        })
    }

    pub fn passed(&self) -> u32 {
        self.tests_run
            .saturating_sub(self.failures.saturating_add(self.errors))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildResult {
    pub commit_hash: ObjectId,
    pub repository: RepositoryHandle,
    pub exit_code: i64,
    pub success: bool,
    pub tests: Option<TestSummary>,
    pub logs: Vec<String>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// The scheduler had no free worker or pending slot.
#[derive(Debug, Clone, Error)]
#[error("build for commit {commit_hash} rejected: scheduler is saturated ({capacity} running, 1 pending)")]
pub struct SchedulingRejection {
    pub commit_hash: ObjectId,
    pub capacity: usize,
}

/// Notified after refs of an eligible push are durably applied.
pub trait PushListener: Send + Sync {
    fn on_push(&self, commit_hash: &ObjectId, repository: &RepositoryHandle);
}

/// Non-blocking handoff of a build request.
pub trait BuildSubmitter: Send + Sync {
    fn submit(&self, request: BuildJobRequest) -> Result<(), SchedulingRejection>;
}

/// Receives the outcome of every finished build.
pub trait BuildResultSink: Send + Sync {
    fn on_result(&self, result: &BuildResult);

    fn on_failure(&self, request: &BuildJobRequest, error: &str);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_takes_last_total() {
        let logs = vec![
            "[INFO] Tests run: 2, Failures: 0, Errors: 0, Skipped: 0".to_string(),
            "[INFO] Results:".to_string(),
            "[ERROR] Tests run: 7, Failures: 2, Errors: 1, Skipped: 0".to_string(),
            "[INFO] BUILD FAILURE".to_string(),
        ];
        let summary = TestSummary::parse(&logs).unwrap();
        assert_eq!(summary.tests_run, 7);
        assert_eq!(summary.failures, 2);
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.passed(), 4);
    }

    #[test]
    fn test_passed_with_oversized_counts() {
        let summary = TestSummary::parse(&[
            "Tests run: 3, Failures: 4294967295, Errors: 4294967295".to_string()
        ])
        .unwrap();
        assert_eq!(summary.passed(), 0);
    }

    #[test]
    fn test_summary_absent() {
        assert!(TestSummary::parse(&["compiling".to_string()]).is_none());
    }
}
