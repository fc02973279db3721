// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Build Job Scheduler
//!
//! Bounded executor for containerized builds. At most `N` builds run at once
//! and exactly one more may wait for a worker; any further submission is
//! rejected immediately with a [`SchedulingRejection`].
//!
//! Admission and execution are two semaphores:
//!
//! ```text
//! submit() ── try_acquire(admission: N+1) ──▶ spawn ── acquire(workers: N) ──▶ ContainerRuntime::run
//!                  │ none free
//!                  ▼
//!           SchedulingRejection
//! ```

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::domain::build::{
    BuildJobRequest, BuildResult, BuildResultSink, BuildSubmitter, SchedulingRejection, TestSummary,
};
use crate::domain::runtime::{BindMount, ContainerRequest, ContainerResourceLimits, ContainerRuntime};

/// Mount point of the pushed bare repository inside the build container.
pub const REPOSITORY_MOUNT: &str = "/repository";

/// Everything a build needs besides the job itself. Built once at startup.
#[derive(Debug, Clone)]
pub struct BuildSettings {
    pub image: String,
    pub script: String,
    pub limits: ContainerResourceLimits,
    pub network_disabled: bool,
    pub timeout: Duration,
    pub extra_env: Vec<(String, String)>,
}

pub struct BuildJobScheduler {
    capacity: usize,
    admission: Arc<Semaphore>,
    workers: Arc<Semaphore>,
    runtime: Arc<dyn ContainerRuntime>,
    sink: Arc<dyn BuildResultSink>,
    settings: Arc<BuildSettings>,
    sequence: AtomicU64,
}

impl BuildJobScheduler {
    /// `pool_size` is clamped to at least one worker.
    pub fn new(
        pool_size: usize,
        settings: BuildSettings,
        runtime: Arc<dyn ContainerRuntime>,
        sink: Arc<dyn BuildResultSink>,
    ) -> Self {
        let capacity = pool_size.max(1);
        info!(
            "Build scheduler ready: {} workers, 1 pending slot, image {}",
            capacity, settings.image
        );
        Self {
            capacity,
            admission: Arc::new(Semaphore::new(capacity + 1)),
            workers: Arc::new(Semaphore::new(capacity)),
            runtime,
            sink,
            settings: Arc::new(settings),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Free admission slots (running plus pending).
    pub fn available_slots(&self) -> usize {
        self.admission.available_permits()
    }

    fn container_request(&self, request: &BuildJobRequest) -> ContainerRequest {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        let short_hash: String = request.commit_hash.as_str().chars().take(12).collect();

        let mut env: HashMap<String, String> = self.settings.extra_env.iter().cloned().collect();
        env.insert("COMMIT_HASH".to_string(), request.commit_hash.to_string());

        ContainerRequest {
            name: format!("localvc-build-{}-{}", short_hash, sequence),
            image: self.settings.image.clone(),
            script: self.settings.script.clone(),
            env,
            binds: vec![BindMount {
                host_path: request.repository.path.clone(),
                container_path: REPOSITORY_MOUNT.to_string(),
                read_only: true,
            }],
            limits: self.settings.limits,
            network_disabled: self.settings.network_disabled,
            timeout: self.settings.timeout,
        }
    }
}

async fn run_job(
    request: BuildJobRequest,
    container: ContainerRequest,
    workers: Arc<Semaphore>,
    runtime: Arc<dyn ContainerRuntime>,
    sink: Arc<dyn BuildResultSink>,
) {
    let _worker = match workers.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Build scheduler closed before {} could start", request.commit_hash);
            return;
        }
    };

    let started_at = Utc::now();
    info!(
        "Starting build {} for {} ({})",
        container.name, request.repository.locator, request.commit_hash
    );

    match runtime.run(container).await {
        Ok(output) => {
            let result = BuildResult {
                commit_hash: request.commit_hash.clone(),
                repository: request.repository.clone(),
                exit_code: output.exit_code,
                success: output.exit_code == 0,
                tests: TestSummary::parse(&output.logs),
                logs: output.logs,
                enqueued_at: request.enqueued_at,
                started_at,
                finished_at: Utc::now(),
            };
            let status = if result.success { "success" } else { "failure" };
            metrics::counter!("localvc_builds_completed_total", "status" => status).increment(1);
            sink.on_result(&result);
        }
        Err(e) => {
            metrics::counter!("localvc_builds_completed_total", "status" => "error").increment(1);
            error!("Build of {} for {} failed: {}", request.commit_hash, request.repository.locator, e);
            sink.on_failure(&request, &e.to_string());
        }
    }
}

impl BuildSubmitter for BuildJobScheduler {
    fn submit(&self, request: BuildJobRequest) -> Result<(), SchedulingRejection> {
        let admission = match Arc::clone(&self.admission).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                metrics::counter!("localvc_builds_rejected_total").increment(1);
                return Err(SchedulingRejection {
                    commit_hash: request.commit_hash,
                    capacity: self.capacity,
                });
            }
        };
        metrics::counter!("localvc_builds_submitted_total").increment(1);

        let container = self.container_request(&request);
        let workers = Arc::clone(&self.workers);
        let runtime = Arc::clone(&self.runtime);
        let sink = Arc::clone(&self.sink);
        tokio::spawn(async move {
            let _admission = admission;
            run_job(request, container, workers, runtime, sink).await;
        });
        Ok(())
    }
}

/// Result sink that reports through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingResultSink;

impl BuildResultSink for TracingResultSink {
    fn on_result(&self, result: &BuildResult) {
        let duration = result.finished_at - result.started_at;
        match result.tests {
            Some(tests) => info!(
                "Build of {} for {} finished with exit code {} in {}s: {} tests, {} failures, {} errors",
                result.commit_hash,
                result.repository.locator,
                result.exit_code,
                duration.num_seconds(),
                tests.tests_run,
                tests.failures,
                tests.errors
            ),
            None => info!(
                "Build of {} for {} finished with exit code {} in {}s (no test summary)",
                result.commit_hash,
                result.repository.locator,
                result.exit_code,
                duration.num_seconds()
            ),
        }
    }

    fn on_failure(&self, request: &BuildJobRequest, error: &str) {
        warn!("Build of {} for {} produced no result: {}", request.commit_hash, request.repository.locator, error);
    }
}
