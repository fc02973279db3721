// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `localvc serve`: wires the directory, repository store, Docker runtime and
//! build scheduler behind the HTTP and SSH transports, then runs until
//! Ctrl+C or SIGTERM.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use localvc_core::application::{
    AuthRateLimiter, BuildAgentCredentials, BuildJobScheduler, BuildSettings, BuildTrigger, PushPolicy,
    StandardAccessAuthorizer, StandardCredentialAuthenticator, TracingAccessLog, TracingResultSink,
};
use localvc_core::domain::server_config::ServerConfigManifest;
use localvc_core::infrastructure::{DockerRuntime, FileDirectory, ProtocolEngine, RepositoryStore};
use localvc_core::presentation::ssh::{self, SshServer};
use localvc_core::presentation::{http, GitServices};

pub async fn run(config_path: Option<PathBuf>) -> Result<()> {
    let config = ServerConfigManifest::load_or_default(config_path).context("Failed to load configuration")?;
    config.validate().context("Configuration validation failed")?;
    info!("Configuration loaded: server={}", config.metadata.name);

    install_metrics_exporter(&config)?;

    let services = Arc::new(build_services(&config).await?);
    let shutdown = CancellationToken::new();

    let ssh_task = if config.spec.ssh.enabled {
        let ssh_config = &config.spec.ssh;
        let host_key_path = ssh_config
            .host_key_path
            .as_deref()
            .context("spec.ssh.host_key_path is required when SSH is enabled")?;
        let host_key = ssh::load_host_key(Path::new(host_key_path))?;
        let addr = socket_addr(&ssh_config.bind_address, ssh_config.port)?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind SSH listener on {}", addr))?;

        let server = SshServer::new(services.clone(), host_key, ssh_config.max_concurrent_commands);
        let token = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = server.serve(listener, token.clone()).await {
                error!("SSH transport failed: {}", e);
                token.cancel();
            }
        }))
    } else {
        info!("SSH transport disabled");
        None
    };

    let http_config = &config.spec.http;
    let addr = socket_addr(&http_config.bind_address, http_config.port)?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind HTTP listener on {}", addr))?;
    info!("HTTP transport listening on {} (base URL {})", addr, services.base_url);

    let app = http::router(services.clone()).into_make_service_with_connect_info::<SocketAddr>();
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .context("HTTP server failed");

    shutdown.cancel();
    if let Some(task) = ssh_task {
        let _ = task.await;
    }
    info!("localvc shutting down");

    result
}

async fn build_services(config: &ServerConfigManifest) -> Result<GitServices> {
    let directory = Arc::new(
        FileDirectory::from_yaml_file(&config.spec.directory.path).context("Failed to load user directory")?,
    );

    let root = config.repositories_root();
    std::fs::create_dir_all(&root)
        .with_context(|| format!("Failed to create repositories root {}", root.display()))?;
    info!("Serving repositories from {}", root.display());

    let build = &config.spec.build;
    let runtime = DockerRuntime::new(build.docker_socket_path.as_deref(), build.autopull)
        .context("Failed to connect to Docker")?;
    // Builds fail individually while Docker is down; the transports stay up.
    if let Err(e) = runtime.healthcheck().await {
        warn!("Docker is not reachable, builds will fail until it is: {}", e);
    }

    let settings = BuildSettings {
        image: build.image.clone(),
        script: build.script.clone(),
        limits: config.resource_limits()?,
        network_disabled: build.network_disabled,
        timeout: Duration::from_secs(build.timeout_seconds),
        extra_env: build.proxy.as_ref().map(|proxy| proxy.env()).unwrap_or_default(),
    };
    let scheduler = Arc::new(BuildJobScheduler::new(
        config.build_pool_size(),
        settings,
        Arc::new(runtime),
        Arc::new(TracingResultSink),
    ));

    let security = &config.spec.security;
    let mut authenticator = StandardCredentialAuthenticator::new(directory.clone());
    if let Some(agent) = &security.build_agent {
        info!("Build agent '{}' may read every repository", agent.login);
        authenticator = authenticator.with_build_agent(BuildAgentCredentials {
            login: agent.login.clone(),
            password_sha256: agent.password_sha256.clone(),
        });
    }

    Ok(GitServices {
        base_url: config.base_url()?,
        store: RepositoryStore::new(root),
        engine: ProtocolEngine::default(),
        authenticator: Arc::new(authenticator),
        authorizer: Arc::new(StandardAccessAuthorizer::new(directory.clone())),
        auth_limiter: AuthRateLimiter::per_minute(security.auth_attempts_per_minute),
        access_log: Arc::new(TracingAccessLog),
        exercises: directory,
        policy: PushPolicy::new(),
        trigger: Arc::new(BuildTrigger::new(scheduler)),
    })
}

fn install_metrics_exporter(config: &ServerConfigManifest) -> Result<()> {
    let Some(metrics) = config
        .spec
        .observability
        .as_ref()
        .and_then(|o| o.metrics.as_ref())
        .filter(|m| m.enabled)
    else {
        return Ok(());
    };

    let addr = SocketAddr::from(([0, 0, 0, 0], metrics.port));
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;
    info!("Prometheus metrics exposed on {}", addr);
    Ok(())
}

fn socket_addr(bind_address: &str, port: u16) -> Result<SocketAddr> {
    format!("{}:{}", bind_address, port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", bind_address, port))
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}
