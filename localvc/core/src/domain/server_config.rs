// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Server Configuration Types
//
// Defines the configuration schema for a localvc server, including:
// - Kubernetes-style manifest format (apiVersion/kind/metadata/spec)
// - HTTP and SSH transport settings
// - Repository storage and directory locations
// - Authentication limits and build agent credentials
// - Build scheduler, container image and resource flags
// - Observability settings

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use url::Url;

use crate::domain::runtime::ContainerResourceLimits;

pub const API_VERSION: &str = "localvc/v1";
pub const KIND: &str = "ServerConfig";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("unknown container flag '{0}'")]
    UnknownContainerFlag(String),

    #[error("container flag '{0}' requires a value")]
    MissingFlagValue(String),

    #[error("invalid value '{value}' for container flag '{flag}'")]
    InvalidFlagValue { flag: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level Kubernetes-style server configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfigManifest {
    /// API version (must be "localvc/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "ServerConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: ServerConfigSpec,
}

/// Manifest metadata (Kubernetes-style)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Human-readable server name
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfigSpec {
    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub ssh: SshConfig,

    #[serde(default)]
    pub repositories: RepositoriesConfig,

    #[serde(default)]
    pub build: BuildConfig,

    #[serde(default)]
    pub directory: DirectoryConfig,

    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_http_port")]
    pub port: u16,

    /// Public base URL; its path is the prefix of every repository URL.
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_http_port(),
            base_url: default_base_url(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    /// Path to the server's private host key (OpenSSH format)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_key_path: Option<String>,

    /// Upper bound on git commands served concurrently over SSH (unbounded if unset)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent_commands: Option<usize>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_bind_address(),
            port: default_ssh_port(),
            host_key_path: None,
            max_concurrent_commands: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoriesConfig {
    #[serde(default = "default_repositories_root")]
    pub root: String,
}

impl Default for RepositoriesConfig {
    fn default() -> Self {
        Self {
            root: default_repositories_root(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Concurrent builds. Derived from available CPUs when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_size: Option<usize>,

    #[serde(default = "default_build_image")]
    pub image: String,

    /// Shell script run inside the container. `$COMMIT_HASH` holds the pushed commit
    /// and the bare repository is mounted read-only at `/repository`.
    #[serde(default = "default_build_script")]
    pub script: String,

    /// Docker-style resource flags (`--cpus`, `--memory`, `--memory-swap`, `--pids-limit`)
    #[serde(default)]
    pub container_flags: Vec<String>,

    /// Path to Docker socket
    /// Default: auto-detected
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker_socket_path: Option<String>,

    #[serde(default = "default_true")]
    pub network_disabled: bool,

    #[serde(default = "default_build_timeout")]
    pub timeout_seconds: u64,

    /// Pull the image when it is missing locally
    #[serde(default = "default_true")]
    pub autopull: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxyConfig>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            pool_size: None,
            image: default_build_image(),
            script: default_build_script(),
            container_flags: Vec::new(),
            docker_socket_path: None,
            network_disabled: true,
            timeout_seconds: default_build_timeout(),
            autopull: true,
            proxy: None,
        }
    }
}

/// Proxy variables forwarded into build containers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_proxy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub https_proxy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_proxy: Option<String>,
}

impl ProxyConfig {
    pub fn env(&self) -> Vec<(String, String)> {
        [
            ("HTTP_PROXY", &self.http_proxy),
            ("HTTPS_PROXY", &self.https_proxy),
            ("NO_PROXY", &self.no_proxy),
        ]
        .into_iter()
        .filter_map(|(key, value)| value.as_ref().map(|v| (key.to_string(), v.clone())))
        .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// YAML file holding users, courses, exercises and participations
    #[serde(default = "default_directory_path")]
    pub path: String,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            path: default_directory_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Authentication attempts accepted per client address and minute (0 disables the limit)
    #[serde(default = "default_auth_attempts_per_minute")]
    pub auth_attempts_per_minute: u32,

    /// Read-only credentials for build containers fetching repositories
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_agent: Option<BuildAgentConfig>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            auth_attempts_per_minute: default_auth_attempts_per_minute(),
            build_agent: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildAgentConfig {
    pub login: String,
    /// SHA-256 hex digest of the password
    pub password_sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format ("json" or "text")
    #[serde(default = "default_log_format")]
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Prometheus scrape port
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_http_port() -> u16 {
    8080
}

fn default_ssh_port() -> u16 {
    7921
}

fn default_base_url() -> String {
    "http://localhost:8080/git".to_string()
}

fn default_repositories_root() -> String {
    "./repositories".to_string()
}

fn default_build_image() -> String {
    "ls1tum/artemis-maven-template:java17-20".to_string()
}

fn default_build_script() -> String {
    "set -e\n\
     git config --global --add safe.directory /repository\n\
     git clone --quiet /repository /var/tmp/build\n\
     cd /var/tmp/build\n\
     git checkout --quiet \"$COMMIT_HASH\"\n\
     if [ -x ./gradlew ]; then ./gradlew --no-daemon test; else mvn -B test; fi\n"
        .to_string()
}

fn default_build_timeout() -> u64 {
    240
}

fn default_directory_path() -> String {
    "./localvc-directory.yaml".to_string()
}

fn default_auth_attempts_per_minute() -> u32 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for ServerConfigManifest {
    fn default() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localvc".to_string());

        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: hostname,
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: ServerConfigSpec::default(),
        }
    }
}

impl ServerConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. LOCALVC_CONFIG_PATH environment variable
    /// 2. ./localvc-config.yaml (working directory)
    /// 3. ~/.localvc/config.yaml (user home)
    /// 4. /etc/localvc/config.yaml (system)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("LOCALVC_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./localvc-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".localvc").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/localvc/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit CLI path fails if missing or invalid
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("LOCALVC_BASE_URL") {
            tracing::info!("Environment override: LOCALVC_BASE_URL={}", val);
            self.spec.http.base_url = val;
        }

        if let Ok(val) = std::env::var("LOCALVC_REPOSITORIES_ROOT") {
            tracing::info!("Environment override: LOCALVC_REPOSITORIES_ROOT={}", val);
            self.spec.repositories.root = val;
        }

        if let Ok(val) = std::env::var("LOCALVC_BUILD_POOL_SIZE") {
            match val.parse::<usize>() {
                Ok(size) => {
                    tracing::info!("Environment override: LOCALVC_BUILD_POOL_SIZE={}", size);
                    self.spec.build.pool_size = Some(size);
                }
                Err(_) => {
                    tracing::warn!(
                        "Invalid value for LOCALVC_BUILD_POOL_SIZE: '{}'. Expected a positive integer. Ignoring.",
                        val
                    );
                }
            }
        }

        if let Ok(val) = std::env::var("LOCALVC_SSH_ENABLED") {
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => {
                    tracing::info!("Environment override: LOCALVC_SSH_ENABLED=true");
                    self.spec.ssh.enabled = true;
                }
                "false" | "0" | "no" | "off" => {
                    tracing::info!("Environment override: LOCALVC_SSH_ENABLED=false");
                    self.spec.ssh.enabled = false;
                }
                _ => {
                    tracing::warn!(
                        "Invalid value for LOCALVC_SSH_ENABLED: '{}'. Expected true/false. Ignoring.",
                        val
                    );
                }
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_version != API_VERSION {
            return Err(ConfigError::Invalid(format!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version, API_VERSION
            )));
        }

        if self.kind != KIND {
            return Err(ConfigError::Invalid(format!(
                "Invalid kind: '{}'. Must be '{}'",
                self.kind, KIND
            )));
        }

        if self.metadata.name.is_empty() {
            return Err(ConfigError::Invalid("metadata.name cannot be empty".to_string()));
        }

        self.base_url()?;

        if self.spec.http.port == 0 {
            return Err(ConfigError::Invalid("spec.http.port cannot be 0".to_string()));
        }

        let ssh = &self.spec.ssh;
        if ssh.enabled {
            if ssh.port == 0 {
                return Err(ConfigError::Invalid("spec.ssh.port cannot be 0".to_string()));
            }
            if ssh.host_key_path.as_deref().map_or(true, str::is_empty) {
                return Err(ConfigError::Invalid(
                    "spec.ssh.host_key_path is required when SSH is enabled".to_string(),
                ));
            }
            if ssh.max_concurrent_commands == Some(0) {
                return Err(ConfigError::Invalid(
                    "spec.ssh.max_concurrent_commands must be at least 1".to_string(),
                ));
            }
        }

        if self.spec.repositories.root.is_empty() {
            return Err(ConfigError::Invalid("spec.repositories.root cannot be empty".to_string()));
        }

        let build = &self.spec.build;
        if build.image.is_empty() {
            return Err(ConfigError::Invalid("spec.build.image cannot be empty".to_string()));
        }
        if build.pool_size == Some(0) {
            return Err(ConfigError::Invalid("spec.build.pool_size must be at least 1".to_string()));
        }
        if build.timeout_seconds == 0 {
            return Err(ConfigError::Invalid("spec.build.timeout_seconds cannot be 0".to_string()));
        }
        self.resource_limits()?;

        if let Some(agent) = &self.spec.security.build_agent {
            if agent.login.is_empty() {
                return Err(ConfigError::Invalid("spec.security.build_agent.login cannot be empty".to_string()));
            }
            if agent.password_sha256.len() != 64 || !agent.password_sha256.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(ConfigError::Invalid(
                    "spec.security.build_agent.password_sha256 must be a SHA-256 hex digest".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Parsed public base URL. Its path is normalised without a trailing slash.
    pub fn base_url(&self) -> Result<Url, ConfigError> {
        let mut url = Url::parse(&self.spec.http.base_url).map_err(|e| {
            ConfigError::Invalid(format!("spec.http.base_url '{}': {}", self.spec.http.base_url, e))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid(format!(
                "spec.http.base_url must use http or https, got '{}'",
                url.scheme()
            )));
        }
        let path = url.path().trim_end_matches('/').to_string();
        url.set_path(&path);
        Ok(url)
    }

    pub fn resource_limits(&self) -> Result<ContainerResourceLimits, ConfigError> {
        ContainerResourceLimits::from_flags(&self.spec.build.container_flags)
    }

    /// Explicit pool size, or `max(1, (cpus - 2) / 2)`.
    pub fn build_pool_size(&self) -> usize {
        self.spec.build.pool_size.unwrap_or_else(|| {
            let cpus = std::thread::available_parallelism().map_or(1, |n| n.get());
            default_pool_size(cpus)
        })
    }

    pub fn repositories_root(&self) -> PathBuf {
        PathBuf::from(&self.spec.repositories.root)
    }
}

pub fn default_pool_size(available_cpus: usize) -> usize {
    (available_cpus.saturating_sub(2) / 2).max(1)
}
