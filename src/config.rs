//! Configuration loaded from `<root>/.mistrc`
//!
//! The file is JSON with camelCase keys. Every field is optional and falls
//! back to the defaults below. A running process keeps the config in a
//! [`SharedConfig`] and swaps it in place when the file changes.

use parking_lot::RwLock;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Default data root when neither an argument nor `MIST_DATA_DIR` is given
pub const DEFAULT_DATA_DIR: &str = "/var/lib/mist";

/// Global configuration
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    pub docker: DockerConfig,

    #[serde(default)]
    pub git: GitConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub github: GitHubConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// API listen port (default: 8080)
    #[serde(default = "default_server_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Container port used when an application has none (default: 3000)
    #[serde(default = "default_app_port")]
    pub default_app_port: u16,

    /// Seconds allowed for reading request headers (default: 10)
    #[serde(default = "default_read_header_timeout")]
    pub api_read_header_timeout: u64,

    /// Avatar upload limit in MB, consumed by the avatar collaborator
    #[serde(default = "default_max_avatar_size")]
    pub max_avatar_size: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_server_port(),
            bind: default_bind_address(),
            default_app_port: default_app_port(),
            api_read_header_timeout: default_read_header_timeout(),
            max_avatar_size: default_max_avatar_size(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    /// Base domain for generated app hostnames, e.g. `apps.example.com`
    #[serde(default)]
    pub wildcard_domain: String,

    /// Subdomain the dashboard is served on under the wildcard domain
    #[serde(default)]
    pub mist_app_name: String,

    /// Seconds allowed for DNS validation of custom domains (default: 10)
    #[serde(default = "default_dns_validation_timeout")]
    pub dns_validation_timeout: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wildcard_domain: String::new(),
            mist_app_name: String::new(),
            dns_validation_timeout: default_dns_validation_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SecurityConfig {
    /// Session token lifetime in hours (default: 744)
    #[serde(default = "default_jwt_expiry")]
    pub jwt_expiry: i64,

    /// Mark session cookies `Secure`
    #[serde(default)]
    pub secure_cookies: bool,

    /// Minimum password length, consumed by the user collaborator
    #[serde(default = "default_password_min_length")]
    pub password_min_length: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            jwt_expiry: default_jwt_expiry(),
            secure_cookies: false,
            password_min_length: default_password_min_length(),
        }
    }
}

/// Restart policy applied to application containers
#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    No,
    #[default]
    Always,
    UnlessStopped,
    OnFailure,
}

impl RestartPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartPolicy::No => "no",
            RestartPolicy::Always => "always",
            RestartPolicy::UnlessStopped => "unless-stopped",
            RestartPolicy::OnFailure => "on-failure",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DockerConfig {
    /// Prune stopped containers after each successful deployment
    #[serde(default)]
    pub auto_cleanup_containers: bool,

    #[serde(default)]
    pub default_restart_policy: RestartPolicy,

    /// Build timeout in minutes (default: 10)
    #[serde(default = "default_build_timeout")]
    pub build_timeout: u64,

    /// Pull timeout in minutes (default: 5)
    #[serde(default = "default_pull_timeout")]
    pub pull_timeout: u64,

    /// Run/start timeout in minutes (default: 1)
    #[serde(default = "default_short_timeout")]
    pub start_timeout: u64,

    /// Stop and remove timeout in minutes, applied to each (default: 1)
    #[serde(default = "default_short_timeout")]
    pub stop_timeout: u64,

    /// Restart timeout in minutes (default: 1)
    #[serde(default = "default_short_timeout")]
    pub restart_timeout: u64,

    /// Network application containers join (default: traefik-net)
    #[serde(default = "default_network")]
    pub network: String,

    /// Docker CLI used for image builds and system prune
    #[serde(default = "default_docker_binary")]
    pub docker_binary: String,

    /// Daemon URL, e.g. `unix:///var/run/docker.sock` (default: autodetect)
    pub host: Option<String>,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            auto_cleanup_containers: false,
            default_restart_policy: RestartPolicy::default(),
            build_timeout: default_build_timeout(),
            pull_timeout: default_pull_timeout(),
            start_timeout: default_short_timeout(),
            stop_timeout: default_short_timeout(),
            restart_timeout: default_short_timeout(),
            network: default_network(),
            docker_binary: default_docker_binary(),
            host: None,
        }
    }
}

impl DockerConfig {
    pub fn build_timeout(&self) -> Duration {
        minutes(self.build_timeout)
    }

    pub fn start_timeout(&self) -> Duration {
        minutes(self.start_timeout)
    }

    pub fn stop_timeout(&self) -> Duration {
        minutes(self.stop_timeout)
    }

    pub fn restart_timeout(&self) -> Duration {
        minutes(self.restart_timeout)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GitConfig {
    /// Clone/pull timeout in minutes (default: 5)
    #[serde(default = "default_git_clone_timeout")]
    pub git_clone_timeout: u64,

    /// Delete the working tree once the image is built
    #[serde(default)]
    pub remove_git_repo_after_build: bool,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            git_clone_timeout: default_git_clone_timeout(),
            remove_git_repo_after_build: false,
        }
    }
}

impl GitConfig {
    pub fn clone_timeout(&self) -> Duration {
        minutes(self.git_clone_timeout)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    /// Buffered deployment ids before enqueue reports `full` (default: 5)
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,

    /// Concurrent deployment workers (default: 1)
    #[serde(default = "default_queue_workers")]
    pub workers: usize,

    /// Seconds in-flight deployments get to finish on shutdown (default: 30)
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            workers: default_queue_workers(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct GitHubConfig {
    #[serde(default = "default_github_api")]
    pub api_base_url: String,

    #[serde(default = "default_github_git")]
    pub git_base_url: String,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_base_url: default_github_api(),
            git_base_url: default_github_git(),
        }
    }
}

fn minutes(n: u64) -> Duration {
    Duration::from_secs(n * 60)
}

fn default_server_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_app_port() -> u16 {
    3000
}

fn default_read_header_timeout() -> u64 {
    10
}

fn default_max_avatar_size() -> u64 {
    5
}

fn default_dns_validation_timeout() -> u64 {
    10
}

fn default_jwt_expiry() -> i64 {
    744
}

fn default_password_min_length() -> usize {
    8
}

fn default_build_timeout() -> u64 {
    10
}

fn default_pull_timeout() -> u64 {
    5
}

fn default_short_timeout() -> u64 {
    1
}

fn default_network() -> String {
    "traefik-net".to_string()
}

fn default_docker_binary() -> String {
    "docker".to_string()
}

fn default_git_clone_timeout() -> u64 {
    5
}

fn default_queue_capacity() -> usize {
    5
}

fn default_queue_workers() -> usize {
    1
}

fn default_shutdown_grace() -> u64 {
    30
}

fn default_github_api() -> String {
    "https://api.github.com".to_string()
}

fn default_github_git() -> String {
    "https://github.com".to_string()
}

impl Config {
    /// Load configuration from a file, using defaults if it does not exist
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse and validate a JSON document
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Config = if content.trim().is_empty() {
            Config::default()
        } else {
            serde_json::from_str(content)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must be greater than 0".to_string());
        }
        if self.server.default_app_port == 0 {
            errors.push("server.defaultAppPort must be greater than 0".to_string());
        }
        for (name, value) in [
            ("docker.buildTimeout", self.docker.build_timeout),
            ("docker.pullTimeout", self.docker.pull_timeout),
            ("docker.startTimeout", self.docker.start_timeout),
            ("docker.stopTimeout", self.docker.stop_timeout),
            ("docker.restartTimeout", self.docker.restart_timeout),
            ("git.gitCloneTimeout", self.git.git_clone_timeout),
        ] {
            if value == 0 {
                errors.push(format!("{} must be at least 1 minute", name));
            }
        }
        if self.queue.capacity == 0 {
            errors.push("queue.capacity must be greater than 0".to_string());
        }
        if self.queue.workers == 0 {
            errors.push("queue.workers must be greater than 0".to_string());
        }
        if self.docker.network.trim().is_empty() {
            errors.push("docker.network must not be empty".to_string());
        }
        if self.security.jwt_expiry <= 0 {
            errors.push("security.jwtExpiry must be positive".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

/// Config shared across tasks; readers clone what they need
pub type SharedConfig = Arc<RwLock<Config>>;

/// Watches the config file and swaps new contents into a [`SharedConfig`]
///
/// Invalid files are logged and ignored so a bad edit never takes down a
/// running deployment core. Every applied reload is announced on the
/// returned channel.
pub struct ConfigWatcher {
    path: PathBuf,
    shared: SharedConfig,
    interval: Duration,
    reloaded_tx: watch::Sender<u64>,
}

impl ConfigWatcher {
    pub fn new(path: impl Into<PathBuf>, shared: SharedConfig) -> (Self, watch::Receiver<u64>) {
        let (reloaded_tx, reloaded_rx) = watch::channel(0);
        let watcher = Self {
            path: path.into(),
            shared,
            interval: Duration::from_secs(2),
            reloaded_tx,
        };
        (watcher, reloaded_rx)
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    fn modified(&self) -> Option<SystemTime> {
        std::fs::metadata(&self.path).and_then(|m| m.modified()).ok()
    }

    /// Re-read the file now; returns true if the new config was applied
    pub fn reload(&self) -> bool {
        match Config::load(&self.path) {
            Ok(config) => {
                *self.shared.write() = config;
                self.reloaded_tx.send_modify(|generation| *generation += 1);
                info!(path = %self.path.display(), "Configuration reloaded");
                true
            }
            Err(e) => {
                error!(path = %self.path.display(), error = %e, "Ignoring invalid configuration");
                false
            }
        }
    }

    /// Poll the file for changes until shutdown is signalled
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut last_seen = self.modified();

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    let current = self.modified();
                    if current != last_seen {
                        last_seen = current;
                        self.reload();
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

/// A single path segment built from user input
///
/// Characters outside `[A-Za-z0-9._-]` become `-`. A segment made only of
/// dots (or nothing) has its dots replaced, so the result can never name a
/// parent directory.
pub fn path_component(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.chars().all(|c| c == '.') {
        "_".repeat(cleaned.len().max(1))
    } else {
        cleaned
    }
}

/// Filesystem layout owned by the deployment core
#[derive(Debug, Clone)]
pub struct DataLayout {
    root: PathBuf,
}

impl DataLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve the data root from the first CLI argument, then `MIST_DATA_DIR`
    pub fn from_env() -> Self {
        let root = std::env::args()
            .nth(1)
            .or_else(|| std::env::var("MIST_DATA_DIR").ok())
            .unwrap_or_else(|| DEFAULT_DATA_DIR.to_string());
        Self::new(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn database_path(&self) -> PathBuf {
        self.root.join("mist.db")
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(".mistrc")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn projects_dir(&self) -> PathBuf {
        self.root.join("projects")
    }

    pub fn traefik_dir(&self) -> PathBuf {
        self.root.join("traefik")
    }

    /// Working tree for an application
    pub fn app_dir(&self, project_id: i64, app_name: &str) -> PathBuf {
        self.projects_dir()
            .join(project_id.to_string())
            .join("apps")
            .join(path_component(app_name))
    }

    /// Append-only build log for a deployment
    pub fn build_log_path(&self, commit_hash: &str, deployment_id: i64) -> PathBuf {
        self.logs_dir().join(format!(
            "{}{}_build_logs",
            path_component(commit_hash),
            deployment_id
        ))
    }

    /// Create the directories the core writes into
    pub fn ensure(&self) -> std::io::Result<()> {
        for dir in [self.root.clone(), self.logs_dir(), self.projects_dir(), self.traefik_dir()] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}
