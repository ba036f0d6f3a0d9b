//! Container driver
//!
//! Everything that touches the container daemon goes through
//! [`ContainerDriver`]. The production implementation, [`DockerDriver`],
//! talks to the daemon API with bollard and shells out to the docker CLI for
//! image builds and `system prune`, streaming their output into the
//! deployment log.

use crate::config::{RestartPolicy, SharedConfig};
use crate::error::{BuildError, ContainerError, ContainerOp, DeployError, DeployResult};
use crate::exec::{Exec, ExecError};
use crate::logs::LogSink;
use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions, LogOutput,
    LogsOptions, PruneContainersOptions, RemoveContainerOptions, RestartContainerOptions,
    StartContainerOptions, Stats, StatsOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::{ListImagesOptions, PruneImagesOptions, RemoveImageOptions};
use bollard::models::{HealthStatusEnum, HostConfig, RestartPolicyNameEnum};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use bollard::Docker;
use futures::{Future, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Images kept per application by [`ContainerDriver::cleanup_old_images`]
pub const DEFAULT_IMAGES_KEPT: usize = 5;

/// Seconds a container gets to exit after SIGTERM
const STOP_GRACE_SECS: i64 = 10;

/// Deterministic container name for an application
pub fn container_name(app_id: i64) -> String {
    format!("app-{}", app_id)
}

/// Prefix shared by every image built for an application
pub fn app_image_prefix(app_id: i64) -> String {
    format!("mist-app-{}-", app_id)
}

/// Application-scoped image tag for a commit
pub fn app_image_tag(app_id: i64, commit: &str) -> String {
    let short: String = commit.chars().take(7).collect();
    format!("{}{}", app_image_prefix(app_id), short.to_lowercase())
}

/// What to build and how to tag it
#[derive(Debug, Clone)]
pub struct BuildSpec {
    pub tags: Vec<String>,
    pub context: PathBuf,
    pub dockerfile: Option<PathBuf>,
}

/// What to run as an application container
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub image: String,
    pub name: String,
    pub labels: HashMap<String, String>,
    pub env: Vec<(String, String)>,
}

/// Current state of a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStatus {
    pub id: String,
    /// `running`, `exited`, `created`, `paused`, `restarting`, `dead`, ...
    pub state: String,
    pub status: String,
    pub healthy: bool,
    pub started_at: Option<String>,
    pub image: Option<String>,
}

impl ContainerStatus {
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

/// One resource usage sample
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStats {
    pub cpu_percent: f64,
    pub memory_usage: u64,
    pub memory_limit: u64,
    pub memory_percent: f64,
    pub network_rx: u64,
    pub network_tx: u64,
    pub block_read: u64,
    pub block_write: u64,
}

/// CPU usage between two samples as a percentage of one core times `cpus`
pub fn cpu_percent(total: u64, pre_total: u64, system: u64, pre_system: u64, cpus: u64) -> f64 {
    let cpu_delta = total.saturating_sub(pre_total) as f64;
    let system_delta = system.saturating_sub(pre_system) as f64;
    if cpu_delta <= 0.0 || system_delta <= 0.0 {
        return 0.0;
    }
    (cpu_delta / system_delta) * cpus.max(1) as f64 * 100.0
}

fn stats_sample(stats: &Stats) -> ContainerStats {
    let cpus = stats
        .cpu_stats
        .online_cpus
        .or_else(|| {
            stats
                .cpu_stats
                .cpu_usage
                .percpu_usage
                .as_ref()
                .map(|v| v.len() as u64)
        })
        .unwrap_or(1);
    let cpu = cpu_percent(
        stats.cpu_stats.cpu_usage.total_usage,
        stats.precpu_stats.cpu_usage.total_usage,
        stats.cpu_stats.system_cpu_usage.unwrap_or(0),
        stats.precpu_stats.system_cpu_usage.unwrap_or(0),
        cpus,
    );

    let memory_usage = stats.memory_stats.usage.unwrap_or(0);
    let memory_limit = stats.memory_stats.limit.unwrap_or(0);
    let memory_percent = if memory_limit > 0 {
        memory_usage as f64 / memory_limit as f64 * 100.0
    } else {
        0.0
    };

    let (network_rx, network_tx) = stats
        .networks
        .as_ref()
        .map(|nets| {
            nets.values()
                .fold((0, 0), |(rx, tx), n| (rx + n.rx_bytes, tx + n.tx_bytes))
        })
        .unwrap_or((0, 0));

    let (block_read, block_write) = stats
        .blkio_stats
        .io_service_bytes_recursive
        .as_ref()
        .map(|entries| {
            entries.iter().fold((0, 0), |(r, w), e| match e.op.to_lowercase().as_str() {
                "read" => (r + e.value, w),
                "write" => (r, w + e.value),
                _ => (r, w),
            })
        })
        .unwrap_or((0, 0));

    ContainerStats {
        cpu_percent: cpu,
        memory_usage,
        memory_limit,
        memory_percent,
        network_rx,
        network_tx,
        block_read,
        block_write,
    }
}

/// Typed facade over the container daemon
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    /// Build an image from a context directory
    async fn build_image(&self, spec: &BuildSpec, sink: &LogSink, cancel: &CancellationToken) -> DeployResult<()>;

    /// True iff the container can be inspected
    async fn container_exists(&self, name: &str) -> DeployResult<bool>;

    /// Stop then remove a container; a missing container is not an error
    async fn stop_remove(&self, name: &str, sink: &LogSink, cancel: &CancellationToken) -> DeployResult<()>;

    /// Create and start a detached container, returning its id
    async fn run(&self, spec: &RunSpec, sink: &LogSink, cancel: &CancellationToken) -> DeployResult<String>;

    /// Container state, or `None` if it does not exist
    async fn status(&self, name: &str) -> DeployResult<Option<ContainerStatus>>;

    async fn stop(&self, name: &str) -> DeployResult<()>;

    async fn start(&self, name: &str) -> DeployResult<()>;

    async fn restart(&self, name: &str) -> DeployResult<()>;

    /// Last `tail` lines of container output
    async fn logs_tail(&self, name: &str, tail: usize) -> DeployResult<String>;

    /// Follow container output until `cancel` fires or the container exits
    async fn logs_follow(&self, name: &str, cancel: CancellationToken) -> DeployResult<mpsc::Receiver<String>>;

    /// Stream resource usage samples until `cancel` fires
    async fn stats(&self, name: &str, cancel: CancellationToken) -> DeployResult<mpsc::Receiver<ContainerStats>>;

    /// Remove all but the newest `keep` images built for an application
    async fn cleanup_old_images(&self, app_id: i64, keep: usize) -> DeployResult<usize>;

    /// Create the shared network if it is missing
    async fn ensure_network(&self, network: &str) -> DeployResult<()>;

    async fn system_prune(&self) -> DeployResult<()>;

    async fn prune_containers(&self) -> DeployResult<()>;

    async fn prune_images(&self) -> DeployResult<()>;
}

/// Race a daemon call against its deadline and the cancellation token
async fn deadline<T, F>(
    op: ContainerOp,
    timeout: Duration,
    cancel: &CancellationToken,
    fut: F,
) -> DeployResult<Result<T, BollardError>>
where
    F: Future<Output = Result<T, BollardError>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(DeployError::Cancelled),
        result = tokio::time::timeout(timeout, fut) => result.map_err(|_| {
            ContainerError::new(op, format!("timed out after {}s", timeout.as_secs())).into()
        }),
    }
}

fn daemon_error(op: ContainerOp, e: BollardError) -> DeployError {
    ContainerError::new(op, e.to_string()).into()
}

fn restart_policy_name(policy: &RestartPolicy) -> RestartPolicyNameEnum {
    match policy {
        RestartPolicy::No => RestartPolicyNameEnum::NO,
        RestartPolicy::Always => RestartPolicyNameEnum::ALWAYS,
        RestartPolicy::UnlessStopped => RestartPolicyNameEnum::UNLESS_STOPPED,
        RestartPolicy::OnFailure => RestartPolicyNameEnum::ON_FAILURE,
    }
}

/// Driver backed by the local docker daemon
pub struct DockerDriver {
    client: Docker,
    config: SharedConfig,
}

impl DockerDriver {
    /// Connect to the daemon
    ///
    /// Connection priority:
    /// 1. `docker.host` from the config file
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths
    pub async fn connect(config: SharedConfig) -> anyhow::Result<Self> {
        let host = config.read().docker.host.clone();
        let client = if let Some(host) = host {
            Self::connect_to_host(&host).map_err(|e| {
                anyhow::anyhow!("Failed to connect to Docker at '{}': {}", host, e)
            })?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host).map_err(|e| {
                anyhow::anyhow!("Failed to connect to Docker via DOCKER_HOST='{}': {}", host, e)
            })?
        } else {
            Self::connect_with_defaults().await?
        };

        client.ping().await.map_err(|e| {
            anyhow::anyhow!("Docker daemon is not responding: {}. Ensure dockerd is running.", e)
        })?;

        debug!("Connected to Docker daemon");
        Ok(Self { client, config })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("Cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "Invalid docker host format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }

    async fn connect_with_defaults() -> anyhow::Result<Docker> {
        let home = std::env::var("HOME").unwrap_or_default();
        let xdg_runtime = std::env::var("XDG_RUNTIME_DIR").unwrap_or_default();

        let socket_paths: Vec<(&str, String)> = vec![
            ("Linux default", "/var/run/docker.sock".to_string()),
            ("Rootless Docker", format!("{}/docker.sock", xdg_runtime)),
            ("Podman (Linux)", format!("{}/podman/podman.sock", xdg_runtime)),
            ("Docker Desktop", format!("{}/.docker/run/docker.sock", home)),
        ];

        for (name, path) in &socket_paths {
            if path.starts_with('/') && std::path::Path::new(path).exists() {
                debug!(path, name, "Found Docker socket");
                if let Ok(client) = Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION) {
                    if client.ping().await.is_ok() {
                        return Ok(client);
                    }
                }
            }
        }

        Docker::connect_with_socket_defaults()
            .map_err(|e| anyhow::anyhow!("Cannot connect to Docker daemon: {}", e))
    }

    fn cli(&self) -> Exec<'static> {
        let (binary, host) = {
            let config = self.config.read();
            (config.docker.docker_binary.clone(), config.docker.host.clone())
        };
        let mut exec = Exec::new(binary);
        if let Some(host) = host {
            exec = exec.env("DOCKER_HOST", host);
        }
        exec
    }

    async fn inspect(&self, name: &str) -> DeployResult<Option<bollard::models::ContainerInspectResponse>> {
        match self
            .client
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => Ok(Some(info)),
            Err(BollardError::DockerResponseServerError { status_code: 404, .. }) => Ok(None),
            Err(e) => Err(daemon_error(ContainerOp::Inspect, e)),
        }
    }
}

#[async_trait]
impl ContainerDriver for DockerDriver {
    async fn build_image(&self, spec: &BuildSpec, sink: &LogSink, cancel: &CancellationToken) -> DeployResult<()> {
        let timeout = self.config.read().docker.build_timeout();

        let mut cmd = self.cli().arg("build");
        for tag in &spec.tags {
            cmd = cmd.arg("-t").arg(tag);
        }
        if let Some(dockerfile) = &spec.dockerfile {
            cmd = cmd.arg("-f").arg(dockerfile.to_string_lossy());
        }
        cmd = cmd
            .arg(spec.context.to_string_lossy())
            .env("DOCKER_BUILDKIT", "1")
            .timeout(timeout)
            .sink(sink);

        info!(tags = ?spec.tags, context = %spec.context.display(), "Building image");

        match cmd.run(cancel).await {
            Ok(_) => {
                info!(tags = ?spec.tags, "Image built");
                Ok(())
            }
            Err(ExecError::Exit { code, .. }) => Err(BuildError { exit_code: code }.into()),
            Err(ExecError::Cancelled) => Err(DeployError::Cancelled),
            Err(e) => Err(ContainerError::new(ContainerOp::Build, e.to_string()).into()),
        }
    }

    async fn container_exists(&self, name: &str) -> DeployResult<bool> {
        Ok(self.inspect(name).await?.is_some())
    }

    async fn stop_remove(&self, name: &str, sink: &LogSink, cancel: &CancellationToken) -> DeployResult<()> {
        if !self.container_exists(name).await? {
            sink.line(format!("No existing container {}", name)).await;
            return Ok(());
        }

        let timeout = self.config.read().docker.stop_timeout();

        sink.line(format!("Stopping container {}", name)).await;
        let stopped = deadline(
            ContainerOp::Stop,
            timeout,
            cancel,
            self.client
                .stop_container(name, Some(StopContainerOptions { t: STOP_GRACE_SECS })),
        )
        .await?;
        match stopped {
            Ok(()) => {}
            Err(BollardError::DockerResponseServerError { status_code: 304, .. }) => {
                debug!(name, "Container was already stopped");
            }
            Err(BollardError::DockerResponseServerError { status_code: 404, .. }) => {
                debug!(name, "Container vanished before stop");
                return Ok(());
            }
            Err(e) => return Err(daemon_error(ContainerOp::Stop, e)),
        }

        sink.line(format!("Removing container {}", name)).await;
        let removed = deadline(
            ContainerOp::Remove,
            timeout,
            cancel,
            self.client.remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: false,
                    ..Default::default()
                }),
            ),
        )
        .await?;
        match removed {
            Ok(()) | Err(BollardError::DockerResponseServerError { status_code: 404, .. }) => {
                info!(name, "Removed container");
                Ok(())
            }
            Err(e) => Err(daemon_error(ContainerOp::Remove, e)),
        }
    }

    async fn run(&self, spec: &RunSpec, sink: &LogSink, cancel: &CancellationToken) -> DeployResult<String> {
        let (network, policy, timeout) = {
            let config = self.config.read();
            (
                config.docker.network.clone(),
                config.docker.default_restart_policy.clone(),
                config.docker.start_timeout(),
            )
        };

        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let host_config = HostConfig {
            network_mode: Some(network.clone()),
            restart_policy: Some(bollard::models::RestartPolicy {
                name: Some(restart_policy_name(&policy)),
                maximum_retry_count: None,
            }),
            extra_hosts: Some(vec!["host.docker.internal:host-gateway".to_string()]),
            ..Default::default()
        };

        let container_config = ContainerConfig {
            image: Some(spec.image.clone()),
            env: Some(env),
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        sink.line(format!(
            "Starting container {} from {} on network {}",
            spec.name, spec.image, network
        ))
        .await;

        let created = deadline(
            ContainerOp::Run,
            timeout,
            cancel,
            self.client.create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                container_config,
            ),
        )
        .await?
        .map_err(|e| daemon_error(ContainerOp::Run, e))?;

        let container_id = created.id;
        for warning in &created.warnings {
            sink.line(format!("warning: {}", warning)).await;
        }

        let started = deadline(
            ContainerOp::Run,
            timeout,
            cancel,
            self.client
                .start_container(&container_id, None::<StartContainerOptions<String>>),
        )
        .await;

        let failure = match started {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(daemon_error(ContainerOp::Run, e)),
            Err(e) => Some(e),
        };
        if let Some(err) = failure {
            // Leave no created-but-dead container behind under the app's name
            let _ = self
                .client
                .remove_container(
                    &container_id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
            return Err(err);
        }

        info!(name = %spec.name, container_id = %container_id, image = %spec.image, "Started container");
        sink.line(format!("Container {} started ({})", spec.name, container_id)).await;
        Ok(container_id)
    }

    async fn status(&self, name: &str) -> DeployResult<Option<ContainerStatus>> {
        let Some(info) = self.inspect(name).await? else {
            return Ok(None);
        };

        let state = info.state.unwrap_or_default();
        let state_name = state
            .status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        let running = state.running.unwrap_or(false);
        let healthy = match state.health.and_then(|h| h.status) {
            Some(HealthStatusEnum::HEALTHY) => true,
            Some(HealthStatusEnum::NONE) | Some(HealthStatusEnum::EMPTY) | None => running,
            Some(_) => false,
        };
        let status = match (running, state.exit_code) {
            (true, _) => "Up".to_string(),
            (false, Some(code)) => format!("Exited ({})", code),
            (false, None) => state_name.clone(),
        };

        Ok(Some(ContainerStatus {
            id: info.id.unwrap_or_default(),
            state: state_name,
            status,
            healthy,
            started_at: state.started_at,
            image: info.config.and_then(|c| c.image),
        }))
    }

    async fn stop(&self, name: &str) -> DeployResult<()> {
        let timeout = self.config.read().docker.stop_timeout();
        let result = deadline(
            ContainerOp::Stop,
            timeout,
            &CancellationToken::new(),
            self.client
                .stop_container(name, Some(StopContainerOptions { t: STOP_GRACE_SECS })),
        )
        .await?;
        match result {
            Ok(()) | Err(BollardError::DockerResponseServerError { status_code: 304, .. }) => Ok(()),
            Err(BollardError::DockerResponseServerError { status_code: 404, .. }) => {
                Err(DeployError::not_found(format!("container {} not found", name)))
            }
            Err(e) => Err(daemon_error(ContainerOp::Stop, e)),
        }
    }

    async fn start(&self, name: &str) -> DeployResult<()> {
        let timeout = self.config.read().docker.start_timeout();
        let result = deadline(
            ContainerOp::Start,
            timeout,
            &CancellationToken::new(),
            self.client
                .start_container(name, None::<StartContainerOptions<String>>),
        )
        .await?;
        match result {
            Ok(()) | Err(BollardError::DockerResponseServerError { status_code: 304, .. }) => Ok(()),
            Err(BollardError::DockerResponseServerError { status_code: 404, .. }) => {
                Err(DeployError::not_found(format!("container {} not found", name)))
            }
            Err(e) => Err(daemon_error(ContainerOp::Start, e)),
        }
    }

    async fn restart(&self, name: &str) -> DeployResult<()> {
        let timeout = self.config.read().docker.restart_timeout();
        let result = deadline(
            ContainerOp::Restart,
            timeout,
            &CancellationToken::new(),
            self.client.restart_container(
                name,
                Some(RestartContainerOptions {
                    t: STOP_GRACE_SECS as isize,
                }),
            ),
        )
        .await?;
        match result {
            Ok(()) => Ok(()),
            Err(BollardError::DockerResponseServerError { status_code: 404, .. }) => {
                Err(DeployError::not_found(format!("container {} not found", name)))
            }
            Err(e) => Err(daemon_error(ContainerOp::Restart, e)),
        }
    }

    async fn logs_tail(&self, name: &str, tail: usize) -> DeployResult<String> {
        let options = LogsOptions::<String> {
            follow: false,
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };
        let mut stream = self.client.logs(name, Some(options));
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(output) => text.push_str(&String::from_utf8_lossy(&output.into_bytes())),
                Err(BollardError::DockerResponseServerError { status_code: 404, .. }) => {
                    return Err(DeployError::not_found(format!("container {} not found", name)));
                }
                Err(e) => return Err(daemon_error(ContainerOp::Logs, e)),
            }
        }
        Ok(text)
    }

    async fn logs_follow(&self, name: &str, cancel: CancellationToken) -> DeployResult<mpsc::Receiver<String>> {
        if !self.container_exists(name).await? {
            return Err(DeployError::not_found(format!("container {} not found", name)));
        }

        let (tx, rx) = mpsc::channel(256);
        let client = self.client.clone();
        let name = name.to_string();

        tokio::spawn(async move {
            let options = LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                tail: "100".to_string(),
                ..Default::default()
            };
            let mut stream = client.logs(&name, Some(options));
            let mut partial = String::new();

            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => break,
                    chunk = stream.next() => chunk,
                };
                let output = match chunk {
                    Some(Ok(output)) => output,
                    Some(Err(e)) => {
                        warn!(container = %name, error = %e, "Error reading container logs");
                        break;
                    }
                    None => break,
                };
                let bytes = match output {
                    LogOutput::StdOut { message }
                    | LogOutput::StdErr { message }
                    | LogOutput::Console { message } => message,
                    LogOutput::StdIn { .. } => continue,
                };
                partial.push_str(&String::from_utf8_lossy(&bytes));
                while let Some(pos) = partial.find('\n') {
                    let line: String = partial.drain(..=pos).collect();
                    let line = line.trim_end_matches(['\n', '\r']).to_string();
                    if line.is_empty() {
                        continue;
                    }
                    if tx.send(line).await.is_err() {
                        return;
                    }
                }
            }
            let rest = partial.trim_end();
            if !rest.is_empty() {
                let _ = tx.send(rest.to_string()).await;
            }
            debug!(container = %name, "Container log stream ended");
        });

        Ok(rx)
    }

    async fn stats(&self, name: &str, cancel: CancellationToken) -> DeployResult<mpsc::Receiver<ContainerStats>> {
        if !self.container_exists(name).await? {
            return Err(DeployError::not_found(format!("container {} not found", name)));
        }

        let (tx, rx) = mpsc::channel(16);
        let client = self.client.clone();
        let name = name.to_string();

        tokio::spawn(async move {
            let mut stream = client.stats(
                &name,
                Some(StatsOptions {
                    stream: true,
                    one_shot: false,
                }),
            );
            loop {
                let sample = tokio::select! {
                    _ = cancel.cancelled() => break,
                    sample = stream.next() => sample,
                };
                match sample {
                    Some(Ok(stats)) => {
                        if tx.send(stats_sample(&stats)).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(container = %name, error = %e, "Error reading container stats");
                        break;
                    }
                    None => break,
                }
            }
        });

        Ok(rx)
    }

    async fn cleanup_old_images(&self, app_id: i64, keep: usize) -> DeployResult<usize> {
        let prefix = app_image_prefix(app_id);
        let mut filters = HashMap::new();
        filters.insert("reference".to_string(), vec![format!("{}*", prefix)]);

        let mut images = self
            .client
            .list_images(Some(ListImagesOptions::<String> {
                all: false,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| daemon_error(ContainerOp::Prune, e))?;

        images.sort_by(|a, b| b.created.cmp(&a.created));

        // Never remove the image the current container runs on
        let in_use = self
            .inspect(&container_name(app_id))
            .await?
            .and_then(|info| info.image);

        let mut removed = 0;
        for image in images.iter().skip(keep) {
            if in_use.as_deref() == Some(image.id.as_str()) {
                continue;
            }
            match self
                .client
                .remove_image(
                    &image.id,
                    Some(RemoveImageOptions {
                        force: true,
                        noprune: false,
                    }),
                    None,
                )
                .await
            {
                Ok(_) => {
                    debug!(app_id, image = %image.id, tags = ?image.repo_tags, "Removed old image");
                    removed += 1;
                }
                Err(e) => warn!(app_id, image = %image.id, error = %e, "Failed to remove old image"),
            }
        }

        if removed > 0 {
            info!(app_id, removed, "Cleaned up old images");
        }
        Ok(removed)
    }

    async fn ensure_network(&self, network: &str) -> DeployResult<()> {
        match self
            .client
            .inspect_network(network, None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(_) => Ok(()),
            Err(BollardError::DockerResponseServerError { status_code: 404, .. }) => {
                self.client
                    .create_network(CreateNetworkOptions {
                        name: network.to_string(),
                        driver: "bridge".to_string(),
                        ..Default::default()
                    })
                    .await
                    .map_err(|e| daemon_error(ContainerOp::Network, e))?;
                info!(network, "Created network");
                Ok(())
            }
            Err(e) => Err(daemon_error(ContainerOp::Network, e)),
        }
    }

    async fn system_prune(&self) -> DeployResult<()> {
        self.cli()
            .args(["system", "prune", "-f"])
            .timeout(Duration::from_secs(300))
            .run(&CancellationToken::new())
            .await
            .map_err(|e| ContainerError::new(ContainerOp::Prune, e.to_string()))?;
        Ok(())
    }

    async fn prune_containers(&self) -> DeployResult<()> {
        let report = self
            .client
            .prune_containers(None::<PruneContainersOptions<String>>)
            .await
            .map_err(|e| daemon_error(ContainerOp::Prune, e))?;
        debug!(reclaimed = ?report.space_reclaimed, "Pruned stopped containers");
        Ok(())
    }

    async fn prune_images(&self) -> DeployResult<()> {
        let report = self
            .client
            .prune_images(None::<PruneImagesOptions<String>>)
            .await
            .map_err(|e| daemon_error(ContainerOp::Prune, e))?;
        debug!(reclaimed = ?report.space_reclaimed, "Pruned dangling images");
        Ok(())
    }
}
