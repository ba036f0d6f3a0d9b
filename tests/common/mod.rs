//! Shared fakes and a wired-up deployment core for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use mist::config::{Config, DataLayout, SharedConfig};
use mist::db::{ApplicationRecord, Database, DeploymentRecord};
use mist::docker::{BuildSpec, ContainerDriver, ContainerStats, ContainerStatus, RunSpec};
use mist::engine::Engine;
use mist::error::{BuildError, ContainerError, ContainerOp, DeployError, DeployResult};
use mist::git::SourceProvider;
use mist::github::CommitInfo;
use mist::intake::Intake;
use mist::logs::LogSink;
use mist::queue::Queue;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

/// In-memory container daemon
pub struct FakeDriver {
    pub calls: Mutex<Vec<String>>,
    pub runs: Mutex<Vec<RunSpec>>,
    pub builds: Mutex<Vec<BuildSpec>>,
    containers: Mutex<HashMap<String, ContainerStatus>>,
    build_exit: Mutex<Option<i32>>,
    run_error: Mutex<Option<String>>,
    stop_error: Mutex<Option<String>>,
    build_output: Mutex<Vec<String>>,
    line_delay: Mutex<Duration>,
    panic_on_build: AtomicBool,
    builds_started: AtomicUsize,
    gate: watch::Sender<bool>,
    pub container_output: Mutex<Vec<String>>,
}

impl Default for FakeDriver {
    fn default() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            calls: Mutex::new(Vec::new()),
            runs: Mutex::new(Vec::new()),
            builds: Mutex::new(Vec::new()),
            containers: Mutex::new(HashMap::new()),
            build_exit: Mutex::new(None),
            run_error: Mutex::new(None),
            stop_error: Mutex::new(None),
            build_output: Mutex::new(vec!["Step 1/2 : FROM node:20".to_string(), "Step 2/2 : CMD npm start".to_string()]),
            line_delay: Mutex::new(Duration::ZERO),
            panic_on_build: AtomicBool::new(false),
            builds_started: AtomicUsize::new(0),
            gate,
            container_output: Mutex::new(vec!["listening on :3000".to_string()]),
        }
    }
}

impl FakeDriver {
    pub fn fail_builds_with(&self, code: i32) {
        *self.build_exit.lock() = Some(code);
    }

    /// `run` refuses to start containers
    pub fn fail_runs_with(&self, details: &str) {
        *self.run_error.lock() = Some(details.to_string());
    }

    /// Stopping an existing container fails
    pub fn fail_stop_with(&self, details: &str) {
        *self.stop_error.lock() = Some(details.to_string());
    }

    pub fn set_panic_on_build(&self, on: bool) {
        self.panic_on_build.store(on, Ordering::SeqCst);
    }

    /// Lines each build writes, `delay` apart
    pub fn build_output(&self, lines: &[&str], delay: Duration) {
        *self.build_output.lock() = lines.iter().map(|l| l.to_string()).collect();
        *self.line_delay.lock() = delay;
    }

    /// Builds block until [`release_builds`](Self::release_builds)
    pub fn hold_builds(&self) {
        self.gate.send_replace(false);
    }

    pub fn release_builds(&self) {
        self.gate.send_replace(true);
    }

    pub fn builds_started(&self) -> usize {
        self.builds_started.load(Ordering::SeqCst)
    }

    /// Pretend a container is already up, e.g. from an earlier deployment
    pub fn seed_running(&self, name: &str, image: &str) {
        self.containers.lock().insert(name.to_string(), running_status(name, image));
    }

    pub fn calls_matching(&self, prefix: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.starts_with(prefix)).count()
    }

    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }
}

fn running_status(name: &str, image: &str) -> ContainerStatus {
    ContainerStatus {
        id: format!("cid-{}-{}", name, image),
        state: "running".to_string(),
        status: "Up 1 second".to_string(),
        healthy: true,
        started_at: Some(mist::db::now_timestamp()),
        image: Some(image.to_string()),
    }
}

#[async_trait]
impl ContainerDriver for FakeDriver {
    async fn build_image(&self, spec: &BuildSpec, sink: &LogSink, cancel: &CancellationToken) -> DeployResult<()> {
        self.record(format!("build:{}", spec.tags.join(",")));
        self.builds.lock().push(spec.clone());
        self.builds_started.fetch_add(1, Ordering::SeqCst);

        let mut gate = self.gate.subscribe();
        loop {
            let open = *gate.borrow_and_update();
            if open {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(DeployError::Cancelled),
                changed = gate.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        if self.panic_on_build.load(Ordering::SeqCst) {
            panic!("builder exploded");
        }

        let lines = self.build_output.lock().clone();
        let delay = *self.line_delay.lock();
        for line in lines {
            if cancel.is_cancelled() {
                return Err(DeployError::Cancelled);
            }
            sink.line(line).await;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        match *self.build_exit.lock() {
            Some(code) => Err(BuildError { exit_code: code }.into()),
            None => Ok(()),
        }
    }

    async fn container_exists(&self, name: &str) -> DeployResult<bool> {
        Ok(self.containers.lock().contains_key(name))
    }

    async fn stop_remove(&self, name: &str, _sink: &LogSink, _cancel: &CancellationToken) -> DeployResult<()> {
        self.record(format!("stop_remove:{}", name));
        let mut containers = self.containers.lock();
        if !containers.contains_key(name) {
            return Ok(());
        }
        if let Some(details) = self.stop_error.lock().clone() {
            return Err(ContainerError::new(ContainerOp::Stop, details).into());
        }
        containers.remove(name);
        Ok(())
    }

    async fn run(&self, spec: &RunSpec, _sink: &LogSink, _cancel: &CancellationToken) -> DeployResult<String> {
        self.record(format!("run:{}:{}", spec.name, spec.image));
        self.runs.lock().push(spec.clone());
        if let Some(details) = self.run_error.lock().clone() {
            return Err(ContainerError::new(ContainerOp::Run, details).into());
        }
        let status = running_status(&spec.name, &spec.image);
        let id = status.id.clone();
        self.containers.lock().insert(spec.name.clone(), status);
        Ok(id)
    }

    async fn status(&self, name: &str) -> DeployResult<Option<ContainerStatus>> {
        Ok(self.containers.lock().get(name).cloned())
    }

    async fn stop(&self, name: &str) -> DeployResult<()> {
        if let Some(c) = self.containers.lock().get_mut(name) {
            c.state = "exited".to_string();
        }
        Ok(())
    }

    async fn start(&self, name: &str) -> DeployResult<()> {
        if let Some(c) = self.containers.lock().get_mut(name) {
            c.state = "running".to_string();
        }
        Ok(())
    }

    async fn restart(&self, name: &str) -> DeployResult<()> {
        self.start(name).await
    }

    async fn logs_tail(&self, _name: &str, tail: usize) -> DeployResult<String> {
        let lines = self.container_output.lock().clone();
        let skip = lines.len().saturating_sub(tail);
        Ok(lines[skip..].join("\n"))
    }

    async fn logs_follow(&self, _name: &str, _cancel: CancellationToken) -> DeployResult<mpsc::Receiver<String>> {
        let lines = self.container_output.lock().clone();
        let (tx, rx) = mpsc::channel(lines.len().max(1));
        for line in lines {
            let _ = tx.try_send(line);
        }
        Ok(rx)
    }

    async fn stats(&self, _name: &str, _cancel: CancellationToken) -> DeployResult<mpsc::Receiver<ContainerStats>> {
        let (tx, rx) = mpsc::channel(1);
        let _ = tx.try_send(ContainerStats {
            cpu_percent: 12.5,
            memory_usage: 64 * 1024 * 1024,
            memory_limit: 512 * 1024 * 1024,
            memory_percent: 12.5,
            ..Default::default()
        });
        Ok(rx)
    }

    async fn cleanup_old_images(&self, app_id: i64, keep: usize) -> DeployResult<usize> {
        self.record(format!("cleanup:{}:{}", app_id, keep));
        Ok(0)
    }

    async fn ensure_network(&self, network: &str) -> DeployResult<()> {
        self.record(format!("network:{}", network));
        Ok(())
    }

    async fn system_prune(&self) -> DeployResult<()> {
        Ok(())
    }

    async fn prune_containers(&self) -> DeployResult<()> {
        self.record("prune_containers".to_string());
        Ok(())
    }

    async fn prune_images(&self) -> DeployResult<()> {
        Ok(())
    }
}

/// Working trees under a temp dir and a settable branch head
pub struct FakeSource {
    root: PathBuf,
    head: Mutex<CommitInfo>,
    pub materialized: AtomicUsize,
}

impl FakeSource {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            head: Mutex::new(commit("abc123")),
            materialized: AtomicUsize::new(0),
        }
    }

    pub fn set_head(&self, sha: &str) {
        *self.head.lock() = commit(sha);
    }
}

pub fn commit(sha: &str) -> CommitInfo {
    CommitInfo {
        sha: sha.to_string(),
        message: format!("commit {}", sha),
        html_url: format!("https://github.com/acme/site/commit/{}", sha),
        author_name: "Mona".to_string(),
    }
}

#[async_trait]
impl SourceProvider for FakeSource {
    async fn materialize(
        &self,
        app: &ApplicationRecord,
        _user_id: i64,
        sink: &LogSink,
        _cancel: &CancellationToken,
    ) -> DeployResult<PathBuf> {
        self.materialized.fetch_add(1, Ordering::SeqCst);
        let tree = self.root.join(format!("app-{}", app.id));
        std::fs::create_dir_all(&tree).map_err(anyhow::Error::from)?;
        std::fs::write(tree.join("Dockerfile"), "FROM node:20\n").map_err(anyhow::Error::from)?;
        sink.line(format!("Cloned {}", app.git_repository.as_deref().unwrap_or(""))).await;
        Ok(tree)
    }

    async fn latest_commit(&self, _app: &ApplicationRecord, _user_id: i64) -> DeployResult<CommitInfo> {
        Ok(self.head.lock().clone())
    }
}

/// A deployment core wired to fakes
pub struct Harness {
    pub dir: TempDir,
    pub db: Database,
    pub layout: DataLayout,
    pub config: SharedConfig,
    pub driver: Arc<FakeDriver>,
    pub source: Arc<FakeSource>,
    pub engine: Arc<Engine>,
    pub queue: Arc<Queue>,
    pub intake: Arc<Intake>,
    pub owner: i64,
    pub project: i64,
}

impl Harness {
    pub fn new(capacity: usize, workers: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let layout = DataLayout::new(dir.path().join("data"));
        layout.ensure().unwrap();
        let db = Database::open(layout.database_path()).unwrap();
        let config: SharedConfig = Arc::new(RwLock::new(Config::default()));

        let driver = Arc::new(FakeDriver::default());
        let source = Arc::new(FakeSource::new(dir.path().join("trees")));
        let engine = Arc::new(Engine::new(
            db.clone(),
            layout.clone(),
            Arc::clone(&config),
            source.clone(),
            driver.clone(),
        ));
        let queue = Queue::start(Arc::clone(&engine), capacity, workers);
        let intake = Arc::new(Intake::new(db.clone(), Arc::clone(&queue), source.clone()));

        let owner = db.create_user("alice", "alice@example.com", "owner").unwrap();
        let project = db.create_project("acme", owner).unwrap();

        Self {
            dir,
            db,
            layout,
            config,
            driver,
            source,
            engine,
            queue,
            intake,
            owner,
            project,
        }
    }

    pub fn create_app(&self, name: &str, repository: &str) -> ApplicationRecord {
        let mut app = ApplicationRecord::new(self.project, self.owner, name);
        app.git_repository = Some(repository.to_string());
        app.port = Some(3000);
        let id = self.db.create_application(&app).unwrap();
        self.db.get_application(id).unwrap().unwrap()
    }

    /// Poll until the deployment reaches a terminal status
    pub async fn wait_terminal(&self, deployment_id: i64) -> DeploymentRecord {
        wait_terminal(&self.db, deployment_id).await
    }

    /// Poll until `f` holds, panicking after five seconds
    pub async fn wait_until(&self, f: impl Fn() -> bool) {
        wait_until(f).await
    }
}

pub async fn wait_terminal(db: &Database, deployment_id: i64) -> DeploymentRecord {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let deployment = db.get_deployment(deployment_id).unwrap().unwrap();
        if deployment.is_terminal() {
            return deployment;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "deployment {} stuck in {}",
            deployment_id,
            deployment.stage
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub async fn wait_until(f: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !f() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
