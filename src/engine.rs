//! Deployment engine
//!
//! [`Engine::execute`] drives one deployment row from `pending` to a terminal
//! state:
//!
//! ```text
//! pending -> cloning -> building -> deploying -> success
//!    \          \          \            \
//!     +----------+----------+------------+--> failed
//! ```
//!
//! Every transition is written to the store before the work of the next
//! stage begins, and every step narrates itself into the deployment's log
//! file. The running container is only touched once the new image exists.

use crate::config::{DataLayout, SharedConfig};
use crate::db::{ApplicationRecord, Database, DeploymentRecord, DeploymentStage};
use crate::docker::{
    app_image_tag, container_name, BuildSpec, ContainerDriver, RunSpec, DEFAULT_IMAGES_KEPT,
};
use crate::error::{DeployError, DeployResult};
use crate::git::SourceProvider;
use crate::logs::LogSink;
use crate::traefik;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Last line of every successful build log
pub const SUCCESS_TRAILER: &str = "✅ Deployment completed";

/// Directory the image is built from
pub fn build_context(working_tree: &Path, root_directory: &str) -> PathBuf {
    let root = root_directory.trim().trim_matches('/');
    if root.is_empty() || root == "." {
        working_tree.to_path_buf()
    } else {
        working_tree.join(root)
    }
}

pub struct Engine {
    db: Database,
    layout: DataLayout,
    config: SharedConfig,
    source: Arc<dyn SourceProvider>,
    driver: Arc<dyn ContainerDriver>,
}

impl Engine {
    pub fn new(
        db: Database,
        layout: DataLayout,
        config: SharedConfig,
        source: Arc<dyn SourceProvider>,
        driver: Arc<dyn ContainerDriver>,
    ) -> Self {
        Self {
            db,
            layout,
            config,
            source,
            driver,
        }
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Drive a deployment to a terminal state
    ///
    /// Errors are also persisted on the row; callers only need them for
    /// logging.
    pub async fn execute(&self, deployment_id: i64, cancel: &CancellationToken) -> DeployResult<()> {
        let deployment = self
            .db
            .call(move |db| db.get_deployment(deployment_id))
            .await?
            .ok_or_else(|| DeployError::not_found(format!("deployment {} not found", deployment_id)))?;

        if deployment.is_terminal() {
            debug!(deployment_id, status = %deployment.status, "Deployment already finished, skipping");
            return Ok(());
        }

        if cancel.is_cancelled() {
            self.record_failure(deployment_id, &DeployError::Cancelled).await;
            return Err(DeployError::Cancelled);
        }

        let app_id = deployment.app_id;
        let app = match self.db.call(move |db| db.get_application(app_id)).await? {
            Some(app) => app,
            None => {
                let err = DeployError::not_found(format!("application {} not found", app_id));
                self.record_failure(deployment_id, &err).await;
                return Err(err);
            }
        };

        let log_path = self
            .layout
            .build_log_path(&deployment.commit_hash, deployment_id);
        let sink = match LogSink::open(&log_path).await {
            Ok(sink) => sink,
            Err(e) => {
                let err = DeployError::Store(
                    anyhow::Error::new(e).context(format!("cannot open {}", log_path.display())),
                );
                self.record_failure(deployment_id, &err).await;
                return Err(err);
            }
        };

        let logs_path = log_path.to_string_lossy().into_owned();
        if let Err(e) = self
            .db
            .call(move |db| {
                db.set_build_logs_path(deployment_id, &logs_path)?;
                db.mark_deployment_started(deployment_id)
            })
            .await
        {
            let err = DeployError::Store(e);
            self.record_failure(deployment_id, &err).await;
            sink.close().await;
            return Err(err);
        }

        let started = Instant::now();
        info!(
            deployment_id,
            app_id = app.id,
            commit = %deployment.commit_hash,
            number = deployment.deployment_number,
            "Starting deployment"
        );
        sink.line(format!(
            "Deployment #{} of {} at {}",
            deployment.deployment_number, app.name, deployment.commit_hash
        ))
        .await;

        let result = self.run_stages(&deployment, &app, &sink, cancel).await;

        match &result {
            Ok(()) => {
                info!(
                    deployment_id,
                    app_id = app.id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Deployment succeeded"
                );
                self.after_success(app.id, &sink).await;
            }
            Err(err) => {
                if err.is_cancelled() {
                    warn!(deployment_id, app_id = app.id, "Deployment cancelled");
                } else {
                    error!(deployment_id, app_id = app.id, error = %err, "Deployment failed");
                }
                sink.line(format!("❌ Deployment failed: {}", err)).await;
                self.record_failure(deployment_id, err).await;
            }
        }

        sink.close().await;
        result
    }

    async fn run_stages(
        &self,
        deployment: &DeploymentRecord,
        app: &ApplicationRecord,
        sink: &LogSink,
        cancel: &CancellationToken,
    ) -> DeployResult<()> {
        let id = deployment.id;

        self.advance(id, DeploymentStage::Cloning).await?;
        sink.line("📦 Fetching source").await;
        let working_tree = self
            .source
            .materialize(app, app.created_by, sink, cancel)
            .await?;
        let context = build_context(&working_tree, &app.root_directory);

        ensure_live(cancel)?;
        self.advance(id, DeploymentStage::Building).await?;
        sink.line("🔨 Building image").await;
        let app_tag = app_image_tag(app.id, &deployment.commit_hash);
        let spec = BuildSpec {
            tags: vec![deployment.commit_hash.clone(), app_tag],
            dockerfile: app
                .dockerfile_path
                .as_deref()
                .filter(|p| !p.trim().is_empty())
                .map(|p| context.join(p)),
            context,
        };
        self.driver.build_image(&spec, sink, cancel).await?;

        if self.config.read().git.remove_git_repo_after_build {
            match tokio::fs::remove_dir_all(&working_tree).await {
                Ok(()) => debug!(app_id = app.id, path = %working_tree.display(), "Removed working tree"),
                Err(e) => warn!(app_id = app.id, error = %e, "Failed to remove working tree"),
            }
        }

        ensure_live(cancel)?;
        self.advance(id, DeploymentStage::Deploying).await?;
        sink.line("🚀 Replacing container").await;

        let port = app
            .port
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or_else(|| self.config.read().server.default_app_port);
        let domains = self.resolve_domains(app).await?;
        let app_id = app.id;
        let env: Vec<(String, String)> = self
            .db
            .call(move |db| db.list_env_variables(app_id))
            .await?
            .into_iter()
            .map(|v| (v.key, v.value))
            .collect();

        let name = container_name(app.id);
        if domains.is_empty() {
            sink.line("No domains configured; the container will not be routed").await;
        } else {
            sink.line(format!("Routing {} on port {}", domains.join(", "), port)).await;
        }

        self.driver.stop_remove(&name, sink, cancel).await?;

        let run = RunSpec {
            image: deployment.commit_hash.clone(),
            name: name.clone(),
            labels: traefik::container_labels(&name, app.id, &domains, port),
            env,
        };
        let container_id = match self.driver.run(&run, sink, cancel).await {
            Ok(id) => id,
            Err(e) => {
                // The previous container is already gone
                if let Err(status_err) = self
                    .db
                    .call(move |db| db.update_application_status(app_id, "error"))
                    .await
                {
                    warn!(app_id, error = %status_err, "Failed to mark application as errored");
                }
                return Err(e);
            }
        };

        sink.line(SUCCESS_TRAILER).await;
        let image_tag = deployment.commit_hash.clone();
        self.db
            .call(move |db| db.complete_deployment(id, app_id, &container_id, &name, &image_tag))
            .await?;
        Ok(())
    }

    async fn advance(&self, deployment_id: i64, stage: DeploymentStage) -> DeployResult<()> {
        debug!(deployment_id, stage = stage.as_str(), "Deployment stage");
        self.db
            .call(move |db| {
                db.set_deployment_stage(deployment_id, stage.status(), stage, stage.progress(), None)
            })
            .await?;
        Ok(())
    }

    /// Domain rows, or the synthesized wildcard hostname when there are none
    pub async fn resolve_domains(&self, app: &ApplicationRecord) -> DeployResult<Vec<String>> {
        let app_id = app.id;
        let domains: Vec<String> = self
            .db
            .call(move |db| db.list_domains(app_id))
            .await?
            .into_iter()
            .map(|d| d.domain)
            .collect();
        if !domains.is_empty() {
            return Ok(domains);
        }

        let settings = self.db.call(|db| db.get_system_settings()).await?;
        let wildcard = if settings.wildcard_domain.is_empty() {
            self.config.read().network.wildcard_domain.clone()
        } else {
            settings.wildcard_domain
        };
        if traefik::wildcard_base(&wildcard).is_empty() {
            return Ok(Vec::new());
        }

        let project_id = app.project_id;
        let project = self
            .db
            .call(move |db| db.get_project(project_id))
            .await?
            .ok_or_else(|| DeployError::not_found(format!("project {} not found", app.project_id)))?;
        Ok(traefik::wildcard_app_domain(&project.name, &app.name, &wildcard)
            .into_iter()
            .collect())
    }

    async fn after_success(&self, app_id: i64, sink: &LogSink) {
        match self.driver.cleanup_old_images(app_id, DEFAULT_IMAGES_KEPT).await {
            Ok(0) => {}
            Ok(removed) => sink.line(format!("Removed {} old image(s)", removed)).await,
            Err(e) => warn!(app_id, error = %e, "Image cleanup failed"),
        }

        if self.config.read().docker.auto_cleanup_containers {
            if let Err(e) = self.driver.prune_containers().await {
                warn!(app_id, error = %e, "Container prune failed");
            }
        }
    }

    /// Best-effort write of the failed status
    pub async fn record_failure(&self, deployment_id: i64, err: &DeployError) {
        let message = err.to_string();
        let result = self
            .db
            .call(move |db| {
                db.set_deployment_stage(
                    deployment_id,
                    DeploymentStage::Failed.status(),
                    DeploymentStage::Failed,
                    0,
                    Some(&message),
                )
            })
            .await;
        if let Err(e) = result {
            error!(deployment_id, error = %e, "Failed to record deployment failure");
        }
    }
}

fn ensure_live(cancel: &CancellationToken) -> DeployResult<()> {
    if cancel.is_cancelled() {
        Err(DeployError::Cancelled)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::{DeploymentStatus, NewDeployment};
    use crate::docker::{ContainerStats, ContainerStatus};
    use crate::github::CommitInfo;
    use async_trait::async_trait;
    use parking_lot::RwLock;
    use tokio::sync::mpsc;

    struct NoSource;

    #[async_trait]
    impl SourceProvider for NoSource {
        async fn materialize(
            &self,
            _app: &ApplicationRecord,
            _user_id: i64,
            _sink: &LogSink,
            _cancel: &CancellationToken,
        ) -> DeployResult<PathBuf> {
            Err(crate::error::GitError::new(crate::error::GitErrorKind::Clone, "exit status 128").into())
        }

        async fn latest_commit(&self, _app: &ApplicationRecord, _user_id: i64) -> DeployResult<CommitInfo> {
            Err(DeployError::validation("unused"))
        }
    }

    struct NoDriver;

    #[async_trait]
    impl ContainerDriver for NoDriver {
        async fn build_image(&self, _: &BuildSpec, _: &LogSink, _: &CancellationToken) -> DeployResult<()> {
            unreachable!("build must not run after a failed clone")
        }
        async fn container_exists(&self, _: &str) -> DeployResult<bool> {
            Ok(false)
        }
        async fn stop_remove(&self, _: &str, _: &LogSink, _: &CancellationToken) -> DeployResult<()> {
            unreachable!("stop must not run after a failed clone")
        }
        async fn run(&self, _: &RunSpec, _: &LogSink, _: &CancellationToken) -> DeployResult<String> {
            unreachable!("run must not run after a failed clone")
        }
        async fn status(&self, _: &str) -> DeployResult<Option<ContainerStatus>> {
            Ok(None)
        }
        async fn stop(&self, _: &str) -> DeployResult<()> {
            Ok(())
        }
        async fn start(&self, _: &str) -> DeployResult<()> {
            Ok(())
        }
        async fn restart(&self, _: &str) -> DeployResult<()> {
            Ok(())
        }
        async fn logs_tail(&self, _: &str, _: usize) -> DeployResult<String> {
            Ok(String::new())
        }
        async fn logs_follow(&self, _: &str, _: CancellationToken) -> DeployResult<mpsc::Receiver<String>> {
            Ok(mpsc::channel(1).1)
        }
        async fn stats(&self, _: &str, _: CancellationToken) -> DeployResult<mpsc::Receiver<ContainerStats>> {
            Ok(mpsc::channel(1).1)
        }
        async fn cleanup_old_images(&self, _: i64, _: usize) -> DeployResult<usize> {
            Ok(0)
        }
        async fn ensure_network(&self, _: &str) -> DeployResult<()> {
            Ok(())
        }
        async fn system_prune(&self) -> DeployResult<()> {
            Ok(())
        }
        async fn prune_containers(&self) -> DeployResult<()> {
            Ok(())
        }
        async fn prune_images(&self) -> DeployResult<()> {
            Ok(())
        }
    }

    fn engine(root: &Path) -> (Engine, i64) {
        let db = Database::open_in_memory().unwrap();
        let user = db.create_user("alice", "alice@example.com", "owner").unwrap();
        let project = db.create_project("Acme", user).unwrap();
        let mut app = ApplicationRecord::new(project, user, "web");
        app.git_repository = Some("acme/site".to_string());
        let app_id = db.create_application(&app).unwrap();
        let config: SharedConfig = Arc::new(RwLock::new(Config::default()));
        let engine = Engine::new(
            db,
            DataLayout::new(root),
            config,
            Arc::new(NoSource),
            Arc::new(NoDriver),
        );
        (engine, app_id)
    }

    #[test]
    fn test_build_context() {
        let tree = Path::new("/data/projects/1/apps/web");
        assert_eq!(build_context(tree, ""), tree);
        assert_eq!(build_context(tree, "."), tree);
        assert_eq!(build_context(tree, "/services/api/"), tree.join("services/api"));
    }

    #[tokio::test]
    async fn test_resolve_domains_prefers_rows_then_wildcard() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, app_id) = engine(dir.path());
        let app = engine.db.get_application(app_id).unwrap().unwrap();

        assert!(engine.resolve_domains(&app).await.unwrap().is_empty());

        engine
            .db
            .set_setting(crate::db::SETTING_WILDCARD_DOMAIN, "*.apps.example.com")
            .unwrap();
        assert_eq!(
            engine.resolve_domains(&app).await.unwrap(),
            vec!["acme-web.apps.example.com".to_string()]
        );

        engine.db.add_domain(app_id, "site.example.com").unwrap();
        engine.db.add_domain(app_id, "www.example.com").unwrap();
        assert_eq!(
            engine.resolve_domains(&app).await.unwrap(),
            vec!["site.example.com".to_string(), "www.example.com".to_string()]
        );
    }

    #[tokio::test]
    async fn test_clone_failure_is_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, app_id) = engine(dir.path());
        let dep = engine
            .db
            .create_deployment(&NewDeployment {
                app_id,
                commit_hash: "abc123".to_string(),
                ..Default::default()
            })
            .unwrap();

        let err = engine.execute(dep.id, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, DeployError::Git(_)));

        let row = engine.db.get_deployment(dep.id).unwrap().unwrap();
        assert_eq!(row.status(), Some(DeploymentStatus::Failed));
        assert_eq!(row.stage, "failed");
        assert_eq!(row.progress, 0);
        assert!(row.error_message.unwrap().starts_with("git clone failed"));
        assert!(row.finished_at.is_some());
        assert!(!row.is_active);

        let log = crate::logs::read_all(dir.path().join(format!("logs/abc123{}_build_logs", dep.id)))
            .await
            .unwrap();
        assert!(log.contains("❌ Deployment failed"));
        assert_eq!(engine.db.get_application(app_id).unwrap().unwrap().status, "stopped");
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, app_id) = engine(dir.path());
        let dep = engine
            .db
            .create_deployment(&NewDeployment {
                app_id,
                commit_hash: "abc123".to_string(),
                ..Default::default()
            })
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = engine.execute(dep.id, &cancel).await.unwrap_err();
        assert!(err.is_cancelled());

        let row = engine.db.get_deployment(dep.id).unwrap().unwrap();
        assert_eq!(row.status, "failed");
        assert_eq!(row.error_message.as_deref(), Some("cancelled"));
    }

    #[tokio::test]
    async fn test_finished_deployment_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, app_id) = engine(dir.path());
        let dep = engine
            .db
            .create_deployment(&NewDeployment {
                app_id,
                commit_hash: "abc123".to_string(),
                ..Default::default()
            })
            .unwrap();
        engine
            .db
            .set_deployment_stage(dep.id, DeploymentStatus::Failed, DeploymentStage::Failed, 0, Some("x"))
            .unwrap();

        engine.execute(dep.id, &CancellationToken::new()).await.unwrap();
        let row = engine.db.get_deployment(dep.id).unwrap().unwrap();
        assert_eq!(row.error_message.as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn test_missing_deployment() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _) = engine(dir.path());
        let err = engine.execute(999, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, DeployError::NotFound(_)));
    }
}
