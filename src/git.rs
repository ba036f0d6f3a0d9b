//! Git integration: working trees for applications
//!
//! Each application has a single working tree under
//! `<root>/projects/<projectId>/apps/<appName>`. The first deployment clones
//! the configured branch shallowly; later deployments pull into the same
//! tree. Credentials come from the GitHub App installation of the
//! application's creator.

use crate::config::{DataLayout, SharedConfig};
use crate::db::ApplicationRecord;
use crate::error::{DeployError, DeployResult, GitError, GitErrorKind};
use crate::exec::{Exec, ExecError};
use crate::github::{CommitInfo, GitHubClient};
use crate::logs::LogSink;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Fetches application source for the deployment engine
#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// Clone or update the application's working tree and return its path
    async fn materialize(
        &self,
        app: &ApplicationRecord,
        user_id: i64,
        sink: &LogSink,
        cancel: &CancellationToken,
    ) -> DeployResult<PathBuf>;

    /// Latest commit on the application's branch
    async fn latest_commit(&self, app: &ApplicationRecord, user_id: i64) -> DeployResult<CommitInfo>;
}

/// Build the URL git clones from, embedding the token for HTTP(S) remotes
pub fn clone_url(base: &str, repository: &str, token: Option<&str>) -> String {
    let base = base.trim_end_matches('/');
    let url = format!("{}/{}.git", base, repository);
    match token {
        Some(token) if !token.is_empty() => {
            for scheme in ["https://", "http://"] {
                if let Some(rest) = url.strip_prefix(scheme) {
                    return format!("{}x-access-token:{}@{}", scheme, token, rest);
                }
            }
            url
        }
        _ => url,
    }
}

fn require_repository(app: &ApplicationRecord) -> DeployResult<&str> {
    app.git_repository
        .as_deref()
        .filter(|r| !r.trim().is_empty())
        .ok_or_else(|| {
            DeployError::validation(format!("application {} has no git repository", app.id))
        })
}

/// Source provider backed by the git CLI and the GitHub App
pub struct GitSource {
    github: Arc<GitHubClient>,
    layout: DataLayout,
    config: SharedConfig,
    git_binary: String,
}

impl GitSource {
    pub fn new(github: Arc<GitHubClient>, layout: DataLayout, config: SharedConfig) -> Self {
        Self {
            github,
            layout,
            config,
            git_binary: "git".to_string(),
        }
    }

    pub fn with_git_binary(mut self, git: impl Into<String>) -> Self {
        self.git_binary = git.into();
        self
    }

    fn map_exec_error(kind: GitErrorKind, err: ExecError) -> DeployError {
        match err {
            ExecError::Cancelled => DeployError::Cancelled,
            ExecError::Timeout(d) => GitError::new(
                GitErrorKind::Timeout,
                format!("git {} timed out after {}s", kind.as_str(), d.as_secs()),
            )
            .into(),
            ExecError::Exit { code, .. } => {
                GitError::new(kind, err.to_string()).with_status(code).into()
            }
            other => GitError::new(kind, other.to_string()).into(),
        }
    }

    async fn clone(
        &self,
        url: &str,
        token: Option<&str>,
        branch: &str,
        path: &Path,
        sink: &LogSink,
        cancel: &CancellationToken,
    ) -> DeployResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| GitError::new(GitErrorKind::Clone, format!("cannot create {}: {}", parent.display(), e)))?;
        }
        // A directory without .git is a leftover from an interrupted clone
        if path.exists() {
            tokio::fs::remove_dir_all(path)
                .await
                .map_err(|e| GitError::new(GitErrorKind::Clone, format!("cannot clear {}: {}", path.display(), e)))?;
        }

        let timeout = self.config.read().git.clone_timeout();
        let mut cmd = Exec::new(&self.git_binary)
            .args(["clone", "--depth", "1", "--branch", branch, "--single-branch", url])
            .arg(path.to_string_lossy())
            .env("GIT_TERMINAL_PROMPT", "0")
            .timeout(timeout)
            .sink(sink);
        if let Some(token) = token {
            cmd = cmd.redact(token);
        }
        cmd.run(cancel)
            .await
            .map_err(|e| Self::map_exec_error(GitErrorKind::Clone, e))?;
        Ok(())
    }

    async fn pull(
        &self,
        url: &str,
        token: Option<&str>,
        branch: &str,
        path: &Path,
        sink: &LogSink,
        cancel: &CancellationToken,
    ) -> DeployResult<()> {
        let timeout = self.config.read().git.clone_timeout();
        let dir = path.to_string_lossy().to_string();

        // The stored remote still carries the token from the original clone
        let mut set_url = Exec::new(&self.git_binary)
            .args(["-C", dir.as_str(), "remote", "set-url", "origin", url])
            .env("GIT_TERMINAL_PROMPT", "0")
            .timeout(timeout)
            .sink(sink)
            .quiet();
        if let Some(token) = token {
            set_url = set_url.redact(token);
        }
        set_url
            .run(cancel)
            .await
            .map_err(|e| Self::map_exec_error(GitErrorKind::Pull, e))?;

        let mut pull = Exec::new(&self.git_binary)
            .args(["-C", dir.as_str(), "pull", "origin", branch])
            .env("GIT_TERMINAL_PROMPT", "0")
            .timeout(timeout)
            .sink(sink);
        if let Some(token) = token {
            pull = pull.redact(token);
        }
        pull.run(cancel)
            .await
            .map_err(|e| Self::map_exec_error(GitErrorKind::Pull, e))?;
        Ok(())
    }
}

#[async_trait]
impl SourceProvider for GitSource {
    async fn materialize(
        &self,
        app: &ApplicationRecord,
        user_id: i64,
        sink: &LogSink,
        cancel: &CancellationToken,
    ) -> DeployResult<PathBuf> {
        let repository = require_repository(app)?;
        let branch = app.git_branch.as_str();
        let path = self.layout.app_dir(app.project_id, &app.name);

        let token = self.github.installation_token(user_id).await?;
        let base = self.config.read().github.git_base_url.clone();
        let url = clone_url(&base, repository, token.as_deref());

        if path.join(".git").exists() {
            info!(app_id = app.id, branch, path = %path.display(), "Updating working tree");
            sink.line(format!("Pulling {}@{}", repository, branch)).await;
            self.pull(&url, token.as_deref(), branch, &path, sink, cancel).await?;
        } else {
            info!(app_id = app.id, branch, path = %path.display(), "Cloning repository");
            sink.line(format!("Cloning {}@{}", repository, branch)).await;
            self.clone(&url, token.as_deref(), branch, &path, sink, cancel).await?;
        }

        debug!(app_id = app.id, "Working tree ready");
        Ok(path)
    }

    async fn latest_commit(&self, app: &ApplicationRecord, user_id: i64) -> DeployResult<CommitInfo> {
        let repository = require_repository(app)?;
        let token = self.github.installation_token(user_id).await?;
        Ok(self
            .github
            .latest_commit(repository, &app.git_branch, token.as_deref())
            .await?)
    }
}
