//! Deployment producers
//!
//! The HTTP API and the webhook both end up here: a pending row is inserted,
//! an audit entry records who asked for it, and the id is pushed onto the
//! queue. Nothing in this module executes a deployment.

use crate::db::{Database, DeploymentRecord, DeploymentStage, NewDeployment};
use crate::error::{DeployError, ErrorCode};
use crate::git::SourceProvider;
use crate::queue::{EnqueueError, Queue};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Whoever caused a deployment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    User { id: i64 },
    Webhook { repository: String, branch: String, pusher: Option<String> },
    System { reason: String },
}

impl Trigger {
    pub fn user_id(&self) -> Option<i64> {
        match self {
            Trigger::User { id } => Some(*id),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Trigger::User { .. } => "user",
            Trigger::Webhook { .. } => "webhook",
            Trigger::System { .. } => "system",
        }
    }

    /// Audit log details, tagged with `trigger_type`
    pub fn details(&self, deployment: &DeploymentRecord) -> serde_json::Value {
        let mut details = json!({
            "trigger_type": self.kind(),
            "app_id": deployment.app_id,
            "commit": deployment.commit_hash,
            "deployment_number": deployment.deployment_number,
        });
        match self {
            Trigger::User { .. } => {}
            Trigger::Webhook { repository, branch, pusher } => {
                details["repository"] = json!(repository);
                details["branch"] = json!(branch);
                if let Some(pusher) = pusher {
                    details["pusher"] = json!(pusher);
                }
            }
            Trigger::System { reason } => {
                details["reason"] = json!(reason);
            }
        }
        details
    }
}

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error(transparent)]
    Deploy(#[from] DeployError),

    #[error("{source}")]
    Queue {
        deployment_id: i64,
        #[source]
        source: EnqueueError,
    },
}

impl IntakeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            IntakeError::Deploy(e) => e.code(),
            IntakeError::Queue { source: EnqueueError::Full, .. } => ErrorCode::QueueFull,
            IntakeError::Queue { source: EnqueueError::Closed, .. } => ErrorCode::QueueClosed,
        }
    }
}

impl From<anyhow::Error> for IntakeError {
    fn from(e: anyhow::Error) -> Self {
        IntakeError::Deploy(DeployError::Store(e))
    }
}

#[derive(Clone)]
pub struct Intake {
    db: Database,
    queue: Arc<Queue>,
    source: Arc<dyn SourceProvider>,
}

impl Intake {
    pub fn new(db: Database, queue: Arc<Queue>, source: Arc<dyn SourceProvider>) -> Self {
        Self { db, queue, source }
    }

    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    /// Record, audit and enqueue a deployment
    ///
    /// If the queue refuses the id the row is failed immediately so that no
    /// `pending` row is left without a worker.
    pub fn submit(&self, new: NewDeployment, trigger: &Trigger) -> Result<DeploymentRecord, IntakeError> {
        let deployment = self.db.create_deployment(&new)?;

        if let Err(e) = self.db.insert_audit_log(
            trigger.user_id(),
            "create",
            "deployment",
            Some(deployment.id),
            &trigger.details(&deployment),
        ) {
            warn!(deployment_id = deployment.id, error = %e, "Failed to write audit log");
        }

        if let Err(source) = self.queue.enqueue(deployment.id) {
            let message = source.to_string();
            if let Err(e) = self.db.set_deployment_stage(
                deployment.id,
                DeploymentStage::Failed.status(),
                DeploymentStage::Failed,
                0,
                Some(&message),
            ) {
                warn!(deployment_id = deployment.id, error = %e, "Failed to fail unqueued deployment");
            }
            return Err(IntakeError::Queue {
                deployment_id: deployment.id,
                source,
            });
        }

        info!(
            deployment_id = deployment.id,
            app_id = deployment.app_id,
            commit = %deployment.commit_hash,
            trigger = trigger.kind(),
            "Deployment submitted"
        );
        Ok(deployment)
    }

    /// Deploy the latest commit of the application's branch
    pub async fn deploy_latest(&self, app_id: i64, user_id: i64) -> Result<DeploymentRecord, IntakeError> {
        let app = self
            .db
            .call(move |db| db.get_application(app_id))
            .await?
            .ok_or_else(|| DeployError::not_found(format!("application {} not found", app_id)))?;

        let commit = self.source.latest_commit(&app, app.created_by).await?;

        let new = NewDeployment {
            app_id,
            commit_hash: commit.sha,
            commit_message: Some(commit.message),
            commit_author: Some(commit.author_name).filter(|a| !a.is_empty()),
            triggered_by: Some(user_id),
        };
        let intake = self.clone();
        tokio::task::spawn_blocking(move || intake.submit(new, &Trigger::User { id: user_id }))
            .await
            .map_err(|e| IntakeError::from(anyhow::Error::new(e).context("submit task failed")))?
    }
}

/// Outcome of [`recover`]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Recovery {
    pub requeued: Vec<i64>,
    pub interrupted: Vec<i64>,
}

/// Message stored on deployments a restart cut short
pub const INTERRUPTED: &str = "interrupted by restart";

/// Requeue rows that never started and fail rows a previous process was running
pub fn recover(db: &Database, queue: &Queue) -> anyhow::Result<Recovery> {
    let mut recovery = Recovery::default();

    for deployment in db.list_unfinished_deployments()? {
        if deployment.stage == DeploymentStage::Pending.as_str() {
            match queue.enqueue(deployment.id) {
                Ok(()) => recovery.requeued.push(deployment.id),
                Err(e) => {
                    db.set_deployment_stage(
                        deployment.id,
                        DeploymentStage::Failed.status(),
                        DeploymentStage::Failed,
                        0,
                        Some(&e.to_string()),
                    )?;
                    recovery.interrupted.push(deployment.id);
                }
            }
        } else {
            db.set_deployment_stage(
                deployment.id,
                DeploymentStage::Failed.status(),
                DeploymentStage::Failed,
                0,
                Some(INTERRUPTED),
            )?;
            recovery.interrupted.push(deployment.id);
        }
    }

    if !recovery.requeued.is_empty() || !recovery.interrupted.is_empty() {
        info!(
            requeued = recovery.requeued.len(),
            interrupted = recovery.interrupted.len(),
            "Recovered unfinished deployments"
        );
    }
    Ok(recovery)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(app_id: i64) -> DeploymentRecord {
        DeploymentRecord {
            id: 9,
            app_id,
            commit_hash: "ghi789".to_string(),
            commit_message: None,
            commit_author: None,
            triggered_by: None,
            deployment_number: 3,
            container_id: None,
            container_name: None,
            image_tag: None,
            build_logs_path: None,
            status: "pending".to_string(),
            stage: "pending".to_string(),
            progress: 0,
            error_message: None,
            created_at: String::new(),
            started_at: None,
            finished_at: None,
            duration: None,
            is_active: false,
            rolled_back_from: None,
        }
    }

    #[test]
    fn test_webhook_details() {
        let trigger = Trigger::Webhook {
            repository: "acme/site".to_string(),
            branch: "main".to_string(),
            pusher: Some("octocat".to_string()),
        };
        let details = trigger.details(&record(101));
        assert_eq!(details["trigger_type"], "webhook");
        assert_eq!(details["repository"], "acme/site");
        assert_eq!(details["branch"], "main");
        assert_eq!(details["pusher"], "octocat");
        assert_eq!(details["commit"], "ghi789");
        assert_eq!(trigger.user_id(), None);
    }

    #[test]
    fn test_user_and_system_triggers() {
        let user = Trigger::User { id: 4 };
        assert_eq!(user.user_id(), Some(4));
        assert_eq!(user.details(&record(1))["trigger_type"], "user");

        let system = Trigger::System {
            reason: "rollback".to_string(),
        };
        let details = system.details(&record(1));
        assert_eq!(details["trigger_type"], "system");
        assert_eq!(details["reason"], "rollback");
    }

    #[test]
    fn test_intake_error_codes() {
        let full = IntakeError::Queue {
            deployment_id: 1,
            source: EnqueueError::Full,
        };
        assert_eq!(full.code(), ErrorCode::QueueFull);
        assert_eq!(full.code().status_code(), hyper::StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(full.to_string(), "deployment queue is full");
        let missing: IntakeError = DeployError::not_found("application 3 not found").into();
        assert_eq!(missing.code(), ErrorCode::NotFound);
    }
}
