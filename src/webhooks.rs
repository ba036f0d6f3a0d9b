//! GitHub webhook ingest
//!
//! A push to a branch that an application tracks becomes a deployment, the
//! same way a user-triggered deploy does. Deliveries are authenticated with
//! the `X-Hub-Signature-256` HMAC over the raw body using the GitHub App's
//! webhook secret.

use crate::db::{Database, NewDeployment};
use crate::intake::{Intake, IntakeError, Trigger};
use anyhow::Context;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

type HmacSha256 = Hmac<Sha256>;

/// `after` of a push that deleted the branch
const ZERO_SHA: &str = "0000000000000000000000000000000000000000";

/// GitHub push event payload
#[derive(Debug, Deserialize)]
pub struct PushEvent {
    #[serde(rename = "ref")]
    pub ref_name: String,
    pub after: String,
    pub repository: Repository,
    #[serde(default)]
    pub pusher: Option<Pusher>,
    #[serde(default)]
    pub head_commit: Option<HeadCommit>,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Deserialize)]
pub struct Repository {
    pub full_name: String,
}

#[derive(Debug, Deserialize)]
pub struct Pusher {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct HeadCommit {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub author: Option<CommitAuthor>,
}

#[derive(Debug, Deserialize)]
pub struct CommitAuthor {
    pub name: String,
}

impl PushEvent {
    /// Branch name with any `refs/heads/` prefix removed
    pub fn branch(&self) -> &str {
        self.ref_name
            .strip_prefix("refs/heads/")
            .unwrap_or(&self.ref_name)
    }

    pub fn is_deletion(&self) -> bool {
        self.deleted || self.after == ZERO_SHA
    }
}

/// What a delivery resulted in
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Pong,
    Ignored(String),
    NoMatchingApplication,
    Deployed { deployment_id: i64, app_id: i64 },
}

impl WebhookOutcome {
    pub fn message(&self) -> String {
        match self {
            WebhookOutcome::Pong => "pong".to_string(),
            WebhookOutcome::Ignored(reason) => reason.clone(),
            WebhookOutcome::NoMatchingApplication => "no application tracks this branch".to_string(),
            WebhookOutcome::Deployed { deployment_id, .. } => {
                format!("deployment {} queued", deployment_id)
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("missing X-GitHub-Event header")]
    MissingEvent,

    #[error("invalid webhook signature")]
    InvalidSignature,

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error(transparent)]
    Intake(#[from] IntakeError),

    #[error("store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

/// Check `sha256=<hex>` against HMAC-SHA256(body, secret)
pub fn verify_signature(secret: &str, payload: &[u8], header: &str) -> bool {
    let Some(provided) = header.trim().strip_prefix("sha256=") else {
        warn!("Invalid GitHub signature format");
        return false;
    };
    match verify_hmac_sha256(secret, payload, provided) {
        Ok(valid) => valid,
        Err(e) => {
            warn!(error = %e, "Signature verification error");
            false
        }
    }
}

/// Signature header value GitHub would send for `payload`
pub fn sign(secret: &str, payload: &[u8]) -> anyhow::Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).context("Invalid HMAC key")?;
    mac.update(payload);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

fn verify_hmac_sha256(secret: &str, payload: &[u8], signature_hex: &str) -> anyhow::Result<bool> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).context("Invalid HMAC key")?;
    mac.update(payload);
    let expected_hex = hex::encode(mac.finalize().into_bytes());
    Ok(constant_time_compare(&expected_hex, &signature_hex.to_lowercase()))
}

/// Constant-time string comparison
pub fn constant_time_compare(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        result |= x ^ y;
    }
    result == 0
}

pub struct WebhookIngest {
    db: Database,
    intake: Arc<Intake>,
}

impl WebhookIngest {
    pub fn new(db: Database, intake: Arc<Intake>) -> Self {
        Self { db, intake }
    }

    /// Handle one delivery
    ///
    /// Blocks on the store; async callers run it on the blocking pool.
    pub fn handle(
        &self,
        event: Option<&str>,
        signature: Option<&str>,
        body: &[u8],
    ) -> Result<WebhookOutcome, WebhookError> {
        let event = event
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .ok_or(WebhookError::MissingEvent)?;

        let secret = self
            .db
            .get_github_app()?
            .map(|app| app.webhook_secret)
            .filter(|s| !s.is_empty());
        match secret {
            Some(secret) => {
                let valid = signature
                    .map(|sig| verify_signature(&secret, body, sig))
                    .unwrap_or(false);
                if !valid {
                    warn!(event, "Rejected webhook with bad or missing signature");
                    return Err(WebhookError::InvalidSignature);
                }
            }
            None => warn!(event, "No webhook secret configured, accepting unsigned delivery"),
        }

        match event {
            "ping" => return Ok(WebhookOutcome::Pong),
            "push" => {}
            other => {
                debug!(event = other, "Ignoring webhook event");
                return Ok(WebhookOutcome::Ignored(format!("event {} ignored", other)));
            }
        }

        let push: PushEvent =
            serde_json::from_slice(body).map_err(|e| WebhookError::Malformed(e.to_string()))?;
        if push.repository.full_name.is_empty() || push.ref_name.is_empty() {
            return Err(WebhookError::Malformed("repository and ref are required".to_string()));
        }

        let branch = push.branch().to_string();
        let repository = push.repository.full_name.clone();

        if push.is_deletion() {
            debug!(repository = %repository, branch = %branch, "Ignoring branch deletion");
            return Ok(WebhookOutcome::Ignored("branch deleted".to_string()));
        }

        let Some(app_id) = self
            .db
            .find_application_id_by_repo_and_branch(&repository, &branch)?
        else {
            debug!(repository = %repository, branch = %branch, "No application for push");
            return Ok(WebhookOutcome::NoMatchingApplication);
        };

        let app = self
            .db
            .get_application(app_id)?
            .with_context(|| format!("application {} vanished", app_id))?;
        if app.deployment_strategy == "manual" {
            info!(app_id, branch = %branch, "Push ignored, application deploys manually");
            return Ok(WebhookOutcome::Ignored("application deploys manually".to_string()));
        }

        let pusher = push.pusher.as_ref().map(|p| p.name.clone());
        let author = push
            .head_commit
            .as_ref()
            .and_then(|c| c.author.as_ref())
            .map(|a| a.name.clone())
            .or_else(|| pusher.clone());

        let deployment = self.intake.submit(
            NewDeployment {
                app_id,
                commit_hash: push.after.clone(),
                commit_message: push.head_commit.as_ref().map(|c| c.message.clone()),
                commit_author: author,
                triggered_by: None,
            },
            &Trigger::Webhook {
                repository,
                branch,
                pusher,
            },
        )?;

        info!(app_id, deployment_id = deployment.id, commit = %push.after, "Push deployment queued");
        Ok(WebhookOutcome::Deployed {
            deployment_id: deployment.id,
            app_id,
        })
    }
}
