//! GitHub App authentication and REST calls
//!
//! Repository access uses installation tokens. A token is obtained by
//! signing a short RS256 JWT with the App's private key and exchanging it at
//! `POST /app/installations/<id>/access_tokens`. Tokens are cached in memory
//! and in the `github_installations` row and reused until they are within
//! five minutes of expiry.

use crate::config::SharedConfig;
use crate::db::{Database, GitHubInstallationRecord};
use crate::error::{GitError, GitErrorKind};
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use dashmap::DashMap;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Per-request deadline for GitHub API calls
pub const API_TIMEOUT: Duration = Duration::from_secs(30);

/// Tokens closer than this to expiry are refreshed
pub const REFRESH_MARGIN_SECS: i64 = 5 * 60;

const USER_AGENT: &str = "mist-deployer";

/// Claims of the App JWT
#[derive(Debug, Serialize, Deserialize)]
pub struct AppClaims {
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
}

/// Sign the JWT that authenticates as the GitHub App itself
pub fn mint_app_jwt(app_id: i64, private_key_pem: &str) -> Result<String, GitError> {
    let key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes()).map_err(|e| {
        GitError::new(GitErrorKind::Token, format!("invalid GitHub App private key: {}", e))
    })?;

    let now = Utc::now().timestamp();
    let claims = AppClaims {
        iat: now - 60,
        exp: now + 600,
        iss: app_id.to_string(),
    };

    encode(&Header::new(Algorithm::RS256), &claims, &key)
        .map_err(|e| GitError::new(GitErrorKind::Token, format!("failed to sign app JWT: {}", e)))
}

/// An installation token and its expiry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl CachedToken {
    /// True while the token has more than the refresh margin left
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        (self.expires_at - now).num_seconds() > REFRESH_MARGIN_SECS
    }

    fn from_row(row: &GitHubInstallationRecord) -> Option<Self> {
        let token = row.access_token.clone().filter(|t| !t.is_empty())?;
        let expires_at = DateTime::parse_from_rfc3339(row.token_expires_at.as_deref()?)
            .ok()?
            .with_timezone(&Utc);
        Some(Self { token, expires_at })
    }
}

/// Process-wide installation token cache keyed by installation id
///
/// Created once at startup and shared by every deployment worker.
#[derive(Default)]
pub struct TokenCache {
    tokens: RwLock<HashMap<i64, CachedToken>>,
    refresh_locks: DashMap<i64, Arc<tokio::sync::Mutex<()>>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_fresh(&self, installation_id: i64, now: DateTime<Utc>) -> Option<CachedToken> {
        self.tokens
            .read()
            .get(&installation_id)
            .filter(|t| t.is_fresh(now))
            .cloned()
    }

    pub fn put(&self, installation_id: i64, token: CachedToken) {
        self.tokens.write().insert(installation_id, token);
    }

    /// Drop every cached token
    pub fn clear(&self) {
        self.tokens.write().clear();
    }

    fn refresh_lock(&self, installation_id: i64) -> Arc<tokio::sync::Mutex<()>> {
        self.refresh_locks
            .entry(installation_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

/// Latest commit on a branch
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitInfo {
    pub sha: String,
    pub message: String,
    pub html_url: String,
    pub author_name: String,
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    token: String,
    expires_at: String,
}

#[derive(Debug, Deserialize)]
struct CommitResponse {
    sha: String,
    #[serde(default)]
    html_url: String,
    commit: CommitDetails,
}

#[derive(Debug, Deserialize)]
struct CommitDetails {
    #[serde(default)]
    message: String,
    author: Option<CommitAuthor>,
}

#[derive(Debug, Deserialize)]
struct CommitAuthor {
    #[serde(default)]
    name: String,
}

/// GitHub REST client bound to the stored App credentials
pub struct GitHubClient {
    db: Database,
    config: SharedConfig,
    http: reqwest::Client,
    cache: Arc<TokenCache>,
}

impl GitHubClient {
    pub fn new(db: Database, config: SharedConfig, cache: Arc<TokenCache>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(API_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            db,
            config,
            http,
            cache,
        })
    }

    fn api_base(&self) -> String {
        self.config
            .read()
            .github
            .api_base_url
            .trim_end_matches('/')
            .to_string()
    }

    fn store_error(e: anyhow::Error) -> GitError {
        GitError::new(GitErrorKind::Token, format!("{:#}", e))
    }

    /// Token for the installation owned by `user_id`
    ///
    /// Returns `None` when the user has no installation, in which case
    /// repositories are fetched anonymously.
    pub async fn installation_token(&self, user_id: i64) -> Result<Option<String>, GitError> {
        let Some(installation) = self
            .db
            .call(move |db| db.get_installation_by_user(user_id))
            .await
            .map_err(Self::store_error)?
        else {
            debug!(user_id, "No GitHub installation for user");
            return Ok(None);
        };
        let installation_id = installation.installation_id;

        if let Some(cached) = self.cache.get_fresh(installation_id, Utc::now()) {
            return Ok(Some(cached.token));
        }

        let lock = self.cache.refresh_lock(installation_id);
        let _guard = lock.lock().await;

        // Another task may have refreshed while we waited
        if let Some(cached) = self.cache.get_fresh(installation_id, Utc::now()) {
            return Ok(Some(cached.token));
        }

        let row = self
            .db
            .call(move |db| db.get_installation_by_user(user_id))
            .await
            .map_err(Self::store_error)?
            .unwrap_or(installation);

        if let Some(stored) = CachedToken::from_row(&row) {
            if stored.is_fresh(Utc::now()) {
                self.cache.put(installation_id, stored.clone());
                return Ok(Some(stored.token));
            }
        }

        let fresh = self.refresh_token(installation_id).await?;
        let expires_at = fresh.expires_at.to_rfc3339_opts(SecondsFormat::Secs, true);
        let token = fresh.token.clone();
        let stored_expiry = expires_at.clone();
        let previous = row.token_expires_at.clone();
        let swapped = self
            .db
            .call(move |db| {
                db.update_installation_token(installation_id, &token, &stored_expiry, previous.as_deref())
            })
            .await
            .map_err(Self::store_error)?;
        if !swapped {
            debug!(installation_id, "Installation token was refreshed concurrently");
        }

        info!(installation_id, expires_at = %expires_at, "Refreshed GitHub installation token");
        self.cache.put(installation_id, fresh.clone());
        Ok(Some(fresh.token))
    }

    async fn refresh_token(&self, installation_id: i64) -> Result<CachedToken, GitError> {
        let app = self
            .db
            .call(|db| db.get_github_app())
            .await
            .map_err(Self::store_error)?
            .ok_or_else(|| GitError::new(GitErrorKind::Token, "GitHub App is not configured"))?;
        let jwt = mint_app_jwt(app.app_id, &app.private_key_pem)?;

        let url = format!(
            "{}/app/installations/{}/access_tokens",
            self.api_base(),
            installation_id
        );

        let mut attempt = 0;
        loop {
            attempt += 1;
            let response = self
                .http
                .post(&url)
                .bearer_auth(&jwt)
                .header("Accept", "application/vnd.github+json")
                .send()
                .await
                .map_err(|e| GitError::new(GitErrorKind::Token, format!("token request failed: {}", e)))?;

            let status = response.status();
            if status == reqwest::StatusCode::CREATED {
                let body: AccessTokenResponse = response.json().await.map_err(|e| {
                    GitError::new(GitErrorKind::Token, format!("invalid token response: {}", e))
                })?;
                let expires_at = DateTime::parse_from_rfc3339(&body.expires_at)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now() + ChronoDuration::hours(1));
                return Ok(CachedToken {
                    token: body.token,
                    expires_at,
                });
            }

            if status.is_server_error() && attempt < 2 {
                warn!(installation_id, status = %status, "GitHub token endpoint failed, retrying once");
                continue;
            }

            let text = response.text().await.unwrap_or_default();
            return Err(GitError::new(
                GitErrorKind::Token,
                format!("GitHub returned {} for installation token: {}", status, text.trim()),
            )
            .with_status(i32::from(status.as_u16())));
        }
    }

    /// Latest commit on `branch` of `owner/repo`
    pub async fn latest_commit(
        &self,
        repository: &str,
        branch: &str,
        token: Option<&str>,
    ) -> Result<CommitInfo, GitError> {
        let url = format!(
            "{}/repos/{}/commits/{}",
            self.api_base(),
            repository,
            urlencoding::encode(branch)
        );

        let mut request = self
            .http
            .get(&url)
            .header("Accept", "application/vnd.github+json");
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| GitError::new(GitErrorKind::Api, format!("commit lookup failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(GitError::new(
                GitErrorKind::Api,
                format!(
                    "GitHub returned {} for {}@{}: {}",
                    status,
                    repository,
                    branch,
                    text.trim()
                ),
            )
            .with_status(i32::from(status.as_u16())));
        }

        let body: CommitResponse = response
            .json()
            .await
            .map_err(|e| GitError::new(GitErrorKind::Api, format!("invalid commit response: {}", e)))?;

        Ok(CommitInfo {
            sha: body.sha,
            message: body.commit.message,
            html_url: body.html_url,
            author_name: body.commit.author.map(|a| a.name).unwrap_or_default(),
        })
    }
}
