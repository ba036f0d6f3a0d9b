//! Identity resolution for API callers
//!
//! Sessions are HS256 JWTs carried either in the `mist_token` cookie or an
//! `Authorization: Bearer` header. The signing secret lives in the
//! `jwtSecret` system setting and is generated on first start.

use crate::config::Config;
use crate::db::{ApplicationRecord, Database, SETTING_JWT_SECRET};
use crate::error::{DeployError, DeployResult};
use chrono::{Duration, Utc};
use hyper::header::{AUTHORIZATION, COOKIE};
use hyper::HeaderMap;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, TokenData, Validation};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
    pub role: String,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub secret: String,
    pub token_expiry_hours: i64,
    pub cookie_name: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret: uuid::Uuid::new_v4().to_string(),
            token_expiry_hours: 744,
            cookie_name: "mist_token".to_string(),
        }
    }
}

/// An authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: i64,
    pub role: String,
}

impl Identity {
    pub fn is_privileged(&self) -> bool {
        matches!(self.role.as_str(), "owner" | "admin")
    }
}

#[derive(Clone)]
pub struct AuthManager {
    config: Arc<AuthConfig>,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl AuthManager {
    pub fn new(config: AuthConfig) -> Self {
        let encoding_key = EncodingKey::from_secret(config.secret.as_bytes());
        let decoding_key = DecodingKey::from_secret(config.secret.as_bytes());
        Self {
            config: Arc::new(config),
            encoding_key,
            decoding_key,
        }
    }

    /// Build from the stored secret, creating one if none exists yet
    pub fn from_store(db: &Database, config: &Config) -> anyhow::Result<Self> {
        let secret = match db.get_setting(SETTING_JWT_SECRET)?.filter(|s| !s.is_empty()) {
            Some(secret) => secret,
            None => {
                let bytes: [u8; 32] = rand::thread_rng().gen();
                let secret = hex::encode(bytes);
                db.set_setting(SETTING_JWT_SECRET, &secret)?;
                info!("Generated session signing secret");
                secret
            }
        };
        Ok(Self::new(AuthConfig {
            secret,
            token_expiry_hours: config.security.jwt_expiry,
            ..AuthConfig::default()
        }))
    }

    pub fn create_token(&self, user_id: i64, role: &str) -> Result<String, jsonwebtoken::errors::Error> {
        let now = Utc::now();
        let exp = now + Duration::hours(self.config.token_expiry_hours);

        let claims = Claims {
            sub: user_id.to_string(),
            exp: exp.timestamp(),
            iat: now.timestamp(),
            role: role.to_string(),
        };

        encode(&Header::default(), &claims, &self.encoding_key)
    }

    pub fn verify_token(&self, token: &str) -> Result<TokenData<Claims>, jsonwebtoken::errors::Error> {
        let validation = Validation::default();
        decode::<Claims>(token, &self.decoding_key, &validation)
    }

    pub fn extract_token_from_cookie(&self, cookie_header: &str) -> Option<String> {
        for cookie in cookie_header.split(';') {
            let cookie = cookie.trim();
            if let Some(value) = cookie.strip_prefix(&format!("{}=", self.config.cookie_name)) {
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
        None
    }

    pub fn extract_token_from_header(&self, auth_header: &str) -> Option<String> {
        auth_header.strip_prefix("Bearer ").map(|s| s.to_string())
    }

    /// Caller identity from request headers; cookie wins over bearer
    pub fn resolve(&self, headers: &HeaderMap) -> Option<Identity> {
        let token = headers
            .get(COOKIE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| self.extract_token_from_cookie(v))
            .or_else(|| {
                headers
                    .get(AUTHORIZATION)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| self.extract_token_from_header(v))
            })?;

        let data = match self.verify_token(&token) {
            Ok(data) => data,
            Err(e) => {
                debug!(error = %e, "Rejected session token");
                return None;
            }
        };
        let user_id = data.claims.sub.parse().ok()?;
        Some(Identity {
            user_id,
            role: data.claims.role,
        })
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }
}

/// Owners and admins may deploy anything; others must belong to the project
pub fn authorize_deploy(db: &Database, identity: &Identity, app: &ApplicationRecord) -> DeployResult<()> {
    if identity.is_privileged() || db.is_project_member(app.project_id, identity.user_id)? {
        Ok(())
    } else {
        Err(DeployError::Authorization(format!(
            "user {} is not a member of project {}",
            identity.user_id, app.project_id
        )))
    }
}
