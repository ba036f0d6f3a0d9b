//! HTTP API for the deployment core
//!
//! Routes:
//!
//! | Method | Path | Auth |
//! |---|---|---|
//! | GET | `/api/health` | none |
//! | GET | `/api/auth/setup-status` | none |
//! | POST | `/api/github/webhook` | signature |
//! | POST | `/api/deployments/create` | session |
//! | POST | `/api/deployments/cancel` | session |
//! | GET | `/api/deployments?appId=` | session |
//! | GET | `/api/deployments/logs?id=` | session |
//! | PUT | `/api/settings/system` | owner/admin |
//! | GET (ws) | `/api/ws/logs?id=` | session |
//! | GET (ws) | `/api/ws/container-logs?appId=` | session |
//! | GET (ws) | `/api/ws/container-stats?appId=` | session |

use crate::auth::{authorize_deploy, AuthManager, Identity};
use crate::config::{DataLayout, SharedConfig};
use crate::db::{
    ApplicationRecord, Database, DeploymentRecord, SETTING_ALLOWED_ORIGINS, SETTING_MIST_APP_NAME,
    SETTING_WILDCARD_DOMAIN,
};
use crate::docker::{container_name, ContainerDriver};
use crate::error::{json_error_response, DeployError, ErrorCode};
use crate::intake::Intake;
use crate::logs;
use crate::queue::{CancelOutcome, Queue};
use crate::state::SetupState;
use crate::traefik;
use crate::webhooks::{WebhookError, WebhookIngest};
use crate::ws::{self, ApiBody, Frame};
use anyhow::Result;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::CONTENT_TYPE;
use hyper::HeaderMap;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Deployments returned by the listing endpoint when no limit is given
const DEFAULT_LIST_LIMIT: usize = 50;

/// API response wrapper
#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateDeploymentRequest {
    app_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelDeploymentRequest {
    deployment_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SystemSettingsRequest {
    wildcard_domain: Option<String>,
    mist_app_name: Option<String>,
    allowed_origins: Option<String>,
}

#[derive(Debug, Serialize)]
struct DeploymentLogs {
    deployment: DeploymentRecord,
    logs: String,
}

/// Everything request handlers need
pub struct ApiState {
    pub db: Database,
    pub config: SharedConfig,
    pub layout: DataLayout,
    pub auth: AuthManager,
    pub setup: SetupState,
    pub intake: Arc<Intake>,
    pub queue: Arc<Queue>,
    pub webhooks: WebhookIngest,
    pub driver: Arc<dyn ContainerDriver>,
}

pub struct ApiServer {
    state: Arc<ApiState>,
    listener: TcpListener,
}

impl ApiServer {
    pub async fn bind(state: Arc<ApiState>, addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { state, listener })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until shutdown is signalled
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) -> Result<()> {
        info!(addr = %self.local_addr()?, "API server listening");

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                let io = TokioIo::new(stream);
                                let service = service_fn(move |req| {
                                    let state = Arc::clone(&state);
                                    async move { handle_request(state, req).await }
                                });
                                if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                                    .serve_connection_with_upgrades(io, service)
                                    .await
                                {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("API server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_request(
    state: Arc<ApiState>,
    req: Request<Incoming>,
) -> Result<Response<ApiBody>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();
    let params = query_params(&req);

    debug!(%method, %path, "API request");

    let result = match (method.clone(), path.as_str()) {
        (Method::GET, "/api/health") => Ok(json_response(
            StatusCode::OK,
            json!({"status": "ok", "version": env!("CARGO_PKG_VERSION")}).to_string(),
        )),
        (Method::GET, "/api/auth/setup-status") => setup_status(&state).await,
        (Method::POST, "/api/github/webhook") => return Ok(github_webhook(&state, req).await),
        _ => {
            let Some(identity) = state.auth.resolve(req.headers()) else {
                warn!(%path, "Unauthorized API request");
                return Ok(json_error_response(ErrorCode::Unauthorized, "unauthorized"));
            };
            match (method, path.as_str()) {
                (Method::POST, "/api/deployments/create") => create_deployment(&state, identity, req).await,
                (Method::POST, "/api/deployments/cancel") => cancel_deployment(&state, identity, req).await,
                (Method::GET, "/api/deployments") => list_deployments(&state, identity, &params).await,
                (Method::GET, "/api/deployments/logs") => deployment_logs(&state, identity, &params).await,
                (Method::PUT, "/api/settings/system") => update_system_settings(&state, &identity, req).await,
                (Method::GET, "/api/ws/logs") => build_log_socket(&state, identity, &params, req).await,
                (Method::GET, "/api/ws/container-logs") => {
                    container_socket(&state, identity, &params, req, Feed::Logs).await
                }
                (Method::GET, "/api/ws/container-stats") => {
                    container_socket(&state, identity, &params, req, Feed::Stats).await
                }
                _ => Ok(json_error_response(ErrorCode::NotFound, "Not found")),
            }
        }
    };

    Ok(result.unwrap_or_else(|e| {
        if matches!(e, DeployError::Store(_)) {
            error!(error = %e, %path, "API error");
        }
        Response::from(&e)
    }))
}

// ==================== Helpers ====================

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<ApiBody> {
    let mut response = Response::new(Full::new(body.into()).map_err(|e| match e {}).boxed());
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

fn ok_json<T: Serialize>(data: T) -> Result<Response<ApiBody>, DeployError> {
    let body = serde_json::to_string(&ApiResponse::ok(data)).map_err(anyhow::Error::from)?;
    Ok(json_response(StatusCode::OK, body))
}

fn query_params<B>(req: &Request<B>) -> HashMap<String, String> {
    req.uri()
        .query()
        .unwrap_or("")
        .split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            if key.is_empty() {
                return None;
            }
            let value = urlencoding::decode(value).ok()?.into_owned();
            Some((key.to_string(), value))
        })
        .collect()
}

fn int_param(params: &HashMap<String, String>, name: &str) -> Result<i64, DeployError> {
    params
        .get(name)
        .ok_or_else(|| DeployError::validation(format!("missing {}", name)))?
        .parse()
        .map_err(|_| DeployError::validation(format!("invalid {}", name)))
}

async fn read_json<T: for<'de> Deserialize<'de>>(req: Request<Incoming>) -> Result<T, DeployError> {
    let body = req
        .into_body()
        .collect()
        .await
        .map_err(|e| DeployError::validation(format!("cannot read body: {}", e)))?
        .to_bytes();
    serde_json::from_slice(&body).map_err(|e| DeployError::validation(format!("invalid request body: {}", e)))
}

/// Run store-backed handler work on the blocking pool
async fn blocking<T, F>(state: &Arc<ApiState>, f: F) -> Result<T, DeployError>
where
    F: FnOnce(&ApiState) -> Result<T, DeployError> + Send + 'static,
    T: Send + 'static,
{
    let state = Arc::clone(state);
    tokio::task::spawn_blocking(move || f(&state))
        .await
        .map_err(|e| DeployError::Store(anyhow::Error::new(e).context("store task failed")))?
}

fn load_app(state: &ApiState, identity: &Identity, app_id: i64) -> Result<ApplicationRecord, DeployError> {
    let app = state
        .db
        .get_application(app_id)?
        .ok_or_else(|| DeployError::not_found(format!("application {} not found", app_id)))?;
    authorize_deploy(&state.db, identity, &app)?;
    Ok(app)
}

fn load_deployment(
    state: &ApiState,
    identity: &Identity,
    deployment_id: i64,
) -> Result<DeploymentRecord, DeployError> {
    let deployment = state
        .db
        .get_deployment(deployment_id)?
        .ok_or_else(|| DeployError::not_found(format!("deployment {} not found", deployment_id)))?;
    load_app(state, identity, deployment.app_id)?;
    Ok(deployment)
}

fn check_origin(state: &ApiState, headers: &HeaderMap) -> Result<(), DeployError> {
    let allowed = state.db.get_system_settings()?.allowed_origins;
    if ws::origin_allowed(headers, &allowed) {
        Ok(())
    } else {
        Err(DeployError::Authorization("origin not allowed".to_string()))
    }
}

fn log_path(state: &ApiState, deployment: &DeploymentRecord) -> PathBuf {
    deployment
        .build_logs_path
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| state.layout.build_log_path(&deployment.commit_hash, deployment.id))
}

// ==================== Handlers ====================

async fn setup_status(state: &Arc<ApiState>) -> Result<Response<ApiBody>, DeployError> {
    let required = if state.setup.is_required() {
        blocking(state, |state| Ok(state.setup.refresh(&state.db)?)).await?
    } else {
        false
    };
    ok_json(json!({ "setupRequired": required }))
}

async fn github_webhook(state: &Arc<ApiState>, req: Request<Incoming>) -> Response<ApiBody> {
    let header = |name: &str| {
        req.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let event = header("x-github-event");
    let signature = header("x-hub-signature-256");

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => return json_error_response(ErrorCode::ValidationError, format!("cannot read body: {}", e)),
    };

    let handled = blocking(state, move |state| {
        Ok(state.webhooks.handle(event.as_deref(), signature.as_deref(), &body))
    })
    .await;
    let handled = match handled {
        Ok(handled) => handled,
        Err(e) => {
            error!(error = %e, "Webhook processing failed");
            return Response::from(&e);
        }
    };

    match handled {
        Ok(outcome) => json_response(
            StatusCode::OK,
            json!({"success": true, "message": outcome.message()}).to_string(),
        ),
        Err(e) => {
            let code = match &e {
                WebhookError::MissingEvent | WebhookError::Malformed(_) => ErrorCode::ValidationError,
                WebhookError::InvalidSignature => ErrorCode::Unauthorized,
                WebhookError::Intake(inner) => inner.code(),
                WebhookError::Store(_) => ErrorCode::StoreError,
            };
            if code == ErrorCode::StoreError {
                error!(error = %e, "Webhook processing failed");
            }
            json_error_response(code, e.to_string())
        }
    }
}

async fn create_deployment(
    state: &Arc<ApiState>,
    identity: Identity,
    req: Request<Incoming>,
) -> Result<Response<ApiBody>, DeployError> {
    let request: CreateDeploymentRequest = read_json(req).await?;
    let user_id = identity.user_id;
    let app = blocking(state, move |state| load_app(state, &identity, request.app_id)).await?;

    match state.intake.deploy_latest(app.id, user_id).await {
        Ok(deployment) => ok_json(deployment),
        Err(e) => Ok(json_error_response(e.code(), e.to_string())),
    }
}

async fn cancel_deployment(
    state: &Arc<ApiState>,
    identity: Identity,
    req: Request<Incoming>,
) -> Result<Response<ApiBody>, DeployError> {
    let request: CancelDeploymentRequest = read_json(req).await?;
    let deployment =
        blocking(state, move |state| load_deployment(state, &identity, request.deployment_id)).await?;
    if deployment.is_terminal() {
        return Ok(json_error_response(
            ErrorCode::Conflict,
            format!("deployment {} already finished", deployment.id),
        ));
    }

    let outcome = match state.queue.cancel(deployment.id) {
        CancelOutcome::Running => "running",
        CancelOutcome::Pending => "pending",
    };
    ok_json(json!({ "deploymentId": deployment.id, "cancelled": outcome }))
}

async fn list_deployments(
    state: &Arc<ApiState>,
    identity: Identity,
    params: &HashMap<String, String>,
) -> Result<Response<ApiBody>, DeployError> {
    let app_id = int_param(params, "appId")?;
    let limit = params
        .get("limit")
        .and_then(|l| l.parse().ok())
        .unwrap_or(DEFAULT_LIST_LIMIT);
    let deployments = blocking(state, move |state| {
        load_app(state, &identity, app_id)?;
        Ok(state.db.list_deployments(app_id, limit)?)
    })
    .await?;
    ok_json(deployments)
}

async fn deployment_logs(
    state: &Arc<ApiState>,
    identity: Identity,
    params: &HashMap<String, String>,
) -> Result<Response<ApiBody>, DeployError> {
    let deployment_id = int_param(params, "id")?;
    let deployment = blocking(state, move |state| load_deployment(state, &identity, deployment_id)).await?;
    if !deployment.is_terminal() {
        return Ok(json_error_response(
            ErrorCode::Conflict,
            "deployment is still in progress; stream /api/ws/logs instead",
        ));
    }

    let logs = match logs::read_all(log_path(state, &deployment)).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(DeployError::Store(e.into())),
    };
    ok_json(DeploymentLogs { deployment, logs })
}

async fn update_system_settings(
    state: &Arc<ApiState>,
    identity: &Identity,
    req: Request<Incoming>,
) -> Result<Response<ApiBody>, DeployError> {
    if !identity.is_privileged() {
        return Err(DeployError::Authorization("only owners and admins may change settings".to_string()));
    }
    let request: SystemSettingsRequest = read_json(req).await?;

    let (settings, routed) = blocking(state, move |state| {
        for (key, value) in [
            (SETTING_WILDCARD_DOMAIN, &request.wildcard_domain),
            (SETTING_MIST_APP_NAME, &request.mist_app_name),
            (SETTING_ALLOWED_ORIGINS, &request.allowed_origins),
        ] {
            if let Some(value) = value {
                state.db.set_setting(key, value.trim())?;
            }
        }

        let config = state.config.read().clone();
        let routed = traefik::sync_dashboard_route(&state.db, &state.layout, &config)?;
        Ok((state.db.get_system_settings()?, routed))
    })
    .await?;
    ok_json(json!({
        "wildcardDomain": settings.wildcard_domain,
        "mistAppName": settings.mist_app_name,
        "allowedOrigins": settings.allowed_origins,
        "dashboardRouted": routed,
    }))
}

async fn build_log_socket(
    state: &Arc<ApiState>,
    identity: Identity,
    params: &HashMap<String, String>,
    req: Request<Incoming>,
) -> Result<Response<ApiBody>, DeployError> {
    if !ws::is_upgrade_request(&req) {
        return Err(DeployError::validation("expected a WebSocket upgrade"));
    }
    let deployment_id = int_param(params, "id")?;
    let headers = req.headers().clone();
    let deployment = blocking(state, move |state| {
        let deployment = load_deployment(state, &identity, deployment_id)?;
        check_origin(state, &headers)?;
        Ok(deployment)
    })
    .await?;

    let path = log_path(state, &deployment);
    let db = state.db.clone();
    let deployment_id = deployment.id;

    Ok(ws::upgrade(req, move |socket| async move {
        debug!(deployment_id, "Build log subscriber connected");
        let cancel = CancellationToken::new();
        let finished = move || {
            db.get_deployment(deployment_id)
                .ok()
                .flatten()
                .map(|d| d.is_terminal())
                .unwrap_or(true)
        };
        let mut lines = logs::tail(path, cancel.clone(), finished);

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            while let Some(line) = lines.recv().await {
                if tx.send(Message::text(line)).await.is_err() {
                    break;
                }
            }
        });

        ws::pump(socket, rx, cancel).await;
        debug!(deployment_id, "Build log subscriber disconnected");
    }))
}

#[derive(Debug, Clone, Copy)]
enum Feed {
    Logs,
    Stats,
}

async fn container_socket(
    state: &Arc<ApiState>,
    identity: Identity,
    params: &HashMap<String, String>,
    req: Request<Incoming>,
    feed: Feed,
) -> Result<Response<ApiBody>, DeployError> {
    if !ws::is_upgrade_request(&req) {
        return Err(DeployError::validation("expected a WebSocket upgrade"));
    }
    let app_id = int_param(params, "appId")?;
    let headers = req.headers().clone();
    let app = blocking(state, move |state| {
        let app = load_app(state, &identity, app_id)?;
        check_origin(state, &headers)?;
        Ok(app)
    })
    .await?;

    let driver = Arc::clone(&state.driver);
    let name = container_name(app.id);

    Ok(ws::upgrade(req, move |socket| async move {
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(container_feed(driver, name, feed, tx, cancel.clone()));
        ws::pump(socket, rx, cancel).await;
    }))
}

/// Produce `status`, then `log`/`stats` frames, then `end`
async fn container_feed(
    driver: Arc<dyn ContainerDriver>,
    name: String,
    feed: Feed,
    tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
) {
    let send = |frame: Message| {
        let tx = tx.clone();
        async move { tx.send(frame).await.is_ok() }
    };

    let status = match driver.status(&name).await {
        Ok(Some(status)) => status,
        Ok(None) => {
            send(Frame::new("error", json!({"message": format!("container {} not found", name)})).to_message()).await;
            send(Frame::new("end", json!({})).to_message()).await;
            return;
        }
        Err(e) => {
            send(Frame::new("error", json!({"message": e.to_string()})).to_message()).await;
            send(Frame::new("end", json!({})).to_message()).await;
            return;
        }
    };

    let running = status.is_running();
    if !send(Frame::new("status", &status).to_message()).await {
        return;
    }
    if !running {
        send(Frame::new("error", json!({"message": format!("container {} is not running", name)})).to_message())
            .await;
        send(Frame::new("end", json!({})).to_message()).await;
        return;
    }

    match feed {
        Feed::Logs => match driver.logs_follow(&name, cancel.clone()).await {
            Ok(mut lines) => {
                while let Some(line) = lines.recv().await {
                    if !send(Frame::new("log", json!({ "line": line })).to_message()).await {
                        return;
                    }
                }
            }
            Err(e) => {
                send(Frame::new("error", json!({"message": e.to_string()})).to_message()).await;
            }
        },
        Feed::Stats => match driver.stats(&name, cancel.clone()).await {
            Ok(mut samples) => {
                while let Some(sample) = samples.recv().await {
                    if !send(Frame::new("stats", &sample).to_message()).await {
                        return;
                    }
                }
            }
            Err(e) => {
                send(Frame::new("error", json!({"message": e.to_string()})).to_message()).await;
            }
        },
    }

    if !cancel.is_cancelled() {
        send(Frame::new("end", json!({})).to_message()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_response() {
        let response = ApiResponse::ok("test".to_string());
        assert!(response.success);
        assert_eq!(response.data, Some("test".to_string()));
        let json = serde_json::to_string(&response).unwrap();
        assert!(!json.contains("error"));
    }

    #[test]
    fn test_query_params() {
        let req = Request::builder()
            .uri("/api/deployments?appId=101&limit=5&name=a%20b&flag")
            .body(())
            .unwrap();
        let params = query_params(&req);
        assert_eq!(params["appId"], "101");
        assert_eq!(params["name"], "a b");
        assert_eq!(params["flag"], "");
        assert_eq!(int_param(&params, "limit").unwrap(), 5);
        assert!(matches!(int_param(&params, "id"), Err(DeployError::Validation(_))));
        assert!(matches!(int_param(&params, "name"), Err(DeployError::Validation(_))));
    }
}
