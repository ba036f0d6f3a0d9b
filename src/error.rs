//! Error kinds surfaced by the deployment core and their JSON responses

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Which Git step failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitErrorKind {
    Clone,
    Pull,
    Token,
    Api,
    Timeout,
}

impl GitErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GitErrorKind::Clone => "clone",
            GitErrorKind::Pull => "pull",
            GitErrorKind::Token => "token",
            GitErrorKind::Api => "api",
            GitErrorKind::Timeout => "timeout",
        }
    }
}

/// Failure while talking to GitHub or running git
#[derive(Debug, Clone, Error)]
#[error("git {} failed: {details}", kind.as_str())]
pub struct GitError {
    pub kind: GitErrorKind,
    pub details: String,
    /// Remote HTTP status or subprocess exit code, when there is one
    pub status: Option<i32>,
}

impl GitError {
    pub fn new(kind: GitErrorKind, details: impl Into<String>) -> Self {
        Self {
            kind,
            details: details.into(),
            status: None,
        }
    }

    pub fn with_status(mut self, status: i32) -> Self {
        self.status = Some(status);
        self
    }
}

/// Non-zero exit from an image build
#[derive(Debug, Clone, Error)]
#[error("docker build failed: exit {exit_code}")]
pub struct BuildError {
    pub exit_code: i32,
}

/// Container daemon operation that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerOp {
    Build,
    Inspect,
    Stop,
    Remove,
    Run,
    Start,
    Restart,
    Logs,
    Stats,
    Network,
    Prune,
}

impl ContainerOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerOp::Build => "build",
            ContainerOp::Inspect => "inspect",
            ContainerOp::Stop => "stop",
            ContainerOp::Remove => "remove",
            ContainerOp::Run => "run",
            ContainerOp::Start => "start",
            ContainerOp::Restart => "restart",
            ContainerOp::Logs => "logs",
            ContainerOp::Stats => "stats",
            ContainerOp::Network => "network",
            ContainerOp::Prune => "prune",
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("docker {} failed: {details}", op.as_str())]
pub struct ContainerError {
    pub op: ContainerOp,
    pub details: String,
}

impl ContainerError {
    pub fn new(op: ContainerOp, details: impl Into<String>) -> Self {
        Self {
            op,
            details: details.into(),
        }
    }
}

/// Errors at the deployment core boundary
///
/// `Display` yields the component-prefixed text that is stored in
/// `Deployment.errorMessage`.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Authorization(String),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error("store error: {0:#}")]
    Store(#[from] anyhow::Error),

    #[error("cancelled")]
    Cancelled,

    #[error("worker panic: {0}")]
    Panic(String),
}

pub type DeployResult<T> = std::result::Result<T, DeployError>;

/// Machine readable error codes for HTTP responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    GitError,
    BuildError,
    ContainerError,
    QueueFull,
    QueueClosed,
    StoreError,
    Cancelled,
    InternalError,
}

impl ErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::ValidationError => StatusCode::BAD_REQUEST,
            ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Conflict => StatusCode::CONFLICT,
            ErrorCode::GitError => StatusCode::BAD_GATEWAY,
            ErrorCode::BuildError => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCode::ContainerError => StatusCode::BAD_GATEWAY,
            ErrorCode::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::QueueClosed => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::StoreError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::Cancelled => StatusCode::CONFLICT,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "VALIDATION_ERROR",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::Forbidden => "FORBIDDEN",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Conflict => "CONFLICT",
            ErrorCode::GitError => "GIT_ERROR",
            ErrorCode::BuildError => "BUILD_ERROR",
            ErrorCode::ContainerError => "CONTAINER_ERROR",
            ErrorCode::QueueFull => "QUEUE_FULL",
            ErrorCode::QueueClosed => "QUEUE_CLOSED",
            ErrorCode::StoreError => "STORE_ERROR",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl DeployError {
    pub fn validation(msg: impl Into<String>) -> Self {
        DeployError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        DeployError::NotFound(msg.into())
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            DeployError::Validation(_) => ErrorCode::ValidationError,
            DeployError::Authorization(_) => ErrorCode::Forbidden,
            DeployError::NotFound(_) => ErrorCode::NotFound,
            DeployError::Git(_) => ErrorCode::GitError,
            DeployError::Build(_) => ErrorCode::BuildError,
            DeployError::Container(_) => ErrorCode::ContainerError,
            DeployError::Store(_) => ErrorCode::StoreError,
            DeployError::Cancelled => ErrorCode::Cancelled,
            DeployError::Panic(_) => ErrorCode::InternalError,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.code().status_code()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DeployError::Cancelled)
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub code: ErrorCode,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: message.into(),
            code,
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"success":false,"error":"{}","code":"{}"}}"#,
                self.error.replace('\"', "\\\""),
                self.code.as_str()
            )
        })
    }
}

/// Build a JSON error response with the code's default status
pub fn json_error_response(
    code: ErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = ErrorResponse::new(code, message).to_json();

    let mut response = Response::new(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed());
    *response.status_mut() = code.status_code();
    response.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    response
}

impl From<&DeployError> for Response<BoxBody<Bytes, hyper::Error>> {
    fn from(err: &DeployError) -> Self {
        json_error_response(err.code(), err.to_string())
    }
}
