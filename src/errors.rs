use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use thiserror::Error;

/// Kinds of failure surfaced by the instance lifecycle engine and its collaborators.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("an instance is already running")]
    AlreadyRunning,

    #[error("no instance exists")]
    NoInstance,

    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("vfio {op} failed for {addr}: {source}")]
    Vfio { op: &'static str, addr: String, #[source] source: crate::vfio::VfioError },

    #[error("hypervisor {op} failed: {message}")]
    Hypervisor { op: &'static str, message: String },

    #[error("image pull failed for {image}: {message}")]
    ImagePull { image: String, message: String },

    #[error("tunnel {op} failed: {message}")]
    Tunnel { op: &'static str, message: String },

    #[error("port allocation failed: {0}")]
    PortAllocation(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("internal error")]
    Panicked,
}

impl AgentError {
    fn status_code(&self) -> StatusCode {
        match self {
            AgentError::AlreadyRunning => StatusCode::BAD_REQUEST,
            AgentError::NoInstance => StatusCode::NOT_FOUND,
            AgentError::UnknownCommand(_) => StatusCode::BAD_REQUEST,
            AgentError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AgentError::Unauthorized => StatusCode::UNAUTHORIZED,
            AgentError::Vfio { .. }
            | AgentError::Hypervisor { .. }
            | AgentError::ImagePull { .. }
            | AgentError::Tunnel { .. }
            | AgentError::PortAllocation(_)
            | AgentError::Persistence(_)
            | AgentError::Panicked => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ApiErrorBody {
    ok: bool,
    error: String,
}

impl IntoResponse for AgentError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        tracing::error!(error = %self, %status, "request failed");
        (status, Json(ApiErrorBody { ok: false, error: self.to_string() })).into_response()
    }
}

pub type AgentResult<T> = Result<T, AgentError>;
