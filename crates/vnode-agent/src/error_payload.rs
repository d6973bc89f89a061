use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::error::EnvError;

const MAX_MESSAGE_BYTES: usize = 32 * 1024;
const MAX_HINT_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

pub fn encode(code: &str, message: impl Into<String>, hint: Option<String>) -> ErrorPayload {
    ErrorPayload {
        code: code.to_string(),
        message: truncate_utf8(&message.into(), MAX_MESSAGE_BYTES),
        hint: hint.map(|h| truncate_utf8(&h, MAX_HINT_BYTES)),
    }
}

impl From<&EnvError> for ErrorPayload {
    fn from(err: &EnvError) -> Self {
        encode(err.code(), err.to_string(), err.hint().map(str::to_string))
    }
}

pub fn status_for(err: &EnvError) -> StatusCode {
    match err {
        EnvError::InvalidQuota(_) | EnvError::InvalidId(_) | EnvError::ParseError(_) => {
            StatusCode::BAD_REQUEST
        }
        EnvError::NotFound(_) => StatusCode::NOT_FOUND,
        EnvError::QuotaExceeded { .. } | EnvError::InvalidTransition { .. } => StatusCode::CONFLICT,
        EnvError::TemplateMissing(_)
        | EnvError::CopyFailure { .. }
        | EnvError::BinaryMissing(_)
        | EnvError::LinkageError { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        EnvError::SpawnFailure { .. } | EnvError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        EnvError::ProxyConfigFailure { .. } => StatusCode::BAD_GATEWAY,
        EnvError::PortsExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    env_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<&'static str>,
    error: ErrorPayload,
}

/// An [`EnvError`] rendered as an HTTP response. Failures tied to an
/// environment echo its id with `status: "failed"`.
#[derive(Debug)]
pub struct ApiError {
    env_id: Option<String>,
    err: EnvError,
}

impl ApiError {
    pub fn for_env(env_id: impl Into<String>, err: EnvError) -> Self {
        Self {
            env_id: Some(env_id.into()),
            err,
        }
    }
}

impl From<EnvError> for ApiError {
    fn from(err: EnvError) -> Self {
        Self { env_id: None, err }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.err);
        if status.is_server_error() {
            tracing::error!(env_id = ?self.env_id, code = self.err.code(), error = %self.err, "request failed");
        } else {
            tracing::debug!(env_id = ?self.env_id, code = self.err.code(), error = %self.err, "request rejected");
        }
        let body = ErrorBody {
            status: self.env_id.as_ref().map(|_| "failed"),
            env_id: self.env_id,
            error: ErrorPayload::from(&self.err),
        };
        (status, Json(body)).into_response()
    }
}
