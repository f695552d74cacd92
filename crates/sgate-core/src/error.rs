//! Public-API error taxonomy (§7). Each variant knows its HTTP status and how
//! to classify itself for scheduler bookkeeping.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use sgate_provider::ProviderError;
use sgate_session::SessionError;
use sgate_upstream::UpstreamError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum GatewayError {
    #[error("missing or invalid api key")]
    AuthError,
    #[error("daily request cap reached for this api key")]
    RateLimitError,
    #[error("no provider available")]
    NoAvailableProvider,
    #[error("upstream authentication failed: {0}")]
    UpstreamAuthFailure(String),
    #[error("upstream transport error: {0}")]
    UpstreamTransportError(String),
    #[error("upstream response framing malformed: {0}")]
    UpstreamProtocolError(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::AuthError => StatusCode::UNAUTHORIZED,
            GatewayError::RateLimitError => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::NoAvailableProvider => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::UpstreamAuthFailure(_)
            | GatewayError::UpstreamTransportError(_)
            | GatewayError::UpstreamProtocolError(_) => StatusCode::BAD_GATEWAY,
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this failure should trigger provider substitution before
    /// surfacing to the caller (§7 propagation policy).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::UpstreamAuthFailure(_)
                | GatewayError::UpstreamTransportError(_)
                | GatewayError::UpstreamProtocolError(_)
        )
    }
}

impl From<UpstreamError> for GatewayError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::AuthRefresh(msg) => GatewayError::UpstreamAuthFailure(msg),
            UpstreamError::Transport(msg) | UpstreamError::Http { body: msg, .. } => {
                GatewayError::UpstreamTransportError(msg)
            }
            UpstreamError::Protocol(msg) => GatewayError::UpstreamProtocolError(msg),
            UpstreamError::Timeout => {
                GatewayError::UpstreamTransportError("upstream call timed out".to_string())
            }
        }
    }
}

impl From<ProviderError> for GatewayError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::NoAvailableProvider => GatewayError::NoAvailableProvider,
            other => GatewayError::Internal(other.to_string()),
        }
    }
}

impl From<SessionError> for GatewayError {
    fn from(err: SessionError) -> Self {
        GatewayError::Internal(err.to_string())
    }
}

impl From<sgate_storage::StorageError> for GatewayError {
    fn from(err: sgate_storage::StorageError) -> Self {
        GatewayError::Internal(err.to_string())
    }
}

impl GatewayError {
    /// The `{"error": {"code": ..., "message": ..., "status": ...}}` body
    /// shared by the JSON error response and the streaming error chunk.
    pub fn error_envelope(&self) -> serde_json::Value {
        let status = self.status();
        json!({
            "error": {
                "code": status.as_u16(),
                "message": self.to_string(),
                "status": status_name(status),
            }
        })
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(self.error_envelope())).into_response()
    }
}

fn status_name(status: StatusCode) -> &'static str {
    match status {
        StatusCode::UNAUTHORIZED => "UNAUTHENTICATED",
        StatusCode::TOO_MANY_REQUESTS => "RESOURCE_EXHAUSTED",
        StatusCode::SERVICE_UNAVAILABLE | StatusCode::BAD_GATEWAY => "UNAVAILABLE",
        StatusCode::BAD_REQUEST => "INVALID_ARGUMENT",
        _ => "INTERNAL",
    }
}
