//! Axum routes for the public Gemini-compatible surface (§6).
//!
//! Business logic lives entirely in [`Core`] and [`AuthContext`]; this module
//! only translates HTTP in and out.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, RawQuery, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::StreamExt;
use sgate_storage::GatewayStorage;
use tokio::sync::mpsc;

use crate::auth::Authenticator;
use crate::classify::{ModelsSegmentRequest, classify_models_segment};
use crate::core::Core;
use crate::error::GatewayError;
use crate::mapping::strip_models_prefix;

/// Everything a handler needs: the executor and the authenticator share the
/// same storage the rest of the gateway does.
pub struct GatewayApi<S> {
    pub core: Core<S>,
    pub auth: Authenticator<S>,
}

pub fn router<S: GatewayStorage + 'static>(api: Arc<GatewayApi<S>>) -> Router {
    Router::new()
        .route("/v1beta/models", get(list_models::<S>))
        .route("/v1beta/models/{*segment}", get(models_segment::<S>))
        .route("/v1beta/models/{*segment}", post(models_segment::<S>))
        .with_state(api)
}

async fn list_models<S: GatewayStorage + 'static>(
    State(api): State<Arc<GatewayApi<S>>>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
) -> Response {
    if let Err(err) = api.auth.authenticate(&headers, query.as_deref()).await {
        return err.into_response();
    }
    let payload = sgate_protocol::gemini::ListModelsResponse {
        models: api.core.list_models(),
    };
    (StatusCode::OK, Json(payload)).into_response()
}

/// Dispatches `GET|POST /v1beta/models/{segment}` once classified, where
/// `segment` is either a bare model name or `model:action`.
async fn models_segment<S: GatewayStorage + 'static>(
    State(api): State<Arc<GatewayApi<S>>>,
    Path(segment): Path<String>,
    headers: HeaderMap,
    RawQuery(query): RawQuery,
    method: axum::http::Method,
    body: Bytes,
) -> Response {
    let auth = match api.auth.authenticate(&headers, query.as_deref()).await {
        Ok(auth) => auth,
        Err(err) => return err.into_response(),
    };

    let classified = match classify_models_segment(&method, &segment, body) {
        Ok(classified) => classified,
        Err(err) => return err.into_response(),
    };

    match classified {
        ModelsSegmentRequest::GetModel { name } => {
            match api.core.get_model(strip_models_prefix(&name)).await {
                Some(descriptor) => (StatusCode::OK, Json(descriptor)).into_response(),
                None => GatewayError::InvalidRequest(format!("unknown model {name}")).into_response(),
            }
        }
        ModelsSegmentRequest::Generate {
            model,
            is_stream,
            body,
        } => {
            if is_stream {
                stream_generate(api, auth, model, body).await
            } else {
                unary_generate(api, auth, model, body).await
            }
        }
    }
}

async fn unary_generate<S: GatewayStorage + 'static>(
    api: Arc<GatewayApi<S>>,
    auth: crate::auth::AuthContext,
    model: String,
    body: sgate_protocol::gemini::GenerateContentRequestBody,
) -> Response {
    let model = strip_models_prefix(&model).to_string();
    let result = api.core.unary_generate(&auth, &model, &body).await;
    match result {
        Ok(response) => {
            let _ = api.auth.record_usage(auth.api_key_id).await;
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(err) => err.into_response(),
    }
}

/// Streams `data: <json>\n\n` lines as the body fills, emitted from inside
/// `Core::stream_generate`'s synchronous callback via an unbounded channel
/// (§6). `Core`'s callback can't await, so the sender side just queues;
/// reading the body governs the actual backpressure against the caller.
async fn stream_generate<S: GatewayStorage + 'static>(
    api: Arc<GatewayApi<S>>,
    auth: crate::auth::AuthContext,
    model: String,
    body: sgate_protocol::gemini::GenerateContentRequestBody,
) -> Response {
    let model = strip_models_prefix(&model).to_string();
    let (tx, rx) = mpsc::unbounded_channel::<String>();

    tokio::spawn(async move {
        let emit = |line: String| {
            let _ = tx.send(line);
        };
        let result = api.core.stream_generate(&auth, &model, &body, emit).await;
        if result.is_ok() {
            let _ = api.auth.record_usage(auth.api_key_id).await;
        }
    });

    let stream =
        tokio_stream::wrappers::UnboundedReceiverStream::new(rx).map(|line| Ok::<_, std::convert::Infallible>(Bytes::from(line)));
    let body = Body::from_stream(stream);

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .header("x-accel-buffering", "no")
        .body(body)
        .unwrap_or_else(|_| GatewayError::Internal("failed to build sse response".to_string()).into_response())
}

/// Per-call upstream timeout values advertised to the caller-facing layer
/// purely for documentation; the authoritative values live in
/// `sgate_upstream::UpstreamClientConfig` (§5).
pub const UNARY_TIMEOUT: Duration = Duration::from_secs(120);
pub const STREAM_TIMEOUT: Duration = Duration::from_secs(1800);
