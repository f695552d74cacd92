use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::Deserialize;
use wreq::{Client, Method, Proxy, header};

use crate::chunk::{TextChunk, is_normal_stop, parse_object};
use crate::error::UpstreamError;
use crate::parser::StreamObjectParser;
use crate::token::{ServerToken, ServerTokenSource, TokenLifecycle};

/// A provider's decrypted credentials, as handed to the client by the
/// scheduler after it acquires the provider row.
#[derive(Debug, Clone)]
pub struct ProviderCredential {
    pub provider_id: i64,
    pub csesidx: String,
    pub cookie_bag: String,
}

#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    pub base_url: String,
    pub token_endpoint: String,
    pub issuer: String,
    pub audience: String,
    pub proxy: Option<String>,
    pub connect_timeout: Duration,
    /// Per-call timeout for unary generation (default 120s, §5).
    pub unary_timeout: Duration,
    /// Per-call timeout for streaming generation (default 1800s, §5).
    pub stream_timeout: Duration,
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://assist.upstream.internal".to_string(),
            token_endpoint: "https://assist.upstream.internal/csrf-token".to_string(),
            issuer: "sgate".to_string(),
            audience: "upstream-assist".to_string(),
            proxy: None,
            connect_timeout: Duration::from_secs(5),
            unary_timeout: Duration::from_secs(120),
            stream_timeout: Duration::from_secs(1800),
        }
    }
}

pub struct StreamAssistParams<'a> {
    pub session_id: &'a str,
    pub query: &'a str,
    pub model_id: &'a str,
    pub is_stream: bool,
}

#[derive(Debug, Clone)]
pub struct StreamAssistOutcome {
    pub normal_stop: bool,
    pub session_info: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct GeneratedMedia {
    pub mime_type: String,
    pub data: String,
}

/// One instance per provider. Holds the short-lived bearer token and
/// performs the upstream operations this gateway needs.
#[async_trait::async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn create_session(&self) -> Result<String, UpstreamError>;

    async fn stream_assist(
        &self,
        params: StreamAssistParams<'_>,
        on_chunk: &mut (dyn FnMut(TextChunk) + Send),
    ) -> Result<StreamAssistOutcome, UpstreamError>;

    /// Fetches the most recently generated file for a session, base64-encoded,
    /// when the caller's turn asked for media (§4.4.a). `None` if the session
    /// has no generated file yet.
    async fn fetch_latest_media(
        &self,
        session_id: &str,
    ) -> Result<Option<GeneratedMedia>, UpstreamError>;
}

pub struct WreqUpstreamClient {
    http: Client,
    config: UpstreamClientConfig,
    credential: ProviderCredential,
    tokens: TokenLifecycle,
}

impl WreqUpstreamClient {
    pub fn new(
        credential: ProviderCredential,
        config: UpstreamClientConfig,
        token_source: Arc<dyn ServerTokenSource>,
    ) -> Result<Self, UpstreamError> {
        let http = build_client(&config)?;
        let tokens = TokenLifecycle::new(
            credential.csesidx.clone(),
            config.issuer.clone(),
            config.audience.clone(),
            token_source,
        );
        Ok(Self {
            http,
            config,
            credential,
            tokens,
        })
    }

    async fn authorized(&self, method: Method, url: &str) -> Result<wreq::RequestBuilder, UpstreamError> {
        let bearer = self.tokens.bearer_token(&self.credential.cookie_bag).await?;
        Ok(self
            .http
            .request(method, url)
            .header(header::AUTHORIZATION, format!("Bearer {bearer}"))
            .header(header::COOKIE, self.credential.cookie_bag.as_str())
            .header("x-upstream-csesidx", self.credential.csesidx.as_str()))
    }
}

#[derive(Deserialize)]
struct CreateSessionResponse {
    #[serde(rename = "sessionName")]
    session_name: String,
}

#[async_trait::async_trait]
impl UpstreamClient for WreqUpstreamClient {
    async fn create_session(&self) -> Result<String, UpstreamError> {
        let url = format!("{}/session", self.config.base_url);
        let resp = self
            .authorized(Method::POST, &url)
            .await?
            .json(&serde_json::json!({ "csesidx": self.credential.csesidx }))
            .timeout(self.config.unary_timeout)
            .send()
            .await
            .map_err(map_wreq_error)?;

        let status = resp.status().as_u16();
        let body = resp.bytes().await.map_err(map_wreq_error)?;
        if !(200..300).contains(&status) {
            return Err(UpstreamError::Http {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        let parsed: CreateSessionResponse =
            serde_json::from_slice(&body).map_err(|e| UpstreamError::Protocol(e.to_string()))?;
        Ok(parsed.session_name)
    }

    async fn stream_assist(
        &self,
        params: StreamAssistParams<'_>,
        on_chunk: &mut (dyn FnMut(TextChunk) + Send),
    ) -> Result<StreamAssistOutcome, UpstreamError> {
        let url = format!("{}/assist:stream", self.config.base_url);
        let timeout = if params.is_stream {
            self.config.stream_timeout
        } else {
            self.config.unary_timeout
        };

        let resp = self
            .authorized(Method::POST, &url)
            .await?
            .json(&serde_json::json!({
                "sessionId": params.session_id,
                "query": params.query,
                "modelId": params.model_id,
            }))
            .header("x-upstream-timeout-ms", timeout.as_millis().to_string())
            .timeout(timeout)
            .send()
            .await
            .map_err(map_wreq_error)?;

        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            let body = resp.bytes().await.unwrap_or_default();
            return Err(UpstreamError::Http {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        let mut parser = StreamObjectParser::new();
        let mut last_state: Option<String> = None;
        let mut session_info = None;
        let mut stream = resp.bytes_stream();
        while let Some(item) = stream.next().await {
            let bytes = item.map_err(map_wreq_error)?;
            parser.feed(&bytes, |object_bytes| match parse_object(&object_bytes) {
                Ok(parsed) => {
                    if parsed.state.is_some() {
                        last_state = parsed.state;
                    }
                    if parsed.session_info.is_some() {
                        session_info = parsed.session_info;
                    }
                    for chunk in parsed.chunks {
                        on_chunk(chunk);
                    }
                }
                Err(error) => {
                    tracing::warn!(event = "upstream_object_parse_failed", %error, "skipping malformed stream object");
                }
            });
        }

        if !parser.is_closed() {
            return Err(UpstreamError::Protocol(
                "stream ended before top-level array closed".to_string(),
            ));
        }

        Ok(StreamAssistOutcome {
            normal_stop: is_normal_stop(last_state.as_deref()),
            session_info,
        })
    }

    async fn fetch_latest_media(
        &self,
        session_id: &str,
    ) -> Result<Option<GeneratedMedia>, UpstreamError> {
        let url = format!("{}/media/latest", self.config.base_url);
        let resp = self
            .authorized(Method::GET, &url)
            .await?
            .query(&[("sessionId", session_id)])
            .timeout(self.config.unary_timeout)
            .send()
            .await
            .map_err(map_wreq_error)?;

        let status = resp.status().as_u16();
        if status == 404 {
            return Ok(None);
        }
        let body = resp.bytes().await.map_err(map_wreq_error)?;
        if !(200..300).contains(&status) {
            return Err(UpstreamError::Http {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        #[derive(Deserialize)]
        struct MediaResponse {
            #[serde(rename = "mimeType")]
            mime_type: String,
            data: String,
        }
        let parsed: MediaResponse =
            serde_json::from_slice(&body).map_err(|e| UpstreamError::Protocol(e.to_string()))?;
        Ok(Some(GeneratedMedia {
            mime_type: parsed.mime_type,
            data: parsed.data,
        }))
    }
}

fn build_client(config: &UpstreamClientConfig) -> Result<Client, UpstreamError> {
    let mut builder = Client::builder()
        .connect_timeout(config.connect_timeout)
        .read_timeout(config.stream_timeout);

    if let Some(proxy) = config.proxy.as_deref().filter(|p| !p.trim().is_empty()) {
        let proxy = Proxy::all(proxy).map_err(|e| UpstreamError::Transport(e.to_string()))?;
        builder = builder.proxy(proxy);
    }

    builder
        .build()
        .map_err(|e| UpstreamError::Transport(e.to_string()))
}

fn map_wreq_error(err: wreq::Error) -> UpstreamError {
    if err.is_timeout() {
        return UpstreamError::Timeout;
    }
    UpstreamError::Transport(err.to_string())
}

/// Fetches the server-side cross-site-request token over HTTP ahead of JWT
/// derivation (§4.1).
pub struct WreqServerTokenSource {
    http: Client,
    token_endpoint: String,
}

impl WreqServerTokenSource {
    pub fn new(config: &UpstreamClientConfig) -> Result<Self, UpstreamError> {
        Ok(Self {
            http: build_client(config)?,
            token_endpoint: config.token_endpoint.clone(),
        })
    }
}

#[derive(Deserialize)]
struct ServerTokenResponse {
    #[serde(rename = "keyId")]
    key_id: String,
    token: String,
    #[serde(rename = "expiresAt")]
    expires_at: i64,
}

#[async_trait::async_trait]
impl ServerTokenSource for WreqServerTokenSource {
    async fn fetch(&self, csesidx: &str, cookie_bag: &str) -> Result<ServerToken, UpstreamError> {
        let resp = self
            .http
            .get(&self.token_endpoint)
            .header(header::COOKIE, cookie_bag)
            .query(&[("csesidx", csesidx)])
            .send()
            .await
            .map_err(map_wreq_error)?;

        let status = resp.status().as_u16();
        let body = resp.bytes().await.map_err(map_wreq_error)?;
        if !(200..300).contains(&status) {
            return Err(UpstreamError::AuthRefresh(format!(
                "token endpoint returned {status}: {}",
                String::from_utf8_lossy(&body)
            )));
        }
        let parsed: ServerTokenResponse =
            serde_json::from_slice(&body).map_err(|e| UpstreamError::AuthRefresh(e.to_string()))?;
        Ok(ServerToken {
            key_id: parsed.key_id,
            token: parsed.token,
            server_exp: parsed.expires_at,
        })
    }
}
