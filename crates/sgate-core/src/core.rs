//! The request executor (§4.4): wires the scheduler, session matcher and
//! upstream client cache together into the two public operations, unary and
//! streaming `generateContent`.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sgate_protocol::gemini::request::Content;
use sgate_protocol::gemini::{FinishReason, GenerateContentRequestBody, GenerateContentResponse, Part, UsageMetadata};
use sgate_provider::{ProviderError, ProviderScheduler, retry_with_substitution};
use sgate_session::SessionMatcher;
use sgate_storage::{GatewayStorage, NewRequestLog};
use sgate_upstream::{StreamAssistParams, TextChunk, UpstreamClientCache};

use crate::auth::AuthContext;
use crate::error::GatewayError;
use crate::mapping;

/// Knobs the executor itself owns, separate from provider/session config
/// (those live with their respective components).
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub max_retries: u32,
    pub group_id: Option<String>,
    pub media_keywords: Vec<String>,
    /// How long to wait after the text stream closes before polling for a
    /// generated file (§4.4 streaming procedure).
    pub media_grace_period: Duration,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_retries: sgate_provider::DEFAULT_MAX_RETRIES,
            group_id: None,
            media_keywords: mapping::default_media_keywords(),
            media_grace_period: Duration::from_secs(2),
        }
    }
}

/// Composes the scheduler, matcher and upstream cache into the two
/// public-facing generate operations.
pub struct Core<S> {
    storage: Arc<S>,
    scheduler: Arc<ProviderScheduler<S>>,
    matcher: Arc<SessionMatcher<S>>,
    clients: Arc<UpstreamClientCache>,
    config: CoreConfig,
}

struct ExecutionResult {
    normal_stop: bool,
    media: Option<sgate_upstream::GeneratedMedia>,
    session_id: i64,
    provider_id: i64,
}

/// Newtype so `GatewayError` can flow through `retry_with_substitution`'s
/// `E: Into<ProviderError>` bound without sgate-provider knowing about it.
struct AttemptFailed(GatewayError);

impl From<AttemptFailed> for ProviderError {
    fn from(value: AttemptFailed) -> Self {
        if value.0.is_retryable() {
            ProviderError::Upstream(value.0.to_string())
        } else {
            ProviderError::Fatal(value.0.to_string())
        }
    }
}

impl<S: GatewayStorage + 'static> Core<S> {
    pub fn new(
        storage: Arc<S>,
        scheduler: Arc<ProviderScheduler<S>>,
        matcher: Arc<SessionMatcher<S>>,
        clients: Arc<UpstreamClientCache>,
        config: CoreConfig,
    ) -> Self {
        Self {
            storage,
            scheduler,
            matcher,
            clients,
            config,
        }
    }

    /// `POST /v1beta/models/{model}:generateContent` (§4.4 unary procedure).
    pub async fn unary_generate(
        &self,
        auth: &AuthContext,
        model: &str,
        body: &GenerateContentRequestBody,
    ) -> Result<GenerateContentResponse, GatewayError> {
        let started = Instant::now();
        let include_thoughts = body.include_thoughts();
        let thoughts: Mutex<Vec<String>> = Mutex::new(Vec::new());
        let text: Mutex<String> = Mutex::new(String::new());

        let outcome = self
            .execute(auth.user_id, model, body, false, |chunk| {
                if chunk.thought {
                    if include_thoughts {
                        thoughts.lock().unwrap().push(chunk.text);
                    }
                } else {
                    text.lock().unwrap().push_str(&chunk.text);
                }
            })
            .await;

        let prompt_tokens = mapping::estimate_tokens(&body.last_message_text());

        match outcome {
            Ok(result) => {
                let text = text.into_inner().unwrap();
                let mut parts: Vec<Part> = thoughts
                    .into_inner()
                    .unwrap()
                    .into_iter()
                    .map(Part::Thought)
                    .collect();
                if !text.is_empty() {
                    parts.push(Part::Text(text.clone()));
                }
                if let Some(media) = result.media {
                    parts.push(Part::InlineData {
                        mime_type: media.mime_type,
                        data: media.data,
                    });
                }

                let output_tokens = mapping::estimate_tokens(&text);
                let finish_reason = if result.normal_stop {
                    FinishReason::Stop
                } else {
                    FinishReason::MaxTokens
                };
                let usage = UsageMetadata {
                    prompt_token_count: prompt_tokens,
                    candidates_token_count: output_tokens,
                    total_token_count: prompt_tokens + output_tokens,
                };
                let response = GenerateContentResponse::unary(parts, finish_reason, usage, model);

                self.log(
                    auth,
                    model,
                    "unary",
                    Some(result.provider_id),
                    Some(result.session_id),
                    prompt_tokens,
                    output_tokens,
                    started.elapsed(),
                    200,
                    None,
                )
                .await;
                Ok(response)
            }
            Err(err) => {
                self.log(
                    auth,
                    model,
                    "unary",
                    None,
                    None,
                    prompt_tokens,
                    0,
                    started.elapsed(),
                    err.status().as_u16() as i32,
                    Some(err.to_string()),
                )
                .await;
                Err(err)
            }
        }
    }

    /// `POST /v1beta/models/{model}:streamGenerateContent` (§4.4 streaming
    /// procedure). `emit` receives pre-framed SSE lines, including the
    /// terminal `data: [DONE]\n\n`.
    pub async fn stream_generate(
        &self,
        auth: &AuthContext,
        model: &str,
        body: &GenerateContentRequestBody,
        emit: impl Fn(String) + Send + Sync,
    ) -> Result<(), GatewayError> {
        let started = Instant::now();
        let include_thoughts = body.include_thoughts();
        let text: Mutex<String> = Mutex::new(String::new());

        let outcome = self
            .execute(auth.user_id, model, body, true, |chunk| {
                if chunk.thought && !include_thoughts {
                    return;
                }
                let part = if chunk.thought {
                    Part::Thought(chunk.text.clone())
                } else {
                    text.lock().unwrap().push_str(&chunk.text);
                    Part::Text(chunk.text.clone())
                };
                let response = GenerateContentResponse::stream_chunk(vec![part], model);
                if let Ok(json) = serde_json::to_string(&response) {
                    emit(sgate_protocol::sse::data_line(&json));
                }
            })
            .await;

        let prompt_tokens = mapping::estimate_tokens(&body.last_message_text());

        match outcome {
            Ok(result) => {
                let text = text.into_inner().unwrap();
                let output_tokens = mapping::estimate_tokens(&text);
                let finish_reason = if result.normal_stop {
                    FinishReason::Stop
                } else {
                    FinishReason::MaxTokens
                };
                let usage = UsageMetadata {
                    prompt_token_count: prompt_tokens,
                    candidates_token_count: output_tokens,
                    total_token_count: prompt_tokens + output_tokens,
                };

                let final_chunk = GenerateContentResponse::unary(Vec::new(), finish_reason, usage, model);
                if let Ok(json) = serde_json::to_string(&final_chunk) {
                    emit(sgate_protocol::sse::data_line(&json));
                }

                if let Some(media) = result.media {
                    let media_chunk = GenerateContentResponse::unary(
                        vec![Part::InlineData {
                            mime_type: media.mime_type,
                            data: media.data,
                        }],
                        FinishReason::Stop,
                        usage,
                        model,
                    );
                    if let Ok(json) = serde_json::to_string(&media_chunk) {
                        emit(sgate_protocol::sse::data_line(&json));
                    }
                }
                emit(sgate_protocol::sse::DONE_LINE.to_string());

                self.log(
                    auth,
                    model,
                    "stream",
                    Some(result.provider_id),
                    Some(result.session_id),
                    prompt_tokens,
                    output_tokens,
                    started.elapsed(),
                    200,
                    None,
                )
                .await;
                Ok(())
            }
            Err(err) => {
                if let Ok(json) = serde_json::to_string(&err.error_envelope()) {
                    emit(sgate_protocol::sse::data_line(&json));
                }
                emit(sgate_protocol::sse::DONE_LINE.to_string());
                self.log(
                    auth,
                    model,
                    "stream",
                    None,
                    None,
                    prompt_tokens,
                    0,
                    started.elapsed(),
                    err.status().as_u16() as i32,
                    Some(err.to_string()),
                )
                .await;
                Err(err)
            }
        }
    }

    pub async fn get_model(&self, name: &str) -> Option<sgate_protocol::gemini::ModelDescriptor> {
        mapping::describe_model(name)
    }

    pub fn list_models(&self) -> Vec<sgate_protocol::gemini::ModelDescriptor> {
        mapping::known_models()
    }

    /// Runs the provider-scheduler retry loop around one conversation turn,
    /// invoking `on_chunk` for every text/thought chunk the upstream call
    /// produces. Shared by both the unary and streaming public operations —
    /// they differ only in how they consume `on_chunk` and shape the result.
    async fn execute(
        &self,
        user_id: i64,
        model: &str,
        body: &GenerateContentRequestBody,
        is_stream: bool,
        on_chunk: impl Fn(TextChunk) + Send + Sync,
    ) -> Result<ExecutionResult, GatewayError> {
        let query = body.last_message_text();
        if query.is_empty() {
            return Err(GatewayError::InvalidRequest(
                "contents produced no usable query text".to_string(),
            ));
        }
        let wants_media = body.wants_media(&self.config.media_keywords);
        let contents: Arc<Vec<Content>> = Arc::new(body.contents.clone());
        let query: Arc<String> = Arc::new(query);
        let upstream_model: Arc<String> = Arc::new(mapping::map_model(model));
        let session_state: Arc<Mutex<Option<i64>>> = Arc::new(Mutex::new(None));
        let last_error: Arc<Mutex<Option<GatewayError>>> = Arc::new(Mutex::new(None));
        let on_chunk = Arc::new(on_chunk);

        let outcome = retry_with_substitution(
            &self.scheduler,
            self.config.group_id.as_deref(),
            self.config.max_retries,
            move |handle| {
                let contents = contents.clone();
                let query = query.clone();
                let upstream_model = upstream_model.clone();
                let session_state = session_state.clone();
                let last_error = last_error.clone();
                let on_chunk = on_chunk.clone();
                async move {
                    let result = self
                        .attempt(
                            user_id,
                            handle.provider_id,
                            handle.credential,
                            &contents,
                            &query,
                            &upstream_model,
                            wants_media,
                            is_stream,
                            &session_state,
                            on_chunk.as_ref(),
                        )
                        .await;
                    if let Err(ref err) = result {
                        *last_error.lock().unwrap() = Some(err.clone());
                    }
                    result.map_err(AttemptFailed)
                }
            },
        )
        .await;

        outcome.map_err(|provider_err| {
            last_error
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| provider_err.into())
        })
    }

    /// One provider-scheduler attempt: match-or-migrate the session, ensure
    /// an upstream session id, run the upstream call, and fetch media if
    /// requested (§4.4 steps 2-8).
    #[allow(clippy::too_many_arguments)]
    async fn attempt(
        &self,
        user_id: i64,
        provider_id: i64,
        credential: sgate_upstream::ProviderCredential,
        contents: &[Content],
        query: &str,
        upstream_model: &str,
        wants_media: bool,
        is_stream: bool,
        session_state: &Mutex<Option<i64>>,
        on_chunk: &(dyn Fn(TextChunk) + Send + Sync),
    ) -> Result<ExecutionResult, GatewayError> {
        let prior_session_id = *session_state.lock().unwrap();
        let session = match prior_session_id {
            Some(old_id) => self.matcher.migrate(old_id, provider_id).await?,
            None => {
                self.matcher
                    .match_or_create(user_id, provider_id, contents)
                    .await?
                    .session
            }
        };
        *session_state.lock().unwrap() = Some(session.id);

        let client = self.clients.get(credential).await?;

        let upstream_session_id = match session.upstream_session_id.clone() {
            Some(id) => id,
            None => {
                let id = client.create_session().await?;
                self.matcher.set_upstream_session_id(session.id, &id).await?;
                id
            }
        };

        let delivered_content = std::sync::atomic::AtomicBool::new(false);
        let mut dispatch = |chunk: TextChunk| {
            if !chunk.thought {
                delivered_content.store(true, std::sync::atomic::Ordering::Relaxed);
            }
            on_chunk(chunk);
        };

        let outcome = client
            .stream_assist(
                StreamAssistParams {
                    session_id: &upstream_session_id,
                    query,
                    model_id: upstream_model,
                    is_stream,
                },
                &mut dispatch,
            )
            .await?;

        if delivered_content.load(std::sync::atomic::Ordering::Relaxed) {
            self.matcher.record_message(session.id).await?;
        }

        let media = if wants_media {
            // Streaming responses can close before the backend has finished
            // writing generated media; unary responses already wait on the
            // full upstream reply, so the grace period only applies here.
            if is_stream {
                tokio::time::sleep(self.config.media_grace_period).await;
            }
            client.fetch_latest_media(&upstream_session_id).await?
        } else {
            None
        };

        Ok(ExecutionResult {
            normal_stop: outcome.normal_stop,
            media,
            session_id: session.id,
            provider_id,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn log(
        &self,
        auth: &AuthContext,
        model: &str,
        kind: &'static str,
        provider_id: Option<i64>,
        session_id: Option<i64>,
        input_tokens: i64,
        output_tokens: i64,
        elapsed: Duration,
        status_code: i32,
        error_message: Option<String>,
    ) {
        let result = self
            .storage
            .insert_request_log(NewRequestLog {
                user_id: auth.user_id,
                api_key_id: Some(auth.api_key_id),
                provider_id,
                session_id,
                model: model.to_string(),
                kind,
                input_tokens: input_tokens as i32,
                output_tokens: output_tokens as i32,
                latency_ms: elapsed.as_millis() as i64,
                status_code,
                error_message,
            })
            .await;
        if let Err(err) = result {
            tracing::warn!(event = "request_log_insert_failed", %err, "failed to persist request log row");
        }
    }
}
