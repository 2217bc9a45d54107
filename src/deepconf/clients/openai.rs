//! OpenAI-compatible Chat Completions adapter with per-token logprob capture.
//!
//! # Key Features
//!
//! - **Streaming with logprobs**: every request asks for `logprobs` +
//!   `top_logprobs`, and each SSE chunk is surfaced as a
//!   [`StreamEvent`] carrying the raw logprob payload for the engine to
//!   score.
//! - **Server-side gating hints**: requests include a vLLM extra-body
//!   block with the current effective window and the last published
//!   early-stop threshold; servers that don't understand it ignore it.
//! - **Custom base URLs**: point the adapter at any OpenAI-compatible
//!   deployment (vLLM, self-hosted gateways) via
//!   [`OpenAIClient::new_with_base_url`].
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use deepconf::clients::openai::OpenAIClient;
//! use deepconf::provider::{Message, ProviderAdapter, Role};
//! use futures_util::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let key = std::env::var("OPEN_AI_SECRET")?;
//!     let client = OpenAIClient::new_with_base_url(&key, "gpt-oss-120b", "http://localhost:8000/v1")?;
//!
//!     let mut events = client
//!         .stream_chat(&[Message {
//!             role: Role::User,
//!             content: Arc::from("Stream a haiku about log-probabilities."),
//!         }])
//!         .await?;
//!
//!     while let Some(event) = events.next().await {
//!         let event = event.map_err(|e| e.to_string())?;
//!         print!("{}", event.chunk);
//!     }
//!     Ok(())
//! }
//! ```

use std::collections::VecDeque;
use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::deepconf::clients::common::{get_shared_http_client, StreamError};
use crate::deepconf::provider::{Message, ProviderAdapter, Role, StreamEvent, TraceEventStream};
use crate::deepconf::settings::{
    effective_group_window, resolve_for_model, EngineSettings, SettingsError,
};

/// Threshold published in the extra body before calibration overwrites it.
const INITIAL_THRESHOLD: f64 = 17.0;

/// Streaming adapter for OpenAI-compatible Chat Completions endpoints.
///
/// The adapter owns the sampling knobs (resolved from [`EngineSettings`]),
/// a `tokens_seen` counter fed into the window hint of each request, and
/// the `current_threshold` slot the engine writes through
/// [`ProviderAdapter::publish_threshold`].  It reuses the shared HTTP
/// client configured in [`crate::deepconf::clients::common`].
pub struct OpenAIClient {
    /// Model name that will be injected into each request.
    model: String,
    /// API key sent as a bearer token.
    api_key: String,
    /// Base URL without a trailing slash (e.g. `https://api.openai.com/v1`).
    base_url: String,
    /// Resolved settings providing temperature, top_p, logprob count, and
    /// the window configuration for the server-side hint.
    settings: EngineSettings,
    /// Provider context size in tokens, when known.
    ctx_limit: Option<usize>,
    /// Tokens emitted across all requests; feeds the window hint.
    tokens_seen: Arc<AtomicUsize>,
    /// Last early-stop threshold published by the engine.
    current_threshold: Mutex<f64>,
}

impl OpenAIClient {
    /// Construct a client for the public OpenAI endpoint.
    ///
    /// Settings are resolved for `model_name` from the defaults; fails if
    /// a model-override pattern does not compile.
    pub fn new_with_model_string(
        secret_key: &str,
        model_name: &str,
    ) -> Result<Self, SettingsError> {
        Self::new_with_base_url(secret_key, model_name, "https://api.openai.com/v1")
    }

    /// Construct a client targeting a custom OpenAI-compatible base URL.
    /// Note: base_url should not have a trailing slash (e.g., "https://api.openai.com/v1")
    pub fn new_with_base_url(
        secret_key: &str,
        model_name: &str,
        base_url: &str,
    ) -> Result<Self, SettingsError> {
        let settings = resolve_for_model(model_name, None)?;
        Ok(Self::new_with_settings(
            secret_key, model_name, base_url, settings,
        ))
    }

    /// Construct a client from already-resolved settings.
    ///
    /// This is the most general constructor; the settings are taken as-is
    /// with no further per-model resolution.
    pub fn new_with_settings(
        secret_key: &str,
        model_name: &str,
        base_url: &str,
        settings: EngineSettings,
    ) -> Self {
        OpenAIClient {
            model: model_name.to_string(),
            api_key: secret_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            settings,
            ctx_limit: None,
            tokens_seen: Arc::new(AtomicUsize::new(0)),
            current_threshold: Mutex::new(INITIAL_THRESHOLD),
        }
    }

    /// Declare the provider's context size (builder pattern).
    ///
    /// Caps the group window at half this value to leave headroom for the
    /// KV cache and output buffers.
    pub fn with_ctx_limit(mut self, ctx_limit: usize) -> Self {
        self.ctx_limit = Some(ctx_limit);
        self
    }

    /// Assemble the request body: messages, sampling knobs, and the vLLM
    /// extra-body hint with the current window size and threshold.
    async fn request_body(&self, messages: &[Message]) -> Value {
        let formatted: Vec<Value> = messages
            .iter()
            .map(|msg| {
                json!({
                    "role": match msg.role {
                        Role::System => "system",
                        Role::User => "user",
                        Role::Assistant => "assistant",
                    },
                    "content": msg.content.as_ref(),
                })
            })
            .collect();

        let window_size = effective_group_window(
            self.settings.group_window_target,
            self.ctx_limit,
            self.tokens_seen.load(Ordering::Relaxed),
            self.settings.min_effective_window,
            self.settings.absolute_window_cap,
        );
        let threshold = *self.current_threshold.lock().await;

        json!({
            "model": self.model,
            "messages": formatted,
            "stream": true,
            "temperature": self.settings.temperature,
            "top_p": self.settings.top_p,
            "logprobs": true,
            "top_logprobs": self.settings.top_logprobs,
            "top_k": 0,
            "vllm_xargs": {
                "enable_conf": true,
                "window_size": window_size,
                "threshold": threshold,
            },
        })
    }
}

#[async_trait]
impl ProviderAdapter for OpenAIClient {
    async fn stream_chat(&self, messages: &[Message]) -> Result<TraceEventStream, Box<dyn Error>> {
        let body = self.request_body(messages).await;
        let url = format!("{}/chat/completions", self.base_url);

        let response = get_shared_http_client()
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                if log::log_enabled!(log::Level::Error) {
                    log::error!("OpenAIClient::stream_chat(...): request error: {}", err);
                }
                err
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            if log::log_enabled!(log::Level::Error) {
                log::error!(
                    "OpenAIClient::stream_chat(...): HTTP {} from {}: {}",
                    status,
                    url,
                    detail
                );
            }
            return Err(Box::new(StreamError(format!(
                "chat completions request failed with HTTP {}: {}",
                status, detail
            ))));
        }

        let tokens_seen = Arc::clone(&self.tokens_seen);
        let events = stream::unfold(
            (Box::pin(response.bytes_stream()), SseDecoder::new(), tokens_seen),
            |(mut bytes, mut decoder, tokens_seen)| async move {
                loop {
                    if let Some(event) = decoder.next_event() {
                        tokens_seen.fetch_add(1, Ordering::Relaxed);
                        return Some((Ok(event), (bytes, decoder, tokens_seen)));
                    }
                    if decoder.finished {
                        return None;
                    }
                    match bytes.next().await {
                        Some(Ok(chunk)) => decoder.feed(&chunk),
                        Some(Err(err)) => {
                            decoder.finished = true;
                            let boxed: Box<dyn Error + Send + Sync> = Box::new(StreamError(
                                format!("stream chunk error: {}", err),
                            ));
                            return Some((Err(boxed), (bytes, decoder, tokens_seen)));
                        }
                        None => return None,
                    }
                }
            },
        );

        Ok(Box::pin(events))
    }

    fn provider_ctx_limit(&self) -> Option<usize> {
        self.ctx_limit
    }

    async fn publish_threshold(&self, threshold: f64) {
        *self.current_threshold.lock().await = threshold;
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

// ---------------------------------------------------------------------------
// SSE decoding
// ---------------------------------------------------------------------------

/// Incremental decoder for the `data: {json}` server-sent-event framing
/// used by Chat Completions streaming.
///
/// Bytes accumulate until a full line is available; lines are decoded
/// independently, so a UTF-8 sequence split across network chunks is
/// reassembled before decoding.
struct SseDecoder {
    buffer: Vec<u8>,
    pending: VecDeque<StreamEvent>,
    finished: bool,
}

impl SseDecoder {
    fn new() -> Self {
        SseDecoder {
            buffer: Vec::new(),
            pending: VecDeque::new(),
            finished: false,
        }
    }

    /// Consume a network chunk, queuing an event per completed data line
    /// that carries non-empty content.
    fn feed(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
        while let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();
            if let Some(payload) = line.strip_prefix("data:") {
                let payload = payload.trim();
                if payload == "[DONE]" {
                    self.finished = true;
                } else {
                    self.decode_payload(payload);
                }
            }
        }
    }

    fn decode_payload(&mut self, payload: &str) {
        let value: Value = match serde_json::from_str(payload) {
            Ok(value) => value,
            Err(err) => {
                log::debug!("SseDecoder::decode_payload(...): skipping malformed event: {}", err);
                return;
            }
        };
        let choice = match value.get("choices").and_then(|c| c.as_array()).and_then(|c| c.first()) {
            Some(choice) => choice,
            None => return,
        };
        let content = choice
            .get("delta")
            .and_then(|delta| delta.get("content"))
            .and_then(|content| content.as_str())
            .unwrap_or_default();
        if content.is_empty() {
            return;
        }
        let logprobs = choice.get("logprobs").filter(|lp| !lp.is_null()).cloned();
        self.pending.push_back(StreamEvent {
            chunk: content.to_string(),
            logprobs,
        });
    }

    fn next_event(&mut self) -> Option<StreamEvent> {
        self.pending.pop_front()
    }
}
