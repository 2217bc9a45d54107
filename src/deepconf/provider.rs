//! Shared primitives for provider-agnostic streaming chat adapters.
//!
//! The engine talks to exactly one external collaborator: a
//! [`ProviderAdapter`] that turns a chat request into a lazy stream of
//! [`StreamEvent`]s, each carrying a text chunk and the provider's raw
//! logprob payload for that step.  Payloads differ between providers, so
//! [`top_candidates`] normalises the two accepted shapes into an ordered
//! list of [`TokenCandidate`]s and falls through to empty for anything
//! else — provider quirks stay out of the engine.
//!
//! # Accepted logprob payload shapes
//!
//! ```text
//! (a) { "content": [ ..., { "top_logprobs": [ {"token": .., "logprob": ..}, .. ] } ] }
//! (b) { "top_logprobs": [ {"token": .., "logprob": ..}, .. ] }
//! ```
//!
//! # Example
//!
//! ```rust
//! use deepconf::provider::top_candidates;
//! use serde_json::json;
//!
//! let payload = json!({
//!     "top_logprobs": [
//!         { "token": "Paris", "logprob": -0.01 },
//!         { "token": "Lyon",  "logprob": -5.2 },
//!     ]
//! });
//! let candidates = top_candidates(&payload);
//! assert_eq!(candidates.len(), 2);
//! assert_eq!(candidates[0].token, "Paris");
//! ```

use std::error::Error;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::Stream;
use serde::{Deserialize, Serialize};

/// Represents the possible roles for a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// A system authored message that primes or constrains assistant behaviour.
    System,
    /// A user authored message.
    User,
    /// An assistant authored message.
    Assistant,
}

/// A single chat message sent to the provider.
///
/// The body is stored as `Arc<str>` so that the same prompt can be cheaply
/// cloned across the many trace requests one solve call issues.
#[derive(Clone)]
pub struct Message {
    /// The role associated with the message.
    pub role: Role,
    /// The message body.
    pub content: Arc<str>,
}

/// One streaming step: a text chunk plus the provider's raw logprob
/// payload for that step, when it sent one.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    /// Incremental completion text.  Events with an empty chunk are
    /// skipped by the trace runner.
    pub chunk: String,
    /// Provider-specific logprob payload; parsed by [`top_candidates`].
    pub logprobs: Option<serde_json::Value>,
}

/// One candidate token with its log-probability at a given step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenCandidate {
    /// Candidate token text as reported by the provider.
    #[serde(default)]
    pub token: String,
    /// Natural-log probability of the candidate.
    #[serde(default)]
    pub logprob: f64,
}

/// Type alias for the lazy, finite, non-restartable event stream one chat
/// request produces.  Dropping the stream cancels the request.
pub type TraceEventStream =
    Pin<Box<dyn Stream<Item = Result<StreamEvent, Box<dyn Error + Send + Sync>>> + Send>>;

/// Trait-driven abstraction for a streaming chat provider.
///
/// Implementations translate engine requests into the provider's wire
/// format and surface per-token logprobs alongside the text.  They own
/// sampling knobs, transient-failure retries, and any timeouts; the engine
/// only consumes events and counts traces.
///
/// All implementations **must** be thread-safe (`Send + Sync`) so a single
/// adapter can be shared across sequential trace runs behind an `Arc`.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Open one streaming chat completion.
    ///
    /// Every call starts an independent sampled completion for the same
    /// `messages`; the returned stream yields events until the provider
    /// finishes or errors.  A failure to open the stream at all is an
    /// `Err` here; failures mid-stream travel as `Err` items inside the
    /// stream.
    async fn stream_chat(&self, messages: &[Message]) -> Result<TraceEventStream, Box<dyn Error>>;

    /// Upper bound on the provider's context size in tokens, when known.
    ///
    /// Consulted by the group-window computation; `None` means the
    /// absolute window cap stands in for it.
    fn provider_ctx_limit(&self) -> Option<usize> {
        None
    }

    /// Receive the calibrated online early-stop threshold.
    ///
    /// Advisory: adapters that can gate emission server-side may forward
    /// it; ignoring it does not affect correctness, since the engine
    /// enforces the threshold client-side regardless.
    async fn publish_threshold(&self, _threshold: f64) {}

    /// Return the identifier used to select the upstream model.
    fn model_name(&self) -> &str;
}

/// Extract the ordered top-k candidate list from a raw logprob payload.
///
/// Probes shape (a) — an object whose `content` array's **last** entry
/// carries `top_logprobs` — then shape (b) — `top_logprobs` at the top
/// level.  Anything else yields an empty list, which downstream scoring
/// treats as a zero-confidence step.
pub fn top_candidates(payload: &serde_json::Value) -> Vec<TokenCandidate> {
    let entries = match payload.get("content").and_then(|c| c.as_array()) {
        Some(content) if !content.is_empty() => content
            .last()
            .and_then(|entry| entry.get("top_logprobs"))
            .and_then(|tl| tl.as_array()),
        _ => payload.get("top_logprobs").and_then(|tl| tl.as_array()),
    };
    let entries = match entries {
        Some(entries) => entries,
        None => {
            if log::log_enabled!(log::Level::Debug) {
                log::debug!(
                    "top_candidates(...): payload matches neither accepted logprob shape, scoring step as zero confidence: {}",
                    payload
                );
            }
            return Vec::new();
        }
    };
    entries
        .iter()
        .map(|entry| TokenCandidate {
            token: entry
                .get("token")
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .to_string(),
            logprob: entry.get("logprob").and_then(|lp| lp.as_f64()).unwrap_or(0.0),
        })
        .collect()
}
