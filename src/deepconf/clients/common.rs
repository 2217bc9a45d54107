//! Shared utilities for provider adapter implementations.
//!
//! Adapters that talk to OpenAI-compatible HTTP surfaces should reuse the
//! tuned [`reqwest`] client exposed here: the single instance keeps TLS
//! sessions and DNS lookups warm, which significantly reduces latency when
//! a solve call issues hundreds of sequential trace requests.

use std::error::Error;
use std::time::Duration;

use lazy_static::lazy_static;

lazy_static! {
    /// Shared HTTP client with persistent connection pooling.
    static ref SHARED_HTTP_CLIENT: reqwest::Client = {
        reqwest::ClientBuilder::new()
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .timeout(Duration::from_secs(300))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to build shared HTTP client")
    };
}

/// Borrow the lazily initialised shared [`reqwest::Client`].
///
/// The returned reference can be cloned and reused by individual adapters.
pub fn get_shared_http_client() -> &'static reqwest::Client {
    &SHARED_HTTP_CLIENT
}

/// Streaming-layer error carrying a human-readable description.
#[derive(Debug)]
pub struct StreamError(pub String);

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Error for StreamError {}
