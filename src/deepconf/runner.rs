//! Drives one provider stream into a sealed [`Trace`].
//!
//! The runner consumes streaming events one at a time, derives a
//! confidence scalar for each emitted token from its top-k logprobs,
//! feeds the [`MovingConfidence`] window, and records both timelines in
//! lockstep.  When an online stop threshold is supplied and the group
//! confidence sinks below it — after the window has finished its warmup
//! ramp — the stream is abandoned early and the trace sealed at that
//! point.  Dropping the runner's future mid-stream closes the underlying
//! stream and discards the partial trace.

use std::error::Error;

use futures_util::StreamExt;

use crate::deepconf::aggregate::Trace;
use crate::deepconf::confidence::{token_confidence, MovingConfidence};
use crate::deepconf::provider::{top_candidates, Message, ProviderAdapter};
use crate::deepconf::settings::OnlineSettings;

/// Runs single traces against a shared [`ProviderAdapter`].
///
/// Stateless between runs; every [`run`](TraceRunner::run) call builds a
/// fresh [`MovingConfidence`] window from the settings snapshot.
pub struct TraceRunner<'a> {
    adapter: &'a dyn ProviderAdapter,
    settings: &'a OnlineSettings,
}

impl<'a> TraceRunner<'a> {
    /// Create a runner borrowing the adapter and settings for the run.
    pub fn new(adapter: &'a dyn ProviderAdapter, settings: &'a OnlineSettings) -> Self {
        TraceRunner { adapter, settings }
    }

    /// Sample one completion and seal it into a [`Trace`].
    ///
    /// With `stop_threshold = Some(s)`, the stream is cut as soon as the
    /// group confidence drops below `s` *and* at least
    /// `min_effective_window` tokens have been scored — the length gate
    /// keeps the ramping window from triggering premature stops.
    ///
    /// A transport error mid-stream seals the trace at what was received;
    /// a failure to open the stream at all is returned as an error.
    pub async fn run(
        &self,
        messages: &[Message],
        stop_threshold: Option<f64>,
    ) -> Result<Trace, Box<dyn Error>> {
        let mut moving = MovingConfidence::new(
            self.settings.group_window_target,
            self.settings.min_effective_window,
            self.settings.absolute_window_cap,
            self.adapter.provider_ctx_limit(),
        );
        let mut answer = String::new();
        let mut token_confs: Vec<f64> = Vec::new();
        let mut group_confs: Vec<f64> = Vec::new();

        let mut events = self.adapter.stream_chat(messages).await?;
        while let Some(event) = events.next().await {
            let event = match event {
                Ok(event) => event,
                Err(err) => {
                    log::warn!(
                        "TraceRunner::run(...): stream error after {} tokens, sealing trace: {}",
                        token_confs.len(),
                        err
                    );
                    break;
                }
            };
            if event.chunk.is_empty() {
                continue;
            }
            answer.push_str(&event.chunk);

            let candidates = event
                .logprobs
                .as_ref()
                .map(|payload| top_candidates(payload))
                .unwrap_or_default();
            let conf = token_confidence(&candidates);
            token_confs.push(conf);
            moving.push(conf);
            group_confs.push(moving.group_conf());

            if let Some(threshold) = stop_threshold {
                if moving.group_conf() < threshold
                    && token_confs.len() >= self.settings.min_effective_window
                {
                    if log::log_enabled!(log::Level::Debug) {
                        log::debug!(
                            "TraceRunner::run(...): group confidence {:.4} fell below {:.4} at token {}, stopping early",
                            moving.group_conf(),
                            threshold,
                            token_confs.len()
                        );
                    }
                    break;
                }
            }
        }

        Ok(Trace {
            answer,
            token_confs,
            group_confs,
        })
    }
}
