//! The adaptive sampling controller.
//!
//! [`OnlineEngine::solve`] runs the full warmup → calibration → adaptive
//! loop against a single [`ProviderAdapter`]:
//!
//! ```text
//! OnlineEngine::solve(messages)
//!   ├─ Phase 1: warmup_traces full traces, no early stop
//!   ├─ Phase 2: calibrate s = min score among the top-η% warmup traces,
//!   │           publish s to the adapter (advisory)
//!   ├─ Phase 3: while under budget — aggregate, return on consensus ≥ τ,
//!   │           otherwise sample one more trace with early stop at s
//!   └─ Phase 4: budget exhausted — return the final aggregate
//! ```
//!
//! Traces run strictly one at a time: each new trace is only sampled
//! after the consensus check over all prior traces, so the adaptive phase
//! is inherently serial.  All state lives on the stack of one `solve`
//! call; nothing persists across calls.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use deepconf::clients::openai::OpenAIClient;
//! use deepconf::provider::{Message, Role};
//! use deepconf::OnlineEngine;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let key = std::env::var("OPEN_AI_SECRET")?;
//!     let client = OpenAIClient::new_with_model_string(&key, "gpt-4.1-mini")?;
//!     let engine = OnlineEngine::for_model(Arc::new(client), None)?;
//!
//!     let result = engine
//!         .solve(&[Message {
//!             role: Role::User,
//!             content: Arc::from("What is 17 * 23? Answer with just the number."),
//!         }])
//!         .await?;
//!
//!     println!("{} (consensus {:.2})", result.winner, result.consensus());
//!     Ok(())
//! }
//! ```

use std::error::Error;
use std::sync::Arc;

use crate::deepconf::aggregate::{aggregate, Aggregate, ConfidenceRule, Trace};
use crate::deepconf::provider::{Message, ProviderAdapter};
use crate::deepconf::runner::TraceRunner;
use crate::deepconf::settings::{
    resolve_for_model, EngineSettings, OnlineSettings, SettingsError, SettingsOverride,
};

/// Adaptive confidence-weighted sampling over one provider adapter.
///
/// Construction validates the settings, so a live engine always holds an
/// in-range configuration.  The engine is reusable: each
/// [`solve`](OnlineEngine::solve) call is independent.
pub struct OnlineEngine {
    adapter: Arc<dyn ProviderAdapter>,
    settings: EngineSettings,
    online: OnlineSettings,
}

impl OnlineEngine {
    /// Build an engine from already-resolved settings.
    ///
    /// Fails fast on any out-of-range field, before a single trace runs.
    pub fn new(
        adapter: Arc<dyn ProviderAdapter>,
        settings: EngineSettings,
    ) -> Result<Self, SettingsError> {
        let online = OnlineSettings::from_engine(&settings)?;
        Ok(OnlineEngine {
            adapter,
            settings,
            online,
        })
    }

    /// Build an engine with settings resolved for the adapter's model
    /// name: defaults, then `user_overrides`, then matching per-model
    /// overrides.
    pub fn for_model(
        adapter: Arc<dyn ProviderAdapter>,
        user_overrides: Option<&SettingsOverride>,
    ) -> Result<Self, SettingsError> {
        let settings = resolve_for_model(adapter.model_name(), user_overrides)?;
        Self::new(adapter, settings)
    }

    /// The resolved settings this engine runs with.
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Sample traces until consensus or budget and return the winning
    /// answer with its vote weights.
    ///
    /// Traces are scored with the bottom-10% group-confidence rule
    /// throughout: it calibrates the online gate and weights every vote.
    pub async fn solve(&self, messages: &[Message]) -> Result<Aggregate, Box<dyn Error>> {
        let rule = ConfidenceRule::bottom10();
        let runner = TraceRunner::new(self.adapter.as_ref(), &self.online);
        let mut traces: Vec<Trace> = Vec::with_capacity(self.online.warmup_traces);

        // Phase 1: warmup, no online early stop.
        for i in 0..self.online.warmup_traces {
            let trace = runner.run(messages, None).await?;
            if log::log_enabled!(log::Level::Debug) {
                log::debug!(
                    "OnlineEngine::solve(...): warmup trace {}/{}: {} tokens",
                    i + 1,
                    self.online.warmup_traces,
                    trace.token_confs.len()
                );
            }
            traces.push(trace);
        }

        // Phase 2: calibrate the online threshold from the warmup scores.
        // Empty traces carry no signal and are left out.
        let mut scores: Vec<f64> = traces
            .iter()
            .filter(|trace| !trace.is_empty())
            .map(|trace| rule.score(trace))
            .collect();
        if scores.is_empty() {
            log::warn!(
                "OnlineEngine::solve(...): no usable warmup trace, falling back to a single vote"
            );
            return Ok(aggregate(&traces, rule, self.online.eta_percent));
        }
        scores.sort_by(|a, b| b.total_cmp(a));
        let keep = (scores.len() * self.online.eta_percent / 100).max(1);
        let stop_threshold = scores[keep - 1];
        self.adapter.publish_threshold(stop_threshold).await;
        log::info!(
            "OnlineEngine::solve(...): calibrated online threshold {:.4} from {} warmup traces",
            stop_threshold,
            scores.len()
        );

        // Phase 3: adaptive sampling until consensus or budget.
        while traces.len() < self.online.max_budget {
            let result = aggregate(&traces, rule, self.online.eta_percent);
            let consensus = result.consensus();
            if consensus >= self.online.consensus_threshold {
                log::info!(
                    "OnlineEngine::solve(...): consensus {:.4} reached after {} traces",
                    consensus,
                    traces.len()
                );
                return Ok(result);
            }
            let trace = runner.run(messages, Some(stop_threshold)).await?;
            traces.push(trace);
        }

        // Phase 4: budget exhausted.
        log::info!(
            "OnlineEngine::solve(...): budget of {} traces exhausted",
            self.online.max_budget
        );
        Ok(aggregate(&traces, rule, self.online.eta_percent))
    }
}
