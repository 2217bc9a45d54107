//! Streaming confidence primitives.
//!
//! [`MovingConfidence`] maintains the sliding-window average of per-token
//! confidences for one in-flight trace; its window-average at each step is
//! the *group confidence* used for Lowest Group Confidence (LGC) scoring
//! and online early termination.  The trace-level aggregations
//! ([`avg_trace_conf`], [`tail_conf`], [`bottom_percent_group_conf`])
//! reduce a sealed trace's confidence timeline to a single score.
//!
//! # Example
//!
//! ```rust
//! use deepconf::confidence::MovingConfidence;
//!
//! let mut mv = MovingConfidence::new(3, 1, 16, None);
//! for c in [1.0, 1.0, 1.0, 0.1] {
//!     mv.push(c);
//! }
//! // Window of the last 3 tokens: (1.0 + 1.0 + 0.1) / 3
//! assert!((mv.group_conf() - 0.7).abs() < 1e-9);
//! ```

use std::collections::VecDeque;

use crate::deepconf::provider::TokenCandidate;
use crate::deepconf::settings::effective_group_window;

/// Resum the queue this often to keep float drift bounded on long traces.
const RESUM_INTERVAL: usize = 1 << 16;

/// Sliding-window average of per-token confidences for one trace.
///
/// The window size follows [`effective_group_window`]: it starts at the
/// configured floor, ramps up with the number of tokens seen, and is
/// capped by the target, the absolute cap, and half the provider context
/// when known.  Each instance is exclusively owned by the runner of one
/// trace; nothing here is shared.
pub struct MovingConfidence {
    target_window: usize,
    min_effective: usize,
    absolute_cap: usize,
    provider_ctx_limit: Option<usize>,
    tokens_seen: usize,
    queue: VecDeque<f64>,
    sum_vals: f64,
}

impl MovingConfidence {
    /// Create an empty window with the given size configuration.
    pub fn new(
        target_window: usize,
        min_effective: usize,
        absolute_cap: usize,
        provider_ctx_limit: Option<usize>,
    ) -> Self {
        MovingConfidence {
            target_window,
            min_effective,
            absolute_cap,
            provider_ctx_limit,
            tokens_seen: 0,
            queue: VecDeque::new(),
            sum_vals: 0.0,
        }
    }

    /// Record the confidence of the next token.
    ///
    /// Recomputes the effective window for the new token count, shrinks
    /// from the oldest end if the window contracted, then either backfills
    /// the current value until the widened window is full (so a freshly
    /// widened window is not biased by zero-fills) or slides by one,
    /// dropping the oldest entry.  After every push the queue holds
    /// exactly the effective window.
    pub fn push(&mut self, token_conf: f64) {
        self.tokens_seen += 1;
        let eff = effective_group_window(
            self.target_window,
            self.provider_ctx_limit,
            self.tokens_seen,
            self.min_effective,
            self.absolute_cap,
        );
        while self.queue.len() > eff {
            if let Some(oldest) = self.queue.pop_front() {
                self.sum_vals -= oldest;
            }
        }
        if self.queue.len() < eff {
            while self.queue.len() < eff {
                self.queue.push_back(token_conf);
                self.sum_vals += token_conf;
            }
        } else {
            if let Some(oldest) = self.queue.pop_front() {
                self.sum_vals -= oldest;
            }
            self.queue.push_back(token_conf);
            self.sum_vals += token_conf;
        }

        if self.tokens_seen % RESUM_INTERVAL == 0 {
            self.sum_vals = self.queue.iter().sum();
        }
    }

    /// Current window-average confidence.
    ///
    /// Returns positive infinity when no token has been pushed, so that
    /// absent data can never trigger an early stop.
    pub fn group_conf(&self) -> f64 {
        if self.queue.is_empty() {
            return f64::INFINITY;
        }
        self.sum_vals / self.queue.len() as f64
    }

    /// Number of tokens pushed so far.
    pub fn tokens_seen(&self) -> usize {
        self.tokens_seen
    }

    /// Current window occupancy.
    pub fn window_len(&self) -> usize {
        self.queue.len()
    }
}

// ---------------------------------------------------------------------------
// Per-token confidence
// ---------------------------------------------------------------------------

/// Confidence proxy for one emitted token: the negative mean logprob over
/// the top-k candidate list.
///
/// Peaky distributions have more negative logprobs, so higher values mean
/// more confident.  An empty candidate list (provider sent no usable
/// logprobs for this step) scores `0.0`.
///
/// # Example
///
/// ```rust
/// use deepconf::confidence::token_confidence;
/// use deepconf::provider::TokenCandidate;
///
/// let candidates = vec![
///     TokenCandidate { token: "a".to_string(), logprob: -0.5 },
///     TokenCandidate { token: "b".to_string(), logprob: -1.5 },
/// ];
/// assert!((token_confidence(&candidates) - 1.0).abs() < 1e-9);
/// assert_eq!(token_confidence(&[]), 0.0);
/// ```
pub fn token_confidence(candidates: &[TokenCandidate]) -> f64 {
    if candidates.is_empty() {
        return 0.0;
    }
    let sum: f64 = candidates.iter().map(|c| c.logprob).sum();
    -sum / candidates.len() as f64
}

// ---------------------------------------------------------------------------
// Trace-level aggregations
// ---------------------------------------------------------------------------

/// Mean of the lowest q% of group confidences across a trace.
///
/// A pessimistic trace score: a trace is only as good as its shakiest
/// stretch.  `k = max(1, floor(len * q / 100))` lowest values are
/// averaged; an empty timeline scores positive infinity.
///
/// # Example
///
/// ```rust
/// use deepconf::confidence::bottom_percent_group_conf;
///
/// let groups: Vec<f64> = (1..=25).map(|v| v as f64).collect();
/// assert!((bottom_percent_group_conf(&groups, 10) - 1.5).abs() < 1e-9);
/// ```
pub fn bottom_percent_group_conf(group_confs: &[f64], q_percent: usize) -> f64 {
    if group_confs.is_empty() {
        return f64::INFINITY;
    }
    let k = (group_confs.len() * q_percent / 100).max(1);
    let mut sorted = group_confs.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    mean(&sorted[..k])
}

/// Mean of the last `min(last_tokens, len)` token confidences.
///
/// Empty input scores positive infinity.
pub fn tail_conf(token_confs: &[f64], last_tokens: usize) -> f64 {
    if token_confs.is_empty() {
        return f64::INFINITY;
    }
    let start = token_confs.len() - last_tokens.min(token_confs.len());
    mean(&token_confs[start..])
}

/// Arithmetic mean of all token confidences; empty input scores positive
/// infinity.
pub fn avg_trace_conf(token_confs: &[f64]) -> f64 {
    if token_confs.is_empty() {
        return f64::INFINITY;
    }
    mean(token_confs)
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backfill_seeds_widened_window_with_current_value() {
        // Floor of 3: the very first push backfills three copies, so the
        // average equals the pushed value instead of being diluted.
        let mut mv = MovingConfidence::new(3, 3, 16, None);
        mv.push(0.8);
        assert_eq!(mv.window_len(), 3);
        assert!((mv.group_conf() - 0.8).abs() < 1e-9);
    }

    #[test]
    fn empty_window_reports_infinite_confidence() {
        let mv = MovingConfidence::new(4, 1, 16, None);
        assert_eq!(mv.group_conf(), f64::INFINITY);
    }
}
