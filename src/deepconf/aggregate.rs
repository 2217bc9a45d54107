//! Trace aggregation: η%-filtering and confidence-weighted voting.
//!
//! A sealed [`Trace`] carries the completion text plus its per-token and
//! group confidence timelines.  [`aggregate`] scores every usable trace
//! with a [`ConfidenceRule`], keeps the top η%, and adds each kept trace's
//! score to its answer's vote weight.  Scores are confidence proxies
//! derived from negative mean logprobs, so they are assumed non-negative
//! in the operating regime; no renormalization is performed — higher score
//! simply contributes more.
//!
//! Traces whose token stream came back empty score positive infinity
//! under every rule and are excluded from filtering and voting entirely,
//! so a dead stream can never dominate the vote.
//!
//! # Example
//!
//! ```rust
//! use deepconf::aggregate::{aggregate, ConfidenceRule, Trace};
//!
//! let traces = vec![
//!     Trace { answer: "A".to_string(), token_confs: vec![2.0], group_confs: vec![2.0] },
//!     Trace { answer: "A".to_string(), token_confs: vec![1.5], group_confs: vec![1.5] },
//!     Trace { answer: "B".to_string(), token_confs: vec![1.0], group_confs: vec![1.0] },
//! ];
//!
//! let result = aggregate(&traces, ConfidenceRule::bottom10(), 100);
//! assert_eq!(result.winner, "A");
//! assert!((result.weight_of("A") - 3.5).abs() < 1e-9);
//! assert!((result.consensus() - 3.5 / 4.5).abs() < 1e-9);
//! ```

use crate::deepconf::confidence::{avg_trace_conf, bottom_percent_group_conf, tail_conf};

/// One sampled completion with its confidence timelines.
///
/// Immutable once sealed by the trace runner.  `token_confs[i]` and
/// `group_confs[i]` describe the same streaming step, so the two vectors
/// always have equal length.
#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    /// Concatenated completion text.
    pub answer: String,
    /// Per-token confidence scalars, one per emitted token.
    pub token_confs: Vec<f64>,
    /// Group (window-average) confidence at each token position.
    pub group_confs: Vec<f64>,
}

impl Trace {
    /// `true` when the provider stream produced no scored tokens.
    ///
    /// Empty traces score positive infinity under every rule and are
    /// excluded from threshold calibration and voting.
    pub fn is_empty(&self) -> bool {
        self.token_confs.is_empty()
    }
}

/// Trace-level scoring rule.
///
/// Defaults to [`ConfidenceRule::bottom10`], the pessimistic Lowest Group
/// Confidence score used for online threshold calibration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConfidenceRule {
    /// Arithmetic mean of all token confidences.
    Average,
    /// Mean of the last `last_tokens` token confidences.
    Tail { last_tokens: usize },
    /// Mean of the lowest `q_percent`% of group confidences.
    BottomPercent { q_percent: usize },
}

impl ConfidenceRule {
    /// Bottom-10% group confidence, the default online rule.
    pub fn bottom10() -> Self {
        ConfidenceRule::BottomPercent { q_percent: 10 }
    }

    /// Mean confidence over the final 2048 tokens.
    pub fn tail2k() -> Self {
        ConfidenceRule::Tail { last_tokens: 2048 }
    }

    /// Score a sealed trace under this rule; empty traces score positive
    /// infinity.
    pub fn score(&self, trace: &Trace) -> f64 {
        match *self {
            ConfidenceRule::Average => avg_trace_conf(&trace.token_confs),
            ConfidenceRule::Tail { last_tokens } => tail_conf(&trace.token_confs, last_tokens),
            ConfidenceRule::BottomPercent { q_percent } => {
                bottom_percent_group_conf(&trace.group_confs, q_percent)
            }
        }
    }
}

impl Default for ConfidenceRule {
    fn default() -> Self {
        ConfidenceRule::bottom10()
    }
}

/// Outcome of a weighted vote: the winning answer plus every answer's
/// accumulated weight in first-insertion order.
#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    /// Answer with the largest accumulated weight; ties resolve to the
    /// answer that accumulated weight first.  Empty string when no trace
    /// was usable.
    pub winner: String,
    /// `(answer, weight)` pairs in the order answers first appeared.
    pub weights: Vec<(String, f64)>,
}

impl Aggregate {
    /// Accumulated weight of `answer`, or `0.0` if it received no votes.
    pub fn weight_of(&self, answer: &str) -> f64 {
        self.weights
            .iter()
            .find(|(candidate, _)| candidate == answer)
            .map(|(_, weight)| *weight)
            .unwrap_or(0.0)
    }

    /// The winner's share of total vote weight, or `0.0` when the total
    /// is not positive.
    pub fn consensus(&self) -> f64 {
        let total: f64 = self.weights.iter().map(|(_, weight)| weight).sum();
        if total > 0.0 {
            self.weight_of(&self.winner) / total
        } else {
            0.0
        }
    }
}

/// Keep the top η% of usable traces by score.
///
/// Scores descending with a stable sort, so equal scores keep their
/// original order; `k = max(1, floor(n * eta / 100))` traces survive.
/// Empty traces never make it into the candidate set.
pub fn filter_top_eta(
    traces: &[Trace],
    rule: ConfidenceRule,
    eta_percent: usize,
) -> Vec<&Trace> {
    let mut scored: Vec<(f64, &Trace)> = traces
        .iter()
        .filter(|trace| !trace.is_empty())
        .map(|trace| (rule.score(trace), trace))
        .collect();
    if scored.is_empty() {
        return Vec::new();
    }
    scored.sort_by(|a, b| b.0.total_cmp(&a.0));
    let keep = (scored.len() * eta_percent / 100).max(1);
    scored
        .into_iter()
        .take(keep)
        .map(|(_, trace)| trace)
        .collect()
}

/// Confidence-weighted vote over already-filtered traces.
///
/// Each trace adds its score to its answer's weight; answers are compared
/// by exact string equality.  The winner is the argmax over weights, with
/// ties broken by first insertion order.
pub fn weighted_vote(traces: &[&Trace], rule: ConfidenceRule) -> Aggregate {
    let mut weights: Vec<(String, f64)> = Vec::new();
    for trace in traces {
        let score = rule.score(trace);
        match weights
            .iter_mut()
            .find(|(answer, _)| answer == &trace.answer)
        {
            Some((_, weight)) => *weight += score,
            None => weights.push((trace.answer.clone(), score)),
        }
    }
    let mut winner = String::new();
    let mut best = f64::NEG_INFINITY;
    for (answer, weight) in &weights {
        if *weight > best {
            best = *weight;
            winner = answer.clone();
        }
    }
    Aggregate { winner, weights }
}

/// End-to-end aggregation: η%-filter then weighted vote.
///
/// With no usable traces the result has an empty winner and no weights.
pub fn aggregate(traces: &[Trace], rule: ConfidenceRule, eta_percent: usize) -> Aggregate {
    let kept = filter_top_eta(traces, rule, eta_percent);
    weighted_vote(&kept, rule)
}

/// Plain answer-count majority over all traces, the unweighted baseline.
///
/// Counts every trace (including empty ones) and breaks ties by first
/// insertion order, mirroring [`weighted_vote`].
pub fn majority_vote(traces: &[Trace]) -> (String, Vec<(String, usize)>) {
    let mut votes: Vec<(String, usize)> = Vec::new();
    for trace in traces {
        match votes
            .iter_mut()
            .find(|(answer, _)| answer == &trace.answer)
        {
            Some((_, count)) => *count += 1,
            None => votes.push((trace.answer.clone(), 1)),
        }
    }
    let mut winner = String::new();
    let mut best = 0usize;
    for (answer, count) in &votes {
        if *count > best {
            best = *count;
            winner = answer.clone();
        }
    }
    (winner, votes)
}
