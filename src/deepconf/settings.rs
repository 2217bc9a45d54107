//! Engine configuration: defaults, partial overrides, per-model nudges, and
//! the effective group-window computation.
//!
//! Settings resolution happens once, before any trace is sampled:
//! start from [`EngineSettings::default`], apply the caller's
//! [`SettingsOverride`], then apply every [`ModelOverride`] whose pattern
//! matches the model name (case-insensitively), in listed order.  The
//! resolved record is validated up front so that misconfiguration surfaces
//! as a [`SettingsError`] instead of a half-finished sampling run.
//!
//! # Example
//!
//! ```rust
//! use deepconf::settings::{resolve_for_model, EngineSettings, SettingsOverride};
//!
//! // Defaults straight up.
//! let cfg = resolve_for_model("gpt-4.1-nano", None).unwrap();
//! assert_eq!(cfg.eta_percent, 10);
//!
//! // Caller overrides merge onto the defaults.
//! let user = SettingsOverride {
//!     warmup_traces: Some(4),
//!     max_budget: Some(32),
//!     ..SettingsOverride::default()
//! };
//! let cfg = resolve_for_model("gpt-4.1-nano", Some(&user)).unwrap();
//! assert_eq!(cfg.warmup_traces, 4);
//! assert_eq!(cfg.max_budget, 32);
//! assert_eq!(cfg.consensus_threshold, 0.95);
//! ```

use std::error::Error;
use std::fmt;

use regex::RegexBuilder;
use serde::{Deserialize, Serialize};

/// Resolved engine configuration.
///
/// All fields carry the documented defaults; construct via
/// [`EngineSettings::default`], one of the named presets, or
/// [`resolve_for_model`].  Instances are immutable for the duration of a
/// sampling run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Master switch consulted by callers before engaging the engine at all.
    pub enabled: bool,
    /// Sampling temperature forwarded to the provider.
    pub temperature: f64,
    /// Nucleus sampling parameter forwarded to the provider.
    pub top_p: f64,
    /// Number of candidate logprobs requested per emitted token.
    pub top_logprobs: usize,
    /// Requested group-confidence window size, before context caps apply.
    pub group_window_target: usize,
    /// Percentage of top-scoring traces kept for voting (η).
    pub eta_percent: usize,
    /// Consensus threshold τ: sampling stops when the modal answer's share
    /// of total vote weight reaches this value.
    pub consensus_threshold: f64,
    /// Number of warmup traces sampled without online early stop.
    pub warmup_traces: usize,
    /// Hard cap on the total number of traces per solve call.
    pub max_budget: usize,
    /// Smallest window the group-confidence average may shrink to.
    pub min_effective_window: usize,
    /// Largest window regardless of target or provider context size.
    pub absolute_window_cap: usize,
    /// Per-model partial overrides, applied in listed order when their
    /// pattern matches the model name case-insensitively.
    pub model_overrides: Vec<ModelOverride>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            enabled: true,
            temperature: 1.0,
            top_p: 1.0,
            top_logprobs: 20,
            group_window_target: 100_000,
            eta_percent: 10,
            consensus_threshold: 0.95,
            warmup_traces: 16,
            max_budget: 512,
            min_effective_window: 512,
            absolute_window_cap: 131_072, // 128k cap
            model_overrides: vec![ModelOverride {
                pattern: r"gpt[-_]?oss[-_]?120b".to_string(),
                overrides: SettingsOverride {
                    eta_percent: Some(10),
                    consensus_threshold: Some(0.95),
                    group_window_target: Some(100_000),
                    temperature: Some(1.0),
                    top_p: Some(1.0),
                    top_logprobs: Some(20),
                    ..SettingsOverride::default()
                },
            }],
        }
    }
}

impl EngineSettings {
    /// Preset keeping only the top decile of traces (η = 10).
    ///
    /// The η-filter discards most traces and lets a small, high-confidence
    /// minority decide the vote.  Use when traces are cheap and wrong
    /// answers tend to come with visibly poor confidence.
    pub fn aggressive_filtering() -> Self {
        EngineSettings {
            eta_percent: 10,
            ..EngineSettings::default()
        }
    }

    /// Preset dropping only the worst decile of traces (η = 90).
    ///
    /// Most traces participate in the vote; the filter only removes clear
    /// outliers.  Use when individual trace confidence is noisy.
    pub fn conservative_filtering() -> Self {
        EngineSettings {
            eta_percent: 90,
            ..EngineSettings::default()
        }
    }

    /// Check every range constraint, returning the first violation.
    ///
    /// Called by [`OnlineSettings::from_engine`] so that an engine is never
    /// constructed from an out-of-range record.
    ///
    /// # Example
    ///
    /// ```rust
    /// use deepconf::settings::EngineSettings;
    ///
    /// let mut cfg = EngineSettings::default();
    /// assert!(cfg.validate().is_ok());
    ///
    /// cfg.eta_percent = 0;
    /// assert!(cfg.validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.eta_percent < 1 || self.eta_percent > 100 {
            return Err(SettingsError::out_of_range(
                "eta_percent",
                format!("must be in [1, 100], got {}", self.eta_percent),
            ));
        }
        if !(0.0..=1.0).contains(&self.consensus_threshold) {
            return Err(SettingsError::out_of_range(
                "consensus_threshold",
                format!("must be in [0, 1], got {}", self.consensus_threshold),
            ));
        }
        if self.warmup_traces < 1 {
            return Err(SettingsError::out_of_range(
                "warmup_traces",
                "must be at least 1".to_string(),
            ));
        }
        if self.max_budget < self.warmup_traces {
            return Err(SettingsError::out_of_range(
                "max_budget",
                format!(
                    "must be >= warmup_traces ({}), got {}",
                    self.warmup_traces, self.max_budget
                ),
            ));
        }
        if self.group_window_target < 1 {
            return Err(SettingsError::out_of_range(
                "group_window_target",
                "must be at least 1".to_string(),
            ));
        }
        if self.min_effective_window < 1 {
            return Err(SettingsError::out_of_range(
                "min_effective_window",
                "must be at least 1".to_string(),
            ));
        }
        if self.absolute_window_cap < self.min_effective_window {
            return Err(SettingsError::out_of_range(
                "absolute_window_cap",
                format!(
                    "must be >= min_effective_window ({}), got {}",
                    self.min_effective_window, self.absolute_window_cap
                ),
            ));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(SettingsError::out_of_range(
                "temperature",
                format!("must be finite and non-negative, got {}", self.temperature),
            ));
        }
        if !self.top_p.is_finite() || self.top_p < 0.0 {
            return Err(SettingsError::out_of_range(
                "top_p",
                format!("must be finite and non-negative, got {}", self.top_p),
            ));
        }
        Ok(())
    }
}

/// A partial settings record: every field optional, `Some` fields win.
///
/// Used both for caller-supplied configuration and for the values of
/// [`ModelOverride`] entries.  Nested `model_overrides` lists concatenate
/// rather than replace, so a user override can add per-model nudges
/// without clobbering the shipped ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsOverride {
    pub enabled: Option<bool>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub top_logprobs: Option<usize>,
    pub group_window_target: Option<usize>,
    pub eta_percent: Option<usize>,
    pub consensus_threshold: Option<f64>,
    pub warmup_traces: Option<usize>,
    pub max_budget: Option<usize>,
    pub min_effective_window: Option<usize>,
    pub absolute_window_cap: Option<usize>,
    pub model_overrides: Vec<ModelOverride>,
}

impl SettingsOverride {
    /// Merge this partial record onto `settings` in place.
    pub fn apply(&self, settings: &mut EngineSettings) {
        if let Some(enabled) = self.enabled {
            settings.enabled = enabled;
        }
        if let Some(temperature) = self.temperature {
            settings.temperature = temperature;
        }
        if let Some(top_p) = self.top_p {
            settings.top_p = top_p;
        }
        if let Some(top_logprobs) = self.top_logprobs {
            settings.top_logprobs = top_logprobs;
        }
        if let Some(target) = self.group_window_target {
            settings.group_window_target = target;
        }
        if let Some(eta) = self.eta_percent {
            settings.eta_percent = eta;
        }
        if let Some(tau) = self.consensus_threshold {
            settings.consensus_threshold = tau;
        }
        if let Some(warmup) = self.warmup_traces {
            settings.warmup_traces = warmup;
        }
        if let Some(budget) = self.max_budget {
            settings.max_budget = budget;
        }
        if let Some(min_eff) = self.min_effective_window {
            settings.min_effective_window = min_eff;
        }
        if let Some(cap) = self.absolute_window_cap {
            settings.absolute_window_cap = cap;
        }
        settings
            .model_overrides
            .extend(self.model_overrides.iter().cloned());
    }
}

/// One per-model nudge: a case-insensitive regex over the model name plus
/// the partial record to apply when it matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelOverride {
    /// Regex matched against the model name, case-insensitively.
    pub pattern: String,
    /// Values applied when the pattern matches.
    pub overrides: SettingsOverride,
}

/// Build the resolved settings record for `model_name`.
///
/// Defaults, then the caller's override, then every matching
/// [`ModelOverride`] in listed order.  An unparsable override pattern is a
/// configuration error and fails the whole resolution.
///
/// # Example
///
/// ```rust
/// use deepconf::settings::{resolve_for_model, ModelOverride, SettingsOverride};
///
/// let user = SettingsOverride {
///     model_overrides: vec![ModelOverride {
///         pattern: "mini".to_string(),
///         overrides: SettingsOverride {
///             eta_percent: Some(90),
///             ..SettingsOverride::default()
///         },
///     }],
///     ..SettingsOverride::default()
/// };
///
/// let cfg = resolve_for_model("gpt-4o-MINI", Some(&user)).unwrap();
/// assert_eq!(cfg.eta_percent, 90);
///
/// let cfg = resolve_for_model("gpt-4o", Some(&user)).unwrap();
/// assert_eq!(cfg.eta_percent, 10);
/// ```
pub fn resolve_for_model(
    model_name: &str,
    user_overrides: Option<&SettingsOverride>,
) -> Result<EngineSettings, SettingsError> {
    let mut settings = EngineSettings::default();
    if let Some(user) = user_overrides {
        user.apply(&mut settings);
    }
    let entries = settings.model_overrides.clone();
    for entry in &entries {
        let matcher = RegexBuilder::new(&entry.pattern)
            .case_insensitive(true)
            .build()
            .map_err(|source| SettingsError::BadOverridePattern {
                pattern: entry.pattern.clone(),
                source,
            })?;
        if matcher.is_match(model_name) {
            entry.overrides.apply(&mut settings);
        }
    }
    Ok(settings)
}

/// The immutable per-run subset of [`EngineSettings`] consumed by the
/// sampling loop and the trace runner.
#[derive(Debug, Clone)]
pub struct OnlineSettings {
    /// Percentage of top-scoring traces kept during aggregation.
    pub eta_percent: usize,
    /// τ: stop when the modal answer's weight share reaches this.
    pub consensus_threshold: f64,
    /// Number of warmup traces run without online early stop.
    pub warmup_traces: usize,
    /// Total trace budget.
    pub max_budget: usize,
    /// Requested group window size.
    pub group_window_target: usize,
    /// Window floor; also gates online early stop during warmup ramp.
    pub min_effective_window: usize,
    /// Window ceiling.
    pub absolute_window_cap: usize,
}

impl OnlineSettings {
    /// Snapshot the sampling-relevant fields out of a validated
    /// [`EngineSettings`].
    pub fn from_engine(settings: &EngineSettings) -> Result<Self, SettingsError> {
        settings.validate()?;
        Ok(OnlineSettings {
            eta_percent: settings.eta_percent,
            consensus_threshold: settings.consensus_threshold,
            warmup_traces: settings.warmup_traces,
            max_budget: settings.max_budget,
            group_window_target: settings.group_window_target,
            min_effective_window: settings.min_effective_window,
            absolute_window_cap: settings.absolute_window_cap,
        })
    }
}

/// Compute the group-confidence window size in effect after `tokens_seen`
/// tokens.
///
/// The provider context (when known) is halved to leave headroom for the
/// KV cache and output buffers, then clamped by the absolute cap and the
/// floor; the result ramps up with `tokens_seen` until it reaches the hard
/// cap and stays there.
///
/// # Example
///
/// ```rust
/// use deepconf::settings::effective_group_window;
///
/// // target=10, no provider limit, min=2, cap=20
/// assert_eq!(effective_group_window(10, None, 1, 2, 20), 2);
/// assert_eq!(effective_group_window(10, None, 5, 2, 20), 5);
/// assert_eq!(effective_group_window(10, None, 15, 2, 20), 10);
/// ```
pub fn effective_group_window(
    target: usize,
    provider_ctx_limit: Option<usize>,
    tokens_seen: usize,
    min_effective: usize,
    absolute_cap: usize,
) -> usize {
    let half_ctx = provider_ctx_limit.unwrap_or(absolute_cap) / 2;
    let ctx_cap = absolute_cap.min(half_ctx).max(min_effective);
    let hard_cap = target.min(ctx_cap).max(min_effective);
    hard_cap.min(tokens_seen.max(min_effective)).max(min_effective)
}

/// Errors produced while resolving or validating engine settings.
#[derive(Debug)]
pub enum SettingsError {
    /// A numeric field is outside its documented range.
    OutOfRange {
        field: &'static str,
        detail: String,
    },
    /// A [`ModelOverride`] pattern failed to compile as a regex.
    BadOverridePattern {
        pattern: String,
        source: regex::Error,
    },
}

impl SettingsError {
    fn out_of_range(field: &'static str, detail: String) -> Self {
        SettingsError::OutOfRange { field, detail }
    }
}

impl fmt::Display for SettingsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingsError::OutOfRange { field, detail } => {
                write!(f, "invalid setting `{}`: {}", field, detail)
            }
            SettingsError::BadOverridePattern { pattern, source } => {
                write!(f, "invalid model override pattern `{}`: {}", pattern, source)
            }
        }
    }
}

impl Error for SettingsError {}
