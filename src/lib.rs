// src/lib.rs

// Import the top-level `deepconf` module.
pub mod deepconf;

// Re-exporting the submodules and key items for easier external access.
pub use deepconf::{aggregate, clients, confidence, engine, provider, runner, settings};

pub use deepconf::aggregate::{majority_vote, Aggregate, ConfidenceRule, Trace};
pub use deepconf::engine::OnlineEngine;
pub use deepconf::provider::{Message, ProviderAdapter, Role};
pub use deepconf::settings::{EngineSettings, SettingsOverride};

/// Initialize the global `env_logger` instance.
///
/// Safe to call from every test or binary entry point; only the first
/// call installs the logger.
pub fn init_logger() {
    let _ = env_logger::Builder::from_default_env()
        .format_timestamp_millis()
        .try_init();
}
