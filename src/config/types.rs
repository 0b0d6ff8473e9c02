/// Core shared types for the tracelink system
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Floor for the async token timeout. Near-zero configured timeouts would
/// evict continuations before the receiving thread has a chance to run.
pub const MIN_TOKEN_TIMEOUT: Duration = Duration::from_millis(250);

/// Policy for resolving conflicting address observations within one
/// detection window. Some drivers silently redirect through a proxy
/// mid-connect; without a policy the agent would report an arbitrary one
/// of two addresses.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MultihostPreference {
    /// Keep the earliest-observed address, ignore later ones.
    First,
    /// Overwrite with the latest-observed address.
    Last,
    /// Treat a conflict as unreliable: drop the address and stop detecting
    /// for the remainder of the window.
    #[default]
    None,
}

impl MultihostPreference {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "first" => Ok(MultihostPreference::First),
            "last" => Ok(MultihostPreference::Last),
            "none" => Ok(MultihostPreference::None),
            other => Err(TraceError::Config(format!(
                "Unknown datastore_multihost_preference: {}",
                other
            ))),
        }
    }
}

/// Slow-transaction sampler configuration
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SlowTransactionsConfig {
    /// Whether the sampler runs at all
    pub enabled: bool,
    /// A transaction open (or completed) past this threshold is reportable
    pub threshold_ms: u64,
    /// Depth bound on the reported stack trace
    pub max_stack_trace_lines: usize,
    /// Whether already-finished transactions are evaluated at completion,
    /// or only still-open ones on the harvest scan
    pub evaluate_completed: bool,
}

impl Default for SlowTransactionsConfig {
    fn default() -> Self {
        SlowTransactionsConfig {
            enabled: true,
            threshold_ms: 600_000,
            max_stack_trace_lines: 30,
            evaluate_completed: false,
        }
    }
}

/// Top-level configuration recognized by the core
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TraceConfig {
    /// TTL for unconsumed continuation tokens, in seconds
    pub async_token_timeout_seconds: u64,
    /// Conflict policy for connection address detection
    pub datastore_multihost_preference: MultihostPreference,
    pub slow_transactions: SlowTransactionsConfig,
    /// Period of the harvest tick driving sampling-based checks, in seconds
    pub harvest_interval_seconds: u64,
}

impl Default for TraceConfig {
    fn default() -> Self {
        TraceConfig {
            async_token_timeout_seconds: 180,
            datastore_multihost_preference: MultihostPreference::None,
            slow_transactions: SlowTransactionsConfig::default(),
            harvest_interval_seconds: 60,
        }
    }
}

impl TraceConfig {
    /// Effective token TTL, floor-clamped so a zero-second config still
    /// leaves a usable window.
    pub fn token_timeout(&self) -> Duration {
        Duration::from_secs(self.async_token_timeout_seconds).max(MIN_TOKEN_TIMEOUT)
    }

    pub fn harvest_interval(&self) -> Duration {
        Duration::from_secs(self.harvest_interval_seconds.max(1))
    }
}

/// Custom error types for tracelink.
///
/// Core context/token/registry operations fail open and never surface these
/// to adapter code; errors are reserved for the configuration and lifecycle
/// boundary (parsing config, starting/stopping background threads).
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Lifecycle error: {0}")]
    Lifecycle(String),
}

/// Result type alias for tracelink operations
pub type Result<T> = std::result::Result<T, TraceError>;
