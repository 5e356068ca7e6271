//! Coordinator runtime configuration.
//!
//! All values come from environment variables with deterministic defaults.
//! Per-server operational data (management endpoint, secret) lives in the
//! store, not here — this covers only process-wide knobs.
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `VAC_HTTP_PORT` | `8080` | Control API listen port |
//! | `VAC_SWEEP_INTERVAL_SECS` | `180` | Full reconciliation sweep interval |
//! | `VAC_EXPIRY_INTERVAL_SECS` | `60` | Expiry sweeper interval |
//! | `VAC_NODE_TIMEOUT_MS` | `10000` | Per-request node RPC timeout |
//! | `VAC_NODE_RETRY_COUNT` | `3` | Attempts per node operation |
//! | `VAC_NODE_RETRY_DELAY_MS` | `500` | Initial backoff delay (doubles per retry) |
//! | `VAC_TRIAL_PLAN` | unset | Plan granted free of charge on first contact |

use thiserror::Error;

/// Configuration parse failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} invalid: '{value}'")]
    InvalidValue { var: &'static str, value: String },
}

/// Process-wide coordinator configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub http_port: u16,
    pub sweep_interval_secs: u64,
    pub expiry_interval_secs: u64,
    pub node_timeout_ms: u64,
    pub node_retry_count: u32,
    pub node_retry_delay_ms: u64,
    /// Plan id granted automatically on first contact; unset disables trials.
    pub trial_plan: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 8080,
            sweep_interval_secs: 180,
            expiry_interval_secs: 60,
            node_timeout_ms: 10_000,
            node_retry_count: 3,
            node_retry_delay_ms: 500,
            trial_plan: None,
        }
    }
}

impl Config {
    /// Build configuration from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build configuration from an arbitrary lookup function.
    ///
    /// Separated from [`Config::from_env`] so tests stay deterministic
    /// without mutating process-global environment state.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let defaults = Config::default();
        Ok(Self {
            http_port: parse_or(&lookup, "VAC_HTTP_PORT", defaults.http_port)?,
            sweep_interval_secs: parse_or(
                &lookup,
                "VAC_SWEEP_INTERVAL_SECS",
                defaults.sweep_interval_secs,
            )?,
            expiry_interval_secs: parse_or(
                &lookup,
                "VAC_EXPIRY_INTERVAL_SECS",
                defaults.expiry_interval_secs,
            )?,
            node_timeout_ms: parse_or(&lookup, "VAC_NODE_TIMEOUT_MS", defaults.node_timeout_ms)?,
            node_retry_count: parse_or(
                &lookup,
                "VAC_NODE_RETRY_COUNT",
                defaults.node_retry_count,
            )?,
            node_retry_delay_ms: parse_or(
                &lookup,
                "VAC_NODE_RETRY_DELAY_MS",
                defaults.node_retry_delay_ms,
            )?,
            trial_plan: lookup("VAC_TRIAL_PLAN").filter(|v| !v.is_empty()),
        })
    }
}

fn parse_or<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&'static str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(var) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue { var, value: raw }),
        None => Ok(default),
    }
}
