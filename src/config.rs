//! Run configuration, read from environment variables.
//!
//! Every setting has a default, so an empty environment yields a working
//! configuration pointed at the in-cluster Loki and a local SQLite file.
//! [`MinerConfig::from_lookup`] takes the variable source as a function so
//! tests never touch the process environment.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::drain::DrainConfig;
use crate::error::MinerError;
use crate::filter::DEFAULT_FIELD;
use crate::retry::RetryPolicy;

// ================================================================================================
// DEFAULTS
// ================================================================================================

pub const DEFAULT_LOKI_URL: &str = "http://loki.monitoring.svc.cluster.local:3100";
pub const DEFAULT_LOKI_QUERY: &str = "{namespace=\"npps\"}";
pub const DEFAULT_STATE_BACKEND_URL: &str = "sqlite://./var/data/miner_state.db";
pub const DEFAULT_STATE_KEY: &str = "drain3_state";
pub const DEFAULT_SINK_URL: &str = "stdout://";

/// Everything one run needs.
#[derive(Debug, Clone, PartialEq)]
pub struct MinerConfig {
    /// Log store endpoint.
    pub loki_url: String,
    /// Label selector.
    pub loki_query: String,
    /// Maximum entries fetched per run.
    pub loki_limit: usize,
    /// Window queried when no cursor has been persisted yet.
    pub loki_lookback: Duration,
    /// Payload fields holding the message text, first match wins.
    pub log_fields: Vec<String>,

    pub state_backend_url: String,
    pub state_key: String,
    pub state_compress: bool,

    pub drain: DrainConfig,

    /// Lifetime of the run lock. Must outlive the run timeout.
    pub run_lock_ttl: Duration,
    pub run_timeout: Duration,

    pub fetch_retry: RetryPolicy,
    pub state_retry: RetryPolicy,
    pub forward_retry: RetryPolicy,

    /// Per-call timeout for HTTP requests and busy backends.
    pub http_timeout: Duration,
    pub sink_url: String,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            loki_url: DEFAULT_LOKI_URL.to_string(),
            loki_query: DEFAULT_LOKI_QUERY.to_string(),
            loki_limit: 20,
            loki_lookback: Duration::from_secs(3600),
            log_fields: vec![DEFAULT_FIELD.to_string()],
            state_backend_url: DEFAULT_STATE_BACKEND_URL.to_string(),
            state_key: DEFAULT_STATE_KEY.to_string(),
            state_compress: false,
            drain: DrainConfig::default(),
            run_lock_ttl: Duration::from_secs(300),
            run_timeout: Duration::from_secs(240),
            fetch_retry: RetryPolicy::default(),
            state_retry: RetryPolicy::default(),
            forward_retry: RetryPolicy::default(),
            http_timeout: Duration::from_secs(10),
            sink_url: DEFAULT_SINK_URL.to_string(),
        }
    }
}

/// Typed reads over a variable lookup.
struct Vars<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Vars<F> {
    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, name: &str, default: &str) -> String {
        self.raw(name).unwrap_or_else(|| default.to_string())
    }

    fn parse<T>(&self, name: &str, default: T) -> Result<T, MinerError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.raw(name) {
            None => Ok(default),
            Some(value) => value
                .parse()
                .map_err(|e| MinerError::Config(format!("{name}={value:?}: {e}"))),
        }
    }

    fn flag(&self, name: &str, default: bool) -> Result<bool, MinerError> {
        match self.raw(name).map(|v| v.to_ascii_lowercase()) {
            None => Ok(default),
            Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
            Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
            Some(v) => Err(MinerError::Config(format!("{name}={v:?}: expected a boolean"))),
        }
    }

    fn secs(&self, name: &str, default: Duration) -> Result<Duration, MinerError> {
        self.parse(name, default.as_secs()).map(Duration::from_secs)
    }

    fn millis(&self, name: &str, default: Duration) -> Result<Duration, MinerError> {
        self.parse(name, default.as_millis() as u64)
            .map(Duration::from_millis)
    }
}

impl MinerConfig {
    /// Read the process environment.
    pub fn from_env() -> Result<Self, MinerError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Read settings through `lookup`, falling back to defaults for unset or
    /// blank variables.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, MinerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };
        let defaults = Self::default();

        let backoff = RetryPolicy {
            max_attempts: defaults.fetch_retry.max_attempts,
            base_delay: vars.millis("RETRY_BASE_DELAY_MS", defaults.fetch_retry.base_delay)?,
            max_delay: vars.millis("RETRY_MAX_DELAY_MS", defaults.fetch_retry.max_delay)?,
            jitter: vars.parse("RETRY_JITTER", defaults.fetch_retry.jitter)?,
        };
        let attempts = |name: &str| -> Result<RetryPolicy, MinerError> {
            Ok(RetryPolicy {
                max_attempts: vars.parse(name, backoff.max_attempts)?,
                ..backoff.clone()
            })
        };

        let log_fields = vars
            .string("LOG_FIELDS", DEFAULT_FIELD)
            .split(',')
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(str::to_string)
            .collect();

        let config = Self {
            loki_url: vars.string("LOKI_URL", &defaults.loki_url),
            loki_query: vars.string("LOKI_QUERY", &defaults.loki_query),
            loki_limit: vars.parse("LOKI_LIMIT", defaults.loki_limit)?,
            loki_lookback: vars.secs("LOKI_LOOKBACK_SECS", defaults.loki_lookback)?,
            log_fields,
            state_backend_url: vars.string("STATE_BACKEND_URL", &defaults.state_backend_url),
            state_key: vars.string("STATE_KEY", &defaults.state_key),
            state_compress: vars.flag("STATE_COMPRESS", defaults.state_compress)?,
            drain: DrainConfig {
                sim_threshold: vars.parse("DRAIN_SIM_TH", defaults.drain.sim_threshold)?,
                max_depth: vars.parse("DRAIN_DEPTH", defaults.drain.max_depth)?,
                max_children: vars.parse("DRAIN_MAX_CHILDREN", defaults.drain.max_children)?,
                max_clusters_per_leaf: vars.parse(
                    "DRAIN_MAX_CLUSTERS_PER_LEAF",
                    defaults.drain.max_clusters_per_leaf,
                )?,
            },
            run_lock_ttl: vars.secs("RUN_LOCK_TTL_SECS", defaults.run_lock_ttl)?,
            run_timeout: vars.secs("RUN_TIMEOUT_SECS", defaults.run_timeout)?,
            fetch_retry: attempts("FETCH_RETRY_ATTEMPTS")?,
            state_retry: attempts("STATE_RETRY_ATTEMPTS")?,
            forward_retry: attempts("FORWARD_RETRY_ATTEMPTS")?,
            http_timeout: vars.secs("HTTP_TIMEOUT_SECS", defaults.http_timeout)?,
            sink_url: vars.string("SINK_URL", &defaults.sink_url),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), MinerError> {
        self.drain.validate().map_err(MinerError::Config)?;

        if self.loki_limit == 0 {
            return Err(MinerError::Config("LOKI_LIMIT must be positive".to_string()));
        }
        if self.log_fields.is_empty() {
            return Err(MinerError::Config(
                "LOG_FIELDS must name at least one field".to_string(),
            ));
        }
        if self.state_key.is_empty() {
            return Err(MinerError::Config("STATE_KEY must not be empty".to_string()));
        }
        if self.http_timeout.is_zero() || self.run_timeout.is_zero() {
            return Err(MinerError::Config(
                "HTTP_TIMEOUT_SECS and RUN_TIMEOUT_SECS must be positive".to_string(),
            ));
        }
        if self.run_timeout >= self.run_lock_ttl {
            return Err(MinerError::Config(format!(
                "RUN_TIMEOUT_SECS ({}) must be shorter than RUN_LOCK_TTL_SECS ({})",
                self.run_timeout.as_secs(),
                self.run_lock_ttl.as_secs()
            )));
        }
        for (name, policy) in [
            ("FETCH_RETRY_ATTEMPTS", &self.fetch_retry),
            ("STATE_RETRY_ATTEMPTS", &self.state_retry),
            ("FORWARD_RETRY_ATTEMPTS", &self.forward_retry),
        ] {
            if policy.max_attempts == 0 {
                return Err(MinerError::Config(format!("{name} must be at least 1")));
            }
            if !(0.0..=1.0).contains(&policy.jitter) {
                return Err(MinerError::Config(format!(
                    "RETRY_JITTER must be within [0, 1], got {}",
                    policy.jitter
                )));
            }
            if policy.base_delay > policy.max_delay {
                return Err(MinerError::Config(
                    "RETRY_BASE_DELAY_MS must not exceed RETRY_MAX_DELAY_MS".to_string(),
                ));
            }
        }
        Ok(())
    }
}
