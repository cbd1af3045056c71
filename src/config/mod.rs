//! Typed configuration from environment variables.
//!
//! Loads once at startup and fails fast on malformed values. Every setting
//! has a default, so an empty environment yields a working controller.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::model::ObjectKey;
use crate::queue::rate_limit::{
    BucketRateLimiter, ExponentialFailureRateLimiter, MaxOfRateLimiter,
};

/// Tuning for one controller's queue and worker pool.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// How long to wait for the change source to sync. `None` waits forever.
    pub cache_sync_timeout: Option<Duration>,
    /// How often `has_synced` is polled during startup.
    pub sync_poll_interval: Duration,
    /// First requeue delay for a failing key.
    pub backoff_base: Duration,
    /// Upper bound on the per-key requeue delay.
    pub backoff_max: Duration,
    /// Overall requeue rate across all keys.
    pub qps: f64,
    pub burst: u32,
    /// Drop a key after this many consecutive failures. `None` retries forever.
    pub max_retries: Option<u32>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            cache_sync_timeout: Some(Duration::from_secs(60)),
            sync_poll_interval: Duration::from_millis(100),
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_secs(1000),
            qps: 10.0,
            burst: 100,
            max_retries: None,
        }
    }
}

impl ControllerConfig {
    /// The rate limiter these settings describe.
    pub fn rate_limiter(&self) -> MaxOfRateLimiter<ObjectKey> {
        MaxOfRateLimiter::new(vec![
            Box::new(ExponentialFailureRateLimiter::new(
                self.backoff_base,
                self.backoff_max,
            )),
            Box::new(BucketRateLimiter::new(self.qps, self.burst)),
        ])
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub controller: ControllerConfig,
    /// Manifest of objects the daemon seeds its source with.
    pub manifest: Option<PathBuf>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = ControllerConfig::default();

        let workers = parse(&lookup, "RECONCILE_WORKERS")?.unwrap_or(defaults.workers);
        if workers == 0 {
            return Err(Error::Config(
                "RECONCILE_WORKERS must be at least 1".to_string(),
            ));
        }

        let cache_sync_timeout = match parse::<u64>(&lookup, "RECONCILE_SYNC_TIMEOUT_SECS")? {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.cache_sync_timeout,
        };

        let backoff_base = parse(&lookup, "RECONCILE_BACKOFF_BASE_MS")?
            .map_or(defaults.backoff_base, Duration::from_millis);
        let backoff_max = parse(&lookup, "RECONCILE_BACKOFF_MAX_SECS")?
            .map_or(defaults.backoff_max, Duration::from_secs);
        if backoff_max < backoff_base {
            return Err(Error::Config(format!(
                "backoff max {backoff_max:?} is below backoff base {backoff_base:?}"
            )));
        }

        let qps: f64 = parse(&lookup, "RECONCILE_QPS")?.unwrap_or(defaults.qps);
        if !qps.is_finite() || qps <= 0.0 {
            return Err(Error::Config(format!(
                "RECONCILE_QPS must be positive, got {qps}"
            )));
        }

        Ok(Self {
            controller: ControllerConfig {
                workers,
                cache_sync_timeout,
                sync_poll_interval: defaults.sync_poll_interval,
                backoff_base,
                backoff_max,
                qps,
                burst: parse(&lookup, "RECONCILE_BURST")?.unwrap_or(defaults.burst),
                max_retries: parse(&lookup, "RECONCILE_MAX_RETRIES")?,
            },
            manifest: lookup("RECONCILE_MANIFEST").map(PathBuf::from),
            otel_endpoint: lookup("OTEL_ENDPOINT"),
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        })
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(name)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| Error::Config(format!("{name}={raw:?} is invalid: {e}")))
        })
        .transpose()
}
