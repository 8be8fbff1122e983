use crate::core::{LedgerError, Result};
use crate::storage::{DatasetSpec, default_datasets};
use std::time::Duration;

/// Retry behaviour for transient feed failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Initial backoff duration in milliseconds.
    pub initial_backoff_ms: u64,
    /// Maximum backoff duration in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 4_000,
        }
    }
}

impl RetryPolicy {
    /// No retries; every failure surfaces immediately.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Exponential backoff before retry number `attempt` (1-based).
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let base = self.initial_backoff_ms.max(1);
        let max = self.max_backoff_ms.max(base);
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        base.saturating_mul(factor).min(max)
    }
}

/// Ledger service configuration
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Feed location: the chat channel snapshots are posted to
    pub feed_channel_id: String,

    /// Period of the background save backstop
    pub save_period: Duration,

    /// Minimum time between the starts of two saves
    pub min_save_interval: Duration,

    /// Maximum payloads attached to one feed post
    pub max_payloads_per_publish: usize,

    /// How many recent feed posts are scanned for snapshots
    pub history_scan_limit: usize,

    /// Timeout of a single feed request
    pub request_timeout: Duration,

    /// Retry policy for transient feed failures
    pub retry: RetryPolicy,

    /// Datasets this process owns
    pub datasets: Vec<DatasetSpec>,

    /// Ids allowed to run administrative commands
    pub operators: Vec<String>,
}

impl LedgerConfig {
    /// Create a configuration with default tunables
    pub fn new(feed_channel_id: &str) -> Self {
        Self {
            feed_channel_id: feed_channel_id.to_string(),
            save_period: Duration::from_secs(60),
            min_save_interval: Duration::from_secs(10),
            max_payloads_per_publish: 10,
            history_scan_limit: 100,
            request_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            datasets: default_datasets(),
            operators: Vec::new(),
        }
    }

    /// Set the background save period
    pub fn save_period(mut self, period: Duration) -> Self {
        self.save_period = period;
        self
    }

    /// Set the minimum interval between saves
    pub fn min_save_interval(mut self, interval: Duration) -> Self {
        self.min_save_interval = interval;
        self
    }

    /// Set the payload limit per publish
    pub fn max_payloads_per_publish(mut self, max: usize) -> Self {
        self.max_payloads_per_publish = max;
        self
    }

    /// Set how many feed posts are scanned
    pub fn history_scan_limit(mut self, limit: usize) -> Self {
        self.history_scan_limit = limit;
        self
    }

    /// Set the per-request timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the retry policy
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Replace the dataset list
    pub fn datasets(mut self, datasets: Vec<DatasetSpec>) -> Self {
        self.datasets = datasets;
        self
    }

    /// Add an operator id
    pub fn operator(mut self, id: &str) -> Self {
        self.operators.push(id.to_string());
        self
    }

    /// Build from `LEDGER_*` environment variables.
    ///
    /// `LEDGER_FEED_CHANNEL` is required; everything else falls back to the
    /// defaults of [`LedgerConfig::new`].
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let channel = lookup("LEDGER_FEED_CHANNEL")
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| LedgerError::Config("LEDGER_FEED_CHANNEL must be set".to_string()))?;

        let mut config = Self::new(channel.trim());
        if let Some(secs) = parse_var::<u64>(&lookup, "LEDGER_SAVE_PERIOD_SECS")? {
            config.save_period = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "LEDGER_MIN_SAVE_INTERVAL_SECS")? {
            config.min_save_interval = Duration::from_secs(secs);
        }
        if let Some(max) = parse_var::<usize>(&lookup, "LEDGER_MAX_PAYLOADS")? {
            config.max_payloads_per_publish = max;
        }
        if let Some(limit) = parse_var::<usize>(&lookup, "LEDGER_HISTORY_LIMIT")? {
            config.history_scan_limit = limit;
        }
        if let Some(operators) = lookup("LEDGER_OPERATORS") {
            config.operators = operators
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .collect();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.feed_channel_id.trim().is_empty() {
            return Err(LedgerError::Config("feed channel id must not be empty".to_string()));
        }
        if self.save_period.is_zero() {
            return Err(LedgerError::Config("save period must be positive".to_string()));
        }
        if self.max_payloads_per_publish == 0 {
            return Err(LedgerError::Config(
                "max payloads per publish must be at least 1".to_string(),
            ));
        }
        if self.history_scan_limit == 0 {
            return Err(LedgerError::Config("history scan limit must be at least 1".to_string()));
        }
        if self.datasets.is_empty() {
            return Err(LedgerError::Config("at least one dataset is required".to_string()));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| LedgerError::Config(format!("{} has invalid value '{}'", key, raw))),
    }
}
