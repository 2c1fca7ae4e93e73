//! Configuration for a database connection.

use crate::transaction::{ContentHasher, TransactionHasher};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Identifies one backend database.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoInfo {
    /// Host name, with port if any.
    pub host: String,
    /// Database namespace on that host.
    pub namespace: String,
    /// Whether the connection uses TLS.
    pub secure: bool,
}

impl RepoInfo {
    /// Creates a secure repo info.
    pub fn new(host: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            namespace: namespace.into(),
            secure: true,
        }
    }

    /// Sets whether the connection uses TLS.
    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }
}

impl fmt::Display for RepoInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.secure { "https" } else { "http" };
        write!(f, "{scheme}://{}/{}", self.host, self.namespace)
    }
}

impl Default for RepoInfo {
    fn default() -> Self {
        Self::new("localhost", "default")
    }
}

/// Configuration for one database connection.
#[derive(Clone)]
pub struct DatabaseConfig {
    /// Which backend database to talk to.
    pub repo_info: RepoInfo,
    /// Transaction behavior.
    pub transactions: TransactionConfig,
    /// Name of the run loop thread. Derived from the repo info if unset.
    pub run_loop_name: Option<String>,
    /// Produces the compare-and-put token for transactions.
    pub hasher: Arc<dyn TransactionHasher>,
}

impl DatabaseConfig {
    /// Creates a configuration for the given database.
    pub fn new(repo_info: RepoInfo) -> Self {
        Self {
            repo_info,
            transactions: TransactionConfig::default(),
            run_loop_name: None,
            hasher: Arc::new(ContentHasher),
        }
    }

    /// Sets the transaction configuration.
    pub fn with_transactions(mut self, transactions: TransactionConfig) -> Self {
        self.transactions = transactions;
        self
    }

    /// Sets the run loop thread name.
    pub fn with_run_loop_name(mut self, name: impl Into<String>) -> Self {
        self.run_loop_name = Some(name.into());
        self
    }

    /// Sets the transaction hasher.
    pub fn with_hasher(mut self, hasher: Arc<dyn TransactionHasher>) -> Self {
        self.hasher = hasher;
        self
    }

    /// The run loop thread name in effect.
    pub fn effective_run_loop_name(&self) -> String {
        self.run_loop_name
            .clone()
            .unwrap_or_else(|| format!("rtdb-{}-{}", self.repo_info.host, self.repo_info.namespace))
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self::new(RepoInfo::default())
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("repo_info", &self.repo_info)
            .field("transactions", &self.transactions)
            .field("run_loop_name", &self.run_loop_name)
            .finish_non_exhaustive()
    }
}

/// Configuration for optimistic transactions.
#[derive(Debug, Clone)]
pub struct TransactionConfig {
    /// Number of sends after which a transaction gives up.
    pub max_retries: u32,
    /// Delay between reruns after a stale hash.
    pub retry: RetryConfig,
}

impl TransactionConfig {
    /// Sets the retry ceiling.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the retry delay configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            max_retries: 25,
            retry: RetryConfig::immediate(),
        }
    }
}

/// Configuration for retry delays.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Exponential backoff starting at 100ms, capped at 30s, with jitter.
    pub fn exponential() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Retries run as soon as they are scheduled.
    pub fn immediate() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Calculates the delay for a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter && delay_secs > 0.0 {
            // Up to 25% jitter
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen_range(0.0..1.0);
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::immediate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_config_builder() {
        let config = DatabaseConfig::new(RepoInfo::new("db.example.com", "app"))
            .with_run_loop_name("loop")
            .with_transactions(TransactionConfig::default().with_max_retries(3));

        assert_eq!(config.repo_info.host, "db.example.com");
        assert_eq!(config.transactions.max_retries, 3);
        assert_eq!(config.effective_run_loop_name(), "loop");
    }

    #[test]
    fn default_run_loop_name_uses_repo_info() {
        let config = DatabaseConfig::new(RepoInfo::new("h", "ns"));
        assert_eq!(config.effective_run_loop_name(), "rtdb-h-ns");
        assert_eq!(config.repo_info.to_string(), "https://h/ns");
    }

    #[test]
    fn transactions_default_to_25_immediate_retries() {
        let config = TransactionConfig::default();
        assert_eq!(config.max_retries, 25);
        assert_eq!(config.retry.delay_for_attempt(7), Duration::ZERO);
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::exponential()
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);

        let delay1 = config.delay_for_attempt(1);
        assert!(delay1 >= Duration::from_millis(100));
        assert!(delay1 <= Duration::from_millis(125));

        let delay2 = config.delay_for_attempt(2);
        assert!(delay2 >= Duration::from_millis(200));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::exponential()
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0)
            .with_jitter(false);

        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(5));
    }
}
