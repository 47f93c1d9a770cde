//! Retry with exponential backoff for object-store calls
//!
//! Every LIST/GET issued by the fetcher goes through `retry_with_backoff`:
//! - each attempt is bounded by `attempt_timeout`
//! - delays grow by `backoff_multiplier`, capped at `max_delay_ms`
//! - `jitter_factor` spreads concurrent retries apart
//! - once `max_retries` is exhausted the last error is returned as `RetryResult::Failed`

use std::future::Future;
use std::time::Duration;

use anyhow::anyhow;
use rand::{rng, Rng};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::constants::{
    DEFAULT_INITIAL_RETRY_DELAY_MS, DEFAULT_MAX_RETRIES, DEFAULT_MAX_RETRY_DELAY_MS,
    DEFAULT_OP_TIMEOUT, DEFAULT_RETRY_BACKOFF_MULTIPLIER, DEFAULT_RETRY_JITTER_FACTOR,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
    /// Upper bound for a single attempt (e.g. "120s", "2m"); `None` waits forever
    #[serde(with = "humantime_serde")]
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_delay_ms: DEFAULT_INITIAL_RETRY_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_RETRY_DELAY_MS,
            backoff_multiplier: DEFAULT_RETRY_BACKOFF_MULTIPLIER,
            jitter_factor: DEFAULT_RETRY_JITTER_FACTOR,
            attempt_timeout: Some(DEFAULT_OP_TIMEOUT),
        }
    }
}

impl RetryConfig {
    /// No retries, no waiting (tests and one-shot calls)
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff_multiplier: 1.0,
            jitter_factor: 0.0,
            attempt_timeout: None,
        }
    }

    /// Delay before retry number `attempt` (0-based), jitter applied
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay_ms as f64);
        let jitter = if self.jitter_factor > 0.0 {
            let j = self.jitter_factor.min(1.0);
            rng().random_range(-j..=j)
        } else {
            0.0
        };
        Duration::from_millis((capped * (1.0 + jitter)).max(0.0) as u64)
    }
}

/// Outcome of a retried operation
#[derive(Debug)]
pub enum RetryResult<T> {
    Success(T),
    Failed(anyhow::Error),
}

impl<T> RetryResult<T> {
    pub fn into_result(self) -> anyhow::Result<T> {
        match self {
            RetryResult::Success(v) => Ok(v),
            RetryResult::Failed(e) => Err(e),
        }
    }
}

/// Run `op` until it succeeds or retries are exhausted.
///
/// `label` only shows up in logs.
pub async fn retry_with_backoff<T, F, Fut>(label: &str, config: &RetryConfig, mut op: F) -> RetryResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        let outcome = match config.attempt_timeout {
            Some(limit) => match tokio::time::timeout(limit, op()).await {
                Ok(r) => r,
                Err(_) => Err(anyhow!("timed out after {:?}", limit)),
            },
            None => op().await,
        };

        match outcome {
            Ok(v) => {
                if attempt > 0 {
                    debug!("{} succeeded after {} retries", label, attempt);
                }
                return RetryResult::Success(v);
            }
            Err(e) if attempt < config.max_retries => {
                let delay = config.backoff_delay(attempt);
                warn!(
                    "{} failed (attempt {}/{}): {:#}; retrying in {:?}",
                    label,
                    attempt + 1,
                    config.max_retries + 1,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                return RetryResult::Failed(e.context(format!(
                    "{} failed after {} attempt(s)",
                    label,
                    attempt + 1
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
            attempt_timeout: None,
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        let cfg = RetryConfig {
            jitter_factor: 0.0,
            ..RetryConfig::default()
        };
        assert_eq!(cfg.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(cfg.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(cfg.backoff_delay(2), Duration::from_millis(400));
        assert_eq!(cfg.backoff_delay(20), Duration::from_millis(5000));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff("flaky", &fast_config(3), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(anyhow!("transient"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.into_result().unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let calls = AtomicU32::new(0);
        let result: RetryResult<()> = retry_with_backoff("broken", &fast_config(2), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(anyhow!("permanent")) }
        })
        .await;

        assert!(matches!(result, RetryResult::Failed(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempt_timeout() {
        let cfg = RetryConfig {
            attempt_timeout: Some(Duration::from_millis(10)),
            ..fast_config(0)
        };
        let result: RetryResult<()> = retry_with_backoff("slow", &cfg, || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        let err = result.into_result().unwrap_err();
        assert!(format!("{:#}", err).contains("timed out"));
    }
}
