//! Backoff for establishing transports

use crate::config::RetrySettings;
use crate::imap::ImapResult;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included
    pub max_attempts: usize,
    /// Base delay for exponential backoff
    pub base_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Whether to add jitter to retry delays
    pub jitter_enabled: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            backoff_multiplier: settings.backoff_multiplier,
            jitter_enabled: settings.jitter,
        }
    }
}

impl RetryConfig {
    /// Single attempt, no waiting
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            jitter_enabled: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryManager {
    config: RetryConfig,
}

impl RetryManager {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `operation` until it succeeds, fails with a non-recoverable error or attempts run out
    pub async fn execute_with_retry<F, Fut, T>(&self, operation: F) -> ImapResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = ImapResult<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!("Connecting (attempt {}/{})", attempt, max_attempts);

            match operation().await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!("Connected on attempt {}", attempt);
                    }
                    return Ok(result);
                }
                Err(error) => {
                    if !error.is_recoverable() {
                        warn!("Connection failed with non-recoverable error: {}", error);
                        return Err(error);
                    }
                    if attempt >= max_attempts {
                        warn!(
                            "Connection failed after {} attempts, last error: {}",
                            max_attempts, error
                        );
                        return Err(error);
                    }

                    let delay = self.calculate_delay(attempt);
                    warn!(
                        "Connection failed (attempt {}), retrying in {:?}: {}",
                        attempt, delay, error
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    /// Delay before the attempt following `attempt`
    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let delay_ms = (self.config.base_delay.as_millis() as f64
            * self.config.backoff_multiplier.powi(exponent)) as u64;

        let mut delay = std::cmp::min(Duration::from_millis(delay_ms), self.config.max_delay);

        if self.config.jitter_enabled {
            delay = self.add_jitter(delay);
        }

        delay
    }

    /// Add up to 10% random jitter in either direction
    fn add_jitter(&self, delay: Duration) -> Duration {
        use rand::Rng;

        let jitter_range = delay.as_millis() as f64 * 0.1;
        if jitter_range <= 0.0 {
            return delay;
        }
        let mut rng = rand::thread_rng();
        let jitter = rng.gen_range(-jitter_range..=jitter_range);

        let adjusted_ms = (delay.as_millis() as f64 + jitter).max(0.0) as u64;
        Duration::from_millis(adjusted_ms)
    }
}

impl Default for RetryManager {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imap::ImapError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast(max_attempts: usize) -> RetryManager {
        RetryManager::new(RetryConfig {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter_enabled: false,
        })
    }

    #[tokio::test]
    async fn test_retries_recoverable_errors() {
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let result = fast(3)
            .execute_with_retry(|| async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ImapError::connection("refused"))
                } else {
                    Ok(7)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_stops_on_non_recoverable_error() {
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let result: ImapResult<()> = fast(5)
            .execute_with_retry(|| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ImapError::tls("bad certificate"))
            })
            .await;
        assert!(matches!(result, Err(ImapError::Tls(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let result: ImapResult<()> = fast(2)
            .execute_with_retry(|| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ImapError::Timeout)
            })
            .await;
        assert!(matches!(result, Err(ImapError::Timeout)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_delay_is_capped() {
        let manager = fast(10);
        assert_eq!(manager.calculate_delay(1), Duration::from_millis(1));
        assert_eq!(manager.calculate_delay(2), Duration::from_millis(2));
        assert_eq!(manager.calculate_delay(9), Duration::from_millis(5));
        assert_eq!(RetryManager::new(RetryConfig::no_retry()).calculate_delay(3), Duration::ZERO);
    }
}
