//! Retry Manager
//!
//! Bounded exponential-backoff retries for transient errors. Delays come from
//! the `backoff` crate with jitter disabled so schedules are reproducible.
//! Sleeps race the cancellation token.

use crate::error::{Error, Result};
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryConfig {
    pub initial_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Total attempts including the first
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 200,
            multiplier: 2.0,
            max_delay_ms: 10_000,
            max_attempts: 5,
        }
    }
}

impl RetryConfig {
    fn sanitized(&self) -> RetryConfig {
        let defaults = RetryConfig::default();
        RetryConfig {
            initial_delay_ms: if self.initial_delay_ms == 0 {
                defaults.initial_delay_ms
            } else {
                self.initial_delay_ms
            },
            multiplier: if self.multiplier < 1.0 {
                defaults.multiplier
            } else {
                self.multiplier
            },
            max_delay_ms: self.max_delay_ms.max(self.initial_delay_ms),
            max_attempts: self.max_attempts.max(1),
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.initial_delay_ms))
            .with_multiplier(self.multiplier)
            .with_max_interval(Duration::from_millis(self.max_delay_ms))
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build()
    }

    /// Delay schedule between attempts
    pub fn delays(&self) -> Vec<Duration> {
        let config = self.sanitized();
        let mut backoff = config.backoff();
        let max = Duration::from_millis(config.max_delay_ms);
        (1..config.max_attempts)
            .map(|_| backoff.next_backoff().unwrap_or(max))
            .collect()
    }
}

/// Retries transient failures with exponential backoff
#[derive(Debug, Default)]
pub struct RetryManager {
    config: Option<RetryConfig>,
    retries: AtomicU64,
    exhausted: AtomicU64,
}

impl RetryManager {
    pub fn new(config: Option<RetryConfig>) -> Self {
        Self {
            config,
            retries: AtomicU64::new(0),
            exhausted: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> RetryConfig {
        self.config.clone().unwrap_or_default().sanitized()
    }

    /// Run `op` until it succeeds, fails permanently, runs out of attempts
    /// or `cancel` fires. On exhaustion the last error is returned.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, operation: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let config = self.config();
        let mut backoff = config.backoff();
        let max_delay = Duration::from_millis(config.max_delay_ms);
        let mut attempt = 1;

        loop {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => e,
            };

            if attempt >= config.max_attempts {
                self.exhausted.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "{} failed after {} attempts: {}",
                    operation, attempt, err
                );
                return Err(err);
            }

            let delay = backoff.next_backoff().unwrap_or(max_delay);
            debug!(
                "{} attempt {} failed ({}), retrying in {:?}",
                operation, attempt, err, delay
            );
            self.retries.fetch_add(1, Ordering::Relaxed);

            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn exhausted(&self) -> u64 {
        self.exhausted.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Backend;
    use assert_matches::assert_matches;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    fn transient() -> Error {
        Error::BackendTransient {
            backend: Backend::Trident,
            operation: "apply".into(),
            reason: "timeout".into(),
        }
    }

    #[test]
    fn test_delay_schedule() {
        let config = RetryConfig {
            initial_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 500,
            max_attempts: 6,
        };
        let delays: Vec<u64> = config.delays().iter().map(|d| d.as_millis() as u64).collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_then_succeeds() {
        let manager = RetryManager::new(None);
        let calls = AtomicU32::new(0);

        let result = manager
            .run(&CancellationToken::new(), "apply", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(transient())
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(manager.retries(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_last_error_when_exhausted() {
        let manager = RetryManager::new(Some(RetryConfig {
            max_attempts: 3,
            ..Default::default()
        }));
        let calls = AtomicU32::new(0);

        let result: Result<()> = manager
            .run(&CancellationToken::new(), "apply", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::BackendTransient {
                    backend: Backend::Ceph,
                    operation: "apply".into(),
                    reason: format!("attempt {}", n + 1),
                })
            })
            .await;

        assert_matches!(result, Err(Error::BackendTransient { ref reason, .. }) if reason == "attempt 3");
        assert_eq!(manager.exhausted(), 1);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let manager = RetryManager::new(None);
        let calls = AtomicU32::new(0);

        let result: Result<()> = manager
            .run(&CancellationToken::new(), "apply", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::InvalidSpec("bad".into()))
            })
            .await;

        assert_matches!(result, Err(Error::InvalidSpec(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_sleep() {
        let manager = Arc::new(RetryManager::new(Some(RetryConfig {
            initial_delay_ms: 60_000,
            max_delay_ms: 60_000,
            ..Default::default()
        })));
        let cancel = CancellationToken::new();

        let task = {
            let manager = manager.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                manager
                    .run(&cancel, "apply", || async { Err::<(), _>(transient()) })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        let started = tokio::time::Instant::now();
        assert_matches!(task.await.unwrap(), Err(Error::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[test]
    fn test_zero_attempts_defaults_to_one() {
        let manager = RetryManager::new(Some(RetryConfig {
            max_attempts: 0,
            ..Default::default()
        }));
        assert_eq!(manager.config().max_attempts, 1);
        assert!(manager.config().delays().is_empty());
    }
}
