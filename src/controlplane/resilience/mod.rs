//! Resilience Layer
//!
//! Retry for transient errors, circuit breaking for sustained outages.
//! [`Resilience::execute`] nests the breaker inside the retry loop, so each
//! attempt passes through the circuit and an open circuit ends the loop
//! at once.

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::*;
pub use retry::*;

use crate::domain::Backend;
use crate::error::Result;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Retry manager and circuit breaker used together
#[derive(Clone)]
pub struct Resilience {
    pub retry: Arc<RetryManager>,
    pub breaker: Arc<CircuitBreaker>,
}

impl Resilience {
    pub fn new(retry: Arc<RetryManager>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { retry, breaker }
    }

    /// Retry `op`, sending every attempt through `backend`'s circuit
    pub async fn execute<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        backend: Backend,
        operation: &str,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let breaker = &self.breaker;
        let op = &mut op;
        self.retry
            .run(cancel, operation, move || breaker.call(backend, op()))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_stops_retry_loop() {
        let resilience = Resilience::new(
            Arc::new(RetryManager::new(Some(RetryConfig {
                max_attempts: 10,
                ..Default::default()
            }))),
            Arc::new(CircuitBreaker::new(Some(CircuitBreakerConfig {
                failure_threshold: 2,
                cool_down_secs: 600,
            }))),
        );
        let calls = AtomicU32::new(0);

        let result: Result<()> = resilience
            .execute(&CancellationToken::new(), Backend::Trident, "apply", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::BackendUnavailable {
                    backend: Backend::Trident,
                })
            })
            .await;

        assert_matches!(result, Err(Error::CircuitOpen { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
