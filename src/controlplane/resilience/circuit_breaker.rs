//! Circuit Breaker
//!
//! Per-backend failure isolation. After `failure_threshold` consecutive
//! failures the circuit opens and calls fail fast with `CircuitOpen`. Once
//! the cool-down has elapsed a single trial call is let through: success
//! closes the circuit, failure re-opens it.

use crate::domain::Backend;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Time the circuit stays open before a trial call
    pub cool_down_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cool_down_secs: 30,
        }
    }
}

// =============================================================================
// State
// =============================================================================

/// Circuit state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Default)]
struct Circuit {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    rejected: u64,
    times_opened: u64,
}

/// Point-in-time view of one backend's circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub rejected: u64,
    pub times_opened: u64,
}

// =============================================================================
// Circuit Breaker
// =============================================================================

/// Per-backend circuit breaker
#[derive(Debug, Default)]
pub struct CircuitBreaker {
    config: Option<CircuitBreakerConfig>,
    circuits: Mutex<HashMap<Backend, Circuit>>,
}

/// Admission to call a backend; a dropped trial permit frees the half-open slot
#[derive(Debug)]
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    backend: Backend,
    trial: bool,
    settled: bool,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            if let Some(circuit) = self.breaker.circuits.lock().get_mut(&self.backend) {
                circuit.trial_in_flight = false;
            }
        }
    }
}

impl CircuitBreaker {
    pub fn new(config: Option<CircuitBreakerConfig>) -> Self {
        Self {
            config,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    fn threshold(&self) -> u32 {
        self.config
            .as_ref()
            .map(|c| c.failure_threshold)
            .filter(|t| *t > 0)
            .unwrap_or(CircuitBreakerConfig::default().failure_threshold)
    }

    fn cool_down(&self) -> Duration {
        let secs = self
            .config
            .as_ref()
            .map(|c| c.cool_down_secs)
            .unwrap_or(CircuitBreakerConfig::default().cool_down_secs);
        Duration::from_secs(secs)
    }

    fn acquire(&self, backend: Backend) -> Result<Permit<'_>> {
        let cool_down = self.cool_down();
        let mut circuits = self.circuits.lock();
        let circuit = circuits.entry(backend).or_default();

        let trial = match circuit.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let cooled = circuit
                    .opened_at
                    .map(|at| at.elapsed() >= cool_down)
                    .unwrap_or(true);
                if !cooled {
                    circuit.rejected += 1;
                    return Err(Error::CircuitOpen { backend });
                }
                info!("Circuit for {} half-open, allowing trial call", backend);
                circuit.state = CircuitState::HalfOpen;
                circuit.trial_in_flight = true;
                true
            }
            CircuitState::HalfOpen => {
                if circuit.trial_in_flight {
                    circuit.rejected += 1;
                    return Err(Error::CircuitOpen { backend });
                }
                circuit.trial_in_flight = true;
                true
            }
        };

        Ok(Permit {
            breaker: self,
            backend,
            trial,
            settled: false,
        })
    }

    fn record(&self, permit: &mut Permit<'_>, outcome: Outcome) {
        let threshold = self.threshold();
        let mut circuits = self.circuits.lock();
        let circuit = circuits.entry(permit.backend).or_default();
        permit.settled = true;
        if permit.trial {
            circuit.trial_in_flight = false;
        }

        match outcome {
            Outcome::Success => {
                if circuit.state != CircuitState::Closed {
                    info!("Circuit for {} closed", permit.backend);
                }
                circuit.state = CircuitState::Closed;
                circuit.consecutive_failures = 0;
                circuit.opened_at = None;
            }
            Outcome::Failure => {
                circuit.consecutive_failures += 1;
                let reopen = circuit.state == CircuitState::HalfOpen;
                if reopen || circuit.consecutive_failures >= threshold {
                    warn!(
                        "Circuit for {} opened after {} consecutive failures",
                        permit.backend, circuit.consecutive_failures
                    );
                    circuit.state = CircuitState::Open;
                    circuit.opened_at = Some(Instant::now());
                    circuit.times_opened += 1;
                }
            }
            // Caller-side errors say nothing about backend health
            Outcome::Neutral => {}
        }
    }

    /// Run `call` through the circuit for `backend`. The future is dropped
    /// unpolled when the circuit rejects it.
    pub async fn call<T, Fut>(&self, backend: Backend, call: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let mut permit = self.acquire(backend)?;
        let result = call.await;
        let outcome = match &result {
            Ok(_) => Outcome::Success,
            Err(e) if e.trips_circuit() => Outcome::Failure,
            Err(_) => Outcome::Neutral,
        };
        self.record(&mut permit, outcome);
        result
    }

    pub fn state(&self, backend: Backend) -> CircuitState {
        self.circuits
            .lock()
            .get(&backend)
            .map(|c| c.state)
            .unwrap_or_default()
    }

    pub fn snapshot(&self) -> BTreeMap<Backend, CircuitSnapshot> {
        self.circuits
            .lock()
            .iter()
            .map(|(backend, c)| {
                (
                    *backend,
                    CircuitSnapshot {
                        state: c.state,
                        consecutive_failures: c.consecutive_failures,
                        rejected: c.rejected,
                        times_opened: c.times_opened,
                    },
                )
            })
            .collect()
    }

    /// Total calls rejected while open
    pub fn rejected(&self) -> u64 {
        self.circuits.lock().values().map(|c| c.rejected).sum()
    }
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Success,
    Failure,
    Neutral,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn breaker(threshold: u32, cool_down_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(Some(CircuitBreakerConfig {
            failure_threshold: threshold,
            cool_down_secs,
        }))
    }

    fn outage(backend: Backend) -> Error {
        Error::BackendUnavailable { backend }
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_threshold_and_fails_fast() {
        let cb = breaker(3, 30);
        let invoked = AtomicU32::new(0);

        for _ in 0..3 {
            let r: Result<()> = cb
                .call(Backend::Trident, async {
                    invoked.fetch_add(1, Ordering::SeqCst);
                    Err(outage(Backend::Trident))
                })
                .await;
            assert!(r.is_err());
        }
        assert_eq!(cb.state(Backend::Trident), CircuitState::Open);

        let r: Result<()> = cb
            .call(Backend::Trident, async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert_matches!(r, Err(Error::CircuitOpen { backend: Backend::Trident }));
        assert_eq!(invoked.load(Ordering::SeqCst), 3, "open circuit must not invoke the call");
        assert_eq!(cb.rejected(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_single_trial() {
        let cb = breaker(1, 10);
        let _ = cb
            .call(Backend::Ceph, async { Err::<(), _>(outage(Backend::Ceph)) })
            .await;
        assert_eq!(cb.state(Backend::Ceph), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(11)).await;

        // Trial call in flight blocks a second caller
        let permit = cb.acquire(Backend::Ceph).unwrap();
        assert_eq!(cb.state(Backend::Ceph), CircuitState::HalfOpen);
        assert_matches!(cb.acquire(Backend::Ceph), Err(Error::CircuitOpen { .. }));
        drop(permit);

        let r = cb.call(Backend::Ceph, async { Ok(1) }).await;
        assert_eq!(r.unwrap(), 1);
        assert_eq!(cb.state(Backend::Ceph), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens() {
        let cb = breaker(2, 5);
        for _ in 0..2 {
            let _ = cb
                .call(Backend::PowerStore, async {
                    Err::<(), _>(outage(Backend::PowerStore))
                })
                .await;
        }
        tokio::time::advance(Duration::from_secs(6)).await;

        let _ = cb
            .call(Backend::PowerStore, async {
                Err::<(), _>(outage(Backend::PowerStore))
            })
            .await;
        assert_eq!(cb.state(Backend::PowerStore), CircuitState::Open);
        assert_eq!(cb.snapshot()[&Backend::PowerStore].times_opened, 2);
    }

    #[tokio::test]
    async fn test_backends_are_isolated() {
        let cb = breaker(1, 60);
        let _ = cb
            .call(Backend::Trident, async { Err::<(), _>(outage(Backend::Trident)) })
            .await;

        assert_eq!(cb.state(Backend::Trident), CircuitState::Open);
        assert!(cb.call(Backend::Ceph, async { Ok(()) }).await.is_ok());
    }

    #[tokio::test]
    async fn test_config_errors_do_not_trip() {
        let cb = breaker(1, 60);
        let _ = cb
            .call(Backend::Ceph, async {
                Err::<(), _>(Error::InvalidSpec("bad".into()))
            })
            .await;
        assert_eq!(cb.state(Backend::Ceph), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_count() {
        let cb = breaker(2, 60);
        let _ = cb
            .call(Backend::Ceph, async { Err::<(), _>(outage(Backend::Ceph)) })
            .await;
        let _ = cb.call(Backend::Ceph, async { Ok(()) }).await;
        let _ = cb
            .call(Backend::Ceph, async { Err::<(), _>(outage(Backend::Ceph)) })
            .await;
        assert_eq!(cb.state(Backend::Ceph), CircuitState::Closed);
    }
}
