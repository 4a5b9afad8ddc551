//! Unified Control Plane Module
//!
//! The "brain" of the replication operator: discovers installed backends,
//! routes each intent to one of them, and drives it through the matching
//! adapter behind retry and circuit breaking.

pub mod adapters;
pub mod api;
pub mod discovery;
pub mod metrics;
pub mod orchestrator;
pub mod resilience;

pub use adapters::{AdapterRegistry, BackendParameters, BackendStatus};
pub use api::*;
pub use discovery::{DiscoveryConfig, DiscoveryEngine, DiscoverySnapshot};
pub use metrics::MetricsSnapshot;
pub use orchestrator::*;
pub use resilience::{CircuitBreaker, CircuitBreakerConfig, Resilience, RetryConfig, RetryManager};
