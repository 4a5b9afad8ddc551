//! Discovery Engine
//!
//! Determines which replication backends are installed in the environment by
//! checking their CRDs through the [`ResourceStore`](crate::domain::ResourceStore)
//! port. Results are cached per environment fingerprint with a TTL that is
//! checked lazily on access; a miss triggers exactly one discovery run per
//! fingerprint even under concurrent callers.

pub mod capabilities;

pub use capabilities::*;

use crate::domain::{Backend, ResourceStoreRef};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default cache TTL
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);

// =============================================================================
// Configuration
// =============================================================================

/// Discovery configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DiscoveryConfig {
    /// How long a discovery snapshot stays valid
    #[serde(with = "humantime_secs")]
    pub cache_ttl: Duration,
    /// Attach capability matrices to available backends
    pub detect_capabilities: bool,
    /// Backends to probe; empty means all of them
    pub backends: Vec<Backend>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            cache_ttl: DEFAULT_CACHE_TTL,
            detect_capabilities: true,
            backends: Backend::PREFERENCE_ORDER.to_vec(),
        }
    }
}

impl DiscoveryConfig {
    fn effective_ttl(&self) -> Duration {
        if self.cache_ttl.is_zero() {
            DEFAULT_CACHE_TTL
        } else {
            self.cache_ttl
        }
    }

    /// Configured backends in preference order
    fn effective_backends(&self) -> Vec<Backend> {
        if self.backends.is_empty() {
            return Backend::PREFERENCE_ORDER.to_vec();
        }
        Backend::PREFERENCE_ORDER
            .into_iter()
            .filter(|b| self.backends.contains(b))
            .collect()
    }
}

/// TTL as whole seconds in config files
mod humantime_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

// =============================================================================
// Discovery Results
// =============================================================================

/// Whether a backend is installed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    Available,
    Unavailable,
    /// The probe itself failed
    Unknown,
}

/// Backend health as seen through its CRDs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Primary CRD present but a companion CRD is missing
    Degraded,
    Unknown,
}

/// Per-backend discovery outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryResult {
    pub backend: Backend,
    pub availability: Availability,
    pub health: HealthStatus,
    pub last_checked: DateTime<Utc>,
    pub capabilities: Option<BackendCapabilities>,
    pub error: Option<String>,
}

impl DiscoveryResult {
    pub fn is_available(&self) -> bool {
        self.availability == Availability::Available
    }
}

/// Discovery results for every probed backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoverySnapshot {
    pub results: BTreeMap<Backend, DiscoveryResult>,
    /// Soft errors from probes that could not complete
    pub errors: Vec<String>,
}

impl DiscoverySnapshot {
    pub fn get(&self, backend: Backend) -> Option<&DiscoveryResult> {
        self.results.get(&backend)
    }

    pub fn availability(&self, backend: Backend) -> Availability {
        self.get(backend)
            .map(|r| r.availability)
            .unwrap_or(Availability::Unavailable)
    }

    pub fn is_available(&self, backend: Backend) -> bool {
        self.availability(backend) == Availability::Available
    }

    /// Available backends in preference order
    pub fn available(&self) -> Vec<Backend> {
        Backend::PREFERENCE_ORDER
            .into_iter()
            .filter(|b| self.is_available(*b))
            .collect()
    }

    pub fn capabilities(&self, backend: Backend) -> Option<&BackendCapabilities> {
        self.get(backend).and_then(|r| r.capabilities.as_ref())
    }
}

struct CacheEntry {
    snapshot: Arc<DiscoverySnapshot>,
    stored_at: Instant,
}

/// Discovery counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub crd_queries: u64,
}

// =============================================================================
// Discovery Engine
// =============================================================================

/// Cached backend discovery
pub struct DiscoveryEngine {
    store: ResourceStoreRef,
    config: Option<DiscoveryConfig>,
    cache: RwLock<HashMap<String, CacheEntry>>,
    /// Single-flight guard per fingerprint
    inflight: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    /// Bumped by every invalidation; a run started under an older epoch
    /// is not cached
    epoch: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    crd_queries: AtomicU64,
}

impl DiscoveryEngine {
    /// Create an engine; a missing configuration means defaults
    pub fn new(store: ResourceStoreRef, config: Option<DiscoveryConfig>) -> Self {
        Self {
            store,
            config: Some(config.unwrap_or_default()),
            cache: RwLock::new(HashMap::new()),
            inflight: DashMap::new(),
            epoch: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            crd_queries: AtomicU64::new(0),
        }
    }

    /// Configuration in effect, defaulted if absent
    pub fn config(&self) -> DiscoveryConfig {
        self.config.clone().unwrap_or_default()
    }

    fn fingerprint(&self, backends: &[Backend]) -> String {
        let names: Vec<&str> = backends.iter().map(Backend::as_str).collect();
        format!("{}|{}", self.store.environment_id(), names.join(","))
    }

    fn cached(&self, key: &str, ttl: Duration) -> Option<Arc<DiscoverySnapshot>> {
        let cache = self.cache.read();
        cache
            .get(key)
            .filter(|entry| entry.stored_at.elapsed() < ttl)
            .map(|entry| entry.snapshot.clone())
    }

    /// Discover every configured backend. Probe failures do not abort the
    /// run; they are recorded as `Unknown` availability plus a soft error.
    pub async fn discover_backends(&self) -> Arc<DiscoverySnapshot> {
        let config = self.config();
        let ttl = config.effective_ttl();
        let backends = config.effective_backends();
        let key = self.fingerprint(&backends);

        if let Some(snapshot) = self.cached(&key, ttl) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return snapshot;
        }

        let flight = self.inflight.entry(key.clone()).or_default().clone();
        let _guard = flight.lock().await;

        // Another caller may have refreshed while we waited
        if let Some(snapshot) = self.cached(&key, ttl) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return snapshot;
        }

        self.cache_misses.fetch_add(1, Ordering::Relaxed);
        debug!("Discovery cache miss for {}", key);
        let epoch = self.epoch.load(Ordering::Acquire);

        let results = join_all(
            backends
                .iter()
                .map(|b| self.detect_backend(*b, config.detect_capabilities)),
        )
        .await;

        let mut snapshot = DiscoverySnapshot::default();
        for result in results {
            if let Some(err) = &result.error {
                snapshot.errors.push(format!("{}: {}", result.backend, err));
            }
            snapshot.results.insert(result.backend, result);
        }

        info!(
            "Discovered backends: available={:?} errors={}",
            snapshot.available(),
            snapshot.errors.len()
        );

        let snapshot = Arc::new(snapshot);
        if !snapshot.errors.is_empty() {
            warn!("Not caching discovery snapshot with {} probe errors", snapshot.errors.len());
            return snapshot;
        }

        let mut cache = self.cache.write();
        // Checked under the write lock so an invalidation cannot slip in between
        if self.epoch.load(Ordering::Acquire) == epoch {
            cache.insert(
                key,
                CacheEntry {
                    snapshot: snapshot.clone(),
                    stored_at: Instant::now(),
                },
            );
        } else {
            debug!("Cache invalidated during discovery of {}, result not cached", key);
        }
        snapshot
    }

    async fn detect_backend(&self, backend: Backend, with_capabilities: bool) -> DiscoveryResult {
        let crds = backend.required_crds();
        let mut ready = Vec::with_capacity(crds.len());
        let mut error = None;

        for crd in &crds {
            match self.check_crd_ready(crd).await {
                Ok(found) => ready.push(found),
                Err(e) => {
                    warn!("CRD probe for {} failed: {}", crd, e);
                    error = Some(e.to_string());
                    break;
                }
            }
        }

        let (availability, health) = match (&error, ready.first()) {
            (Some(_), _) => (Availability::Unknown, HealthStatus::Unknown),
            (None, Some(true)) if ready.iter().all(|r| *r) => {
                (Availability::Available, HealthStatus::Healthy)
            }
            (None, Some(true)) => (Availability::Available, HealthStatus::Degraded),
            _ => (Availability::Unavailable, HealthStatus::Unknown),
        };

        let capabilities = if with_capabilities && availability == Availability::Available {
            match self.capabilities_from(backend, &ready).await {
                Ok(caps) => Some(caps),
                Err(e) => {
                    warn!("Capability detection for {} failed: {}", backend, e);
                    Some(BackendCapabilities::matrix(backend))
                }
            }
        } else {
            None
        };

        DiscoveryResult {
            backend,
            availability,
            health,
            last_checked: Utc::now(),
            capabilities,
            error,
        }
    }

    /// Whether a single CRD is registered and established
    pub async fn check_crd_ready(&self, crd_name: &str) -> Result<bool> {
        self.crd_queries.fetch_add(1, Ordering::Relaxed);
        self.store.crd_exists(crd_name).await
    }

    /// Capability matrix plus health and version probes
    pub async fn detect_capabilities(&self, backend: Backend) -> Result<BackendCapabilities> {
        let mut ready = Vec::new();
        for crd in &backend.required_crds() {
            ready.push(self.check_crd_ready(crd).await?);
        }
        self.capabilities_from(backend, &ready).await
    }

    /// Capabilities from CRD readiness already probed, in `required_crds` order
    async fn capabilities_from(&self, backend: Backend, ready: &[bool]) -> Result<BackendCapabilities> {
        let mut caps = BackendCapabilities::matrix(backend);
        let crds = backend.required_crds();
        caps.healthy = ready.len() == crds.len() && ready.iter().all(|r| *r);

        let primary = crds
            .first()
            .ok_or_else(|| Error::Internal(format!("{} declares no CRDs", backend)))?;
        self.crd_queries.fetch_add(1, Ordering::Relaxed);
        caps.version = self.store.crd_versions(primary).await?.last().cloned();

        Ok(caps)
    }

    /// Drop every cached snapshot, including any a running discovery is
    /// about to store
    pub fn invalidate_cache(&self) {
        let mut cache = self.cache.write();
        self.epoch.fetch_add(1, Ordering::AcqRel);
        let dropped = cache.len();
        cache.clear();
        info!("Discovery cache invalidated ({} entries)", dropped);
    }

    pub fn stats(&self) -> DiscoveryStats {
        DiscoveryStats {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            crd_queries: self.crd_queries.load(Ordering::Relaxed),
        }
    }
}
