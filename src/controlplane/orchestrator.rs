//! Replication Orchestrator - The "Brain"
//!
//! Runs one reconciliation pass for a replication intent or group:
//! - Resolves the backend (explicit hint, class provisioner, endpoint
//!   naming, then discovery preference order)
//! - Checks the requested transition, mode and parameters
//! - Invokes the adapter through retry and circuit breaking
//! - Folds the backend's answer into unified status

use crate::config::{OperatorConfig, ReplicationClassConfig};
use crate::controlplane::adapters::{AdapterRegistry, BackendParameters, BackendStatus};
use crate::controlplane::discovery::{
    Availability, BackendCapabilities, Capability, CapabilityLevel, DiscoveryEngine,
    DiscoverySnapshot,
};
use crate::controlplane::metrics::{MetricsSnapshot, OrchestratorMetrics};
use crate::controlplane::resilience::{CircuitBreaker, Resilience, RetryManager};
use crate::crd::{
    PvcRef, ReplicationCondition, ReplicationMode, ReplicationState, RoutingHints,
    UnifiedVolumeReplication, UnifiedVolumeReplicationGroup, UnifiedVolumeReplicationGroupStatus,
    UnifiedVolumeReplicationStatus,
};
use crate::domain::{Backend, ResourceStoreRef};
use crate::error::{Error, Result};
use crate::replication::{state_machine, TranslationEngine};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

static NO_CLASSES: BTreeMap<String, ReplicationClassConfig> = BTreeMap::new();

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the orchestrator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct OrchestratorConfig {
    /// Replication classes by name
    pub classes: BTreeMap<String, ReplicationClassConfig>,
}

// =============================================================================
// Operations and Outcomes
// =============================================================================

/// Kind of change being reconciled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the backend was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SelectionSource {
    Explicit,
    ReplicationClass,
    EndpointHeuristic,
    Discovery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BackendSelection {
    pub backend: Backend,
    pub source: SelectionSource,
}

/// Result of one pass. `status` is `None` after a delete; `backend` is
/// `None` when a delete had nothing to clean up.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutcome<S> {
    pub backend: Option<Backend>,
    pub status: Option<S>,
}

// =============================================================================
// Backend Selection
// =============================================================================

/// Resolve the backend for an intent. Pure: the same hints, classes and
/// snapshot always give the same answer.
pub fn select_backend(
    hints: &RoutingHints<'_>,
    classes: &BTreeMap<String, ReplicationClassConfig>,
    snapshot: &DiscoverySnapshot,
) -> Result<BackendSelection> {
    if let Some(backend) = hints.extensions.and_then(|e| e.backend) {
        return Ok(BackendSelection {
            backend,
            source: SelectionSource::Explicit,
        });
    }

    if let Some(name) = hints.replication_class {
        let class = classes.get(name).ok_or_else(|| Error::ClassNotFound {
            class: name.to_string(),
        })?;
        let backend = class.backend().ok_or_else(|| Error::UnknownProvisioner {
            provisioner: class.provisioner.clone(),
        })?;
        return Ok(BackendSelection {
            backend,
            source: SelectionSource::ReplicationClass,
        });
    }

    let names = [
        hints.source.storage_class.as_str(),
        hints.destination.storage_class.as_str(),
        hints.source.cluster.as_str(),
        hints.destination.cluster.as_str(),
    ];
    let mut candidates: Vec<Backend> = Vec::new();
    for name in names {
        for backend in Backend::infer_from_name(name) {
            if !candidates.contains(&backend) {
                candidates.push(backend);
            }
        }
    }
    candidates.sort_by_key(|b| Backend::PREFERENCE_ORDER.iter().position(|p| p == b));

    // Ambiguous naming prefers an installed candidate
    let inferred = match candidates.as_slice() {
        [] => None,
        [only] => Some(*only),
        many => many
            .iter()
            .copied()
            .find(|b| snapshot.is_available(*b))
            .or_else(|| many.first().copied()),
    };
    if let Some(backend) = inferred {
        return Ok(BackendSelection {
            backend,
            source: SelectionSource::EndpointHeuristic,
        });
    }

    snapshot
        .available()
        .first()
        .map(|backend| BackendSelection {
            backend: *backend,
            source: SelectionSource::Discovery,
        })
        .ok_or(Error::NoBackendAvailable)
}

/// Map the discovery state of `backend` onto an error
pub fn ensure_available(backend: Backend, snapshot: &DiscoverySnapshot) -> Result<()> {
    match snapshot.availability(backend) {
        Availability::Available => Ok(()),
        Availability::Unavailable => Err(Error::BackendNotAvailable { backend }),
        Availability::Unknown => Err(Error::BackendUnavailable { backend }),
    }
}

/// Check a transition only when the resource spec changed since the last successful pass
fn needs_transition_check(generation: Option<i64>, observed_generation: Option<i64>) -> bool {
    match (generation, observed_generation) {
        (Some(g), Some(o)) => g != o,
        _ => true,
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Composes discovery, translation, adapters and resilience
pub struct Orchestrator {
    config: Option<OrchestratorConfig>,
    store: ResourceStoreRef,
    discovery: Arc<DiscoveryEngine>,
    registry: Arc<AdapterRegistry>,
    resilience: Resilience,
    translation: TranslationEngine,
    metrics: OrchestratorMetrics,
}

impl Orchestrator {
    pub fn new(
        config: Option<OrchestratorConfig>,
        store: ResourceStoreRef,
        discovery: Arc<DiscoveryEngine>,
        registry: Arc<AdapterRegistry>,
        resilience: Resilience,
    ) -> Result<Self> {
        Ok(Self {
            config,
            store,
            discovery,
            registry,
            resilience,
            translation: TranslationEngine::new(),
            metrics: OrchestratorMetrics::new()?,
        })
    }

    /// Wire every engine from one operator configuration
    pub fn from_config(config: &OperatorConfig, store: ResourceStoreRef) -> Result<Self> {
        let discovery = Arc::new(DiscoveryEngine::new(store.clone(), Some(config.discovery.clone())));
        let registry = Arc::new(AdapterRegistry::with_defaults(store.clone())?);
        let resilience = Resilience::new(
            Arc::new(RetryManager::new(Some(config.retry.clone()))),
            Arc::new(CircuitBreaker::new(Some(config.circuit_breaker.clone()))),
        );
        Self::new(
            Some(OrchestratorConfig {
                classes: config.classes.clone(),
            }),
            store,
            discovery,
            registry,
            resilience,
        )
    }

    fn classes(&self) -> &BTreeMap<String, ReplicationClassConfig> {
        self.config.as_ref().map(|c| &c.classes).unwrap_or(&NO_CLASSES)
    }

    pub fn discovery(&self) -> &DiscoveryEngine {
        &self.discovery
    }

    /// Discovery plus selection plus availability
    async fn resolve(&self, hints: &RoutingHints<'_>) -> Result<(Backend, Arc<DiscoverySnapshot>)> {
        let snapshot = self.discovery.discover_backends().await;
        let selection = select_backend(hints, self.classes(), &snapshot)?;
        debug!("Selected backend {} via {:?}", selection.backend, selection.source);
        ensure_available(selection.backend, &snapshot)?;
        Ok((selection.backend, snapshot))
    }

    /// Class parameters overlaid with extension hints, then validated
    fn parameters(&self, backend: Backend, hints: &RoutingHints<'_>) -> Result<BackendParameters> {
        let mut params = BackendParameters::new();
        if let Some(name) = hints.replication_class {
            let class = self.classes().get(name).ok_or_else(|| Error::ClassNotFound {
                class: name.to_string(),
            })?;
            params.extend(class.parameters.clone());
        }
        if let Some(extensions) = hints.extensions {
            params.extend(extensions.to_parameters(backend));
        }
        self.translation.validate_parameters(backend, &params)?;
        Ok(params)
    }

    fn check_capabilities(
        &self,
        backend: Backend,
        mode: ReplicationMode,
        snapshot: &DiscoverySnapshot,
        group: bool,
    ) -> Result<()> {
        let capabilities = snapshot
            .capabilities(backend)
            .cloned()
            .unwrap_or_else(|| BackendCapabilities::matrix(backend));
        if capabilities.validate_mode(mode)? == CapabilityLevel::Partial {
            debug!("{} supports {} mode only partially", backend, mode);
        }
        if group && !capabilities.supports(Capability::VolumeGroups) {
            return Err(Error::UnsupportedMode {
                backend,
                mode: "volume-groups".into(),
            });
        }
        Ok(())
    }

    fn check_transition(
        observed: Option<ReplicationState>,
        requested: ReplicationState,
        generation: Option<i64>,
        observed_generation: Option<i64>,
    ) -> Result<()> {
        if let Some(current) = observed {
            if needs_transition_check(generation, observed_generation) {
                let verdict = state_machine::validate(current, requested)?;
                debug!("Transition {} -> {}: {}", current, requested, verdict.reason);
            }
        }
        Ok(())
    }

    // =========================================================================
    // Single Volume
    // =========================================================================

    /// Reconcile one replication intent
    #[instrument(skip(self, cancel, intent), fields(name = %intent.name(), op = %operation))]
    pub async fn process_replication(
        &self,
        cancel: &CancellationToken,
        intent: &UnifiedVolumeReplication,
        operation: Operation,
    ) -> Result<ProcessOutcome<UnifiedVolumeReplicationStatus>> {
        let started = Instant::now();
        let result = match operation {
            Operation::Delete => self.delete_replication(cancel, intent).await.map(|backend| ProcessOutcome {
                backend,
                status: None,
            }),
            _ => self.apply_replication(cancel, intent, operation).await,
        };

        let backend = match &result {
            Ok(outcome) => outcome.backend,
            Err(_) => intent.status.as_ref().and_then(|s| s.backend),
        };
        self.metrics
            .record(backend, operation.as_str(), result.as_ref().err(), started.elapsed());
        result
    }

    async fn apply_replication(
        &self,
        cancel: &CancellationToken,
        intent: &UnifiedVolumeReplication,
        operation: Operation,
    ) -> Result<ProcessOutcome<UnifiedVolumeReplicationStatus>> {
        let spec = &intent.spec;
        spec.validate()?;
        let hints = spec.routing();
        let (backend, snapshot) = self.resolve(&hints).await?;

        if operation == Operation::Update {
            Self::check_transition(
                intent.observed_state(),
                spec.replication_state,
                intent.metadata.generation,
                intent.status.as_ref().and_then(|s| s.observed_generation),
            )?;
        }
        self.check_capabilities(backend, spec.replication_mode, &snapshot, false)?;
        let params = self.parameters(backend, &hints)?;
        let adapter = self.registry.adapter(backend)?;

        let reconciled = self
            .resilience
            .execute(cancel, backend, "reconcile", || adapter.reconcile(cancel, intent, &params))
            .await?;
        let observed = self
            .resilience
            .execute(cancel, backend, "status", || adapter.get_status(cancel, intent))
            .await?;

        info!(
            "Reconciled {} on {} as {} (state={})",
            intent.name(),
            backend,
            reconciled.resource_name,
            reconciled.native_state
        );
        Ok(ProcessOutcome {
            backend: Some(backend),
            status: Some(self.replication_status(intent, backend, &observed)),
        })
    }

    async fn delete_replication(
        &self,
        cancel: &CancellationToken,
        intent: &UnifiedVolumeReplication,
    ) -> Result<Option<Backend>> {
        let recorded = intent.status.as_ref().and_then(|s| s.backend);
        let Some((backend, snapshot)) = self.delete_target(recorded, &intent.spec.routing()).await? else {
            return Ok(None);
        };
        if !Self::installed_for_delete(backend, &snapshot)? {
            return Ok(None);
        }

        let adapter = self.registry.adapter(backend)?;
        self.resilience
            .execute(cancel, backend, "delete", || adapter.delete(cancel, intent))
            .await?;
        info!("Cleaned up {} on {}", intent.name(), backend);
        Ok(Some(backend))
    }

    /// Backend to clean up: the one recorded in status, else resolution.
    /// A resolution that can never succeed means nothing was created.
    async fn delete_target(
        &self,
        recorded: Option<Backend>,
        hints: &RoutingHints<'_>,
    ) -> Result<Option<(Backend, Arc<DiscoverySnapshot>)>> {
        let snapshot = self.discovery.discover_backends().await;
        if let Some(backend) = recorded {
            return Ok(Some((backend, snapshot)));
        }
        match select_backend(hints, self.classes(), &snapshot) {
            Ok(selection) => Ok(Some((selection.backend, snapshot))),
            Err(Error::NoBackendAvailable) => Ok(None),
            Err(e) if !e.is_retryable() => {
                warn!("No backend to clean up: {}", e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn installed_for_delete(backend: Backend, snapshot: &DiscoverySnapshot) -> Result<bool> {
        match ensure_available(backend, snapshot) {
            Ok(()) => Ok(true),
            Err(Error::BackendNotAvailable { .. }) => {
                info!("{} is not installed; nothing to clean up", backend);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Backend status for an intent without writing anything
    pub async fn get_replication_status(
        &self,
        cancel: &CancellationToken,
        intent: &UnifiedVolumeReplication,
    ) -> Result<BackendStatus> {
        let (backend, _) = self.resolve(&intent.spec.routing()).await?;
        let adapter = self.registry.adapter(backend)?;
        self.resilience
            .execute(cancel, backend, "status", || adapter.get_status(cancel, intent))
            .await
    }

    fn replication_status(
        &self,
        intent: &UnifiedVolumeReplication,
        backend: Backend,
        observed: &BackendStatus,
    ) -> UnifiedVolumeReplicationStatus {
        let mut status = intent.status.clone().unwrap_or_default();
        status.backend = Some(backend);
        status.state = observed.state.or(status.state);
        status.message = observed.message.clone();
        status.last_sync_time = observed.last_sync_time.or(status.last_sync_time);
        status.last_sync_duration = observed
            .last_sync_duration
            .clone()
            .or(status.last_sync_duration);
        status.observed_generation = intent.metadata.generation;
        status.set_condition(ready_condition(backend, observed));
        status
    }

    // =========================================================================
    // Volume Groups
    // =========================================================================

    /// Claims currently matching the group selector
    async fn members(&self, cancel: &CancellationToken, group: &UnifiedVolumeReplicationGroup) -> Result<Vec<String>> {
        let namespace = group.namespace_or_default();
        let selector = &group.spec.selector.match_labels;
        self.resilience
            .retry
            .run(cancel, "list volumes", || self.store.list_volumes(&namespace, selector))
            .await
    }

    /// Reconcile one volume group; membership is recomputed on every pass
    #[instrument(skip(self, cancel, group), fields(name = %group.name(), op = %operation))]
    pub async fn process_group(
        &self,
        cancel: &CancellationToken,
        group: &UnifiedVolumeReplicationGroup,
        operation: Operation,
    ) -> Result<ProcessOutcome<UnifiedVolumeReplicationGroupStatus>> {
        let started = Instant::now();
        let result = match operation {
            Operation::Delete => self.delete_group(cancel, group).await.map(|backend| ProcessOutcome {
                backend,
                status: None,
            }),
            _ => self.apply_group(cancel, group, operation).await,
        };

        let backend = match &result {
            Ok(outcome) => outcome.backend,
            Err(_) => group.status.as_ref().and_then(|s| s.backend),
        };
        let label = format!("group-{}", operation);
        self.metrics
            .record(backend, &label, result.as_ref().err(), started.elapsed());
        result
    }

    async fn apply_group(
        &self,
        cancel: &CancellationToken,
        group: &UnifiedVolumeReplicationGroup,
        operation: Operation,
    ) -> Result<ProcessOutcome<UnifiedVolumeReplicationGroupStatus>> {
        let spec = &group.spec;
        spec.validate()?;
        let hints = spec.routing();
        let (backend, snapshot) = self.resolve(&hints).await?;

        if operation == Operation::Update {
            Self::check_transition(
                group.observed_state(),
                spec.replication_state,
                group.metadata.generation,
                group.status.as_ref().and_then(|s| s.observed_generation),
            )?;
        }
        self.check_capabilities(backend, spec.replication_mode, &snapshot, true)?;
        let params = self.parameters(backend, &hints)?;
        let adapter = self.registry.group_adapter(backend)?;
        let members = self.members(cancel, group).await?;

        if members.is_empty() {
            info!("Group {} matches no volumes; removing backend resources", group.name());
            self.resilience
                .execute(cancel, backend, "delete", || adapter.delete_group(cancel, group))
                .await?;
            return Ok(ProcessOutcome {
                backend: Some(backend),
                status: Some(self.group_status(group, backend, &members, None)),
            });
        }

        let reconciled = self
            .resilience
            .execute(cancel, backend, "reconcile", || {
                adapter.reconcile_group(cancel, group, &members, &params)
            })
            .await?;
        let observed = self
            .resilience
            .execute(cancel, backend, "status", || adapter.group_status(cancel, group, &members))
            .await?;

        info!(
            "Reconciled group {} on {}: {} volumes, {} writes",
            group.name(),
            backend,
            reconciled.members.len(),
            reconciled.writes
        );
        Ok(ProcessOutcome {
            backend: Some(backend),
            status: Some(self.group_status(group, backend, &members, Some(&observed))),
        })
    }

    async fn delete_group(&self, cancel: &CancellationToken, group: &UnifiedVolumeReplicationGroup) -> Result<Option<Backend>> {
        let recorded = group.status.as_ref().and_then(|s| s.backend);
        let Some((backend, snapshot)) = self.delete_target(recorded, &group.spec.routing()).await? else {
            return Ok(None);
        };
        if !Self::installed_for_delete(backend, &snapshot)? {
            return Ok(None);
        }

        let adapter = self.registry.group_adapter(backend)?;
        self.resilience
            .execute(cancel, backend, "delete", || adapter.delete_group(cancel, group))
            .await?;
        Ok(Some(backend))
    }

    /// Backend status for a group without writing anything
    pub async fn get_group_status(
        &self,
        cancel: &CancellationToken,
        group: &UnifiedVolumeReplicationGroup,
    ) -> Result<BackendStatus> {
        let (backend, _) = self.resolve(&group.spec.routing()).await?;
        let adapter = self.registry.group_adapter(backend)?;
        let members = self.members(cancel, group).await?;
        self.resilience
            .execute(cancel, backend, "status", || adapter.group_status(cancel, group, &members))
            .await
    }

    fn group_status(
        &self,
        group: &UnifiedVolumeReplicationGroup,
        backend: Backend,
        members: &[String],
        observed: Option<&BackendStatus>,
    ) -> UnifiedVolumeReplicationGroupStatus {
        let mut status = group.status.clone().unwrap_or_default();
        status.backend = Some(backend);
        status.observed_generation = group.metadata.generation;
        status.persistent_volume_claims_ref_list = members
            .iter()
            .map(|name| PvcRef { name: name.clone() })
            .collect();

        match observed {
            Some(observed) => {
                status.state = observed.state.or(status.state);
                status.message = observed.message.clone();
                status.set_condition(ready_condition(backend, observed));
            }
            None => {
                status.state = None;
                status.message = Some("selector matches no volumes".into());
                status.set_condition(ReplicationCondition::ready(
                    false,
                    "NoMatchingVolumes",
                    "selector matches no volumes",
                ));
            }
        }
        status
    }

    // =========================================================================
    // Cache and Metrics
    // =========================================================================

    pub fn invalidate_cache(&self) {
        self.discovery.invalidate_cache();
    }

    pub fn get_metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot(
            self.discovery.stats(),
            self.resilience.retry.retries(),
            self.resilience.retry.exhausted(),
            self.resilience.breaker.snapshot(),
        )
    }

    /// Prometheus text exposition
    pub fn render_metrics(&self) -> Result<String> {
        self.metrics.render(&self.get_metrics())
    }
}

fn ready_condition(backend: Backend, observed: &BackendStatus) -> ReplicationCondition {
    match (observed.found, observed.state) {
        (true, Some(state)) => ReplicationCondition::ready(
            true,
            "Reconciled",
            format!("{} reports {}", backend, state),
        ),
        (true, None) => ReplicationCondition::ready(
            false,
            "Pending",
            observed
                .message
                .clone()
                .unwrap_or_else(|| format!("waiting for {} to report a state", backend)),
        ),
        (false, _) => ReplicationCondition::ready(false, "Pending", format!("{} resource not found yet", backend)),
    }
}

/// Status after a failed pass: previous state kept, reason from the error.
/// `observedGeneration` is left alone so the failed generation is re-checked next pass.
pub fn replication_failure_status(
    intent: &UnifiedVolumeReplication,
    err: &Error,
) -> UnifiedVolumeReplicationStatus {
    let mut status = intent.status.clone().unwrap_or_default();
    status.message = Some(err.to_string());
    status.set_condition(ReplicationCondition::ready(false, err.reason(), err.to_string()));
    status
}

/// Group counterpart of [`replication_failure_status`]
pub fn group_failure_status(
    group: &UnifiedVolumeReplicationGroup,
    err: &Error,
) -> UnifiedVolumeReplicationGroupStatus {
    let mut status = group.status.clone().unwrap_or_default();
    status.message = Some(err.to_string());
    status.set_condition(ReplicationCondition::ready(false, err.reason(), err.to_string()));
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::adapters::test_support::{group, intent, simple_intent};
    use crate::controlplane::adapters::{CephAdapter, ReconcileResult, ReplicationAdapter};
    use crate::controlplane::discovery::{DiscoveryResult, HealthStatus};
    use crate::controlplane::resilience::{CircuitBreakerConfig, RetryConfig};
    use crate::domain::{ResourceStore, TRIDENT_MIRROR_RELATIONSHIP, VOLUME_REPLICATION};
    use crate::store::memory::{InMemoryResourceStore, InjectedFailure, StoreOp};
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn snapshot(entries: &[(Backend, Availability)]) -> DiscoverySnapshot {
        let mut snapshot = DiscoverySnapshot::default();
        for (backend, availability) in entries {
            snapshot.results.insert(
                *backend,
                DiscoveryResult {
                    backend: *backend,
                    availability: *availability,
                    health: HealthStatus::Healthy,
                    last_checked: Utc::now(),
                    capabilities: None,
                    error: None,
                },
            );
        }
        snapshot
    }

    fn all_available() -> DiscoverySnapshot {
        snapshot(&[
            (Backend::Ceph, Availability::Available),
            (Backend::Trident, Availability::Available),
            (Backend::PowerStore, Availability::Available),
        ])
    }

    fn classes() -> BTreeMap<String, ReplicationClassConfig> {
        BTreeMap::from([
            (
                "gold".to_string(),
                ReplicationClassConfig {
                    provisioner: "csi.trident.netapp.io".into(),
                    parameters: BTreeMap::from([("replicationPolicy".into(), "MirrorAndVault".into())]),
                },
            ),
            (
                "odd".to_string(),
                ReplicationClassConfig {
                    provisioner: "example.com/nfs".into(),
                    parameters: BTreeMap::new(),
                },
            ),
        ])
    }

    fn orchestrator_with(store: Arc<InMemoryResourceStore>, registry: AdapterRegistry) -> Orchestrator {
        Orchestrator::new(
            Some(OrchestratorConfig { classes: classes() }),
            store.clone(),
            Arc::new(DiscoveryEngine::new(store, None)),
            Arc::new(registry),
            Resilience::new(
                Arc::new(RetryManager::new(Some(RetryConfig {
                    max_attempts: 3,
                    ..Default::default()
                }))),
                Arc::new(CircuitBreaker::new(Some(CircuitBreakerConfig {
                    failure_threshold: 2,
                    cool_down_secs: 60,
                }))),
            ),
        )
        .unwrap()
    }

    fn orchestrator(backends: &[Backend]) -> (Arc<InMemoryResourceStore>, Orchestrator) {
        let store = Arc::new(InMemoryResourceStore::with_backends(backends));
        let registry = AdapterRegistry::with_defaults(store.clone()).unwrap();
        (store.clone(), orchestrator_with(store, registry))
    }

    fn with_hints(storage_class: &str, extensions: serde_json::Value) -> UnifiedVolumeReplication {
        intent(
            "db",
            json!({
                "replicationState": "source",
                "volumeMapping": {"source": {"name": "data"}, "destination": {"volumeHandle": "dr:data"}},
                "sourceEndpoint": {"cluster": "east", "storageClass": storage_class},
                "destinationEndpoint": {"cluster": "west", "storageClass": storage_class},
                "extensions": extensions,
            }),
        )
    }

    // -------------------------------------------------------------------------
    // Selection
    // -------------------------------------------------------------------------

    #[test]
    fn test_explicit_backend_wins() {
        let uvr = with_hints("rbd", json!({"backend": "powerstore"}));
        let selection = select_backend(&uvr.spec.routing(), &classes(), &all_available()).unwrap();
        assert_eq!(selection.backend, Backend::PowerStore);
        assert_eq!(selection.source, SelectionSource::Explicit);
    }

    #[test]
    fn test_class_provisioner_and_errors() {
        let mut uvr = with_hints("rbd", json!({}));
        uvr.spec.replication_class = Some("gold".into());
        let selection = select_backend(&uvr.spec.routing(), &classes(), &all_available()).unwrap();
        assert_eq!(selection.backend, Backend::Trident);
        assert_eq!(selection.source, SelectionSource::ReplicationClass);

        uvr.spec.replication_class = Some("missing".into());
        assert_matches!(
            select_backend(&uvr.spec.routing(), &classes(), &all_available()),
            Err(Error::ClassNotFound { .. })
        );

        uvr.spec.replication_class = Some("odd".into());
        assert_matches!(
            select_backend(&uvr.spec.routing(), &classes(), &all_available()),
            Err(Error::UnknownProvisioner { .. })
        );
    }

    #[test]
    fn test_endpoint_heuristics() {
        let uvr = simple_intent("db", "source", "ontap-gold");
        let selection = select_backend(&uvr.spec.routing(), &classes(), &all_available()).unwrap();
        assert_eq!(selection.backend, Backend::Trident);
        assert_eq!(selection.source, SelectionSource::EndpointHeuristic);

        // ambiguous naming prefers the installed candidate
        let uvr = simple_intent("db", "source", "ceph-to-dell");
        let only_dell = snapshot(&[
            (Backend::Ceph, Availability::Unavailable),
            (Backend::PowerStore, Availability::Available),
        ]);
        let selection = select_backend(&uvr.spec.routing(), &classes(), &only_dell).unwrap();
        assert_eq!(selection.backend, Backend::PowerStore);
    }

    #[test]
    fn test_discovery_fallback_is_deterministic() {
        let uvr = simple_intent("db", "source", "standard");
        let snap = snapshot(&[
            (Backend::PowerStore, Availability::Available),
            (Backend::Trident, Availability::Available),
            (Backend::Ceph, Availability::Unavailable),
        ]);
        let first = select_backend(&uvr.spec.routing(), &classes(), &snap).unwrap();
        let second = select_backend(&uvr.spec.routing(), &classes(), &snap).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.backend, Backend::Trident);
        assert_eq!(first.source, SelectionSource::Discovery);

        assert_matches!(
            select_backend(&uvr.spec.routing(), &classes(), &snapshot(&[])),
            Err(Error::NoBackendAvailable)
        );
    }

    #[test]
    fn test_availability_errors() {
        let snap = snapshot(&[
            (Backend::Ceph, Availability::Unavailable),
            (Backend::Trident, Availability::Unknown),
        ]);
        assert_matches!(ensure_available(Backend::Ceph, &snap), Err(Error::BackendNotAvailable { .. }));
        let err = ensure_available(Backend::Trident, &snap).unwrap_err();
        assert!(err.is_transient());
        assert_matches!(
            ensure_available(Backend::PowerStore, &snap),
            Err(Error::BackendNotAvailable { .. })
        );
    }

    // -------------------------------------------------------------------------
    // Single volume
    // -------------------------------------------------------------------------

    #[tokio::test]
    async fn test_ceph_create_passthrough() {
        let (store, orch) = orchestrator(&[Backend::Ceph, Backend::Trident]);
        let uvr = simple_intent("db", "primary", "rbd");

        let outcome = orch
            .process_replication(&CancellationToken::new(), &uvr, Operation::Create)
            .await
            .unwrap();
        assert_eq!(outcome.backend, Some(Backend::Ceph));

        let stored = store.resource(&VOLUME_REPLICATION, "apps", "db").unwrap();
        assert_eq!(stored.spec["replicationState"], "primary");
        assert_eq!(stored.spec["dataSource"]["name"], "data");

        let status = outcome.status.unwrap();
        assert_eq!(status.backend, Some(Backend::Ceph));
        assert_eq!(status.state, None, "requested state is not an observation");
        assert!(!status.is_ready(), "backend has not reported yet");
    }

    #[tokio::test]
    async fn test_observed_state_survives_empty_backend_status() {
        let (store, orch) = orchestrator(&[Backend::Ceph]);
        let cancel = CancellationToken::new();
        let mut uvr = simple_intent("db", "source", "rbd");
        uvr.metadata.generation = Some(1);
        uvr.status = Some(UnifiedVolumeReplicationStatus {
            state: Some(ReplicationState::Failed),
            observed_generation: Some(1),
            ..Default::default()
        });

        let outcome = orch.process_replication(&cancel, &uvr, Operation::Update).await.unwrap();
        let status = outcome.status.unwrap();
        assert_eq!(status.state, Some(ReplicationState::Failed));
        assert!(!status.is_ready());

        store.set_status(&VOLUME_REPLICATION, "apps", "db", json!({"state": "Primary"}));
        let outcome = orch.process_replication(&cancel, &uvr, Operation::Update).await.unwrap();
        assert_eq!(outcome.status.unwrap().state, Some(ReplicationState::Source));
    }

    #[tokio::test]
    async fn test_class_parameters_reach_backend() {
        let (store, orch) = orchestrator(&[Backend::Trident]);
        let mut uvr = simple_intent("db", "secondary", "standard");
        uvr.spec.replication_class = Some("gold".into());

        orch.process_replication(&CancellationToken::new(), &uvr, Operation::Create)
            .await
            .unwrap();
        let stored = store.resource(&TRIDENT_MIRROR_RELATIONSHIP, "apps", "db").unwrap();
        assert_eq!(stored.spec["state"], "reestablished");
        assert_eq!(stored.spec["replicationPolicy"], "MirrorAndVault");
    }

    #[tokio::test]
    async fn test_backend_not_installed() {
        let (store, orch) = orchestrator(&[Backend::Trident]);
        let uvr = simple_intent("db", "source", "rbd");

        let err = orch
            .process_replication(&CancellationToken::new(), &uvr, Operation::Create)
            .await
            .unwrap_err();
        assert_matches!(err, Error::BackendNotAvailable { backend: Backend::Ceph });
        assert_eq!(err.reason(), "BackendNotAvailable");
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_illegal_transition_rejected_on_spec_change() {
        let (store, orch) = orchestrator(&[Backend::Ceph]);
        let mut uvr = simple_intent("db", "replica", "rbd");
        uvr.metadata.generation = Some(2);
        uvr.status = Some(UnifiedVolumeReplicationStatus {
            state: Some(ReplicationState::Source),
            observed_generation: Some(1),
            ..Default::default()
        });

        let err = orch
            .process_replication(&CancellationToken::new(), &uvr, Operation::Update)
            .await
            .unwrap_err();
        assert_matches!(err, Error::InvalidTransition { ref reason, .. } if reason.contains("cannot"));
        assert_eq!(store.write_count(), 0);

        let status = replication_failure_status(&uvr, &err);
        assert_eq!(status.observed_generation, Some(1));
        assert_eq!(status.conditions[0].reason.as_deref(), Some("InvalidTransition"));
    }

    #[tokio::test]
    async fn test_unsupported_mode_and_bad_parameter() {
        let (store, orch) = orchestrator(&[Backend::Ceph]);
        let cancel = CancellationToken::new();

        let mut uvr = simple_intent("db", "source", "rbd");
        uvr.spec.replication_mode = ReplicationMode::Synchronous;
        assert_matches!(
            orch.process_replication(&cancel, &uvr, Operation::Create).await,
            Err(Error::UnsupportedMode { backend: Backend::Ceph, .. })
        );

        let uvr = with_hints("rbd", json!({"ceph": {"mirroringMode": "mirror-all"}}));
        let err = orch
            .process_replication(&cancel, &uvr, Operation::Create)
            .await
            .unwrap_err();
        assert_matches!(err, Error::InvalidParameter { ref key, .. } if key == "mirroringMode");
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_store_errors_are_retried() {
        let (store, orch) = orchestrator(&[Backend::Ceph]);
        store.fail_next(StoreOp::Apply, InjectedFailure::Unavailable, 1);

        let uvr = simple_intent("db", "source", "rbd");
        orch.process_replication(&CancellationToken::new(), &uvr, Operation::Create)
            .await
            .unwrap();

        assert!(store.resource(&VOLUME_REPLICATION, "apps", "db").is_some());
        let metrics = orch.get_metrics();
        assert_eq!(metrics.retries, 1);
        assert_eq!(metrics.operations_total, 1);
        assert_eq!(metrics.operations_failed, 0);
    }

    struct DownAdapter {
        calls: AtomicU32,
    }

    #[async_trait]
    impl ReplicationAdapter for DownAdapter {
        fn backend(&self) -> Backend {
            Backend::Trident
        }

        async fn reconcile(
            &self,
            _cancel: &CancellationToken,
            _intent: &UnifiedVolumeReplication,
            _params: &BackendParameters,
        ) -> Result<ReconcileResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::BackendUnavailable {
                backend: Backend::Trident,
            })
        }

        async fn delete(&self, _cancel: &CancellationToken, _intent: &UnifiedVolumeReplication) -> Result<()> {
            Ok(())
        }

        async fn get_status(
            &self,
            _cancel: &CancellationToken,
            _intent: &UnifiedVolumeReplication,
        ) -> Result<BackendStatus> {
            Ok(BackendStatus::not_found())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unhealthy_backend_does_not_block_others() {
        let store = Arc::new(InMemoryResourceStore::with_backends(&[Backend::Ceph, Backend::Trident]));
        let down = Arc::new(DownAdapter {
            calls: AtomicU32::new(0),
        });
        let registry = AdapterRegistry::new();
        registry.register(down.clone()).unwrap();
        registry.register(Arc::new(CephAdapter::new(store.clone()))).unwrap();
        let orch = orchestrator_with(store.clone(), registry);
        let cancel = CancellationToken::new();

        let trident = simple_intent("tmr", "source", "ontap-gold");
        assert_matches!(
            orch.process_replication(&cancel, &trident, Operation::Create).await,
            Err(Error::CircuitOpen { backend: Backend::Trident })
        );
        assert_matches!(
            orch.process_replication(&cancel, &trident, Operation::Create).await,
            Err(Error::CircuitOpen { .. })
        );
        assert_eq!(down.calls.load(Ordering::SeqCst), 2, "open circuit short-circuits the adapter");

        let ceph = simple_intent("vr", "source", "rbd");
        assert!(orch.process_replication(&cancel, &ceph, Operation::Create).await.is_ok());
        assert_eq!(orch.get_metrics().circuit_rejections, 2);
    }

    #[tokio::test]
    async fn test_delete_without_backend_completes() {
        let (store, orch) = orchestrator(&[Backend::Trident]);
        let mut uvr = simple_intent("db", "source", "rbd");
        uvr.status = Some(UnifiedVolumeReplicationStatus {
            backend: Some(Backend::Ceph),
            ..Default::default()
        });

        let outcome = orch
            .process_replication(&CancellationToken::new(), &uvr, Operation::Delete)
            .await
            .unwrap();
        assert_eq!(outcome.backend, None);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_removes_backend_resource() {
        let (store, orch) = orchestrator(&[Backend::Ceph]);
        let cancel = CancellationToken::new();
        let uvr = simple_intent("db", "source", "rbd");
        orch.process_replication(&cancel, &uvr, Operation::Create).await.unwrap();

        let outcome = orch.process_replication(&cancel, &uvr, Operation::Delete).await.unwrap();
        assert_eq!(outcome.backend, Some(Backend::Ceph));
        assert!(store.resource(&VOLUME_REPLICATION, "apps", "db").is_none());
    }

    #[tokio::test]
    async fn test_status_and_cache_metrics() {
        let (store, orch) = orchestrator(&[Backend::Ceph]);
        let cancel = CancellationToken::new();
        let uvr = simple_intent("db", "source", "rbd");
        orch.process_replication(&cancel, &uvr, Operation::Create).await.unwrap();
        store.set_status(&VOLUME_REPLICATION, "apps", "db", json!({"state": "Primary"}));

        let status = orch.get_replication_status(&cancel, &uvr).await.unwrap();
        assert_eq!(status.state, Some(ReplicationState::Source));

        let metrics = orch.get_metrics();
        assert_eq!(metrics.cache_misses, 1);
        assert_eq!(metrics.cache_hits, 1);

        orch.invalidate_cache();
        orch.get_replication_status(&cancel, &uvr).await.unwrap();
        assert_eq!(orch.get_metrics().cache_misses, 2);
        assert!(orch.render_metrics().unwrap().contains("operations_total"));
    }

    // -------------------------------------------------------------------------
    // Groups
    // -------------------------------------------------------------------------

    fn pg_volumes(store: &InMemoryResourceStore) {
        for pvc in ["pg-0", "pg-1", "pg-2"] {
            store.add_volume("apps", pvc, &[("app", "pg"), ("instance", "prod")]);
        }
        store.add_volume("apps", "other", &[("app", "web")]);
    }

    #[tokio::test]
    async fn test_group_membership_recomputed_each_pass() {
        let (store, orch) = orchestrator(&[Backend::Ceph]);
        pg_volumes(&store);
        let cancel = CancellationToken::new();
        let g = group("pg", "source", "rbd");

        let outcome = orch.process_group(&cancel, &g, Operation::Create).await.unwrap();
        let status = outcome.status.unwrap();
        let names: Vec<&str> = status
            .persistent_volume_claims_ref_list
            .iter()
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(names, vec!["pg-0", "pg-1", "pg-2"]);
        assert_eq!(store.resources(&VOLUME_REPLICATION).len(), 3);

        let unlabel = BTreeMap::from([("app".to_string(), None)]);
        store.set_volume_labels("apps", "pg-1", &unlabel).await.unwrap();

        let outcome = orch.process_group(&cancel, &g, Operation::Update).await.unwrap();
        assert_eq!(outcome.status.unwrap().persistent_volume_claims_ref_list.len(), 2);
        assert_eq!(store.resources(&VOLUME_REPLICATION).len(), 2);
    }

    #[tokio::test]
    async fn test_group_single_backend_resource() {
        let (store, orch) = orchestrator(&[Backend::Trident]);
        pg_volumes(&store);
        let g = group("pg", "source", "ontap-gold");

        orch.process_group(&CancellationToken::new(), &g, Operation::Create)
            .await
            .unwrap();
        let stored = store.resources(&TRIDENT_MIRROR_RELATIONSHIP);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].spec["volumeMappings"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_group_without_members() {
        let (_store, orch) = orchestrator(&[Backend::Ceph]);
        let g = group("pg", "source", "rbd");

        let outcome = orch
            .process_group(&CancellationToken::new(), &g, Operation::Create)
            .await
            .unwrap();
        let status = outcome.status.unwrap();
        assert!(status.persistent_volume_claims_ref_list.is_empty());
        assert_eq!(status.conditions[0].reason.as_deref(), Some("NoMatchingVolumes"));
    }
}
