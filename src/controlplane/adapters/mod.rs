//! Backend Adapters
//!
//! One adapter per backend, each implementing the same reconcile / delete /
//! status contract against the [`ResourceStore`] port:
//! - Ceph: csi-addons `VolumeReplication`, near-passthrough
//! - Trident: `TridentMirrorRelationship`, state nouns
//! - PowerStore: `DellCSIReplicationGroup`, action verbs plus volume labels
//!
//! [`BackendAdapter`] is the closed dispatch over the three implementations.
//! The traits stay object safe so the registry can hold test doubles.

pub mod ceph;
pub mod powerstore;
pub mod registry;
pub mod trident;

pub use ceph::CephAdapter;
pub use powerstore::PowerStoreAdapter;
pub use registry::AdapterRegistry;
pub use trident::TridentAdapter;

use crate::crd::{
    ReplicationState, UnifiedVolumeReplication, UnifiedVolumeReplicationGroup, GROUP_LABEL,
    OWNER_LABEL,
};
use crate::domain::{
    ApplyOutcome, Backend, BackendResource, OwnerLink, ResourceStore, ResourceStoreRef,
    StoredResource,
};
use crate::error::{Error, Result};
use crate::replication::translation::NativeState;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Free-form backend parameters after class and extension merging
pub type BackendParameters = BTreeMap<String, String>;

// =============================================================================
// Results
// =============================================================================

/// Outcome of a single-volume reconcile
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileResult {
    pub backend: Backend,
    pub resource_name: String,
    pub native_state: NativeState,
    /// `None` when the stored resource already matched
    pub outcome: Option<ApplyOutcome>,
}

/// Outcome of a group reconcile
#[derive(Debug, Clone, PartialEq)]
pub struct GroupReconcileResult {
    pub backend: Backend,
    pub native_state: NativeState,
    pub resources: Vec<String>,
    pub members: Vec<String>,
    /// Writes issued on this pass
    pub writes: u32,
}

/// Backend status mapped into unified terms
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStatus {
    /// Whether the backend resource exists
    pub found: bool,
    pub state: Option<ReplicationState>,
    /// Raw value the backend reported
    pub native_state: Option<String>,
    pub message: Option<String>,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub last_sync_duration: Option<String>,
}

impl BackendStatus {
    pub fn not_found() -> Self {
        Self {
            message: Some("backend resource not found".to_string()),
            ..Default::default()
        }
    }
}

// =============================================================================
// Adapter Contracts
// =============================================================================

/// Single-volume adapter contract
#[async_trait]
pub trait ReplicationAdapter: Send + Sync {
    fn backend(&self) -> Backend;

    /// Create or update the backend resource for `intent`
    async fn reconcile(
        &self,
        cancel: &CancellationToken,
        intent: &UnifiedVolumeReplication,
        params: &BackendParameters,
    ) -> Result<ReconcileResult>;

    /// Remove every backend artifact for `intent`
    async fn delete(&self, cancel: &CancellationToken, intent: &UnifiedVolumeReplication) -> Result<()>;

    async fn get_status(
        &self,
        cancel: &CancellationToken,
        intent: &UnifiedVolumeReplication,
    ) -> Result<BackendStatus>;
}

impl std::fmt::Debug for dyn ReplicationAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationAdapter").field("backend", &self.backend()).finish()
    }
}

/// Volume-group adapter contract. `members` is the claim set matched on the
/// current pass, sorted.
#[async_trait]
pub trait GroupReplicationAdapter: Send + Sync {
    fn group_backend(&self) -> Backend;

    async fn reconcile_group(
        &self,
        cancel: &CancellationToken,
        group: &UnifiedVolumeReplicationGroup,
        members: &[String],
        params: &BackendParameters,
    ) -> Result<GroupReconcileResult>;

    async fn delete_group(&self, cancel: &CancellationToken, group: &UnifiedVolumeReplicationGroup) -> Result<()>;

    async fn group_status(
        &self,
        cancel: &CancellationToken,
        group: &UnifiedVolumeReplicationGroup,
        members: &[String],
    ) -> Result<BackendStatus>;
}

// =============================================================================
// Closed Dispatch
// =============================================================================

/// The three concrete adapters
pub enum BackendAdapter {
    Ceph(CephAdapter),
    Trident(TridentAdapter),
    PowerStore(PowerStoreAdapter),
}

impl BackendAdapter {
    pub fn for_backend(backend: Backend, store: ResourceStoreRef) -> Self {
        match backend {
            Backend::Ceph => BackendAdapter::Ceph(CephAdapter::new(store)),
            Backend::Trident => BackendAdapter::Trident(TridentAdapter::new(store)),
            Backend::PowerStore => BackendAdapter::PowerStore(PowerStoreAdapter::new(store)),
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $a:ident => $call:expr) => {
        match $self {
            BackendAdapter::Ceph($a) => $call,
            BackendAdapter::Trident($a) => $call,
            BackendAdapter::PowerStore($a) => $call,
        }
    };
}

#[async_trait]
impl ReplicationAdapter for BackendAdapter {
    fn backend(&self) -> Backend {
        dispatch!(self, a => a.backend())
    }

    async fn reconcile(
        &self,
        cancel: &CancellationToken,
        intent: &UnifiedVolumeReplication,
        params: &BackendParameters,
    ) -> Result<ReconcileResult> {
        dispatch!(self, a => a.reconcile(cancel, intent, params).await)
    }

    async fn delete(&self, cancel: &CancellationToken, intent: &UnifiedVolumeReplication) -> Result<()> {
        dispatch!(self, a => a.delete(cancel, intent).await)
    }

    async fn get_status(
        &self,
        cancel: &CancellationToken,
        intent: &UnifiedVolumeReplication,
    ) -> Result<BackendStatus> {
        dispatch!(self, a => a.get_status(cancel, intent).await)
    }
}

#[async_trait]
impl GroupReplicationAdapter for BackendAdapter {
    fn group_backend(&self) -> Backend {
        dispatch!(self, a => a.group_backend())
    }

    async fn reconcile_group(
        &self,
        cancel: &CancellationToken,
        group: &UnifiedVolumeReplicationGroup,
        members: &[String],
        params: &BackendParameters,
    ) -> Result<GroupReconcileResult> {
        dispatch!(self, a => a.reconcile_group(cancel, group, members, params).await)
    }

    async fn delete_group(&self, cancel: &CancellationToken, group: &UnifiedVolumeReplicationGroup) -> Result<()> {
        dispatch!(self, a => a.delete_group(cancel, group).await)
    }

    async fn group_status(
        &self,
        cancel: &CancellationToken,
        group: &UnifiedVolumeReplicationGroup,
        members: &[String],
    ) -> Result<BackendStatus> {
        dispatch!(self, a => a.group_status(cancel, group, members).await)
    }
}

// =============================================================================
// Shared Helpers
// =============================================================================

/// Apply `desired` unless the stored copy already reflects it. A stored
/// object managed by a different replication object is never taken over.
pub(crate) async fn apply_if_changed(
    store: &dyn ResourceStore,
    desired: &BackendResource,
) -> Result<Option<ApplyOutcome>> {
    if let Some(existing) = store.get(&desired.kind, &desired.namespace, &desired.name).await? {
        if let Some(owner) = foreign_owner(desired, &existing) {
            return Err(Error::ResourceConflict {
                kind: desired.kind.to_string(),
                name: format!("{}/{}", desired.namespace, desired.name),
                owner,
            });
        }
        if desired.is_satisfied_by(&existing) {
            debug!("{} {}/{} unchanged", desired.kind, desired.namespace, desired.name);
            return Ok(None);
        }
    }
    store.apply(desired).await.map(Some)
}

/// The managing object of `existing`, when it is not the one behind `desired`.
/// Owner UIDs decide when both sides carry one; otherwise the owner and
/// group labels do. Objects carrying neither are unmanaged.
fn foreign_owner(desired: &BackendResource, existing: &StoredResource) -> Option<String> {
    let desired_uid = desired.owner.as_ref().and_then(|o| o.uid.as_deref());
    let existing_owner = existing.owners.iter().find(|o| o.uid.is_some());
    if let (Some(uid), Some(owner)) = (desired_uid, existing_owner) {
        return (owner.uid.as_deref() != Some(uid)).then(|| format!("{} {}", owner.kind, owner.name));
    }

    let identity = |labels: &BTreeMap<String, String>| {
        (labels.get(OWNER_LABEL).cloned(), labels.get(GROUP_LABEL).cloned())
    };
    match identity(&existing.labels) {
        (None, None) => None,
        theirs if theirs == identity(&desired.labels) => None,
        (Some(owner), _) => Some(format!("replication {}", owner)),
        (None, Some(group)) => Some(format!("replication group {}", group)),
    }
}

/// Attribute a store error to `backend`
pub(crate) fn backend_error(backend: Backend, operation: &str, err: Error) -> Error {
    match err {
        Error::Kube(e) => {
            let err = Error::Kube(e);
            if err.is_transient() {
                Error::BackendTransient {
                    backend,
                    operation: operation.to_string(),
                    reason: err.to_string(),
                }
            } else {
                Error::BackendOperationFailed {
                    backend,
                    operation: operation.to_string(),
                    reason: err.to_string(),
                }
            }
        }
        other => other,
    }
}

pub(crate) fn ensure_live(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

/// Owner references cannot cross namespaces
pub(crate) fn owner_in(owner: OwnerLink, owner_namespace: &str, namespace: &str) -> Option<OwnerLink> {
    (owner_namespace == namespace).then_some(owner)
}

/// Parameter value, if set and non-empty
pub(crate) fn param<'a>(params: &'a BackendParameters, key: &str) -> Option<&'a str> {
    params.get(key).map(String::as_str).filter(|v| !v.trim().is_empty())
}

pub(crate) fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

pub(crate) fn time_at(value: &Value, pointer: &str) -> Option<DateTime<Utc>> {
    str_at(value, pointer)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Collapse member states: a single shared state, or `None` with a message
pub(crate) fn aggregate_states(states: &[(String, Option<ReplicationState>)]) -> (Option<ReplicationState>, Option<String>) {
    let mut distinct: Vec<ReplicationState> = states.iter().filter_map(|(_, s)| *s).collect();
    distinct.sort_by_key(|s| s.as_str());
    distinct.dedup();

    match distinct.as_slice() {
        [] => (None, Some("no member reports a state yet".to_string())),
        [only] if states.iter().all(|(_, s)| s.is_some()) => (Some(*only), None),
        _ => {
            let detail: Vec<String> = states
                .iter()
                .map(|(name, s)| format!("{}={}", name, s.map(|s| s.as_str()).unwrap_or("unknown")))
                .collect();
            (None, Some(format!("members disagree: {}", detail.join(", "))))
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::crd::{UnifiedVolumeReplicationGroupSpec, UnifiedVolumeReplicationSpec};
    use serde_json::json;

    pub fn intent(name: &str, spec: Value) -> UnifiedVolumeReplication {
        let spec: UnifiedVolumeReplicationSpec = serde_json::from_value(spec).unwrap();
        let mut uvr = UnifiedVolumeReplication::new(name, spec);
        uvr.metadata.namespace = Some("apps".into());
        uvr.metadata.uid = Some(format!("uid-{}", name));
        uvr
    }

    pub fn simple_intent(name: &str, state: &str, storage_class: &str) -> UnifiedVolumeReplication {
        intent(
            name,
            json!({
                "replicationState": state,
                "volumeMapping": {
                    "source": {"name": "data"},
                    "destination": {"volumeHandle": "remote-svm:data_dr"}
                },
                "sourceEndpoint": {"cluster": "east", "storageClass": storage_class},
                "destinationEndpoint": {"cluster": "west", "storageClass": storage_class}
            }),
        )
    }

    pub fn group(name: &str, state: &str, storage_class: &str) -> UnifiedVolumeReplicationGroup {
        let spec: UnifiedVolumeReplicationGroupSpec = serde_json::from_value(json!({
            "selector": {"matchLabels": {"app": "pg", "instance": "prod"}},
            "replicationState": state,
            "sourceEndpoint": {"cluster": "east", "storageClass": storage_class},
            "destinationEndpoint": {"cluster": "west", "storageClass": storage_class}
        }))
        .unwrap();
        let mut g = UnifiedVolumeReplicationGroup::new(name, spec);
        g.metadata.namespace = Some("apps".into());
        g.metadata.uid = Some(format!("uid-{}", name));
        g
    }

    pub fn pg_members() -> Vec<String> {
        vec!["pg-0".into(), "pg-1".into(), "pg-2".into()]
    }
}
