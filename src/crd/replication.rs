//! UnifiedVolumeReplication CRD
//!
//! The vendor-neutral replication intent: one volume, one desired replication
//! state, and the endpoints the operator uses to pick a backend.

use crate::domain::{Backend, OwnerLink};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use kube::{CustomResource, Resource, ResourceExt};
use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Label carried by every backend resource created for a group
pub const GROUP_LABEL: &str = "replication.unified.io/group";

/// Label naming the replication object that owns a backend resource
pub const OWNER_LABEL: &str = "replication.unified.io/owner";

// =============================================================================
// UnifiedVolumeReplication CRD
// =============================================================================

/// UnifiedVolumeReplication declares the desired replication state of a
/// single volume independently of the storage backend that implements it.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "replication.unified.io",
    version = "v1alpha1",
    kind = "UnifiedVolumeReplication",
    plural = "unifiedvolumereplications",
    shortname = "uvr",
    status = "UnifiedVolumeReplicationStatus",
    printcolumn = r#"{"name": "Desired", "type": "string", "jsonPath": ".spec.replicationState"}"#,
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    printcolumn = r#"{"name": "Backend", "type": "string", "jsonPath": ".status.backend"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct UnifiedVolumeReplicationSpec {
    /// Desired replication state
    pub replication_state: ReplicationState,

    /// Replication mode
    #[serde(default)]
    pub replication_mode: ReplicationMode,

    /// Source claim and destination volume
    pub volume_mapping: VolumeMapping,

    /// Where the source volume lives
    pub source_endpoint: Endpoint,

    /// Where the destination volume lives
    pub destination_endpoint: Endpoint,

    /// RPO/RTO targets
    #[serde(default)]
    pub schedule: Schedule,

    /// Configured replication class carrying backend parameters
    #[serde(default)]
    pub replication_class: Option<String>,

    /// Backend-specific hints
    #[serde(default)]
    pub extensions: Option<Extensions>,
}

// =============================================================================
// Replication State
// =============================================================================

/// Vendor-neutral replication state
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationState {
    /// Read-write side of the relationship
    #[serde(alias = "primary")]
    Source,
    /// Read-only side receiving updates
    #[serde(alias = "secondary")]
    Replica,
    /// Replica on its way to becoming the source
    Promoting,
    /// Source on its way to becoming a replica
    Demoting,
    /// Resynchronizing from the source
    Syncing,
    /// Replication is broken
    Failed,
}

impl ReplicationState {
    pub const ALL: [ReplicationState; 6] = [
        ReplicationState::Source,
        ReplicationState::Replica,
        ReplicationState::Promoting,
        ReplicationState::Demoting,
        ReplicationState::Syncing,
        ReplicationState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicationState::Source => "source",
            ReplicationState::Replica => "replica",
            ReplicationState::Promoting => "promoting",
            ReplicationState::Demoting => "demoting",
            ReplicationState::Syncing => "syncing",
            ReplicationState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ReplicationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ReplicationState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "source" | "primary" => Ok(ReplicationState::Source),
            "replica" | "secondary" => Ok(ReplicationState::Replica),
            "promoting" => Ok(ReplicationState::Promoting),
            "demoting" => Ok(ReplicationState::Demoting),
            "syncing" => Ok(ReplicationState::Syncing),
            "failed" => Ok(ReplicationState::Failed),
            other => Err(Error::InvalidSpec(format!("unknown replication state: {}", other))),
        }
    }
}

// The `primary`/`secondary` spellings must pass schema validation too.
impl JsonSchema for ReplicationState {
    fn schema_name() -> String {
        "ReplicationState".to_string()
    }

    fn json_schema(_gen: &mut SchemaGenerator) -> Schema {
        let accepted = [
            "source", "replica", "promoting", "demoting", "syncing", "failed", "primary",
            "secondary",
        ];
        SchemaObject {
            instance_type: Some(InstanceType::String.into()),
            enum_values: Some(accepted.iter().map(|s| serde_json::json!(s)).collect()),
            ..Default::default()
        }
        .into()
    }
}

/// Replication mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationMode {
    Synchronous,
    #[default]
    Asynchronous,
    Continuous,
    Interval,
    Eventual,
}

impl std::fmt::Display for ReplicationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicationMode::Synchronous => write!(f, "synchronous"),
            ReplicationMode::Asynchronous => write!(f, "asynchronous"),
            ReplicationMode::Continuous => write!(f, "continuous"),
            ReplicationMode::Interval => write!(f, "interval"),
            ReplicationMode::Eventual => write!(f, "eventual"),
        }
    }
}

// =============================================================================
// Sub-Types
// =============================================================================

/// Source claim and destination volume
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMapping {
    pub source: PvcReference,
    #[serde(default)]
    pub destination: VolumeReference,
}

/// Reference to a PersistentVolumeClaim
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PvcReference {
    pub name: String,
    /// Defaults to the namespace of the replication object
    #[serde(default)]
    pub namespace: Option<String>,
}

/// Reference to the remote volume
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VolumeReference {
    /// Backend volume handle on the destination side
    #[serde(default)]
    pub volume_handle: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
}

/// Replication endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub cluster: String,
    #[serde(default)]
    pub region: Option<String>,
    pub storage_class: String,
}

/// Schedule mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleMode {
    #[default]
    Continuous,
    Interval,
    Manual,
}

/// Recovery objectives
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    /// Recovery point objective (e.g. "15m")
    #[serde(default)]
    pub rpo: Option<String>,
    /// Recovery time objective (e.g. "5m")
    #[serde(default)]
    pub rto: Option<String>,
    #[serde(default)]
    pub mode: ScheduleMode,
}

/// Backend-specific hints
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Extensions {
    /// Explicit backend selection, overrides every inference
    #[serde(default)]
    pub backend: Option<Backend>,
    #[serde(default)]
    pub ceph: Option<CephExtensions>,
    #[serde(default)]
    pub trident: Option<TridentExtensions>,
    #[serde(default)]
    pub powerstore: Option<PowerStoreExtensions>,
    /// Free-form backend parameters, merged over the class parameters
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CephExtensions {
    /// journal or snapshot
    #[serde(default)]
    pub mirroring_mode: Option<String>,
    #[serde(default)]
    pub scheduling_interval: Option<String>,
    #[serde(default)]
    pub auto_resync: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TridentExtensions {
    #[serde(default)]
    pub replication_policy: Option<String>,
    #[serde(default)]
    pub replication_schedule: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PowerStoreExtensions {
    #[serde(default)]
    pub protection_policy: Option<String>,
    #[serde(default)]
    pub remote_system: Option<String>,
    #[serde(default)]
    pub remote_cluster_id: Option<String>,
    #[serde(default)]
    pub rpo: Option<String>,
}

impl Extensions {
    /// Flatten the typed hints for `backend` into canonical parameter keys.
    /// The free-form map wins over typed hints.
    pub fn to_parameters(&self, backend: Backend) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        let mut put = |key: &str, value: &Option<String>| {
            if let Some(v) = value {
                params.insert(key.to_string(), v.clone());
            }
        };

        match backend {
            Backend::Ceph => {
                if let Some(ceph) = &self.ceph {
                    put("mirroringMode", &ceph.mirroring_mode);
                    put("schedulingInterval", &ceph.scheduling_interval);
                    put("autoResync", &ceph.auto_resync.map(|b| b.to_string()));
                }
            }
            Backend::Trident => {
                if let Some(trident) = &self.trident {
                    put("replicationPolicy", &trident.replication_policy);
                    put("replicationSchedule", &trident.replication_schedule);
                }
            }
            Backend::PowerStore => {
                if let Some(ps) = &self.powerstore {
                    put("protectionPolicy", &ps.protection_policy);
                    put("remoteSystem", &ps.remote_system);
                    put("remoteClusterId", &ps.remote_cluster_id);
                    put("rpo", &ps.rpo);
                }
            }
        }

        params.extend(self.parameters.clone());
        params
    }
}

/// Borrowed view of the fields used to resolve a backend
#[derive(Debug, Clone, Copy)]
pub struct RoutingHints<'a> {
    pub source: &'a Endpoint,
    pub destination: &'a Endpoint,
    pub replication_class: Option<&'a str>,
    pub extensions: Option<&'a Extensions>,
}

// =============================================================================
// Status
// =============================================================================

/// Status of a UnifiedVolumeReplication
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UnifiedVolumeReplicationStatus {
    /// Observed replication state
    #[serde(default)]
    pub state: Option<ReplicationState>,

    /// Backend driving this replication
    #[serde(default)]
    pub backend: Option<Backend>,

    #[serde(default)]
    pub message: Option<String>,

    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_sync_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub last_sync_duration: Option<String>,

    #[serde(default)]
    pub observed_generation: Option<i64>,

    #[serde(default)]
    pub conditions: Vec<ReplicationCondition>,
}

/// Status condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationCondition {
    /// Type of condition
    pub r#type: String,
    /// Status: True, False, Unknown
    pub status: ConditionStatus,
    /// Last transition time
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_transition_time: Option<DateTime<Utc>>,
    /// Machine-readable reason
    #[serde(default)]
    pub reason: Option<String>,
    /// Human-readable message
    #[serde(default)]
    pub message: Option<String>,
}

impl ReplicationCondition {
    /// Build a `Ready` condition
    pub fn ready(ready: bool, reason: &str, message: impl Into<String>) -> Self {
        Self {
            r#type: "Ready".to_string(),
            status: if ready {
                ConditionStatus::True
            } else {
                ConditionStatus::False
            },
            last_transition_time: Some(Utc::now()),
            reason: Some(reason.to_string()),
            message: Some(message.into()),
        }
    }
}

/// Condition status values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// Replace a condition of the same type, keeping the transition time when
/// the status did not change
pub fn upsert_condition(conditions: &mut Vec<ReplicationCondition>, mut condition: ReplicationCondition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.r#type == condition.r#type) {
        if existing.status == condition.status {
            condition.last_transition_time = existing.last_transition_time;
        }
        *existing = condition;
    } else {
        conditions.push(condition);
    }
}

impl UnifiedVolumeReplicationStatus {
    /// Set a condition, replacing existing if same type
    pub fn set_condition(&mut self, condition: ReplicationCondition) {
        upsert_condition(&mut self.conditions, condition);
    }

    /// Check if the Ready condition is true
    pub fn is_ready(&self) -> bool {
        self.conditions
            .iter()
            .any(|c| c.r#type == "Ready" && c.status == ConditionStatus::True)
    }
}

// =============================================================================
// Implementations
// =============================================================================

impl UnifiedVolumeReplicationSpec {
    /// Structural checks performed before any backend is contacted
    pub fn validate(&self) -> Result<()> {
        if self.volume_mapping.source.name.trim().is_empty() {
            return Err(Error::InvalidSpec("volumeMapping.source.name is required".into()));
        }
        validate_endpoints(&self.source_endpoint, &self.destination_endpoint)
    }

    pub fn routing(&self) -> RoutingHints<'_> {
        RoutingHints {
            source: &self.source_endpoint,
            destination: &self.destination_endpoint,
            replication_class: self.replication_class.as_deref(),
            extensions: self.extensions.as_ref(),
        }
    }
}

/// Source and destination must differ in cluster or storage class
pub fn validate_endpoints(source: &Endpoint, destination: &Endpoint) -> Result<()> {
    if source.cluster == destination.cluster && source.storage_class == destination.storage_class {
        return Err(Error::InvalidSpec(format!(
            "source and destination endpoints are identical ({}/{})",
            source.cluster, source.storage_class
        )));
    }
    Ok(())
}

impl UnifiedVolumeReplication {
    /// Get the name of this replication
    pub fn name(&self) -> String {
        self.name_any()
    }

    /// Namespace, defaulting to `default`
    pub fn namespace_or_default(&self) -> String {
        self.namespace().unwrap_or_else(|| "default".to_string())
    }

    /// Namespace of the source claim
    pub fn source_pvc_namespace(&self) -> String {
        self.spec
            .volume_mapping
            .source
            .namespace
            .clone()
            .unwrap_or_else(|| self.namespace_or_default())
    }

    /// Owner reference for backend resources
    pub fn owner_link(&self) -> OwnerLink {
        OwnerLink {
            api_version: Self::api_version(&()).to_string(),
            kind: Self::kind(&()).to_string(),
            name: self.name_any(),
            uid: self.uid(),
        }
    }

    /// Observed state recorded in status
    pub fn observed_state(&self) -> Option<ReplicationState> {
        self.status.as_ref().and_then(|s| s.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(cluster: &str, class: &str) -> Endpoint {
        Endpoint {
            cluster: cluster.into(),
            region: None,
            storage_class: class.into(),
        }
    }

    #[test]
    fn test_state_aliases() {
        let state: ReplicationState = serde_json::from_str("\"primary\"").unwrap();
        assert_eq!(state, ReplicationState::Source);
        let state: ReplicationState = serde_json::from_str("\"secondary\"").unwrap();
        assert_eq!(state, ReplicationState::Replica);
        assert_eq!(serde_json::to_string(&ReplicationState::Source).unwrap(), "\"source\"");
        assert_eq!("Promoting".parse::<ReplicationState>().unwrap(), ReplicationState::Promoting);
    }

    #[test]
    fn test_spec_deserialize() {
        let spec: UnifiedVolumeReplicationSpec = serde_json::from_value(serde_json::json!({
            "replicationState": "primary",
            "volumeMapping": {"source": {"name": "data"}},
            "sourceEndpoint": {"cluster": "east", "storageClass": "rbd"},
            "destinationEndpoint": {"cluster": "west", "storageClass": "rbd"},
            "extensions": {"ceph": {"mirroringMode": "snapshot"}}
        }))
        .unwrap();

        assert_eq!(spec.replication_state, ReplicationState::Source);
        assert_eq!(spec.replication_mode, ReplicationMode::Asynchronous);
        assert!(spec.validate().is_ok());
        let params = spec.extensions.unwrap().to_parameters(Backend::Ceph);
        assert_eq!(params.get("mirroringMode").map(String::as_str), Some("snapshot"));
    }

    #[test]
    fn test_identical_endpoints_rejected() {
        let err = validate_endpoints(&endpoint("east", "rbd"), &endpoint("east", "rbd")).unwrap_err();
        assert_eq!(err.reason(), "InvalidSpec");
        assert!(validate_endpoints(&endpoint("east", "rbd"), &endpoint("east", "rbd-dr")).is_ok());
    }

    #[test]
    fn test_free_form_parameters_override_typed_hints() {
        let mut ext = Extensions {
            trident: Some(TridentExtensions {
                replication_policy: Some("MirrorAllSnapshots".into()),
                replication_schedule: None,
            }),
            ..Default::default()
        };
        ext.parameters.insert("replicationPolicy".into(), "Sync".into());

        let params = ext.to_parameters(Backend::Trident);
        assert_eq!(params["replicationPolicy"], "Sync");
        assert!(ext.to_parameters(Backend::Ceph).contains_key("replicationPolicy"));
    }

    #[test]
    fn test_condition_keeps_transition_time() {
        let mut status = UnifiedVolumeReplicationStatus::default();
        status.set_condition(ReplicationCondition::ready(true, "Reconciled", "ok"));
        let first = status.conditions[0].last_transition_time;
        status.set_condition(ReplicationCondition::ready(true, "Reconciled", "still ok"));
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].last_transition_time, first);
        assert!(status.is_ready());
    }
}
