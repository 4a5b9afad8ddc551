//! UnifiedVolumeReplicationGroup CRD
//!
//! A label-selected set of PersistentVolumeClaims replicated as one
//! consistency unit. Membership is recomputed on every reconciliation pass.

use crate::crd::replication::{
    upsert_condition, validate_endpoints, ConditionStatus, Endpoint, Extensions,
    ReplicationCondition, ReplicationMode, ReplicationState, RoutingHints, Schedule,
};
use crate::domain::{Backend, OwnerLink};
use crate::error::{Error, Result};
use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Prefix of every backend object name derived from a group
pub const GROUP_RESOURCE_PREFIX: &str = "uvrg-";

// =============================================================================
// UnifiedVolumeReplicationGroup CRD
// =============================================================================

/// UnifiedVolumeReplicationGroup replicates every claim matching its selector
/// as a single consistency group.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "replication.unified.io",
    version = "v1alpha1",
    kind = "UnifiedVolumeReplicationGroup",
    plural = "unifiedvolumereplicationgroups",
    shortname = "uvrg",
    status = "UnifiedVolumeReplicationGroupStatus",
    printcolumn = r#"{"name": "Desired", "type": "string", "jsonPath": ".spec.replicationState"}"#,
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    printcolumn = r#"{"name": "Backend", "type": "string", "jsonPath": ".status.backend"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct UnifiedVolumeReplicationGroupSpec {
    /// Claims in the group's namespace matching this selector are members
    pub selector: GroupSelector,

    pub replication_state: ReplicationState,

    #[serde(default)]
    pub replication_mode: ReplicationMode,

    pub source_endpoint: Endpoint,

    pub destination_endpoint: Endpoint,

    #[serde(default)]
    pub schedule: Schedule,

    #[serde(default)]
    pub replication_class: Option<String>,

    #[serde(default)]
    pub extensions: Option<Extensions>,

    /// Remote volume handle per member claim; members without an entry
    /// use the claim name
    #[serde(default)]
    pub remote_volume_handles: BTreeMap<String, String>,
}

/// Label predicate
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GroupSelector {
    #[serde(default)]
    pub match_labels: BTreeMap<String, String>,
}

// =============================================================================
// Status
// =============================================================================

/// Status of a UnifiedVolumeReplicationGroup
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UnifiedVolumeReplicationGroupStatus {
    #[serde(default)]
    pub state: Option<ReplicationState>,

    #[serde(default)]
    pub backend: Option<Backend>,

    #[serde(default)]
    pub message: Option<String>,

    #[serde(default)]
    pub observed_generation: Option<i64>,

    /// Claims matched on the latest pass
    #[serde(default)]
    pub persistent_volume_claims_ref_list: Vec<PvcRef>,

    #[serde(default)]
    pub conditions: Vec<ReplicationCondition>,
}

/// Member claim reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PvcRef {
    pub name: String,
}

impl UnifiedVolumeReplicationGroupStatus {
    pub fn set_condition(&mut self, condition: ReplicationCondition) {
        upsert_condition(&mut self.conditions, condition);
    }

    pub fn is_ready(&self) -> bool {
        self.conditions
            .iter()
            .any(|c| c.r#type == "Ready" && c.status == ConditionStatus::True)
    }
}

// =============================================================================
// Implementations
// =============================================================================

impl UnifiedVolumeReplicationGroupSpec {
    pub fn validate(&self) -> Result<()> {
        if self.selector.match_labels.is_empty() {
            return Err(Error::InvalidSpec("selector.matchLabels must not be empty".into()));
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

    /// Remote handle for a member claim
    pub fn remote_handle_for(&self, pvc: &str) -> String {
        self.remote_volume_handles
            .get(pvc)
            .cloned()
            .unwrap_or_else(|| pvc.to_string())
    }
}

impl UnifiedVolumeReplicationGroup {
    pub fn name(&self) -> String {
        self.name_any()
    }

    pub fn namespace_or_default(&self) -> String {
        self.namespace().unwrap_or_else(|| "default".to_string())
    }

    /// Base name for backend objects created on behalf of this group.
    /// Prefixed so it never coincides with a single-volume intent's name.
    pub fn backend_name(&self) -> String {
        format!("{}{}", GROUP_RESOURCE_PREFIX, self.name_any())
    }

    pub fn owner_link(&self) -> OwnerLink {
        OwnerLink {
            api_version: Self::api_version(&()).to_string(),
            kind: Self::kind(&()).to_string(),
            name: self.name_any(),
            uid: self.uid(),
        }
    }

    pub fn observed_state(&self) -> Option<ReplicationState> {
        self.status.as_ref().and_then(|s| s.state)
    }
}
