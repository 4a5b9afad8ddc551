//! Backend identities
//!
//! The closed set of replication backends the operator drives, together with
//! the declarative resource kinds each of them exposes.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

// =============================================================================
// Resource Kinds
// =============================================================================

/// A declarative resource kind served by the cluster API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceKind {
    pub group: &'static str,
    pub version: &'static str,
    pub kind: &'static str,
    pub plural: &'static str,
}

impl ResourceKind {
    /// `group/version` string used in manifests
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.to_string()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Name of the CustomResourceDefinition that registers this kind
    pub fn crd_name(&self) -> String {
        format!("{}.{}", self.plural, self.group)
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.kind, self.group)
    }
}

/// csi-addons VolumeReplication
pub const VOLUME_REPLICATION: ResourceKind = ResourceKind {
    group: "replication.storage.openshift.io",
    version: "v1alpha1",
    kind: "VolumeReplication",
    plural: "volumereplications",
};

/// csi-addons VolumeReplicationClass
pub const VOLUME_REPLICATION_CLASS: ResourceKind = ResourceKind {
    group: "replication.storage.openshift.io",
    version: "v1alpha1",
    kind: "VolumeReplicationClass",
    plural: "volumereplicationclasses",
};

/// NetApp Trident mirror relationship
pub const TRIDENT_MIRROR_RELATIONSHIP: ResourceKind = ResourceKind {
    group: "trident.netapp.io",
    version: "v1",
    kind: "TridentMirrorRelationship",
    plural: "tridentmirrorrelationships",
};

/// Dell CSM replication group
pub const DELL_REPLICATION_GROUP: ResourceKind = ResourceKind {
    group: "replication.storage.dell.com",
    version: "v1",
    kind: "DellCSIReplicationGroup",
    plural: "dellcsireplicationgroups",
};

// =============================================================================
// Backend
// =============================================================================

/// Replication backend identity
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Ceph RBD through csi-addons (native-compatible)
    Ceph,
    /// NetApp Trident (state-named)
    Trident,
    /// Dell PowerStore (action-named)
    PowerStore,
}

impl Backend {
    /// Every backend, in the fixed selection preference order
    pub const PREFERENCE_ORDER: [Backend; 3] = [Backend::Ceph, Backend::Trident, Backend::PowerStore];

    /// Identifier as written in specs and metric labels
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Ceph => "ceph",
            Backend::Trident => "trident",
            Backend::PowerStore => "powerstore",
        }
    }

    /// Human readable label
    pub fn label(&self) -> &'static str {
        match self {
            Backend::Ceph => "Ceph RBD (csi-addons)",
            Backend::Trident => "NetApp Trident",
            Backend::PowerStore => "Dell PowerStore",
        }
    }

    /// Resource kind the adapter writes
    pub fn resource_kind(&self) -> ResourceKind {
        match self {
            Backend::Ceph => VOLUME_REPLICATION,
            Backend::Trident => TRIDENT_MIRROR_RELATIONSHIP,
            Backend::PowerStore => DELL_REPLICATION_GROUP,
        }
    }

    /// CRDs that must be registered for the backend to be usable
    pub fn required_crds(&self) -> Vec<String> {
        match self {
            Backend::Ceph => vec![VOLUME_REPLICATION.crd_name(), VOLUME_REPLICATION_CLASS.crd_name()],
            Backend::Trident => vec![TRIDENT_MIRROR_RELATIONSHIP.crd_name()],
            Backend::PowerStore => vec![DELL_REPLICATION_GROUP.crd_name()],
        }
    }

    /// Substrings that identify the backend in endpoint or class names
    pub fn naming_hints(&self) -> &'static [&'static str] {
        match self {
            Backend::Ceph => &["ceph", "rbd"],
            Backend::Trident => &["trident", "ontap", "netapp"],
            Backend::PowerStore => &["powerstore", "dell"],
        }
    }

    /// Backend owning a CSI provisioner name
    pub fn from_provisioner(provisioner: &str) -> Option<Backend> {
        match provisioner.to_lowercase().as_str() {
            "rbd.csi.ceph.com" | "cephfs.csi.ceph.com" | "openshift-storage.rbd.csi.ceph.com" => {
                Some(Backend::Ceph)
            }
            "csi.trident.netapp.io" => Some(Backend::Trident),
            "csi-powerstore.dellemc.com" => Some(Backend::PowerStore),
            _ => None,
        }
    }

    /// Backends whose naming hints occur in `name`, in preference order
    pub fn infer_from_name(name: &str) -> Vec<Backend> {
        let name = name.to_lowercase();
        Self::PREFERENCE_ORDER
            .into_iter()
            .filter(|b| b.naming_hints().iter().any(|hint| name.contains(hint)))
            .collect()
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ceph" | "ceph-csi" | "rbd" => Ok(Backend::Ceph),
            "trident" | "netapp" => Ok(Backend::Trident),
            "powerstore" | "dell" => Ok(Backend::PowerStore),
            other => Err(crate::error::Error::Configuration(format!(
                "unknown backend: {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crd_names() {
        assert_eq!(
            VOLUME_REPLICATION.crd_name(),
            "volumereplications.replication.storage.openshift.io"
        );
        assert_eq!(
            DELL_REPLICATION_GROUP.api_version(),
            "replication.storage.dell.com/v1"
        );
    }

    #[test]
    fn test_infer_from_name() {
        assert_eq!(Backend::infer_from_name("rbd"), vec![Backend::Ceph]);
        assert_eq!(
            Backend::infer_from_name("ontap-gold"),
            vec![Backend::Trident]
        );
        assert_eq!(
            Backend::infer_from_name("ceph-to-powerstore"),
            vec![Backend::Ceph, Backend::PowerStore]
        );
        assert!(Backend::infer_from_name("standard").is_empty());
    }

    #[test]
    fn test_from_provisioner() {
        assert_eq!(
            Backend::from_provisioner("rbd.csi.ceph.com"),
            Some(Backend::Ceph)
        );
        assert_eq!(
            Backend::from_provisioner("csi-powerstore.dellemc.com"),
            Some(Backend::PowerStore)
        );
        assert_eq!(Backend::from_provisioner("ebs.csi.aws.com"), None);
    }

    #[test]
    fn test_serde_names() {
        let json = serde_json::to_string(&Backend::PowerStore).unwrap();
        assert_eq!(json, "\"powerstore\"");
        assert_eq!("Trident".parse::<Backend>().unwrap(), Backend::Trident);
    }
}
