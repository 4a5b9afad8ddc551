//! Custom Resource Definitions for the Unified Replication Operator
//!
//! This module contains all CRD types:
//! - UnifiedVolumeReplication: replication intent for a single volume
//! - UnifiedVolumeReplicationGroup: label-selected volume group

pub mod replication;
pub mod replication_group;

pub use replication::*;
pub use replication_group::*;

use kube::CustomResourceExt;

/// Render every CRD as a multi-document YAML stream
pub fn render_crds() -> crate::error::Result<String> {
    let mut out = String::new();
    for crd in [
        UnifiedVolumeReplication::crd(),
        UnifiedVolumeReplicationGroup::crd(),
    ] {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(&crd)?);
    }
    Ok(out)
}
