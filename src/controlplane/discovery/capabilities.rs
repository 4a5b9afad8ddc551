//! Backend capability matrix
//!
//! Static per-backend support levels, combined at discovery time with the
//! health and version probes.

use crate::crd::ReplicationMode;
use crate::domain::Backend;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A replication feature a backend may offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    AsyncReplication,
    SyncReplication,
    ContinuousReplication,
    VolumeGroups,
    Resync,
    Failover,
}

impl Capability {
    /// Capability a replication mode depends on
    pub fn for_mode(mode: ReplicationMode) -> Capability {
        match mode {
            ReplicationMode::Synchronous => Capability::SyncReplication,
            ReplicationMode::Continuous => Capability::ContinuousReplication,
            ReplicationMode::Asynchronous | ReplicationMode::Interval | ReplicationMode::Eventual => {
                Capability::AsyncReplication
            }
        }
    }
}

/// Support level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityLevel {
    None,
    Partial,
    Full,
}

/// Capability set reported for one backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendCapabilities {
    pub backend: Backend,
    pub levels: BTreeMap<Capability, CapabilityLevel>,
    /// Every required CRD is established
    pub healthy: bool,
    /// Last served version of the primary CRD
    pub version: Option<String>,
}

impl BackendCapabilities {
    /// Static matrix for `backend` with unknown health and version
    pub fn matrix(backend: Backend) -> Self {
        use Capability::*;
        use CapabilityLevel::{Full, None, Partial};

        let levels: &[(Capability, CapabilityLevel)] = match backend {
            Backend::Ceph => &[
                (AsyncReplication, Full),
                (SyncReplication, None),
                (ContinuousReplication, Full),
                (VolumeGroups, Partial),
                (Resync, Full),
                (Failover, Full),
            ],
            Backend::Trident => &[
                (AsyncReplication, Full),
                (SyncReplication, Partial),
                (ContinuousReplication, Partial),
                (VolumeGroups, Full),
                (Resync, Full),
                (Failover, Full),
            ],
            Backend::PowerStore => &[
                (AsyncReplication, Full),
                (SyncReplication, Full),
                (ContinuousReplication, Full),
                (VolumeGroups, Full),
                (Resync, Full),
                (Failover, Full),
            ],
        };

        Self {
            backend,
            levels: levels.iter().copied().collect(),
            healthy: false,
            version: Option::None,
        }
    }

    pub fn level(&self, capability: Capability) -> CapabilityLevel {
        self.levels
            .get(&capability)
            .copied()
            .unwrap_or(CapabilityLevel::None)
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.level(capability) != CapabilityLevel::None
    }

    /// Reject a replication mode this backend cannot honour
    pub fn validate_mode(&self, mode: ReplicationMode) -> Result<CapabilityLevel> {
        match self.level(Capability::for_mode(mode)) {
            CapabilityLevel::None => Err(Error::UnsupportedMode {
                backend: self.backend,
                mode: mode.to_string(),
            }),
            level => Ok(level),
        }
    }
}
