//! Unified Replication Operator
//!
//! A Kubernetes operator exposing one declarative volume-replication API and
//! driving Ceph RBD (csi-addons), NetApp Trident and Dell PowerStore
//! replication underneath it.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                    UnifiedVolumeReplication / ...Group                       │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                     Controller (finalizer + status)                          │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                          Orchestrator                                        │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │   Discovery     │  │  State Machine  │  │      Translation            │  │
//! │  │   (TTL cache)   │  │                 │  │      Engine                 │  │
//! │  └────────┬────────┘  └────────┬────────┘  └─────────────┬───────────────┘  │
//! │           └────────────────────┼─────────────────────────┘                   │
//! │                    ┌───────────┴───────────┐                                │
//! │                    │  Retry + Circuit      │                                │
//! │                    │  Breaker              │                                │
//! │                    └───────────┬───────────┘                                │
//! ├────────────────────────────────┼────────────────────────────────────────────┤
//! │                         Adapter Registry                                     │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────────┐  │
//! │  │      Ceph       │  │     Trident     │  │        PowerStore           │  │
//! │  │VolumeReplication│  │ MirrorRelation  │  │  ReplicationGroup + labels  │  │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────────┘  │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                 ResourceStore (Kubernetes | in-memory)                       │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: orchestrator, discovery, adapters, resilience, API
//! - [`controller`]: kube runtime controllers for both resources
//! - [`replication`]: state machine and translation tables
//! - [`crd`]: Custom Resource Definitions
//! - [`store`]: resource store implementations
//! - [`domain`]: backend identities and the store port
//! - [`config`]: operator configuration
//! - [`error`]: Error types and handling

pub mod config;
pub mod controller;
pub mod controlplane;
pub mod crd;
pub mod domain;
pub mod error;
pub mod replication;
pub mod store;

// Re-export commonly used types
pub use config::{ControllerConfig, OperatorConfig, ReplicationClassConfig};

pub use controlplane::{
    AdapterRegistry, ApiServer, ApiServerConfig, DiscoveryEngine, DiscoverySnapshot,
    MetricsSnapshot, Operation, Orchestrator, OrchestratorConfig, Resilience,
};

pub use crd::{
    ReplicationMode, ReplicationState, UnifiedVolumeReplication, UnifiedVolumeReplicationGroup,
    UnifiedVolumeReplicationGroupSpec, UnifiedVolumeReplicationGroupStatus,
    UnifiedVolumeReplicationSpec, UnifiedVolumeReplicationStatus,
};

pub use domain::{Backend, ResourceStore, ResourceStoreRef};

pub use error::{Error, ErrorAction, Result};

pub use replication::TranslationEngine;

pub use store::{InMemoryResourceStore, KubeResourceStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
