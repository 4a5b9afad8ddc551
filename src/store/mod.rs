//! Resource store implementations
//!
//! - [`kubernetes`]: the cluster API through `kube`
//! - [`memory`]: in-process store for standalone mode and tests

pub mod kubernetes;
pub mod memory;

pub use kubernetes::{KubeResourceStore, FIELD_MANAGER};
pub use memory::{InMemoryResourceStore, InjectedFailure, StoreOp};
