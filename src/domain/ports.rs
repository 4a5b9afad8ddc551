//! Domain Ports - Boundary to the declarative-object substrate
//!
//! The operator core never talks to the cluster API directly. Discovery and
//! the backend adapters go through [`ResourceStore`], which the Kubernetes
//! store and the in-memory store implement.

use crate::domain::backend::ResourceKind;
use crate::error::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Owner Linkage
// =============================================================================

/// Owner reference pointing a backend resource back at its replication object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerLink {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: Option<String>,
}

impl OwnerLink {
    /// Render as a Kubernetes ownerReference
    pub fn to_owner_reference(&self) -> Value {
        json!({
            "apiVersion": self.api_version,
            "kind": self.kind,
            "name": self.name,
            "uid": self.uid.clone().unwrap_or_default(),
            "controller": true,
            "blockOwnerDeletion": true,
        })
    }
}

// =============================================================================
// Backend Resource Descriptor
// =============================================================================

/// What an adapter wants written to the backend's declarative resource
#[derive(Debug, Clone, PartialEq)]
pub struct BackendResource {
    pub kind: ResourceKind,
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub owner: Option<OwnerLink>,
    pub spec: Value,
}

impl BackendResource {
    pub fn new(kind: ResourceKind, namespace: &str, name: &str, spec: Value) -> Self {
        Self {
            kind,
            name: name.to_string(),
            namespace: namespace.to_string(),
            labels: BTreeMap::new(),
            annotations: BTreeMap::new(),
            owner: None,
            spec,
        }
    }

    pub fn with_owner(mut self, owner: Option<OwnerLink>) -> Self {
        self.owner = owner;
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Full manifest body for an apply request
    pub fn to_manifest(&self) -> Value {
        let mut metadata = json!({
            "name": self.name,
            "namespace": self.namespace,
        });
        if !self.labels.is_empty() {
            metadata["labels"] = json!(self.labels);
        }
        if !self.annotations.is_empty() {
            metadata["annotations"] = json!(self.annotations);
        }
        if let Some(owner) = &self.owner {
            metadata["ownerReferences"] = json!([owner.to_owner_reference()]);
        }

        json!({
            "apiVersion": self.kind.api_version(),
            "kind": self.kind.kind,
            "metadata": metadata,
            "spec": self.spec,
        })
    }

    /// Whether `existing` already reflects everything this descriptor writes
    pub fn is_satisfied_by(&self, existing: &StoredResource) -> bool {
        existing.spec == self.spec
            && contains_all(&existing.labels, &self.labels)
            && contains_all(&existing.annotations, &self.annotations)
            && match &self.owner {
                Some(owner) => existing.owners.iter().any(|o| o.name == owner.name && o.kind == owner.kind),
                None => true,
            }
    }
}

fn contains_all(have: &BTreeMap<String, String>, want: &BTreeMap<String, String>) -> bool {
    want.iter().all(|(k, v)| have.get(k) == Some(v))
}

/// A backend resource as read back from the store
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredResource {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub owners: Vec<OwnerLink>,
    pub spec: Value,
    pub status: Option<Value>,
}

/// Result of an apply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Updated,
}

// =============================================================================
// Resource Store Port
// =============================================================================

/// Port for the declarative-object substrate
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Stable identifier of the environment, used as discovery cache key
    fn environment_id(&self) -> String;

    /// Whether a CRD is registered and established
    async fn crd_exists(&self, crd_name: &str) -> Result<bool>;

    /// Served versions of a CRD, empty when absent
    async fn crd_versions(&self, crd_name: &str) -> Result<Vec<String>>;

    /// Read a resource
    async fn get(&self, kind: &ResourceKind, namespace: &str, name: &str)
        -> Result<Option<StoredResource>>;

    /// Create-or-update a resource
    async fn apply(&self, resource: &BackendResource) -> Result<ApplyOutcome>;

    /// Delete a resource, returning whether it existed
    async fn delete(&self, kind: &ResourceKind, namespace: &str, name: &str) -> Result<bool>;

    /// List resources whose labels match `selector`
    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<StoredResource>>;

    /// Labels of a PersistentVolumeClaim, `None` when the claim does not exist
    async fn volume_labels(&self, namespace: &str, pvc: &str)
        -> Result<Option<BTreeMap<String, String>>>;

    /// Set (`Some`) or remove (`None`) labels on a PersistentVolumeClaim
    async fn set_volume_labels(
        &self,
        namespace: &str,
        pvc: &str,
        labels: &BTreeMap<String, Option<String>>,
    ) -> Result<()>;

    /// Names of PersistentVolumeClaims whose labels match `selector`, sorted
    async fn list_volumes(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<String>>;
}

pub type ResourceStoreRef = Arc<dyn ResourceStore>;
