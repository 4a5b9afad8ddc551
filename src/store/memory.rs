//! In-memory resource store
//!
//! Backs standalone mode and the test suite. Tracks per-operation counters so
//! tests can assert idempotence, and supports failure injection by operation.

use crate::domain::{
    ApplyOutcome, Backend, BackendResource, ResourceKind, ResourceStore, StoredResource,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Store operation, for counters and failure injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    CrdQuery,
    Get,
    Apply,
    Delete,
    List,
    VolumeLabels,
    SetVolumeLabels,
    ListVolumes,
}

/// Kind of injected failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    /// 503, transient
    Unavailable,
    /// 422, permanent
    Rejected,
}

impl InjectedFailure {
    fn to_error(self, op: StoreOp) -> Error {
        let (code, reason) = match self {
            InjectedFailure::Unavailable => (503, "ServiceUnavailable"),
            InjectedFailure::Rejected => (422, "Invalid"),
        };
        Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".into(),
            message: format!("injected failure on {:?}", op),
            reason: reason.into(),
            code,
        }))
    }
}

type ObjectKey = (String, String, String);

fn key(kind: &ResourceKind, namespace: &str, name: &str) -> ObjectKey {
    (kind.crd_name(), namespace.to_string(), name.to_string())
}

/// In-memory implementation of [`ResourceStore`]
pub struct InMemoryResourceStore {
    environment: String,
    /// CRD name to served versions
    crds: DashMap<String, Vec<String>>,
    objects: DashMap<ObjectKey, StoredResource>,
    /// (namespace, claim) to labels
    volumes: DashMap<(String, String), BTreeMap<String, String>>,
    failures: Mutex<HashMap<StoreOp, (InjectedFailure, u32)>>,
    counters: DashMap<StoreOp, AtomicU64>,
    /// Delay applied after a CRD query has read its answer
    crd_latency: Mutex<Option<Duration>>,
}

impl Default for InMemoryResourceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryResourceStore {
    pub fn new() -> Self {
        Self {
            environment: "in-memory".to_string(),
            crds: DashMap::new(),
            objects: DashMap::new(),
            volumes: DashMap::new(),
            failures: Mutex::new(HashMap::new()),
            counters: DashMap::new(),
            crd_latency: Mutex::new(None),
        }
    }

    /// Store with every CRD of `backends` registered
    pub fn with_backends(backends: &[Backend]) -> Self {
        let store = Self::new();
        for backend in backends {
            store.install_backend(*backend);
        }
        store
    }

    pub fn with_environment(mut self, environment: &str) -> Self {
        self.environment = environment.to_string();
        self
    }

    // =========================================================================
    // Fixture Helpers
    // =========================================================================

    pub fn install_crd(&self, crd_name: &str, versions: &[&str]) {
        self.crds
            .insert(crd_name.to_string(), versions.iter().map(|v| v.to_string()).collect());
    }

    pub fn remove_crd(&self, crd_name: &str) {
        self.crds.remove(crd_name);
    }

    pub fn install_backend(&self, backend: Backend) {
        let version = backend.resource_kind().version;
        for crd in backend.required_crds() {
            self.install_crd(&crd, &[version]);
        }
    }

    pub fn uninstall_backend(&self, backend: Backend) {
        for crd in backend.required_crds() {
            self.remove_crd(&crd);
        }
    }

    pub fn add_volume(&self, namespace: &str, name: &str, labels: &[(&str, &str)]) {
        self.volumes.insert(
            (namespace.to_string(), name.to_string()),
            labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        );
    }

    /// Overwrite the status sub-object of a stored resource
    pub fn set_status(&self, kind: &ResourceKind, namespace: &str, name: &str, status: Value) {
        if let Some(mut object) = self.objects.get_mut(&key(kind, namespace, name)) {
            object.status = Some(status);
        }
    }

    pub fn resource(&self, kind: &ResourceKind, namespace: &str, name: &str) -> Option<StoredResource> {
        self.objects.get(&key(kind, namespace, name)).map(|o| o.clone())
    }

    /// Every stored resource of `kind`, sorted by namespace and name
    pub fn resources(&self, kind: &ResourceKind) -> Vec<StoredResource> {
        let crd = kind.crd_name();
        let mut out: Vec<StoredResource> = self
            .objects
            .iter()
            .filter(|entry| entry.key().0 == crd)
            .map(|entry| entry.value().clone())
            .collect();
        out.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        out
    }

    pub fn labels_of(&self, namespace: &str, pvc: &str) -> Option<BTreeMap<String, String>> {
        self.volumes
            .get(&(namespace.to_string(), pvc.to_string()))
            .map(|l| l.clone())
    }

    // =========================================================================
    // Failure Injection and Counters
    // =========================================================================

    /// Fail the next `times` calls of `op`
    pub fn fail_next(&self, op: StoreOp, failure: InjectedFailure, times: u32) {
        self.failures.lock().insert(op, (failure, times));
    }

    /// Fail every call of `op` until cleared
    pub fn fail_always(&self, op: StoreOp, failure: InjectedFailure) {
        self.fail_next(op, failure, u32::MAX);
    }

    /// Answer CRD queries as of call time but return only after `latency`
    pub fn set_crd_latency(&self, latency: Duration) {
        *self.crd_latency.lock() = Some(latency);
    }

    async fn crd_delay(&self) {
        let latency = *self.crd_latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    pub fn clear_failures(&self) {
        self.failures.lock().clear();
    }

    pub fn count(&self, op: StoreOp) -> u64 {
        self.counters
            .get(&op)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn crd_queries(&self) -> u64 {
        self.count(StoreOp::CrdQuery)
    }

    /// Mutating calls that reached the store: apply, delete, label writes
    pub fn write_count(&self) -> u64 {
        self.count(StoreOp::Apply) + self.count(StoreOp::Delete) + self.count(StoreOp::SetVolumeLabels)
    }

    fn enter(&self, op: StoreOp) -> Result<()> {
        self.counters
            .entry(op)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);

        let mut failures = self.failures.lock();
        let Some((failure, remaining)) = failures.get(&op).copied() else {
            return Ok(());
        };
        match remaining {
            u32::MAX => {}
            0 | 1 => {
                failures.remove(&op);
            }
            n => {
                failures.insert(op, (failure, n - 1));
            }
        }
        Err(failure.to_error(op))
    }
}

fn matches_selector(labels: &BTreeMap<String, String>, selector: &BTreeMap<String, String>) -> bool {
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

#[async_trait]
impl ResourceStore for InMemoryResourceStore {
    fn environment_id(&self) -> String {
        self.environment.clone()
    }

    async fn crd_exists(&self, crd_name: &str) -> Result<bool> {
        self.enter(StoreOp::CrdQuery)?;
        let found = self.crds.contains_key(crd_name);
        self.crd_delay().await;
        Ok(found)
    }

    async fn crd_versions(&self, crd_name: &str) -> Result<Vec<String>> {
        self.enter(StoreOp::CrdQuery)?;
        let versions = self.crds.get(crd_name).map(|v| v.clone()).unwrap_or_default();
        self.crd_delay().await;
        Ok(versions)
    }

    async fn get(&self, kind: &ResourceKind, namespace: &str, name: &str) -> Result<Option<StoredResource>> {
        self.enter(StoreOp::Get)?;
        Ok(self.resource(kind, namespace, name))
    }

    async fn apply(&self, resource: &BackendResource) -> Result<ApplyOutcome> {
        self.enter(StoreOp::Apply)?;
        if !self.crds.contains_key(&resource.kind.crd_name()) {
            return Err(Error::ResourceNotFound {
                kind: "CustomResourceDefinition".into(),
                name: resource.kind.crd_name(),
            });
        }

        let k = key(&resource.kind, &resource.namespace, &resource.name);
        let outcome = match self.objects.get_mut(&k) {
            Some(mut existing) => {
                existing.labels.extend(resource.labels.clone());
                existing.annotations.extend(resource.annotations.clone());
                if let Some(owner) = &resource.owner {
                    if !existing.owners.contains(owner) {
                        existing.owners.push(owner.clone());
                    }
                }
                existing.spec = resource.spec.clone();
                ApplyOutcome::Updated
            }
            None => {
                self.objects.insert(
                    k,
                    StoredResource {
                        name: resource.name.clone(),
                        namespace: resource.namespace.clone(),
                        labels: resource.labels.clone(),
                        annotations: resource.annotations.clone(),
                        owners: resource.owner.iter().cloned().collect(),
                        spec: resource.spec.clone(),
                        status: None,
                    },
                );
                ApplyOutcome::Created
            }
        };
        debug!("Applied {} {}/{}: {:?}", resource.kind, resource.namespace, resource.name, outcome);
        Ok(outcome)
    }

    async fn delete(&self, kind: &ResourceKind, namespace: &str, name: &str) -> Result<bool> {
        self.enter(StoreOp::Delete)?;
        Ok(self.objects.remove(&key(kind, namespace, name)).is_some())
    }

    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<StoredResource>> {
        self.enter(StoreOp::List)?;
        Ok(self
            .resources(kind)
            .into_iter()
            .filter(|o| o.namespace == namespace && matches_selector(&o.labels, selector))
            .collect())
    }

    async fn volume_labels(&self, namespace: &str, pvc: &str) -> Result<Option<BTreeMap<String, String>>> {
        self.enter(StoreOp::VolumeLabels)?;
        Ok(self.labels_of(namespace, pvc))
    }

    async fn set_volume_labels(
        &self,
        namespace: &str,
        pvc: &str,
        labels: &BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        self.enter(StoreOp::SetVolumeLabels)?;
        let mut volume = self
            .volumes
            .get_mut(&(namespace.to_string(), pvc.to_string()))
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "PersistentVolumeClaim".into(),
                name: format!("{}/{}", namespace, pvc),
            })?;
        for (k, v) in labels {
            match v {
                Some(v) => volume.insert(k.clone(), v.clone()),
                None => volume.remove(k),
            };
        }
        Ok(())
    }

    async fn list_volumes(&self, namespace: &str, selector: &BTreeMap<String, String>) -> Result<Vec<String>> {
        self.enter(StoreOp::ListVolumes)?;
        let mut names: Vec<String> = self
            .volumes
            .iter()
            .filter(|entry| entry.key().0 == namespace && matches_selector(entry.value(), selector))
            .map(|entry| entry.key().1.clone())
            .collect();
        names.sort();
        Ok(names)
    }
}
