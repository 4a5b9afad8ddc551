//! Ceph RBD Adapter
//!
//! Drives csi-addons `VolumeReplication` objects. The unified fields map
//! almost one to one onto the backend schema. Volume groups are modelled as
//! one `VolumeReplication` per member sharing a group label, since the
//! backend has no group object of its own.

use super::{
    aggregate_states, apply_if_changed, backend_error, ensure_live, owner_in, param, str_at,
    time_at, BackendParameters, BackendStatus, GroupReconcileResult, GroupReplicationAdapter,
    ReconcileResult, ReplicationAdapter,
};
use crate::crd::{
    ReplicationMode, ReplicationState, UnifiedVolumeReplication, UnifiedVolumeReplicationGroup,
    GROUP_LABEL, OWNER_LABEL,
};
use crate::domain::{Backend, BackendResource, ResourceStoreRef, StoredResource, VOLUME_REPLICATION};
use crate::error::{Error, Result};
use crate::replication::translation::{NativeState, TranslationEngine};
use async_trait::async_trait;
use serde_json::json;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Annotation carrying the RBD mirroring mode
pub const MIRRORING_MODE_ANNOTATION: &str = "replication.unified.io/mirroring-mode";
/// Annotation carrying the snapshot scheduling interval
pub const SCHEDULING_INTERVAL_ANNOTATION: &str = "replication.unified.io/scheduling-interval";

/// Adapter for csi-addons VolumeReplication
pub struct CephAdapter {
    store: ResourceStoreRef,
    translation: TranslationEngine,
}

/// Inputs shared by single-volume and group resources
struct CephRequest<'a> {
    namespace: &'a str,
    name: String,
    pvc: &'a str,
    state: ReplicationState,
    mode: ReplicationMode,
    class: &'a str,
}

impl CephAdapter {
    pub fn new(store: ResourceStoreRef) -> Self {
        Self {
            store,
            translation: TranslationEngine::new(),
        }
    }

    /// VolumeReplicationClass: explicit parameter, then the unified class
    /// name, then the source storage class
    fn replication_class<'a>(
        params: &'a BackendParameters,
        replication_class: Option<&'a str>,
        storage_class: &'a str,
    ) -> &'a str {
        param(params, "volumeReplicationClass")
            .or(replication_class)
            .unwrap_or(storage_class)
    }

    fn build(&self, req: &CephRequest<'_>, params: &BackendParameters) -> Result<(BackendResource, NativeState)> {
        let (state, mode) = self.translation.to_backend(req.state, req.mode, Backend::Ceph)?;

        let mut spec = json!({
            "volumeReplicationClass": req.class,
            "replicationState": state.as_str(),
            "dataSource": {
                "apiGroup": "",
                "kind": "PersistentVolumeClaim",
                "name": req.pvc,
            },
        });
        if let Some(auto_resync) = param(params, "autoResync") {
            spec["autoResync"] = json!(auto_resync == "true");
        }

        let mirroring = param(params, "mirroringMode").unwrap_or(mode.as_str());
        let mut resource = BackendResource::new(VOLUME_REPLICATION, req.namespace, &req.name, spec)
            .with_annotation(MIRRORING_MODE_ANNOTATION, mirroring);
        if let Some(interval) = param(params, "schedulingInterval") {
            resource = resource.with_annotation(SCHEDULING_INTERVAL_ANNOTATION, interval);
        }
        Ok((resource, state))
    }

    fn interpret(&self, stored: &StoredResource) -> Result<BackendStatus> {
        let status = stored.status.clone().unwrap_or_default();
        let native = str_at(&status, "/state").filter(|s| !s.eq_ignore_ascii_case("unknown"));

        let state = match native {
            Some(value) => Some(self.translation.from_backend_str(Backend::Ceph, value)?),
            None => None,
        };

        Ok(BackendStatus {
            found: true,
            state,
            native_state: native.map(str::to_string),
            message: str_at(&status, "/message").map(str::to_string),
            last_sync_time: time_at(&status, "/lastSyncTime"),
            last_sync_duration: str_at(&status, "/lastSyncDuration").map(str::to_string),
        })
    }

    fn member_name(group: &str, pvc: &str) -> String {
        format!("{}-{}", group, pvc)
    }

    fn group_selector(group: &str) -> BTreeMap<String, String> {
        BTreeMap::from([(GROUP_LABEL.to_string(), group.to_string())])
    }
}

#[async_trait]
impl ReplicationAdapter for CephAdapter {
    fn backend(&self) -> Backend {
        Backend::Ceph
    }

    async fn reconcile(
        &self,
        cancel: &CancellationToken,
        intent: &UnifiedVolumeReplication,
        params: &BackendParameters,
    ) -> Result<ReconcileResult> {
        ensure_live(cancel)?;
        let namespace = intent.source_pvc_namespace();
        let spec = &intent.spec;

        let request = CephRequest {
            namespace: &namespace,
            name: intent.name(),
            pvc: &spec.volume_mapping.source.name,
            state: spec.replication_state,
            mode: spec.replication_mode,
            class: Self::replication_class(
                params,
                spec.replication_class.as_deref(),
                &spec.source_endpoint.storage_class,
            ),
        };
        let (resource, native_state) = self.build(&request, params)?;
        let resource = resource
            .with_owner(owner_in(intent.owner_link(), &intent.namespace_or_default(), &namespace))
            .with_label(OWNER_LABEL, intent.name());

        let outcome = apply_if_changed(self.store.as_ref(), &resource)
            .await
            .map_err(|e| backend_error(Backend::Ceph, "apply", e))?;

        if let Some(outcome) = outcome {
            info!(
                "VolumeReplication {}/{} {:?} with replicationState={}",
                namespace, resource.name, outcome, native_state
            );
        }

        Ok(ReconcileResult {
            backend: Backend::Ceph,
            resource_name: resource.name,
            native_state,
            outcome,
        })
    }

    async fn delete(&self, cancel: &CancellationToken, intent: &UnifiedVolumeReplication) -> Result<()> {
        ensure_live(cancel)?;
        let namespace = intent.source_pvc_namespace();
        let existed = self
            .store
            .delete(&VOLUME_REPLICATION, &namespace, &intent.name())
            .await
            .map_err(|e| backend_error(Backend::Ceph, "delete", e))?;
        debug!("Deleted VolumeReplication {}/{} (existed={})", namespace, intent.name(), existed);
        Ok(())
    }

    async fn get_status(
        &self,
        cancel: &CancellationToken,
        intent: &UnifiedVolumeReplication,
    ) -> Result<BackendStatus> {
        ensure_live(cancel)?;
        let stored = self
            .store
            .get(&VOLUME_REPLICATION, &intent.source_pvc_namespace(), &intent.name())
            .await
            .map_err(|e| backend_error(Backend::Ceph, "get", e))?;

        match stored {
            Some(stored) => self.interpret(&stored),
            None => Ok(BackendStatus::not_found()),
        }
    }
}

#[async_trait]
impl GroupReplicationAdapter for CephAdapter {
    fn group_backend(&self) -> Backend {
        Backend::Ceph
    }

    async fn reconcile_group(
        &self,
        cancel: &CancellationToken,
        group: &UnifiedVolumeReplicationGroup,
        members: &[String],
        params: &BackendParameters,
    ) -> Result<GroupReconcileResult> {
        let namespace = group.namespace_or_default();
        let group_name = group.name();
        let spec = &group.spec;
        let class = Self::replication_class(
            params,
            spec.replication_class.as_deref(),
            &spec.source_endpoint.storage_class,
        );

        let mut writes = 0;
        let mut resources = Vec::with_capacity(members.len());
        let mut native_state = self.translation.safe_default(Backend::Ceph);

        for pvc in members {
            ensure_live(cancel)?;
            let request = CephRequest {
                namespace: &namespace,
                name: Self::member_name(&group.backend_name(), pvc),
                pvc,
                state: spec.replication_state,
                mode: spec.replication_mode,
                class,
            };
            let (resource, state) = self.build(&request, params)?;
            native_state = state;
            let resource = resource
                .with_owner(Some(group.owner_link()))
                .with_label(GROUP_LABEL, group_name.clone());

            if apply_if_changed(self.store.as_ref(), &resource)
                .await
                .map_err(|e| backend_error(Backend::Ceph, "apply", e))?
                .is_some()
            {
                writes += 1;
            }
            resources.push(resource.name);
        }

        // Drop members that no longer match the selector
        let existing = self
            .store
            .list(&VOLUME_REPLICATION, &namespace, &Self::group_selector(&group_name))
            .await
            .map_err(|e| backend_error(Backend::Ceph, "list", e))?;
        for stale in existing.iter().filter(|r| !resources.contains(&r.name)) {
            ensure_live(cancel)?;
            info!("Pruning VolumeReplication {}/{} from group {}", namespace, stale.name, group_name);
            self.store
                .delete(&VOLUME_REPLICATION, &namespace, &stale.name)
                .await
                .map_err(|e| backend_error(Backend::Ceph, "delete", e))?;
            writes += 1;
        }

        Ok(GroupReconcileResult {
            backend: Backend::Ceph,
            native_state,
            resources,
            members: members.to_vec(),
            writes,
        })
    }

    async fn delete_group(&self, cancel: &CancellationToken, group: &UnifiedVolumeReplicationGroup) -> Result<()> {
        let namespace = group.namespace_or_default();
        let existing = self
            .store
            .list(&VOLUME_REPLICATION, &namespace, &Self::group_selector(&group.name()))
            .await
            .map_err(|e| backend_error(Backend::Ceph, "list", e))?;

        for resource in existing {
            ensure_live(cancel)?;
            self.store
                .delete(&VOLUME_REPLICATION, &namespace, &resource.name)
                .await
                .map_err(|e| backend_error(Backend::Ceph, "delete", e))?;
        }
        Ok(())
    }

    async fn group_status(
        &self,
        cancel: &CancellationToken,
        group: &UnifiedVolumeReplicationGroup,
        members: &[String],
    ) -> Result<BackendStatus> {
        ensure_live(cancel)?;
        let namespace = group.namespace_or_default();
        let group_name = group.name();

        let mut states = Vec::with_capacity(members.len());
        let mut last_sync = None;
        for pvc in members {
            let name = Self::member_name(&group.backend_name(), pvc);
            let stored = self
                .store
                .get(&VOLUME_REPLICATION, &namespace, &name)
                .await
                .map_err(|e| backend_error(Backend::Ceph, "get", e))?;
            let status = match stored {
                Some(stored) => self.interpret(&stored)?,
                None => BackendStatus::not_found(),
            };
            // Oldest member sync bounds the group
            last_sync = match (last_sync, status.last_sync_time) {
                (Some(a), Some(b)) => Some(std::cmp::min(a, b)),
                (a, b) => a.or(b),
            };
            states.push((pvc.clone(), status.state));
        }

        if states.is_empty() {
            return Err(Error::InvalidSpec(format!(
                "group {} matches no PersistentVolumeClaims",
                group_name
            )));
        }

        let (state, message) = aggregate_states(&states);
        Ok(BackendStatus {
            found: true,
            state,
            native_state: None,
            message,
            last_sync_time: last_sync,
            last_sync_duration: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::adapters::test_support::{group, intent, pg_members, simple_intent};
    use crate::store::memory::InMemoryResourceStore;
    use std::sync::Arc;

    fn setup() -> (Arc<InMemoryResourceStore>, CephAdapter) {
        let store = Arc::new(InMemoryResourceStore::with_backends(&[Backend::Ceph]));
        let adapter = CephAdapter::new(store.clone());
        (store, adapter)
    }

    #[tokio::test]
    async fn test_primary_create_passthrough() {
        let (store, adapter) = setup();
        let uvr = intent(
            "db",
            json!({
                "replicationState": "primary",
                "volumeMapping": {"source": {"name": "data"}},
                "sourceEndpoint": {"cluster": "east", "storageClass": "rbd"},
                "destinationEndpoint": {"cluster": "west", "storageClass": "rbd"},
                "replicationClass": "rbd"
            }),
        );

        let result = adapter
            .reconcile(&CancellationToken::new(), &uvr, &BackendParameters::new())
            .await
            .unwrap();
        assert_eq!(result.native_state.as_str(), "primary");

        let stored = store.resource(&VOLUME_REPLICATION, "apps", "db").unwrap();
        assert_eq!(stored.spec["replicationState"], "primary");
        assert_eq!(stored.spec["volumeReplicationClass"], "rbd");
        assert_eq!(stored.spec["dataSource"]["name"], "data");
        assert_eq!(stored.spec["dataSource"]["kind"], "PersistentVolumeClaim");
        assert_eq!(stored.owners[0].name, "db");
        assert_eq!(stored.annotations[MIRRORING_MODE_ANNOTATION], "snapshot");
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let (store, adapter) = setup();
        let uvr = simple_intent("db", "source", "ceph-rbd");
        let cancel = CancellationToken::new();

        adapter.reconcile(&cancel, &uvr, &BackendParameters::new()).await.unwrap();
        let writes = store.write_count();
        let second = adapter.reconcile(&cancel, &uvr, &BackendParameters::new()).await.unwrap();

        assert_eq!(second.outcome, None);
        assert_eq!(store.write_count(), writes);
    }

    #[tokio::test]
    async fn test_synchronous_mode_rejected() {
        let (store, adapter) = setup();
        let mut uvr = simple_intent("db", "source", "ceph-rbd");
        uvr.spec.replication_mode = ReplicationMode::Synchronous;

        let err = adapter
            .reconcile(&CancellationToken::new(), &uvr, &BackendParameters::new())
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "UnsupportedMode");
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn test_status_reverse_translation() {
        let (store, adapter) = setup();
        let uvr = simple_intent("db", "replica", "ceph-rbd");
        let cancel = CancellationToken::new();
        adapter.reconcile(&cancel, &uvr, &BackendParameters::new()).await.unwrap();

        store.set_status(
            &VOLUME_REPLICATION,
            "apps",
            "db",
            json!({"state": "Secondary", "lastSyncTime": "2026-01-02T03:04:05Z", "lastSyncDuration": "12s"}),
        );
        let status = adapter.get_status(&cancel, &uvr).await.unwrap();
        assert_eq!(status.state, Some(ReplicationState::Replica));
        assert_eq!(status.last_sync_duration.as_deref(), Some("12s"));
        assert!(status.last_sync_time.is_some());

        store.set_status(&VOLUME_REPLICATION, "apps", "db", json!({"state": "Unknown"}));
        assert_eq!(adapter.get_status(&cancel, &uvr).await.unwrap().state, None);
    }

    #[tokio::test]
    async fn test_group_one_resource_per_member_and_prune() {
        let (store, adapter) = setup();
        let g = group("pg", "source", "ceph-rbd");
        let cancel = CancellationToken::new();

        let result = adapter
            .reconcile_group(&cancel, &g, &pg_members(), &BackendParameters::new())
            .await
            .unwrap();
        assert_eq!(result.resources, vec!["uvrg-pg-pg-0", "uvrg-pg-pg-1", "uvrg-pg-pg-2"]);
        assert_eq!(result.writes, 3);

        let stored = store.resources(&VOLUME_REPLICATION);
        assert_eq!(stored.len(), 3);
        assert!(stored.iter().all(|r| r.labels[GROUP_LABEL] == "pg"));

        let remaining = vec!["pg-0".to_string(), "pg-2".to_string()];
        let result = adapter
            .reconcile_group(&cancel, &g, &remaining, &BackendParameters::new())
            .await
            .unwrap();
        assert_eq!(result.writes, 1, "only the prune is a write");
        assert!(store.resource(&VOLUME_REPLICATION, "apps", "uvrg-pg-pg-1").is_none());
    }

    #[tokio::test]
    async fn test_delete_group_removes_members() {
        let (store, adapter) = setup();
        let g = group("pg", "source", "ceph-rbd");
        let cancel = CancellationToken::new();
        adapter
            .reconcile_group(&cancel, &g, &pg_members(), &BackendParameters::new())
            .await
            .unwrap();

        adapter.delete_group(&cancel, &g).await.unwrap();
        assert!(store.resources(&VOLUME_REPLICATION).is_empty());
    }
}
