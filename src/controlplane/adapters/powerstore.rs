//! Dell PowerStore Adapter
//!
//! Drives `DellCSIReplicationGroup` objects. Unified states become action
//! verbs. The backend finds its volumes through a label selector, so every
//! reconcile is a two-object write: label the claim(s), then write the group
//! with a selector matching that label. A failure of the second write after
//! the first succeeded is reported as [`Error::PartialWrite`]; the label
//! write is skipped on the next pass because it is already in place.

use super::{
    apply_if_changed, backend_error, ensure_live, owner_in, param, str_at, time_at,
    BackendParameters, BackendStatus, GroupReconcileResult, GroupReplicationAdapter,
    ReconcileResult, ReplicationAdapter,
};
use crate::crd::{
    ReplicationMode, ReplicationState, Schedule, UnifiedVolumeReplication,
    UnifiedVolumeReplicationGroup, GROUP_LABEL, OWNER_LABEL,
};
use crate::domain::{
    ApplyOutcome, Backend, BackendResource, ResourceStoreRef, StoredResource,
    DELL_REPLICATION_GROUP,
};
use crate::error::{Error, Result};
use crate::replication::translation::{powerstore_rpo, NativeState, TranslationEngine};
use async_trait::async_trait;
use serde_json::json;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Label placed on every claim a replication group selects
pub const VOLUME_GROUP_LABEL: &str = "replication.storage.dell.com/group";

/// CSI driver the replication group belongs to
pub const DRIVER_NAME: &str = "csi-powerstore.dellemc.com";

/// Adapter for Dell CSI replication groups
pub struct PowerStoreAdapter {
    store: ResourceStoreRef,
    translation: TranslationEngine,
}

struct PowerStoreRequest<'a> {
    namespace: &'a str,
    name: String,
    state: ReplicationState,
    mode: ReplicationMode,
    schedule: &'a Schedule,
    remote_cluster: &'a str,
}

impl PowerStoreAdapter {
    pub fn new(store: ResourceStoreRef) -> Self {
        Self {
            store,
            translation: TranslationEngine::new(),
        }
    }

    fn selector(group: &str) -> BTreeMap<String, String> {
        BTreeMap::from([(VOLUME_GROUP_LABEL.to_string(), group.to_string())])
    }

    fn build(&self, req: &PowerStoreRequest<'_>, params: &BackendParameters) -> Result<(BackendResource, NativeState)> {
        let (action, mode) = self.translation.to_backend(req.state, req.mode, Backend::PowerStore)?;

        let rpo = match param(params, "rpo").or(req.schedule.rpo.as_deref()) {
            Some(value) => powerstore_rpo(value)?,
            None => {
                return Err(Error::Configuration(format!(
                    "{}: powerstore requires an rpo parameter or schedule.rpo",
                    req.name
                )))
            }
        };

        let mut spec = json!({
            "driverName": DRIVER_NAME,
            "action": action.as_str(),
            "rpo": rpo,
            "mode": mode.as_str(),
            "remoteClusterId": param(params, "remoteClusterId").unwrap_or(req.remote_cluster),
            "pvcSelector": {"matchLabels": Self::selector(&req.name)},
        });
        if let Some(policy) = param(params, "protectionPolicy") {
            spec["protectionPolicy"] = json!(policy);
        }
        if let Some(remote) = param(params, "remoteSystem") {
            spec["remoteSystem"] = json!(remote);
        }

        Ok((
            BackendResource::new(DELL_REPLICATION_GROUP, req.namespace, &req.name, spec),
            action,
        ))
    }

    /// Put the group label on `pvc`, returning whether a write was issued
    async fn label_volume(&self, namespace: &str, pvc: &str, group: &str) -> Result<bool> {
        let labels = self
            .store
            .volume_labels(namespace, pvc)
            .await
            .map_err(|e| backend_error(Backend::PowerStore, "read volume labels", e))?
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "PersistentVolumeClaim".into(),
                name: format!("{}/{}", namespace, pvc),
            })?;

        match labels.get(VOLUME_GROUP_LABEL) {
            Some(current) if current == group => return Ok(false),
            Some(current) => warn!(
                "Claim {}/{} moves from replication group {} to {}",
                namespace, pvc, current, group
            ),
            None => {}
        }

        let patch = BTreeMap::from([(VOLUME_GROUP_LABEL.to_string(), Some(group.to_string()))]);
        self.store
            .set_volume_labels(namespace, pvc, &patch)
            .await
            .map_err(|e| backend_error(Backend::PowerStore, "label volume", e))?;
        debug!("Labelled claim {}/{} for group {}", namespace, pvc, group);
        Ok(true)
    }

    /// Remove the group label; a claim that is already gone is fine
    async fn unlabel_volume(&self, namespace: &str, pvc: &str) -> Result<()> {
        let patch = BTreeMap::from([(VOLUME_GROUP_LABEL.to_string(), None)]);
        match self.store.set_volume_labels(namespace, pvc, &patch).await {
            Ok(()) | Err(Error::ResourceNotFound { .. }) => Ok(()),
            Err(e) => Err(backend_error(Backend::PowerStore, "unlabel volume", e)),
        }
    }

    /// Second half of the two-object write
    async fn write_group(&self, resource: &BackendResource) -> Result<Option<ApplyOutcome>> {
        apply_if_changed(self.store.as_ref(), resource)
            .await
            .map_err(|e| Error::PartialWrite {
                backend: Backend::PowerStore,
                completed: "volume label".into(),
                pending: "replication group".into(),
                reason: e.to_string(),
            })
    }

    async fn remove_group(&self, namespace: &str, name: &str) -> Result<()> {
        let existed = self
            .store
            .delete(&DELL_REPLICATION_GROUP, namespace, name)
            .await
            .map_err(|e| backend_error(Backend::PowerStore, "delete", e))?;
        debug!("Deleted DellCSIReplicationGroup {}/{} (existed={})", namespace, name, existed);
        Ok(())
    }

    fn interpret(&self, stored: &StoredResource) -> Result<BackendStatus> {
        let status = stored.status.clone().unwrap_or_default();
        let native = str_at(&status, "/lastAction/action").or_else(|| str_at(&stored.spec, "/action"));
        let failed = str_at(&status, "/state")
            .map(|s| s.eq_ignore_ascii_case("failed") || s.eq_ignore_ascii_case("error"))
            .unwrap_or(false);

        let state = match native {
            _ if failed => Some(ReplicationState::Failed),
            Some(value) => Some(self.translation.from_backend_str(Backend::PowerStore, value)?),
            None => None,
        };

        Ok(BackendStatus {
            found: true,
            state,
            native_state: native.map(str::to_string),
            message: str_at(&status, "/lastAction/condition")
                .or_else(|| str_at(&status, "/message"))
                .map(str::to_string),
            last_sync_time: time_at(&status, "/lastAction/time"),
            last_sync_duration: None,
        })
    }

    async fn fetch_status(&self, namespace: &str, name: &str) -> Result<BackendStatus> {
        let stored = self
            .store
            .get(&DELL_REPLICATION_GROUP, namespace, name)
            .await
            .map_err(|e| backend_error(Backend::PowerStore, "get", e))?;
        match stored {
            Some(stored) => self.interpret(&stored),
            None => Ok(BackendStatus::not_found()),
        }
    }
}

#[async_trait]
impl ReplicationAdapter for PowerStoreAdapter {
    fn backend(&self) -> Backend {
        Backend::PowerStore
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
        let req = PowerStoreRequest {
            namespace: &namespace,
            name: intent.name(),
            state: spec.replication_state,
            mode: spec.replication_mode,
            schedule: &spec.schedule,
            remote_cluster: &spec.destination_endpoint.cluster,
        };
        let (resource, action) = self.build(&req, params)?;
        let resource = resource
            .with_owner(owner_in(intent.owner_link(), &intent.namespace_or_default(), &namespace))
            .with_label(OWNER_LABEL, intent.name());

        self.label_volume(&namespace, &spec.volume_mapping.source.name, &req.name)
            .await?;
        ensure_live(cancel)?;

        let outcome = self.write_group(&resource).await?;
        if let Some(outcome) = outcome {
            info!(
                "DellCSIReplicationGroup {}/{} {:?} with action={}",
                namespace, resource.name, outcome, action
            );
        }

        Ok(ReconcileResult {
            backend: Backend::PowerStore,
            resource_name: resource.name,
            native_state: action,
            outcome,
        })
    }

    async fn delete(&self, cancel: &CancellationToken, intent: &UnifiedVolumeReplication) -> Result<()> {
        ensure_live(cancel)?;
        let namespace = intent.source_pvc_namespace();
        self.remove_group(&namespace, &intent.name()).await?;
        self.unlabel_volume(&namespace, &intent.spec.volume_mapping.source.name)
            .await
    }

    async fn get_status(
        &self,
        cancel: &CancellationToken,
        intent: &UnifiedVolumeReplication,
    ) -> Result<BackendStatus> {
        ensure_live(cancel)?;
        self.fetch_status(&intent.source_pvc_namespace(), &intent.name())
            .await
    }
}

#[async_trait]
impl GroupReplicationAdapter for PowerStoreAdapter {
    fn group_backend(&self) -> Backend {
        Backend::PowerStore
    }

    async fn reconcile_group(
        &self,
        cancel: &CancellationToken,
        group: &UnifiedVolumeReplicationGroup,
        members: &[String],
        params: &BackendParameters,
    ) -> Result<GroupReconcileResult> {
        ensure_live(cancel)?;
        let namespace = group.namespace_or_default();
        let name = group.backend_name();
        let spec = &group.spec;
        let req = PowerStoreRequest {
            namespace: &namespace,
            name: name.clone(),
            state: spec.replication_state,
            mode: spec.replication_mode,
            schedule: &spec.schedule,
            remote_cluster: &spec.destination_endpoint.cluster,
        };
        let (resource, action) = self.build(&req, params)?;
        let resource = resource
            .with_owner(Some(group.owner_link()))
            .with_label(GROUP_LABEL, group.name());

        let mut writes = 0u32;
        for pvc in members {
            ensure_live(cancel)?;
            if self.label_volume(&namespace, pvc, &name).await? {
                writes += 1;
            }
        }

        let labelled = self
            .store
            .list_volumes(&namespace, &Self::selector(&name))
            .await
            .map_err(|e| backend_error(Backend::PowerStore, "list volumes", e))?;
        for stale in labelled.iter().filter(|pvc| !members.contains(pvc)) {
            info!("Claim {}/{} left replication group {}", namespace, stale, name);
            self.unlabel_volume(&namespace, stale).await?;
            writes += 1;
        }
        ensure_live(cancel)?;

        let outcome = self.write_group(&resource).await?;
        if outcome.is_some() {
            writes += 1;
            info!(
                "DellCSIReplicationGroup {}/{} selects {} volumes with action={}",
                namespace,
                name,
                members.len(),
                action
            );
        }

        Ok(GroupReconcileResult {
            backend: Backend::PowerStore,
            native_state: action,
            resources: vec![resource.name],
            members: members.to_vec(),
            writes,
        })
    }

    async fn delete_group(&self, cancel: &CancellationToken, group: &UnifiedVolumeReplicationGroup) -> Result<()> {
        ensure_live(cancel)?;
        let namespace = group.namespace_or_default();
        let name = group.backend_name();
        self.remove_group(&namespace, &name).await?;

        let labelled = self
            .store
            .list_volumes(&namespace, &Self::selector(&name))
            .await
            .map_err(|e| backend_error(Backend::PowerStore, "list volumes", e))?;
        for pvc in &labelled {
            self.unlabel_volume(&namespace, pvc).await?;
        }
        Ok(())
    }

    async fn group_status(
        &self,
        cancel: &CancellationToken,
        group: &UnifiedVolumeReplicationGroup,
        _members: &[String],
    ) -> Result<BackendStatus> {
        ensure_live(cancel)?;
        self.fetch_status(&group.namespace_or_default(), &group.backend_name())
            .await
    }
}
