//! NetApp Trident Adapter
//!
//! Drives `TridentMirrorRelationship` objects. Unified states become the
//! state nouns Trident accepts (`established`, `reestablished`, `promoted`).
//! A volume group is a single relationship listing every member mapping.

use super::{
    aggregate_states, apply_if_changed, backend_error, ensure_live, owner_in, param, str_at,
    time_at, BackendParameters, BackendStatus, GroupReconcileResult, GroupReplicationAdapter,
    ReconcileResult, ReplicationAdapter,
};
use crate::crd::{
    ReplicationMode, ReplicationState, Schedule, UnifiedVolumeReplication,
    UnifiedVolumeReplicationGroup, GROUP_LABEL, OWNER_LABEL,
};
use crate::domain::{
    Backend, BackendResource, ResourceStoreRef, StoredResource, TRIDENT_MIRROR_RELATIONSHIP,
};
use crate::error::{Error, Result};
use crate::replication::translation::{NativeState, TranslationEngine};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Adapter for Trident mirror relationships
pub struct TridentAdapter {
    store: ResourceStoreRef,
    translation: TranslationEngine,
}

/// One local claim and its remote counterpart
struct Mapping {
    local_pvc: String,
    remote_handle: String,
}

struct TridentRequest<'a> {
    namespace: &'a str,
    name: String,
    state: ReplicationState,
    mode: ReplicationMode,
    schedule: &'a Schedule,
    mappings: Vec<Mapping>,
}

impl TridentAdapter {
    pub fn new(store: ResourceStoreRef) -> Self {
        Self {
            store,
            translation: TranslationEngine::new(),
        }
    }

    fn build(&self, req: &TridentRequest<'_>, params: &BackendParameters) -> Result<(BackendResource, NativeState)> {
        let (native_state, native_mode) = self.translation.to_backend(req.state, req.mode, Backend::Trident)?;

        let policy = param(params, "replicationPolicy").unwrap_or(native_mode.as_str());
        let volume_mappings: Vec<Value> = req
            .mappings
            .iter()
            .map(|m| {
                json!({
                    "localPVCName": m.local_pvc,
                    "remoteVolumeHandle": m.remote_handle,
                })
            })
            .collect();

        let mut spec = json!({
            "state": native_state.as_str(),
            "replicationPolicy": policy,
            "volumeMappings": volume_mappings,
        });
        if let Some(schedule) = param(params, "replicationSchedule").or(req.schedule.rpo.as_deref()) {
            spec["replicationSchedule"] = json!(schedule);
        }

        Ok((
            BackendResource::new(TRIDENT_MIRROR_RELATIONSHIP, req.namespace, &req.name, spec),
            native_state,
        ))
    }

    fn remote_handle(intent: &UnifiedVolumeReplication, params: &BackendParameters) -> Result<String> {
        intent
            .spec
            .volume_mapping
            .destination
            .volume_handle
            .as_deref()
            .filter(|h| !h.trim().is_empty())
            .or_else(|| param(params, "remoteVolumeHandle"))
            .map(str::to_string)
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "{}: trident requires volumeMapping.destination.volumeHandle or a remoteVolumeHandle parameter",
                    intent.name()
                ))
            })
    }

    /// Per-mapping states, from `status.conditions` or the top-level state
    fn native_states(stored: &StoredResource) -> Vec<(String, String)> {
        let status = stored.status.clone().unwrap_or_default();
        let per_mapping: Vec<(String, String)> = status
            .get("conditions")
            .and_then(Value::as_array)
            .map(|conditions| {
                conditions
                    .iter()
                    .filter_map(|c| {
                        let state = c.get("state").and_then(Value::as_str)?;
                        let pvc = c.get("localPVCName").and_then(Value::as_str).unwrap_or(&stored.name);
                        Some((pvc.to_string(), state.to_string()))
                    })
                    .collect()
            })
            .unwrap_or_default();

        if !per_mapping.is_empty() {
            return per_mapping;
        }
        str_at(&status, "/state")
            .map(|s| vec![(stored.name.clone(), s.to_string())])
            .unwrap_or_default()
    }

    fn interpret(&self, stored: &StoredResource) -> Result<BackendStatus> {
        let natives = Self::native_states(stored);
        let mut states = Vec::with_capacity(natives.len());
        for (pvc, value) in &natives {
            states.push((pvc.clone(), Some(self.translation.from_backend_str(Backend::Trident, value)?)));
        }

        let status = stored.status.clone().unwrap_or_default();
        let (state, disagreement) = if states.is_empty() {
            (None, None)
        } else {
            aggregate_states(&states)
        };

        Ok(BackendStatus {
            found: true,
            state,
            native_state: natives.first().map(|(_, s)| s.clone()),
            message: disagreement.or_else(|| str_at(&status, "/message").map(str::to_string)),
            last_sync_time: time_at(&status, "/lastTransferTime")
                .or_else(|| time_at(&status, "/conditions/0/lastTransitionTime")),
            last_sync_duration: None,
        })
    }

    async fn fetch(&self, namespace: &str, name: &str) -> Result<Option<StoredResource>> {
        self.store
            .get(&TRIDENT_MIRROR_RELATIONSHIP, namespace, name)
            .await
            .map_err(|e| backend_error(Backend::Trident, "get", e))
    }
}

#[async_trait]
impl ReplicationAdapter for TridentAdapter {
    fn backend(&self) -> Backend {
        Backend::Trident
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
        let req = TridentRequest {
            namespace: &namespace,
            name: intent.name(),
            state: spec.replication_state,
            mode: spec.replication_mode,
            schedule: &spec.schedule,
            mappings: vec![Mapping {
                local_pvc: spec.volume_mapping.source.name.clone(),
                remote_handle: Self::remote_handle(intent, params)?,
            }],
        };

        let (resource, native_state) = self.build(&req, params)?;
        let resource = resource
            .with_owner(owner_in(intent.owner_link(), &intent.namespace_or_default(), &namespace))
            .with_label(OWNER_LABEL, intent.name());

        let outcome = apply_if_changed(self.store.as_ref(), &resource)
            .await
            .map_err(|e| backend_error(Backend::Trident, "apply", e))?;
        if let Some(outcome) = outcome {
            info!(
                "TridentMirrorRelationship {}/{} {:?} with state={}",
                namespace, resource.name, outcome, native_state
            );
        }

        Ok(ReconcileResult {
            backend: Backend::Trident,
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
            .delete(&TRIDENT_MIRROR_RELATIONSHIP, &namespace, &intent.name())
            .await
            .map_err(|e| backend_error(Backend::Trident, "delete", e))?;
        debug!("Deleted TridentMirrorRelationship {}/{} (existed={})", namespace, intent.name(), existed);
        Ok(())
    }

    async fn get_status(
        &self,
        cancel: &CancellationToken,
        intent: &UnifiedVolumeReplication,
    ) -> Result<BackendStatus> {
        ensure_live(cancel)?;
        match self.fetch(&intent.source_pvc_namespace(), &intent.name()).await? {
            Some(stored) => self.interpret(&stored),
            None => Ok(BackendStatus::not_found()),
        }
    }
}

#[async_trait]
impl GroupReplicationAdapter for TridentAdapter {
    fn group_backend(&self) -> Backend {
        Backend::Trident
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
        let spec = &group.spec;
        let req = TridentRequest {
            namespace: &namespace,
            name: group.backend_name(),
            state: spec.replication_state,
            mode: spec.replication_mode,
            schedule: &spec.schedule,
            mappings: members
                .iter()
                .map(|pvc| Mapping {
                    local_pvc: pvc.clone(),
                    remote_handle: spec.remote_handle_for(pvc),
                })
                .collect(),
        };

        let (resource, native_state) = self.build(&req, params)?;
        let resource = resource
            .with_owner(Some(group.owner_link()))
            .with_label(GROUP_LABEL, group.name());

        let outcome = apply_if_changed(self.store.as_ref(), &resource)
            .await
            .map_err(|e| backend_error(Backend::Trident, "apply", e))?;
        if outcome.is_some() {
            info!(
                "TridentMirrorRelationship {}/{} spans {} volumes with state={}",
                namespace,
                resource.name,
                members.len(),
                native_state
            );
        }

        Ok(GroupReconcileResult {
            backend: Backend::Trident,
            native_state,
            resources: vec![resource.name],
            members: members.to_vec(),
            writes: u32::from(outcome.is_some()),
        })
    }

    async fn delete_group(&self, cancel: &CancellationToken, group: &UnifiedVolumeReplicationGroup) -> Result<()> {
        ensure_live(cancel)?;
        self.store
            .delete(&TRIDENT_MIRROR_RELATIONSHIP, &group.namespace_or_default(), &group.backend_name())
            .await
            .map_err(|e| backend_error(Backend::Trident, "delete", e))?;
        Ok(())
    }

    async fn group_status(
        &self,
        cancel: &CancellationToken,
        group: &UnifiedVolumeReplicationGroup,
        _members: &[String],
    ) -> Result<BackendStatus> {
        ensure_live(cancel)?;
        match self.fetch(&group.namespace_or_default(), &group.backend_name()).await? {
            Some(stored) => self.interpret(&stored),
            None => Ok(BackendStatus::not_found()),
        }
    }
}
