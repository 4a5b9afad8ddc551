//! Kubernetes resource store
//!
//! Backend resources are handled as `DynamicObject`s so the operator does not
//! depend on vendor crates for csi-addons, Trident or Dell CSM types. Writes
//! use server-side apply under the operator's field manager.

use crate::domain::{
    ApplyOutcome, BackendResource, OwnerLink, ResourceKind, ResourceStore, StoredResource,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams};
use kube::core::GroupVersionKind;
use kube::Client;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Field manager for server-side apply
pub const FIELD_MANAGER: &str = "unified-replication-operator";

/// [`ResourceStore`] backed by the cluster API
#[derive(Clone)]
pub struct KubeResourceStore {
    client: Client,
    environment: String,
}

impl KubeResourceStore {
    pub fn new(client: Client, environment: impl Into<String>) -> Self {
        Self {
            client,
            environment: environment.into(),
        }
    }

    fn api_resource(kind: &ResourceKind) -> ApiResource {
        let gvk = GroupVersionKind::gvk(kind.group, kind.version, kind.kind);
        ApiResource::from_gvk_with_plural(&gvk, kind.plural)
    }

    fn dynamic(&self, kind: &ResourceKind, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &Self::api_resource(kind))
    }

    async fn crd(&self, crd_name: &str) -> Result<Option<CustomResourceDefinition>> {
        let crds: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        Ok(crds.get_opt(crd_name).await?)
    }
}

fn selector_string(selector: &BTreeMap<String, String>) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}

fn to_stored(obj: DynamicObject) -> StoredResource {
    let meta = obj.metadata;
    StoredResource {
        name: meta.name.unwrap_or_default(),
        namespace: meta.namespace.unwrap_or_default(),
        labels: meta.labels.unwrap_or_default(),
        annotations: meta.annotations.unwrap_or_default(),
        owners: meta
            .owner_references
            .unwrap_or_default()
            .into_iter()
            .map(|o| OwnerLink {
                api_version: o.api_version,
                kind: o.kind,
                name: o.name,
                uid: Some(o.uid),
            })
            .collect(),
        spec: obj.data.get("spec").cloned().unwrap_or(Value::Null),
        status: obj.data.get("status").cloned(),
    }
}

#[async_trait]
impl ResourceStore for KubeResourceStore {
    fn environment_id(&self) -> String {
        self.environment.clone()
    }

    async fn crd_exists(&self, crd_name: &str) -> Result<bool> {
        let Some(crd) = self.crd(crd_name).await? else {
            return Ok(false);
        };
        let established = crd
            .status
            .and_then(|s| s.conditions)
            .map(|conditions| {
                conditions
                    .iter()
                    .any(|c| c.type_ == "Established" && c.status == "True")
            })
            .unwrap_or(false);
        debug!("CRD {} established={}", crd_name, established);
        Ok(established)
    }

    async fn crd_versions(&self, crd_name: &str) -> Result<Vec<String>> {
        Ok(self
            .crd(crd_name)
            .await?
            .map(|crd| {
                crd.spec
                    .versions
                    .into_iter()
                    .filter(|v| v.served)
                    .map(|v| v.name)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get(&self, kind: &ResourceKind, namespace: &str, name: &str) -> Result<Option<StoredResource>> {
        Ok(self.dynamic(kind, namespace).get_opt(name).await?.map(to_stored))
    }

    async fn apply(&self, resource: &BackendResource) -> Result<ApplyOutcome> {
        let api = self.dynamic(&resource.kind, &resource.namespace);
        let existed = api.get_opt(&resource.name).await?.is_some();

        let params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(&resource.name, &params, &Patch::Apply(&resource.to_manifest()))
            .await?;

        info!(
            "Applied {} {}/{}",
            resource.kind, resource.namespace, resource.name
        );
        Ok(if existed {
            ApplyOutcome::Updated
        } else {
            ApplyOutcome::Created
        })
    }

    async fn delete(&self, kind: &ResourceKind, namespace: &str, name: &str) -> Result<bool> {
        match self
            .dynamic(kind, namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => {
                info!("Deleted {} {}/{}", kind, namespace, name);
                Ok(true)
            }
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(Error::from(e)),
        }
    }

    async fn list(
        &self,
        kind: &ResourceKind,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> Result<Vec<StoredResource>> {
        let params = ListParams::default().labels(&selector_string(selector));
        let list = self.dynamic(kind, namespace).list(&params).await?;
        Ok(list.items.into_iter().map(to_stored).collect())
    }

    async fn volume_labels(&self, namespace: &str, pvc: &str) -> Result<Option<BTreeMap<String, String>>> {
        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(pvcs
            .get_opt(pvc)
            .await?
            .map(|claim| claim.metadata.labels.unwrap_or_default()))
    }

    async fn set_volume_labels(
        &self,
        namespace: &str,
        pvc: &str,
        labels: &BTreeMap<String, Option<String>>,
    ) -> Result<()> {
        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        // Merge patch: null removes the label
        let patch = json!({ "metadata": { "labels": labels } });
        pvcs.patch(pvc, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        debug!("Patched labels on PVC {}/{}", namespace, pvc);
        Ok(())
    }

    async fn list_volumes(&self, namespace: &str, selector: &BTreeMap<String, String>) -> Result<Vec<String>> {
        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&selector_string(selector));
        let mut names: Vec<String> = pvcs
            .list(&params)
            .await?
            .items
            .into_iter()
            .filter_map(|claim| claim.metadata.name)
            .collect();
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::DELL_REPLICATION_GROUP;

    #[test]
    fn test_selector_string() {
        let selector = BTreeMap::from([
            ("app".to_string(), "pg".to_string()),
            ("instance".to_string(), "prod".to_string()),
        ]);
        assert_eq!(selector_string(&selector), "app=pg,instance=prod");
    }

    #[test]
    fn test_api_resource_uses_declared_plural() {
        let ar = KubeResourceStore::api_resource(&DELL_REPLICATION_GROUP);
        assert_eq!(ar.plural, "dellcsireplicationgroups");
        assert_eq!(ar.api_version, "replication.storage.dell.com/v1");
    }

    #[test]
    fn test_to_stored_reads_spec_and_status() {
        let mut obj = DynamicObject::new("db", &KubeResourceStore::api_resource(&DELL_REPLICATION_GROUP))
            .within("apps")
            .data(json!({"spec": {"action": "Failover"}, "status": {"state": "Ready"}}));
        obj.metadata.labels = Some(BTreeMap::from([("a".to_string(), "b".to_string())]));

        let stored = to_stored(obj);
        assert_eq!(stored.namespace, "apps");
        assert_eq!(stored.spec["action"], "Failover");
        assert_eq!(stored.status.unwrap()["state"], "Ready");
        assert_eq!(stored.labels.len(), 1);
    }
}
