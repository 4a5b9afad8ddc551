//! Replication Controllers
//!
//! Watches `UnifiedVolumeReplication` and `UnifiedVolumeReplicationGroup`
//! resources and hands every change to the [`Orchestrator`]. A finalizer
//! guarantees backend cleanup runs before the resource disappears.

use crate::controlplane::orchestrator::{
    group_failure_status, replication_failure_status, Operation, Orchestrator,
};
use crate::crd::{UnifiedVolumeReplication, UnifiedVolumeReplicationGroup};
use crate::error::{Error, ErrorAction, Result};
use dashmap::DashMap;
use futures::StreamExt;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Finalizer guarding backend cleanup
pub const FINALIZER_NAME: &str = "replication.unified.io/finalizer";

/// Base for exponential error backoff
const ERROR_REQUEUE_SECONDS: u64 = 5;

/// Cap on the error backoff
const MAX_ERROR_REQUEUE_SECONDS: u64 = 300;

/// Shared state for both controllers
pub struct ControllerContext {
    pub client: Client,
    pub orchestrator: Arc<Orchestrator>,
    /// Requeue interval after a successful pass
    pub resync: Duration,
    /// Cancelled on shutdown; aborts in-flight backend calls
    pub cancel: CancellationToken,
    /// Consecutive failures per object, for backoff
    pub error_counts: DashMap<String, u32>,
}

impl ControllerContext {
    pub fn new(
        client: Client,
        orchestrator: Arc<Orchestrator>,
        resync: Duration,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            client,
            orchestrator,
            resync,
            cancel,
            error_counts: DashMap::new(),
        })
    }
}

/// Run both controllers until `ctx.cancel` fires
pub async fn run_controllers(ctx: Arc<ControllerContext>, namespace: Option<String>) -> Result<()> {
    let replications: Api<UnifiedVolumeReplication> = scoped(&ctx.client, namespace.as_deref());
    let groups: Api<UnifiedVolumeReplicationGroup> = scoped(&ctx.client, namespace.as_deref());

    info!(
        namespace = namespace.as_deref().unwrap_or("all"),
        "Starting replication controllers"
    );

    let stop = ctx.cancel.clone();
    let replication_controller = Controller::new(replications, Config::default())
        .graceful_shutdown_on(async move { stop.cancelled().await })
        .run(reconcile_replication, error_policy_replication, ctx.clone())
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => debug!(name = obj.name, namespace = obj.namespace, ?action, "Reconciliation completed"),
                Err(e) => error!(error = %e, "Reconciliation failed"),
            }
        });

    let stop = ctx.cancel.clone();
    let group_controller = Controller::new(groups, Config::default())
        .graceful_shutdown_on(async move { stop.cancelled().await })
        .run(reconcile_group, error_policy_group, ctx.clone())
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => debug!(name = obj.name, namespace = obj.namespace, ?action, "Group reconciliation completed"),
                Err(e) => error!(error = %e, "Group reconciliation failed"),
            }
        });

    futures::future::join(replication_controller, group_controller).await;
    info!("Replication controllers stopped");
    Ok(())
}

fn scoped<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <K as kube::Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Create on the first pass, update once a status has been written
pub fn operation_for(observed_generation: Option<i64>) -> Operation {
    match observed_generation {
        Some(_) => Operation::Update,
        None => Operation::Create,
    }
}

fn finalizer_error(err: kube::runtime::finalizer::Error<Error>) -> Error {
    use kube::runtime::finalizer::Error as FinalizerError;
    match err {
        FinalizerError::ApplyFailed(e) | FinalizerError::CleanupFailed(e) => e,
        FinalizerError::AddFinalizer(e) | FinalizerError::RemoveFinalizer(e) => Error::Kube(e),
        other => Error::Internal(other.to_string()),
    }
}

// =============================================================================
// UnifiedVolumeReplication
// =============================================================================

#[instrument(skip(uvr, ctx), fields(name = %uvr.name_any(), namespace = uvr.namespace()))]
async fn reconcile_replication(uvr: Arc<UnifiedVolumeReplication>, ctx: Arc<ControllerContext>) -> Result<Action> {
    let namespace = uvr.namespace().unwrap_or_else(|| "default".to_string());
    let key = format!("{}/{}", namespace, uvr.name_any());
    let api: Api<UnifiedVolumeReplication> = Api::namespaced(ctx.client.clone(), &namespace);

    let result = finalizer(&api, FINALIZER_NAME, uvr, |event| async {
        match event {
            FinalizerEvent::Apply(uvr) => apply_replication(&api, &uvr, &ctx).await,
            FinalizerEvent::Cleanup(uvr) => cleanup_replication(&uvr, &ctx).await,
        }
    })
    .await
    .map_err(finalizer_error);

    if result.is_ok() {
        ctx.error_counts.remove(&key);
    }
    result
}

async fn apply_replication(
    api: &Api<UnifiedVolumeReplication>,
    uvr: &UnifiedVolumeReplication,
    ctx: &ControllerContext,
) -> Result<Action> {
    let operation = operation_for(uvr.status.as_ref().and_then(|s| s.observed_generation));
    match ctx.orchestrator.process_replication(&ctx.cancel, uvr, operation).await {
        Ok(outcome) => {
            if let Some(status) = outcome.status {
                patch_status(api, &uvr.name_any(), &status).await?;
            }
            Ok(Action::requeue(ctx.resync))
        }
        Err(e) => {
            warn!("Replication {} failed: {}", uvr.name_any(), e);
            let status = replication_failure_status(uvr, &e);
            if let Err(patch_err) = patch_status(api, &uvr.name_any(), &status).await {
                warn!("Could not record failure status: {}", patch_err);
            }
            Err(e)
        }
    }
}

async fn cleanup_replication(uvr: &UnifiedVolumeReplication, ctx: &ControllerContext) -> Result<Action> {
    let outcome = ctx
        .orchestrator
        .process_replication(&ctx.cancel, uvr, Operation::Delete)
        .await?;
    info!(
        "Released {} (backend {})",
        uvr.name_any(),
        outcome.backend.map(|b| b.as_str()).unwrap_or("none")
    );
    Ok(Action::await_change())
}

fn error_policy_replication(uvr: Arc<UnifiedVolumeReplication>, error: &Error, ctx: Arc<ControllerContext>) -> Action {
    let key = format!(
        "{}/{}",
        uvr.namespace().unwrap_or_else(|| "default".to_string()),
        uvr.name_any()
    );
    requeue(&ctx, key, error)
}

// =============================================================================
// UnifiedVolumeReplicationGroup
// =============================================================================

#[instrument(skip(group, ctx), fields(name = %group.name_any(), namespace = group.namespace()))]
async fn reconcile_group(group: Arc<UnifiedVolumeReplicationGroup>, ctx: Arc<ControllerContext>) -> Result<Action> {
    let namespace = group.namespace().unwrap_or_else(|| "default".to_string());
    let key = format!("group:{}/{}", namespace, group.name_any());
    let api: Api<UnifiedVolumeReplicationGroup> = Api::namespaced(ctx.client.clone(), &namespace);

    let result = finalizer(&api, FINALIZER_NAME, group, |event| async {
        match event {
            FinalizerEvent::Apply(group) => apply_group(&api, &group, &ctx).await,
            FinalizerEvent::Cleanup(group) => {
                ctx.orchestrator
                    .process_group(&ctx.cancel, &group, Operation::Delete)
                    .await?;
                Ok(Action::await_change())
            }
        }
    })
    .await
    .map_err(finalizer_error);

    if result.is_ok() {
        ctx.error_counts.remove(&key);
    }
    result
}

async fn apply_group(
    api: &Api<UnifiedVolumeReplicationGroup>,
    group: &UnifiedVolumeReplicationGroup,
    ctx: &ControllerContext,
) -> Result<Action> {
    let operation = operation_for(group.status.as_ref().and_then(|s| s.observed_generation));
    match ctx.orchestrator.process_group(&ctx.cancel, group, operation).await {
        Ok(outcome) => {
            if let Some(status) = outcome.status {
                patch_status(api, &group.name_any(), &status).await?;
            }
            // Membership follows PVC labels, which are not watched
            Ok(Action::requeue(ctx.resync))
        }
        Err(e) => {
            warn!("Group {} failed: {}", group.name_any(), e);
            let status = group_failure_status(group, &e);
            if let Err(patch_err) = patch_status(api, &group.name_any(), &status).await {
                warn!("Could not record failure status: {}", patch_err);
            }
            Err(e)
        }
    }
}

fn error_policy_group(group: Arc<UnifiedVolumeReplicationGroup>, error: &Error, ctx: Arc<ControllerContext>) -> Action {
    let key = format!(
        "group:{}/{}",
        group.namespace().unwrap_or_else(|| "default".to_string()),
        group.name_any()
    );
    requeue(&ctx, key, error)
}

// =============================================================================
// Shared
// =============================================================================

/// Merge-patch the status subresource
async fn patch_status<K, S>(api: &Api<K>, name: &str, status: &S) -> Result<()>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
    S: Serialize,
{
    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

fn requeue(ctx: &ControllerContext, key: String, error: &Error) -> Action {
    let retries = {
        let mut entry = ctx.error_counts.entry(key.clone()).or_insert(0);
        *entry += 1;
        *entry
    };
    let action = requeue_action(error.action(), retries);
    warn!(error = %error, retry = retries, ?action, "Reconciliation error for '{}'", key);
    action
}

/// Map an error action onto a controller action.
/// Backoff doubles per consecutive failure: 5s, 10s, 20s ... capped at 300s.
pub fn requeue_action(action: ErrorAction, retries: u32) -> Action {
    match action {
        ErrorAction::NoRequeue => Action::await_change(),
        ErrorAction::RequeueAfter(delay) => Action::requeue(delay),
        ErrorAction::RequeueWithBackoff => Action::requeue(backoff_delay(retries)),
    }
}

pub fn backoff_delay(retries: u32) -> Duration {
    let base = Duration::from_secs(ERROR_REQUEUE_SECONDS);
    let delay = base * 2u32.saturating_pow(retries.saturating_sub(1).min(6));
    delay.min(Duration::from_secs(MAX_ERROR_REQUEUE_SECONDS))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Backend;

    #[test]
    fn test_operation_from_status() {
        assert_eq!(operation_for(None), Operation::Create);
        assert_eq!(operation_for(Some(3)), Operation::Update);
    }

    #[test]
    fn test_backoff_is_capped() {
        assert_eq!(backoff_delay(1), Duration::from_secs(5));
        assert_eq!(backoff_delay(2), Duration::from_secs(10));
        assert_eq!(backoff_delay(4), Duration::from_secs(40));
        assert_eq!(backoff_delay(30), Duration::from_secs(300));
    }

    #[test]
    fn test_requeue_follows_error_action() {
        let circuit = Error::CircuitOpen {
            backend: Backend::Trident,
        };
        assert_eq!(
            requeue_action(circuit.action(), 1),
            Action::requeue(Duration::from_secs(30))
        );

        let spec_error = Error::InvalidSpec("bad".into());
        assert_eq!(requeue_action(spec_error.action(), 1), Action::await_change());

        let transient = Error::BackendUnavailable {
            backend: Backend::Ceph,
        };
        assert_eq!(
            requeue_action(transient.action(), 3),
            Action::requeue(Duration::from_secs(20))
        );
    }
}
