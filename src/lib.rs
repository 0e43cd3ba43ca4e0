pub mod arangod;
pub mod config;
pub mod controller;
pub mod crd;
pub mod health;
pub mod resources;

pub use config::OperatorConfig;
pub use controller::{
    BackoffConfig, Context, Error, Result, backup_error_policy, error_policy, reconcile,
    reconcile_backup,
};
pub use crd::{ArangoBackup, ArangoDeployment};
pub use health::{HealthState, Metrics};

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::runtime::Controller;
use kube::runtime::controller::Error as ControllerError;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;

use arangod::{ClientFactory, HttpClientFactory};
use controller::BACKUP_KIND;
use resources::KIND;

/// Helper to create a namespaced or cluster-wide API based on scope.
fn scoped_api<T>(client: Client, namespace: Option<&str>) -> Api<T>
where
    T: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <T as Resource>::DynamicType: Default,
    T: Clone + DeserializeOwned + std::fmt::Debug,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Build the shared context with the HTTP backed ArangoDB client factory
pub fn build_context(
    client: Client,
    health_state: Option<Arc<HealthState>>,
    config: OperatorConfig,
) -> Arc<Context> {
    let factory: Arc<dyn ClientFactory> = Arc::new(HttpClientFactory::new(
        client.clone(),
        config.arango_client_timeout,
    ));
    Arc::new(Context::new(client, factory, health_state, config))
}

/// Run the ArangoDeployment controller.
///
/// When `namespace` is `Some(ns)`, only watches resources in that namespace,
/// otherwise watches resources cluster-wide. Member pods and volume claims
/// are owned by their deployment, so changes to them trigger a pass too.
pub async fn run_deployment_controller_scoped(ctx: Arc<Context>, namespace: Option<&str>) {
    let scope_msg = namespace.unwrap_or("cluster-wide");
    tracing::info!(
        "Starting controller for ArangoDeployment resources (scope: {})",
        scope_msg
    );

    let client = ctx.client.clone();
    let deployments: Api<ArangoDeployment> = scoped_api(client.clone(), namespace);
    let pods: Api<Pod> = scoped_api(client.clone(), namespace);
    let pvcs: Api<PersistentVolumeClaim> = scoped_api(client, namespace);

    let watcher_config = WatcherConfig::default().any_semantic();

    Controller::new(deployments, watcher_config.clone())
        .owns(pods, watcher_config.clone())
        .owns(pvcs, watcher_config)
        .run(reconcile, error_policy, ctx.clone())
        .for_each(|result| {
            let ctx = ctx.clone();
            async move {
                match result {
                    Ok((obj, _action)) => {
                        tracing::debug!("Reconciled: {}", obj.name);
                    }
                    Err(ControllerError::ObjectNotFound(obj)) => {
                        tracing::debug!("ArangoDeployment {} is gone, dropping its metrics", obj.name);
                        ctx.forget(KIND, obj.namespace.as_deref().unwrap_or_default(), &obj.name);
                    }
                    Err(e) => {
                        // Watch events for objects that were just deleted
                        let is_not_found = matches!(
                            &e,
                            ControllerError::ReconcilerFailed(err, _) if err.is_not_found()
                        );
                        if is_not_found {
                            tracing::debug!("Object no longer exists (likely deleted): {:?}", e);
                        } else {
                            tracing::error!("Reconciliation error: {:?}", e);
                        }
                    }
                }
            }
        })
        .await;

    // This should never complete in normal operation
    tracing::error!("ArangoDeployment controller stream ended unexpectedly");
}

/// Run the ArangoBackup controller with optional namespace scoping.
pub async fn run_backup_controller_scoped(ctx: Arc<Context>, namespace: Option<&str>) {
    let scope_msg = namespace.unwrap_or("cluster-wide");
    tracing::info!(
        "Starting controller for ArangoBackup resources (scope: {})",
        scope_msg
    );

    let backups: Api<ArangoBackup> = scoped_api(ctx.client.clone(), namespace);
    let watcher_config = WatcherConfig::default().any_semantic();

    Controller::new(backups, watcher_config)
        .run(reconcile_backup, backup_error_policy, ctx.clone())
        .for_each(|result| {
            let ctx = ctx.clone();
            async move {
                match result {
                    Ok((obj, _action)) => {
                        tracing::debug!("Reconciled backup: {}", obj.name);
                    }
                    Err(ControllerError::ObjectNotFound(obj)) => {
                        tracing::debug!("ArangoBackup {} is gone, dropping its metrics", obj.name);
                        ctx.forget(
                            BACKUP_KIND,
                            obj.namespace.as_deref().unwrap_or_default(),
                            &obj.name,
                        );
                    }
                    Err(e) => {
                        let is_not_found = matches!(
                            &e,
                            ControllerError::ReconcilerFailed(err, _) if err.is_not_found()
                        );
                        if is_not_found {
                            tracing::debug!("Backup object no longer exists: {:?}", e);
                        } else {
                            tracing::error!("Backup reconciliation error: {:?}", e);
                        }
                    }
                }
            }
        })
        .await;

    tracing::error!("ArangoBackup controller stream ended unexpectedly");
}
