//! Orchestration platform access used by the reconciliation core
//!
//! The executor and the observed state collector only see the [`Platform`]
//! and [`StatusWriter`] traits; the kube backed implementations live here.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Secret};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use tracing::debug;

use crate::controller::error::{Error, Result};
use crate::crd::{ArangoDeployment, DeploymentStatus};
use crate::resources::FIELD_MANAGER;

/// Pods, volume claims and secrets of one namespace
#[async_trait]
pub trait Platform: Send + Sync {
    async fn get_pod(&self, name: &str) -> Result<Option<Pod>>;

    /// Create a pod; an existing pod with the same name counts as success
    async fn create_pod(&self, pod: &Pod) -> Result<()>;

    /// Delete a pod; a missing pod counts as success
    async fn delete_pod(&self, name: &str) -> Result<()>;

    async fn list_pods(&self, selector: &str) -> Result<Vec<Pod>>;

    async fn get_pvc(&self, name: &str) -> Result<Option<PersistentVolumeClaim>>;

    async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<()>;

    /// Request a larger size for an existing claim
    async fn resize_pvc(&self, name: &str, size: &str) -> Result<()>;

    async fn delete_pvc(&self, name: &str) -> Result<()>;

    async fn list_pvcs(&self, selector: &str) -> Result<Vec<PersistentVolumeClaim>>;

    async fn get_secret(&self, name: &str) -> Result<Option<Secret>>;

    async fn create_secret(&self, secret: &Secret) -> Result<()>;

    async fn delete_secret(&self, name: &str) -> Result<()>;
}

/// Persists a deployment status as a full replacement
#[async_trait]
pub trait StatusWriter: Send {
    /// Write the status; fails with a conflict if the object changed since it was read
    async fn write(&mut self, status: &DeploymentStatus) -> Result<()>;
}

fn is_status(err: &kube::Error, code: u16) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == code)
}

fn ignore_already_exists(result: std::result::Result<(), kube::Error>) -> Result<()> {
    match result {
        Err(e) if is_status(&e, 409) => Ok(()),
        other => other.map_err(Error::KubeError),
    }
}

fn ignore_not_found(result: std::result::Result<(), kube::Error>) -> Result<()> {
    match result {
        Err(e) if is_status(&e, 404) => Ok(()),
        other => other.map_err(Error::KubeError),
    }
}

/// [`Platform`] backed by the Kubernetes API
pub struct KubePlatform {
    pods: Api<Pod>,
    pvcs: Api<PersistentVolumeClaim>,
    secrets: Api<Secret>,
}

impl KubePlatform {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            pods: Api::namespaced(client.clone(), namespace),
            pvcs: Api::namespaced(client.clone(), namespace),
            secrets: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl Platform for KubePlatform {
    async fn get_pod(&self, name: &str) -> Result<Option<Pod>> {
        Ok(self.pods.get_opt(name).await?)
    }

    async fn create_pod(&self, pod: &Pod) -> Result<()> {
        debug!(pod = %pod.name_any(), "Creating pod");
        ignore_already_exists(
            self.pods
                .create(&PostParams::default(), pod)
                .await
                .map(|_| ()),
        )
    }

    async fn delete_pod(&self, name: &str) -> Result<()> {
        debug!(pod = %name, "Deleting pod");
        ignore_not_found(
            self.pods
                .delete(name, &DeleteParams::default())
                .await
                .map(|_| ()),
        )
    }

    async fn list_pods(&self, selector: &str) -> Result<Vec<Pod>> {
        let list = self.pods.list(&ListParams::default().labels(selector)).await?;
        Ok(list.items)
    }

    async fn get_pvc(&self, name: &str) -> Result<Option<PersistentVolumeClaim>> {
        Ok(self.pvcs.get_opt(name).await?)
    }

    async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<()> {
        debug!(pvc = %pvc.name_any(), "Creating volume claim");
        ignore_already_exists(
            self.pvcs
                .create(&PostParams::default(), pvc)
                .await
                .map(|_| ()),
        )
    }

    async fn resize_pvc(&self, name: &str, size: &str) -> Result<()> {
        debug!(pvc = %name, size = %size, "Resizing volume claim");
        let patch = json!({
            "spec": {
                "resources": {
                    "requests": { "storage": size }
                }
            }
        });
        self.pvcs
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn delete_pvc(&self, name: &str) -> Result<()> {
        debug!(pvc = %name, "Deleting volume claim");
        ignore_not_found(
            self.pvcs
                .delete(name, &DeleteParams::default())
                .await
                .map(|_| ()),
        )
    }

    async fn list_pvcs(&self, selector: &str) -> Result<Vec<PersistentVolumeClaim>> {
        let list = self.pvcs.list(&ListParams::default().labels(selector)).await?;
        Ok(list.items)
    }

    async fn get_secret(&self, name: &str) -> Result<Option<Secret>> {
        Ok(self.secrets.get_opt(name).await?)
    }

    async fn create_secret(&self, secret: &Secret) -> Result<()> {
        debug!(secret = %secret.name_any(), "Creating secret");
        ignore_already_exists(
            self.secrets
                .create(&PostParams {
                    field_manager: Some(FIELD_MANAGER.to_string()),
                    ..Default::default()
                }, secret)
                .await
                .map(|_| ()),
        )
    }

    async fn delete_secret(&self, name: &str) -> Result<()> {
        ignore_not_found(
            self.secrets
                .delete(name, &DeleteParams::default())
                .await
                .map(|_| ()),
        )
    }
}

/// [`StatusWriter`] replacing the status subresource of the object it was read with
///
/// Each write carries the resourceVersion of the last read or write, so a
/// concurrent change makes the write fail with 409 instead of overwriting it.
pub struct KubeStatusWriter {
    api: Api<ArangoDeployment>,
    object: ArangoDeployment,
}

impl KubeStatusWriter {
    pub fn new(api: Api<ArangoDeployment>, object: ArangoDeployment) -> Self {
        Self { api, object }
    }
}

#[async_trait]
impl StatusWriter for KubeStatusWriter {
    async fn write(&mut self, status: &DeploymentStatus) -> Result<()> {
        if self.object.status.as_ref() == Some(status) {
            return Ok(());
        }
        let name = self.object.name_any();
        let mut next = self.object.clone();
        next.status = Some(status.clone());
        next.metadata.managed_fields = None;

        let data = serde_json::to_vec(&next)?;
        let updated = self
            .api
            .replace_status(&name, &PostParams::default(), data)
            .await?;
        self.object = updated;
        Ok(())
    }
}
