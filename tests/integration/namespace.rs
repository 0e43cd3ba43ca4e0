//! Test namespace management for isolation

use k8s_openapi::api::core::v1::Namespace;
use kube::api::{DeleteParams, PostParams, PropagationPolicy};
use kube::core::ObjectMeta;
use kube::{Api, Client};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A namespace owned by one test, deleted by [`TestNamespace::cleanup`]
pub struct TestNamespace {
    pub name: String,
    client: Client,
}

impl TestNamespace {
    /// Create `{prefix}-{uuid8}`
    pub async fn create(client: Client, prefix: &str) -> Result<Self, kube::Error> {
        let name = format!("{}-{}", prefix, &Uuid::new_v4().simple().to_string()[..8]);

        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                labels: Some(BTreeMap::from([(
                    "arango-operator.test".to_string(),
                    prefix.to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        };
        Api::<Namespace>::all(client.clone())
            .create(&PostParams::default(), &ns)
            .await?;
        tracing::info!("Created test namespace: {}", name);

        Ok(Self { name, client })
    }

    pub fn api<T>(&self) -> Api<T>
    where
        T: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <T as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &self.name)
    }

    /// Start deleting the namespace without waiting for it to go away
    pub async fn cleanup(&self) -> Result<(), kube::Error> {
        let dp = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };
        match Api::<Namespace>::all(self.client.clone())
            .delete(&self.name, &dp)
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(()),
            Err(e) => Err(e),
        }
    }
}
