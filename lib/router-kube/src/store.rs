//! [`ResourceStore`] over the Kubernetes API
//!
//! Nothing is cached: every call is a request to the API server, which
//! enforces `resourceVersion` preconditions on replace.

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{ListParams, PostParams};
use kube::{Api, Client, Resource, ResourceExt};
use router_api::{IngressRule, RouterInstance};
use router_core::{ResourceStore, StoreError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

/// Store over one Kubernetes client, shared by the controllers
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Connect using the in-cluster or kubeconfig configuration
    pub async fn connect() -> anyhow::Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self { client })
    }

    /// Client for watches, which go around the store
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Create `object` unless an object of that name exists; existing
    /// objects are left untouched. Returns whether it was created.
    pub async fn create_if_absent<K>(&self, object: &K) -> Result<bool, StoreError>
    where
        K: k8s_openapi::Resource
            + Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Debug
            + DeserializeOwned
            + Serialize,
    {
        let (namespace, name) = object_key(object);
        let key = format!("{}/{}", namespace, name);
        let api: Api<K> = self.namespaced(&namespace);

        let existing = api
            .get_opt(&name)
            .await
            .map_err(|e| store_error(K::KIND, key.clone(), e))?;
        if existing.is_some() {
            return Ok(false);
        }

        match api.create(&PostParams::default(), object).await {
            Ok(_) => Ok(true),
            Err(e) => match store_error(K::KIND, key, e) {
                // created concurrently, which is all that was asked
                StoreError::Conflict { .. } => Ok(false),
                other => Err(other),
            },
        }
    }
}

/// Map API failures onto the store's error classes: 404 and 409 are
/// expected outcomes, everything else is transient
fn store_error(kind: &'static str, key: String, error: kube::Error) -> StoreError {
    match &error {
        kube::Error::Api(response) if response.code == 404 => StoreError::not_found(kind, key),
        kube::Error::Api(response) if response.code == 409 => StoreError::conflict(kind, key),
        _ => StoreError::Transient(Box::new(error)),
    }
}

fn object_key<K: ResourceExt>(object: &K) -> (String, String) {
    (
        object.namespace().unwrap_or_else(|| "default".to_string()),
        object.name_any(),
    )
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn list_router_instances(&self) -> Result<Vec<RouterInstance>, StoreError> {
        let api: Api<RouterInstance> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| store_error("RouterInstance", "*".to_string(), e))?;

        debug!("Listed {} RouterInstances", list.items.len());
        Ok(list.items)
    }

    async fn list_ingress_rules(&self) -> Result<Vec<IngressRule>, StoreError> {
        let api: Api<IngressRule> = Api::all(self.client.clone());
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| store_error("IngressRule", "*".to_string(), e))?;

        debug!("Listed {} IngressRules", list.items.len());
        Ok(list.items)
    }

    async fn replace_router_instance_status(
        &self,
        instance: &RouterInstance,
    ) -> Result<RouterInstance, StoreError> {
        let (namespace, name) = object_key(instance);
        let key = format!("{}/{}", namespace, name);
        let body = serde_json::to_vec(instance).map_err(|e| StoreError::Transient(Box::new(e)))?;

        self.namespaced::<RouterInstance>(&namespace)
            .replace_status(&name, &PostParams::default(), body)
            .await
            .map_err(|e| store_error("RouterInstance", key, e))
    }

    async fn replace_ingress_rule(&self, ingress: &IngressRule) -> Result<IngressRule, StoreError> {
        let (namespace, name) = object_key(ingress);
        let key = format!("{}/{}", namespace, name);

        self.namespaced::<IngressRule>(&namespace)
            .replace(&name, &PostParams::default(), ingress)
            .await
            .map_err(|e| store_error("IngressRule", key, e))
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, StoreError> {
        self.namespaced::<ConfigMap>(namespace)
            .get_opt(name)
            .await
            .map_err(|e| store_error("ConfigMap", format!("{}/{}", namespace, name), e))
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, StoreError> {
        let (namespace, name) = object_key(config_map);
        let key = format!("{}/{}", namespace, name);

        // 409 on create means the artifact appeared since it was read.
        self.namespaced::<ConfigMap>(&namespace)
            .create(&PostParams::default(), config_map)
            .await
            .map_err(|e| store_error("ConfigMap", key, e))
    }

    async fn replace_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, StoreError> {
        let (namespace, name) = object_key(config_map);
        let key = format!("{}/{}", namespace, name);

        self.namespaced::<ConfigMap>(&namespace)
            .replace(&name, &PostParams::default(), config_map)
            .await
            .map_err(|e| store_error("ConfigMap", key, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "test".to_string(),
            reason: String::new(),
            code,
        })
    }

    #[test]
    fn test_error_classes() {
        assert!(matches!(
            store_error("ConfigMap", "ns/a".to_string(), api_error(404)),
            StoreError::NotFound { .. }
        ));
        assert!(matches!(
            store_error("ConfigMap", "ns/a".to_string(), api_error(409)),
            StoreError::Conflict { .. }
        ));
        assert!(matches!(
            store_error("ConfigMap", "ns/a".to_string(), api_error(500)),
            StoreError::Transient(_)
        ));
    }
}
