//! Boundary to the external resource store
//!
//! The generator and the reference reconciler never cache resources: every
//! pass goes through this trait. Implementations provide optimistic
//! concurrency: replacing an object carrying a stale `resourceVersion` fails
//! with [`StoreError::Conflict`].

pub mod memory;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use router_api::{IngressRule, RouterInstance};

use crate::error::StoreError;

pub use memory::InMemoryStore;

#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// All RouterInstances in every namespace
    async fn list_router_instances(&self) -> Result<Vec<RouterInstance>, StoreError>;

    /// All IngressRules in every namespace
    async fn list_ingress_rules(&self) -> Result<Vec<IngressRule>, StoreError>;

    /// Persist the status block of `instance`
    async fn replace_router_instance_status(
        &self,
        instance: &RouterInstance,
    ) -> Result<RouterInstance, StoreError>;

    /// Persist metadata and spec of `ingress` (used for the deletion guard)
    async fn replace_ingress_rule(&self, ingress: &IngressRule) -> Result<IngressRule, StoreError>;

    /// Fetch a ConfigMap, `None` when it does not exist
    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, StoreError>;

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, StoreError>;

    async fn replace_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, StoreError>;
}
