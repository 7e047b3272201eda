//! In-process [`ResourceStore`] for tests and local dry runs
//!
//! Mimics the API server behaviors the pipeline depends on: resource
//! versions with conflict detection, finalizer-guarded deletion, and spec
//! generations that move only on spec changes. Every write is counted so
//! callers can assert on redundant writes.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use router_api::{IngressRule, RouterInstance};
use tracing::debug;

use super::ResourceStore;
use crate::error::StoreError;

type Key = (String, String);

#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    routers: BTreeMap<Key, RouterInstance>,
    ingresses: BTreeMap<Key, IngressRule>,
    config_maps: BTreeMap<Key, ConfigMap>,
    last_version: u64,
    config_map_writes: BTreeMap<Key, usize>,
    status_writes: BTreeMap<Key, usize>,
    ingress_writes: usize,
    injected_failures: usize,
    injected_conflicts: usize,
}

impl Inner {
    fn next_version(&mut self) -> String {
        self.last_version += 1;
        self.last_version.to_string()
    }

    fn take_failure(&mut self, operation: &str) -> Result<(), StoreError> {
        if self.injected_failures > 0 {
            self.injected_failures -= 1;
            return Err(StoreError::Transient(
                format!("injected failure during {}", operation).into(),
            ));
        }
        Ok(())
    }

    /// Consumed by writes only, reads never conflict
    fn take_conflict(&mut self, kind: &'static str, key: &Key) -> Result<(), StoreError> {
        if self.injected_conflicts > 0 {
            self.injected_conflicts -= 1;
            return Err(StoreError::conflict(kind, key_display(key)));
        }
        Ok(())
    }
}

fn key_of(meta: &ObjectMeta) -> Key {
    (
        meta.namespace.clone().unwrap_or_else(|| "default".to_string()),
        meta.name.clone().unwrap_or_default(),
    )
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn key_display(key: &Key) -> String {
    format!("{}/{}", key.0, key.1)
}

fn check_version(
    kind: &'static str,
    key: &Key,
    stored: &ObjectMeta,
    incoming: &ObjectMeta,
) -> Result<(), StoreError> {
    match &incoming.resource_version {
        Some(version) if Some(version) != stored.resource_version.as_ref() => {
            Err(StoreError::conflict(kind, key_display(key)))
        }
        _ => Ok(()),
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create or update a RouterInstance the way an external actor would.
    ///
    /// The stored status is kept; the generation moves when `spec` changes.
    pub fn apply_router_instance(&self, mut instance: RouterInstance) -> RouterInstance {
        let mut inner = self.inner();
        let key = key_of(&instance.metadata);
        let version = inner.next_version();
        instance.metadata.namespace = Some(key.0.clone());
        instance.metadata.resource_version = Some(version);

        match inner.routers.get(&key) {
            Some(existing) => {
                let generation = existing.metadata.generation.unwrap_or(1);
                let spec_changed = serde_json::to_value(&existing.spec).ok()
                    != serde_json::to_value(&instance.spec).ok();
                instance.metadata.generation =
                    Some(if spec_changed { generation + 1 } else { generation });
                instance.metadata.uid = existing.metadata.uid.clone();
                instance.status = existing.status.clone();
            }
            None => {
                instance.metadata.generation = Some(1);
                instance.metadata.uid = Some(format!("uid-{}", inner.last_version));
            }
        }

        inner.routers.insert(key, instance.clone());
        instance
    }

    /// Create or update an IngressRule, keeping the stored finalizers and
    /// deletion timestamp
    pub fn apply_ingress_rule(&self, mut ingress: IngressRule) -> IngressRule {
        let mut inner = self.inner();
        let key = key_of(&ingress.metadata);
        let version = inner.next_version();
        ingress.metadata.namespace = Some(key.0.clone());
        ingress.metadata.resource_version = Some(version);

        if let Some(existing) = inner.ingresses.get(&key) {
            ingress.metadata.finalizers = existing.metadata.finalizers.clone();
            ingress.metadata.deletion_timestamp = existing.metadata.deletion_timestamp.clone();
            ingress.metadata.uid = existing.metadata.uid.clone();
        } else {
            ingress.metadata.uid = Some(format!("uid-{}", inner.last_version));
        }

        inner.ingresses.insert(key, ingress.clone());
        ingress
    }

    /// Create or update a ConfigMap outside the pipeline (template sources)
    pub fn apply_config_map(&self, mut config_map: ConfigMap) -> ConfigMap {
        let mut inner = self.inner();
        let key = key_of(&config_map.metadata);
        config_map.metadata.namespace = Some(key.0.clone());
        config_map.metadata.resource_version = Some(inner.next_version());
        inner.config_maps.insert(key, config_map.clone());
        config_map
    }

    /// Request deletion of an IngressRule.
    ///
    /// With finalizers present the object stays, marked for deletion, and is
    /// returned; otherwise it is removed and `None` is returned.
    pub fn delete_ingress_rule(&self, namespace: &str, name: &str) -> Option<IngressRule> {
        let mut inner = self.inner();
        let key = key(namespace, name);
        let guarded = inner
            .ingresses
            .get(&key)
            .map(|i| i.metadata.finalizers.as_ref().is_some_and(|f| !f.is_empty()))?;

        if !guarded {
            inner.ingresses.remove(&key);
            return None;
        }

        let version = inner.next_version();
        let ingress = inner.ingresses.get_mut(&key)?;
        if ingress.metadata.deletion_timestamp.is_none() {
            ingress.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        }
        ingress.metadata.resource_version = Some(version);
        Some(ingress.clone())
    }

    pub fn delete_router_instance(&self, namespace: &str, name: &str) -> Option<RouterInstance> {
        self.inner().routers.remove(&key(namespace, name))
    }

    pub fn router_instance(&self, namespace: &str, name: &str) -> Option<RouterInstance> {
        self.inner().routers.get(&key(namespace, name)).cloned()
    }

    pub fn ingress_rule(&self, namespace: &str, name: &str) -> Option<IngressRule> {
        self.inner().ingresses.get(&key(namespace, name)).cloned()
    }

    pub fn config_map(&self, namespace: &str, name: &str) -> Option<ConfigMap> {
        self.inner().config_maps.get(&key(namespace, name)).cloned()
    }

    /// Creates plus replaces of one ConfigMap made through the store trait
    pub fn config_map_writes(&self, namespace: &str, name: &str) -> usize {
        self.inner()
            .config_map_writes
            .get(&key(namespace, name))
            .copied()
            .unwrap_or(0)
    }

    pub fn status_writes(&self, namespace: &str, name: &str) -> usize {
        self.inner()
            .status_writes
            .get(&key(namespace, name))
            .copied()
            .unwrap_or(0)
    }

    /// Every write made through the store trait
    pub fn total_writes(&self) -> usize {
        let inner = self.inner();
        inner.config_map_writes.values().sum::<usize>()
            + inner.status_writes.values().sum::<usize>()
            + inner.ingress_writes
    }

    /// Make the next `count` trait calls fail with a transient error
    pub fn inject_failures(&self, count: usize) {
        self.inner().injected_failures = count;
    }

    /// Make the next `count` writes fail as if another writer had updated
    /// the object since it was read
    pub fn inject_conflicts(&self, count: usize) {
        self.inner().injected_conflicts = count;
    }
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    async fn list_router_instances(&self) -> Result<Vec<RouterInstance>, StoreError> {
        let mut inner = self.inner();
        inner.take_failure("list RouterInstances")?;
        Ok(inner.routers.values().cloned().collect())
    }

    async fn list_ingress_rules(&self) -> Result<Vec<IngressRule>, StoreError> {
        let mut inner = self.inner();
        inner.take_failure("list IngressRules")?;
        Ok(inner.ingresses.values().cloned().collect())
    }

    async fn replace_router_instance_status(
        &self,
        instance: &RouterInstance,
    ) -> Result<RouterInstance, StoreError> {
        let mut inner = self.inner();
        inner.take_failure("replace RouterInstance status")?;
        let key = key_of(&instance.metadata);
        let stored = inner
            .routers
            .get(&key)
            .ok_or_else(|| StoreError::not_found("RouterInstance", key_display(&key)))?;
        check_version("RouterInstance", &key, &stored.metadata, &instance.metadata)?;
        inner.take_conflict("RouterInstance", &key)?;

        let version = inner.next_version();
        let mut updated = inner.routers[&key].clone();
        updated.status = instance.status.clone();
        updated.metadata.resource_version = Some(version);
        inner.routers.insert(key.clone(), updated.clone());
        *inner.status_writes.entry(key.clone()).or_default() += 1;

        debug!("Stored status of RouterInstance {}", key_display(&key));
        Ok(updated)
    }

    async fn replace_ingress_rule(&self, ingress: &IngressRule) -> Result<IngressRule, StoreError> {
        let mut inner = self.inner();
        inner.take_failure("replace IngressRule")?;
        let key = key_of(&ingress.metadata);
        let stored = inner
            .ingresses
            .get(&key)
            .ok_or_else(|| StoreError::not_found("IngressRule", key_display(&key)))?;
        check_version("IngressRule", &key, &stored.metadata, &ingress.metadata)?;

        let deleting = stored.metadata.deletion_timestamp.clone();
        inner.take_conflict("IngressRule", &key)?;
        let version = inner.next_version();
        let mut updated = ingress.clone();
        updated.metadata.resource_version = Some(version);
        updated.metadata.deletion_timestamp = deleting;
        inner.ingress_writes += 1;

        let released = updated.metadata.deletion_timestamp.is_some()
            && updated.metadata.finalizers.as_ref().map_or(true, |f| f.is_empty());
        if released {
            debug!("Last finalizer removed, deleting IngressRule {}", key_display(&key));
            inner.ingresses.remove(&key);
        } else {
            inner.ingresses.insert(key, updated.clone());
        }
        Ok(updated)
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, StoreError> {
        let mut inner = self.inner();
        inner.take_failure("get ConfigMap")?;
        Ok(inner.config_maps.get(&key(namespace, name)).cloned())
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, StoreError> {
        let mut inner = self.inner();
        inner.take_failure("create ConfigMap")?;
        let key = key_of(&config_map.metadata);
        if inner.config_maps.contains_key(&key) {
            return Err(StoreError::conflict("ConfigMap", key_display(&key)));
        }
        inner.take_conflict("ConfigMap", &key)?;

        let mut created = config_map.clone();
        created.metadata.namespace = Some(key.0.clone());
        created.metadata.resource_version = Some(inner.next_version());
        inner.config_maps.insert(key.clone(), created.clone());
        *inner.config_map_writes.entry(key).or_default() += 1;
        Ok(created)
    }

    async fn replace_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap, StoreError> {
        let mut inner = self.inner();
        inner.take_failure("replace ConfigMap")?;
        let key = key_of(&config_map.metadata);
        let stored = inner
            .config_maps
            .get(&key)
            .ok_or_else(|| StoreError::not_found("ConfigMap", key_display(&key)))?;
        check_version("ConfigMap", &key, &stored.metadata, &config_map.metadata)?;
        inner.take_conflict("ConfigMap", &key)?;

        let mut updated = config_map.clone();
        updated.metadata.resource_version = Some(inner.next_version());
        inner.config_maps.insert(key.clone(), updated.clone());
        *inner.config_map_writes.entry(key).or_default() += 1;
        Ok(updated)
    }
}
