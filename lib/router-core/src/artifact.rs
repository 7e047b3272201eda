//! Names, annotations and construction of the generated ConfigMaps

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Resource;
use router_api::RouterInstance;

use crate::error::{CoreError, Result};

/// Key of the routing table inside the routing-data artifact
pub const ROUTING_DATA_KEY: &str = "routing-data.json";
/// Hash of the routing-data artifact content
pub const ROUTING_DATA_HASH_ANNOTATION: &str = "router.sipingress.io/routing-data-hash";
/// Hash of the rendered-config artifact content
pub const CONFIG_HASH_ANNOTATION: &str = "router.sipingress.io/config-hash";
/// Label marking ConfigMaps written by the generator
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "router-controller";

pub fn routing_data_name(instance: &str) -> String {
    format!("{}-routing-data", instance)
}

pub fn config_name(instance: &str) -> String {
    format!("{}-config", instance)
}

pub fn annotation<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.annotations
        .as_ref()
        .and_then(|annotations| annotations.get(key))
        .map(String::as_str)
}

pub fn set_annotation(meta: &mut ObjectMeta, key: &str, value: &str) {
    meta.annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value.to_string());
}

/// Whether a ConfigMap was written by the generator
pub fn is_managed(meta: &ObjectMeta) -> bool {
    meta.labels
        .as_ref()
        .and_then(|labels| labels.get(MANAGED_BY_LABEL))
        .is_some_and(|value| value == MANAGED_BY_VALUE)
}

/// Whether some instance reads its templates from the ConfigMap `meta`
pub fn is_template_source<'a, I>(instances: I, meta: &ObjectMeta) -> bool
where
    I: IntoIterator<Item = &'a RouterInstance>,
{
    let (Some(namespace), Some(name)) = (meta.namespace.as_deref(), meta.name.as_deref()) else {
        return false;
    };
    instances.into_iter().any(|instance| {
        instance.metadata.namespace.as_deref() == Some(namespace)
            && instance.spec.template_source_ref.as_deref() == Some(name)
    })
}

/// Empty artifact owned by `instance`, so it is garbage collected with it
pub fn new_artifact(instance: &RouterInstance, name: String) -> Result<ConfigMap> {
    let owner = instance.controller_owner_ref(&()).ok_or_else(|| {
        CoreError::InvalidResource(format!(
            "RouterInstance {} has no name or uid",
            instance.key()
        ))
    })?;

    Ok(ConfigMap {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: instance.metadata.namespace.clone(),
            labels: Some(BTreeMap::from([(
                MANAGED_BY_LABEL.to_string(),
                MANAGED_BY_VALUE.to_string(),
            )])),
            owner_references: Some(vec![owner]),
            ..Default::default()
        },
        ..Default::default()
    })
}
