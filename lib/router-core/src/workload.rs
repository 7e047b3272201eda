//! DaemonSet and Service running the SIP router of a RouterInstance
//!
//! Both objects are owned by the instance and created once; the rendered
//! configuration reaches the pods through ConfigMap volumes, so later
//! changes need no update of the workload itself.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, PodSpec, PodTemplateSpec, Service,
    ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::Resource;
use router_api::v1alpha1::RouterServiceSpec;
use router_api::RouterInstance;

use crate::artifact::{config_name, routing_data_name, MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use crate::error::{CoreError, Result};

pub const APP_LABEL: &str = "app.kubernetes.io/name";
pub const APP_VALUE: &str = "sip-router";
/// Selects the pods of one instance
pub const INSTANCE_LABEL: &str = "router.sipingress.io/instance";

pub const CONTAINER_NAME: &str = "sip-router";
pub const CONFIG_MOUNT_PATH: &str = "/etc/sip-router/config";
pub const ROUTING_DATA_MOUNT_PATH: &str = "/etc/sip-router/routing-data";

/// Name shared by the DaemonSet and the Service of an instance
pub fn workload_name(instance: &str) -> String {
    format!("{}-router", instance)
}

/// One SIP listener exposed by the router
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SipPort {
    pub name: &'static str,
    pub protocol: &'static str,
    pub port: i32,
}

/// Listeners of `service`; a port of 0 disables its transport
pub fn sip_ports(service: &RouterServiceSpec) -> Vec<SipPort> {
    [
        ("sip-udp", "UDP", service.udp_port),
        ("sip-tcp", "TCP", service.tcp_port),
    ]
    .into_iter()
    .filter(|(_, _, port)| *port != 0)
    .map(|(name, protocol, port)| SipPort {
        name,
        protocol,
        port: i32::from(port),
    })
    .collect()
}

fn selector_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_LABEL.to_string(), APP_VALUE.to_string()),
        (INSTANCE_LABEL.to_string(), name.to_string()),
    ])
}

fn owned_meta(instance: &RouterInstance, name: &str) -> Result<ObjectMeta> {
    let owner = instance.controller_owner_ref(&()).ok_or_else(|| {
        CoreError::InvalidResource(format!(
            "RouterInstance {} has no name or uid",
            instance.key()
        ))
    })?;

    let mut labels = selector_labels(name);
    labels.insert(MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string());

    Ok(ObjectMeta {
        name: Some(workload_name(name)),
        namespace: instance.metadata.namespace.clone(),
        labels: Some(labels),
        owner_references: Some(vec![owner]),
        ..Default::default()
    })
}

fn instance_name(instance: &RouterInstance) -> Result<&str> {
    instance
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| CoreError::InvalidResource("RouterInstance without name".to_string()))
}

fn config_volume(volume: &str, config_map: String) -> Volume {
    Volume {
        name: volume.to_string(),
        config_map: Some(ConfigMapVolumeSource {
            name: config_map,
            // published by the generator after the pods may have started
            optional: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Router pods on every node, with both generated artifacts mounted
pub fn daemon_set_for(instance: &RouterInstance, image: &str) -> Result<DaemonSet> {
    let name = instance_name(instance)?;
    let labels = selector_labels(name);

    let ports = sip_ports(&instance.spec.router_service)
        .into_iter()
        .map(|p| ContainerPort {
            name: Some(p.name.to_string()),
            protocol: Some(p.protocol.to_string()),
            container_port: p.port,
            ..Default::default()
        })
        .collect();

    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(image.to_string()),
        ports: Some(ports),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "config".to_string(),
                mount_path: CONFIG_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: "routing-data".to_string(),
                mount_path: ROUTING_DATA_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    Ok(DaemonSet {
        metadata: owned_meta(instance, name)?,
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(vec![
                        config_volume("config", config_name(name)),
                        config_volume("routing-data", routing_data_name(name)),
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// LoadBalancer in front of the router pods, carrying the instance's
/// service annotations
pub fn service_for(instance: &RouterInstance) -> Result<Service> {
    let name = instance_name(instance)?;
    let router_service = &instance.spec.router_service;

    let mut metadata = owned_meta(instance, name)?;
    if !router_service.annotations.is_empty() {
        metadata.annotations = Some(router_service.annotations.clone());
    }

    let ports = sip_ports(router_service)
        .into_iter()
        .map(|p| ServicePort {
            name: Some(p.name.to_string()),
            protocol: Some(p.protocol.to_string()),
            port: p.port,
            ..Default::default()
        })
        .collect();

    Ok(Service {
        metadata,
        spec: Some(ServiceSpec {
            type_: Some("LoadBalancer".to_string()),
            external_traffic_policy: Some("Local".to_string()),
            selector: Some(selector_labels(name)),
            ports: Some(ports),
            ..Default::default()
        }),
        ..Default::default()
    })
}
