//! Routing table derived from a RouterInstance and its IngressRule resources

use router_api::{IngressRule, RouterInstance};
use serde::{Deserialize, Serialize};

/// Routing table published to the router, serialized as `routing-data.json`
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoutingData {
    pub udp_port: u16,
    pub tcp_port: u16,
    pub advertise_address: String,
    pub generation: i64,
    pub rules: Vec<RoutingRule>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoutingRule {
    pub owner: String,
    pub domain: String,
    pub headnumber: String,
    pub backend: String,
}

/// Build the routing table for `instance` from every IngressRule resource of
/// the same ingress class.
///
/// Rules are sorted by owner, then domain. The sort is stable, so blocks of
/// one resource sharing a domain keep their declared order.
pub fn routing_data_for(instance: &RouterInstance, ingresses: &[IngressRule]) -> RoutingData {
    let service = &instance.spec.router_service;
    let class = &instance.spec.ingress_class_name;

    let mut rules: Vec<RoutingRule> = ingresses
        .iter()
        .filter(|ingress| &ingress.spec.ingress_class_name == class)
        .flat_map(|ingress| {
            let owner = ingress.owner();
            let own_namespace = ingress
                .metadata
                .namespace
                .clone()
                .unwrap_or_else(|| "default".to_string());
            ingress.spec.rules.iter().map(move |rule| RoutingRule {
                owner: owner.clone(),
                domain: rule.domain.clone(),
                headnumber: rule.headnumber.clone(),
                backend: format!(
                    "{}.{}",
                    rule.backend_service_name,
                    rule.backend_namespace.as_deref().unwrap_or(&own_namespace)
                ),
            })
        })
        .collect();

    rules.sort_by(|a, b| a.owner.cmp(&b.owner).then_with(|| a.domain.cmp(&b.domain)));

    RoutingData {
        udp_port: service.udp_port,
        tcp_port: service.tcp_port,
        advertise_address: service.advertise_address.clone(),
        generation: instance.metadata.generation.unwrap_or(0),
        rules,
    }
}

impl RoutingData {
    /// Indented JSON document as stored in the routing-data artifact
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
