use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// RouterInstance describes one SIP router and the ingress class it serves.
///
/// The generator owns the status block: it records the hashes of the last
/// artifacts it actually wrote, and the ingress reconciler maintains the
/// list of IngressRule resources referencing this instance.
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "router.sipingress.io",
    version = "v1alpha1",
    kind = "RouterInstance",
    plural = "routerinstances",
    derive = "Default",
    status = "RouterInstanceStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct RouterInstanceSpec {
    /// Name of the ingress class managed by this instance
    pub ingress_class_name: String,

    /// Name of the ConfigMap (same namespace) holding the config templates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_source_ref: Option<String>,

    /// Configuration for the generated router service
    #[serde(default)]
    pub router_service: RouterServiceSpec,
}

/// Network settings of the router service
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RouterServiceSpec {
    /// SIP UDP port, 0 disables UDP
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,

    /// SIP TCP port, 0 disables TCP
    #[serde(default)]
    pub tcp_port: u16,

    /// Address advertised in SIP headers
    #[serde(default)]
    pub advertise_address: String,

    /// Annotations set on the generated LoadBalancer Service
    #[serde(default)]
    pub annotations: std::collections::BTreeMap<String, String>,
}

impl Default for RouterServiceSpec {
    fn default() -> Self {
        Self {
            udp_port: default_udp_port(),
            tcp_port: 0,
            advertise_address: String::new(),
            annotations: Default::default(),
        }
    }
}

/// Status of a RouterInstance
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouterInstanceStatus {
    /// Latest observations of the instance's state
    #[serde(default)]
    pub conditions: Vec<RouterCondition>,

    /// Incremented every time a new rendered configuration is published
    #[serde(default)]
    pub configuration_generation: i64,

    /// Hash of the template source set behind the published configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub templates_hash: Option<String>,

    /// Hash of the routing data behind the published configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub router_data_hash: Option<String>,

    /// IngressRule resources currently bound to this instance
    #[serde(default)]
    pub ingress_references: Vec<IngressReference>,
}

/// Back-reference from a RouterInstance to an IngressRule resource
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IngressReference {
    pub namespace: String,
    pub name: String,

    /// RFC 3339 timestamp of the last reconcile touching this pair
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciliation_time: Option<String>,
}

/// Condition for RouterInstance status
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RouterCondition {
    /// Type of condition
    #[serde(rename = "type")]
    pub condition_type: String,

    /// Status: "True", "False"
    pub status: String,

    /// Machine-readable reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// RFC 3339 timestamp of the last status change
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl RouterInstanceStatus {
    /// Look up a condition by type
    pub fn condition(&self, condition_type: &str) -> Option<&RouterCondition> {
        self.conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    /// Insert or replace a condition by type.
    ///
    /// The transition time is kept when only reason/message change. Returns
    /// `true` when anything was modified.
    pub fn set_condition(&mut self, condition: RouterCondition) -> bool {
        match self
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == condition.condition_type)
        {
            Some(existing) => {
                if existing.status == condition.status
                    && existing.reason == condition.reason
                    && existing.message == condition.message
                {
                    return false;
                }
                let keep_time = existing.status == condition.status;
                let previous_time = existing.last_transition_time.take();
                *existing = condition;
                if keep_time {
                    existing.last_transition_time = previous_time;
                }
                true
            }
            None => {
                self.conditions.push(condition);
                true
            }
        }
    }
}

impl RouterInstance {
    /// `namespace/name` of this instance
    pub fn key(&self) -> String {
        format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or("default"),
            self.metadata.name.as_deref().unwrap_or_default()
        )
    }
}

fn default_udp_port() -> u16 {
    5060
}

#[cfg(test)]
mod tests {
    use super::*;

    fn condition(status: &str, reason: &str, time: &str) -> RouterCondition {
        RouterCondition {
            condition_type: "TemplatesRead".to_string(),
            status: status.to_string(),
            reason: Some(reason.to_string()),
            message: None,
            last_transition_time: Some(time.to_string()),
        }
    }

    #[test]
    fn test_spec_uses_camel_case_and_defaults() {
        let spec: RouterInstanceSpec = serde_json::from_value(serde_json::json!({
            "ingressClassName": "sip-a",
            "templateSourceRef": "kamailio-templates",
            "routerService": { "advertiseAddress": "10.0.0.1" }
        }))
        .unwrap();

        assert_eq!(spec.ingress_class_name, "sip-a");
        assert_eq!(spec.template_source_ref.as_deref(), Some("kamailio-templates"));
        assert_eq!(spec.router_service.udp_port, 5060);
        assert_eq!(spec.router_service.tcp_port, 0);
    }

    #[test]
    fn test_status_serializes_reference_fields() {
        let status = RouterInstanceStatus {
            ingress_references: vec![IngressReference {
                namespace: "ns1".to_string(),
                name: "i1".to_string(),
                reconciliation_time: Some("2024-01-01T00:00:00Z".to_string()),
            }],
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["ingressReferences"][0]["reconciliationTime"], "2024-01-01T00:00:00Z");
        assert_eq!(json["configurationGeneration"], 0);
        assert!(json.get("templatesHash").is_none());
    }

    #[test]
    fn test_set_condition_replaces_by_type() {
        let mut status = RouterInstanceStatus::default();
        assert!(status.set_condition(condition("False", "NotFound", "t1")));
        assert!(!status.set_condition(condition("False", "NotFound", "t2")));
        assert!(status.set_condition(condition("True", "Found", "t3")));

        assert_eq!(status.conditions.len(), 1);
        let current = status.condition("TemplatesRead").unwrap();
        assert_eq!(current.status, "True");
        assert_eq!(current.last_transition_time.as_deref(), Some("t3"));
    }

    #[test]
    fn test_set_condition_keeps_transition_time_for_same_status() {
        let mut status = RouterInstanceStatus::default();
        status.set_condition(condition("False", "NotFound", "t1"));
        assert!(status.set_condition(condition("False", "NoTemplateSource", "t2")));

        let current = status.condition("TemplatesRead").unwrap();
        assert_eq!(current.reason.as_deref(), Some("NoTemplateSource"));
        assert_eq!(current.last_transition_time.as_deref(), Some("t1"));
    }
}
