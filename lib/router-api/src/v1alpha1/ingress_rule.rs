use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// IngressRule binds SIP routing rules to an ingress class
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "router.sipingress.io",
    version = "v1alpha1",
    kind = "IngressRule",
    plural = "ingressrules",
    derive = "Default",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct IngressRuleSpec {
    /// Ingress class selecting the RouterInstance that serves these rules
    pub ingress_class_name: String,

    /// Routing rules
    #[serde(default)]
    pub rules: Vec<SipRule>,
}

/// A single domain/headnumber to backend mapping
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SipRule {
    /// SIP domain (e.g. "example.com")
    pub domain: String,

    /// Head number prefix
    #[serde(default)]
    pub headnumber: String,

    /// Name of the backend Service
    pub backend_service_name: String,

    /// Namespace of the backend Service (defaults to the rule's namespace)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_namespace: Option<String>,
}

impl IngressRule {
    /// `namespace/name` identity used as routing rule owner
    pub fn owner(&self) -> String {
        format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or("default"),
            self.metadata.name.as_deref().unwrap_or_default()
        )
    }
}
