/// API version v1alpha1 for SIP router CRDs

pub mod ingress_rule;
pub mod router_instance;

pub use ingress_rule::{IngressRule, IngressRuleSpec, SipRule};
pub use router_instance::{
    IngressReference, RouterCondition, RouterInstance, RouterInstanceSpec,
    RouterInstanceStatus, RouterServiceSpec,
};
