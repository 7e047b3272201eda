//! SIP router API types and CRDs for Kubernetes integration
//!
//! This library defines the custom resources consumed by the router operator:
//! - RouterInstance: one SIP router per ingress class, plus the generator's
//!   change-tracking status
//! - IngressRule: domain/headnumber routing rules bound to an ingress class

pub mod v1alpha1;

pub use v1alpha1::{IngressRule, RouterInstance};
