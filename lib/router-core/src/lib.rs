//! Configuration generation for SIP routers
//!
//! This library provides:
//! - Routing data derived from RouterInstances and their IngressRules
//! - Content hashing and template rendering of router configuration
//! - The debounced generator publishing both as ConfigMaps
//! - Finalizer-guarded back-references from RouterInstances to IngressRules
//! - The DaemonSet and Service running each router

pub mod artifact;
pub mod config;
pub mod debounce;
pub mod error;
pub mod generator;
pub mod hash;
pub mod references;
pub mod retry;
pub mod routing_data;
pub mod store;
pub mod template;
pub mod workload;

pub use config::GeneratorConfig;
pub use debounce::Debouncer;
pub use error::{CoreError, Result, StoreError};
pub use generator::{ChangeNotifier, Generator, PassReport};
pub use references::{ReferenceReconciler, ReferenceState};
pub use routing_data::{routing_data_for, RoutingData, RoutingRule};
pub use store::{InMemoryStore, ResourceStore};
