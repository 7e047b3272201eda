//! Kubernetes backend of the resource store
pub mod store;

pub use store::KubeStore;
