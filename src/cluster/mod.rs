//! Cluster Adapters
//!
//! Implementations of [`crate::domain::ports::ClusterClient`]: one backed by
//! the Kubernetes API, one in process.

pub mod kubernetes;
pub mod memory;

pub use kubernetes::KubeClusterClient;
pub use memory::{CallStats, MemoryClusterClient};
