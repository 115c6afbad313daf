//! Disk Attach Operator
//!
//! A Kubernetes operator that attaches volumes to nodes on behalf of a CSI
//! driver and tracks storage account type migrations of its volumes.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                          Watch Event Pumps                            │
//! │   AttachmentRequest events ──▶ WorkQueue    PersistentVolume events   │
//! ├──────────────────────────────────┬────────────────────────────────────┤
//! │   Attach/Detach Reconciler       │   Migration Progress Tracker       │
//! │   (N workers, one key at once)   │   (spawned update per volume)      │
//! ├──────────────────────────────────┴────────────────────────────────────┤
//! │                              Ports                                    │
//! │   AttachmentProvisioner (REST)     ClusterClient (kube / in-memory)   │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controller`]: reconciler, migration tracker, work queue, watches
//! - [`crd`]: Custom Resource Definitions
//! - [`domain`]: Port traits
//! - [`cluster`]: Cluster client adapters
//! - [`backends`]: Attachment backend adapters
//! - [`error`]: Error types and handling

pub mod backends;
pub mod cluster;
pub mod controller;
pub mod crd;
pub mod domain;
pub mod error;

// Re-export commonly used types
pub use backends::{RestAttachmentProvisioner, RestProvisionerConfig};

pub use cluster::{KubeClusterClient, MemoryClusterClient};

pub use controller::{
    AttachDetachReconciler, ControllerMetrics, MigrationProgressTracker, MigrationStatus,
    QueueConfig, ReconcilerConfig, RecoveryReport, TrackerConfig, WorkQueue,
};

pub use crd::{
    AttachmentRequest, AttachmentRequestSpec, AttachmentRequestStatus, AttachmentState, Role,
};

pub use domain::ports::{AttachmentProvisioner, ClusterClient};

pub use error::{Error, ErrorAction, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
