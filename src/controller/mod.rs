//! Controllers
//!
//! - [`attach_detach`]: reconciles AttachmentRequests against the backend
//! - [`migration`]: records storage account type conversion progress
//! - [`queue`]: deduplicating work queue feeding the reconciler workers
//! - [`events`]: watch streams feeding the queue and the tracker
//! - [`metrics`]: prometheus counters

pub mod attach_detach;
pub mod events;
pub mod metrics;
pub mod migration;
pub mod queue;

pub use attach_detach::{AttachDetachReconciler, ReconcilerConfig, RecoveryReport};
pub use metrics::ControllerMetrics;
pub use migration::{
    MigrationAnnotationKeys, MigrationProgressTracker, MigrationStatus, TrackerConfig,
    VolumeCache,
};
pub use queue::{QueueConfig, WorkQueue};
