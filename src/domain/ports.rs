//! Domain Ports - Core trait definitions for the attach operator
//!
//! These traits define the boundaries between the reconciliation logic and
//! the systems it drives. Adapters implement these traits to provide concrete
//! functionality; tests substitute in-process fakes.

use crate::crd::AttachmentRequest;
use crate::error::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolume;
use k8s_openapi::api::storage::v1::VolumeAttachment;
use std::collections::BTreeMap;
use std::sync::Arc;

// =============================================================================
// Attachment Provisioner Port
// =============================================================================

/// Port for the backend that really attaches and detaches volumes.
///
/// Both calls must be safe to retry for the same (volume, node) pair.
#[async_trait]
pub trait AttachmentProvisioner: Send + Sync {
    /// Attach `volume_id` to `node_id`, returning the publish context
    async fn publish(
        &self,
        volume_id: &str,
        node_id: &str,
        volume_context: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>>;

    /// Detach `volume_id` from `node_id`
    async fn unpublish(&self, volume_id: &str, node_id: &str) -> Result<()>;
}

// =============================================================================
// Cluster Client Port
// =============================================================================

/// Port for reading and writing cluster resources.
///
/// Writes of AttachmentRequests are conditional on `metadata.resourceVersion`
/// and fail with [`crate::Error::Conflict`] (or a 409 kube error) when the
/// stored object moved on.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Get an AttachmentRequest by name, `None` if it does not exist
    async fn get_attachment_request(&self, name: &str) -> Result<Option<AttachmentRequest>>;

    /// List all AttachmentRequests in the controller namespace
    async fn list_attachment_requests(&self) -> Result<Vec<AttachmentRequest>>;

    /// Create an AttachmentRequest, including its status
    async fn create_attachment_request(&self, request: &AttachmentRequest)
        -> Result<AttachmentRequest>;

    /// Replace metadata and spec of an AttachmentRequest
    async fn replace_attachment_request(
        &self,
        request: &AttachmentRequest,
    ) -> Result<AttachmentRequest>;

    /// Replace the status subresource of an AttachmentRequest
    async fn replace_attachment_request_status(
        &self,
        request: &AttachmentRequest,
    ) -> Result<AttachmentRequest>;

    /// List all VolumeAttachments in the cluster
    async fn list_volume_attachments(&self) -> Result<Vec<VolumeAttachment>>;

    /// Get a PersistentVolume by name, `None` if it does not exist
    async fn get_persistent_volume(&self, name: &str) -> Result<Option<PersistentVolume>>;

    /// Merge-patch annotations of a PersistentVolume.
    ///
    /// `Some(value)` sets a key, `None` removes it; keys not mentioned are
    /// left untouched.
    async fn patch_volume_annotations(
        &self,
        name: &str,
        annotations: &BTreeMap<String, Option<String>>,
    ) -> Result<PersistentVolume>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type AttachmentProvisionerRef = Arc<dyn AttachmentProvisioner>;
pub type ClusterClientRef = Arc<dyn ClusterClient>;
