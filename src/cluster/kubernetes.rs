//! Kubernetes Cluster Client
//!
//! [`ClusterClient`] implementation backed by the kube API server.

use crate::crd::AttachmentRequest;
use crate::domain::ports::ClusterClient;
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolume;
use k8s_openapi::api::storage::v1::VolumeAttachment;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use std::collections::BTreeMap;
use tracing::debug;

const ATTACHMENT_REQUEST_KIND: &str = "AttachmentRequest";
const PERSISTENT_VOLUME_KIND: &str = "PersistentVolume";

/// Cluster client talking to the Kubernetes API server
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
    namespace: String,
}

impl KubeClusterClient {
    /// Create a client scoped to `namespace` for AttachmentRequests
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    /// Namespace AttachmentRequests live in
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Typed API for AttachmentRequests
    pub fn attachment_requests(&self) -> Api<AttachmentRequest> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Typed API for PersistentVolumes
    pub fn persistent_volumes(&self) -> Api<PersistentVolume> {
        Api::all(self.client.clone())
    }

    /// Typed API for VolumeAttachments
    pub fn volume_attachments(&self) -> Api<VolumeAttachment> {
        Api::all(self.client.clone())
    }
}

/// Translate API status codes into the operator's error kinds
fn map_kube_error(err: kube::Error, kind: &str, name: &str) -> Error {
    match &err {
        kube::Error::Api(resp) if resp.code == 404 => Error::ResourceNotFound {
            kind: kind.to_string(),
            name: name.to_string(),
        },
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
            Error::ResourceExists {
                kind: kind.to_string(),
                name: name.to_string(),
            }
        }
        kube::Error::Api(resp) if resp.code == 409 => Error::Conflict {
            kind: kind.to_string(),
            name: name.to_string(),
        },
        _ => Error::Kube(err),
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn get_attachment_request(&self, name: &str) -> Result<Option<AttachmentRequest>> {
        Ok(self.attachment_requests().get_opt(name).await?)
    }

    async fn list_attachment_requests(&self) -> Result<Vec<AttachmentRequest>> {
        let list = self
            .attachment_requests()
            .list(&ListParams::default())
            .await?;
        Ok(list.items)
    }

    async fn create_attachment_request(
        &self,
        request: &AttachmentRequest,
    ) -> Result<AttachmentRequest> {
        let name = request.name_any();
        let api = self.attachment_requests();

        // Status is a subresource: create first, then write it separately
        let mut object = request.clone();
        let status = object.status.take();
        object.metadata.resource_version = None;

        let mut created = api
            .create(&PostParams::default(), &object)
            .await
            .map_err(|e| map_kube_error(e, ATTACHMENT_REQUEST_KIND, &name))?;

        if let Some(status) = status {
            created.status = Some(status);
            created = api
                .replace_status(&name, &PostParams::default(), serde_json::to_vec(&created)?)
                .await
                .map_err(|e| map_kube_error(e, ATTACHMENT_REQUEST_KIND, &name))?;
        }

        debug!(attachment = %name, "Created AttachmentRequest");
        Ok(created)
    }

    async fn replace_attachment_request(
        &self,
        request: &AttachmentRequest,
    ) -> Result<AttachmentRequest> {
        let name = request.name_any();
        self.attachment_requests()
            .replace(&name, &PostParams::default(), request)
            .await
            .map_err(|e| map_kube_error(e, ATTACHMENT_REQUEST_KIND, &name))
    }

    async fn replace_attachment_request_status(
        &self,
        request: &AttachmentRequest,
    ) -> Result<AttachmentRequest> {
        let name = request.name_any();
        self.attachment_requests()
            .replace_status(&name, &PostParams::default(), serde_json::to_vec(request)?)
            .await
            .map_err(|e| map_kube_error(e, ATTACHMENT_REQUEST_KIND, &name))
    }

    async fn list_volume_attachments(&self) -> Result<Vec<VolumeAttachment>> {
        let list = self
            .volume_attachments()
            .list(&ListParams::default())
            .await?;
        Ok(list.items)
    }

    async fn get_persistent_volume(&self, name: &str) -> Result<Option<PersistentVolume>> {
        Ok(self.persistent_volumes().get_opt(name).await?)
    }

    async fn patch_volume_annotations(
        &self,
        name: &str,
        annotations: &BTreeMap<String, Option<String>>,
    ) -> Result<PersistentVolume> {
        // `None` serializes to null, which a merge patch treats as removal
        let patch = serde_json::json!({
            "metadata": {
                "annotations": annotations,
            }
        });

        self.persistent_volumes()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_kube_error(e, PERSISTENT_VOLUME_KIND, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".into(),
            message: reason.into(),
            reason: reason.into(),
            code,
        })
    }

    #[test]
    fn test_map_kube_error() {
        assert_matches!(
            map_kube_error(api_error(404, "NotFound"), "AttachmentRequest", "a"),
            Error::ResourceNotFound { .. }
        );
        assert_matches!(
            map_kube_error(api_error(409, "AlreadyExists"), "AttachmentRequest", "a"),
            Error::ResourceExists { .. }
        );
        assert_matches!(
            map_kube_error(api_error(409, "Conflict"), "AttachmentRequest", "a"),
            Error::Conflict { .. }
        );
        assert_matches!(
            map_kube_error(api_error(500, "InternalError"), "AttachmentRequest", "a"),
            Error::Kube(_)
        );
    }
}
