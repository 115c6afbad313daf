//! REST Attachment Provisioner
//!
//! Forwards publish/unpublish calls to an attachment service over HTTP.
//!
//! ```text
//!   POST {endpoint}/v1/publish    {volumeId, nodeId, volumeContext} -> {publishContext}
//!   POST {endpoint}/v1/unpublish  {volumeId, nodeId}                -> 2xx
//! ```

use crate::domain::ports::AttachmentProvisioner;
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the REST provisioner
#[derive(Debug, Clone)]
pub struct RestProvisionerConfig {
    /// Base URL of the attachment service
    pub endpoint: String,
    /// Per-request timeout
    pub request_timeout: Duration,
}

impl Default for RestProvisionerConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8090".to_string(),
            request_timeout: Duration::from_secs(60),
        }
    }
}

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PublishRequest<'a> {
    volume_id: &'a str,
    node_id: &'a str,
    volume_context: &'a BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    #[serde(default)]
    publish_context: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UnpublishRequest<'a> {
    volume_id: &'a str,
    node_id: &'a str,
}

// =============================================================================
// Provisioner
// =============================================================================

/// [`AttachmentProvisioner`] backed by an HTTP service
#[derive(Debug)]
pub struct RestAttachmentProvisioner {
    config: RestProvisionerConfig,
    http: reqwest::Client,
}

impl RestAttachmentProvisioner {
    pub fn new(config: RestProvisionerConfig) -> Result<Self> {
        if config.endpoint.trim().is_empty() {
            return Err(Error::Configuration(
                "provisioner endpoint must not be empty".to_string(),
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        info!(endpoint = %config.endpoint, "Using REST attachment provisioner");
        Ok(Self { config, http })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.endpoint.trim_end_matches('/'), path)
    }

    /// POST `body` and return the response, mapping non-2xx to `reason`
    async fn post<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<std::result::Result<reqwest::Response, String>> {
        let response = self.http.post(self.url(path)).json(body).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(Ok(response));
        }
        if status == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            return Err(Error::BackendUnavailable {
                backend: self.config.endpoint.clone(),
            });
        }
        let text = response.text().await.unwrap_or_default();
        Ok(Err(format!("{status}: {}", text.trim())))
    }
}

#[async_trait]
impl AttachmentProvisioner for RestAttachmentProvisioner {
    async fn publish(
        &self,
        volume_id: &str,
        node_id: &str,
        volume_context: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>> {
        debug!(%volume_id, %node_id, "Publishing volume");
        let body = PublishRequest {
            volume_id,
            node_id,
            volume_context,
        };
        match self.post("v1/publish", &body).await? {
            Ok(response) => {
                let parsed: PublishResponse = response.json().await?;
                Ok(parsed.publish_context)
            }
            Err(reason) => Err(Error::Publish {
                volume_id: volume_id.to_string(),
                node_id: node_id.to_string(),
                reason,
            }),
        }
    }

    async fn unpublish(&self, volume_id: &str, node_id: &str) -> Result<()> {
        debug!(%volume_id, %node_id, "Unpublishing volume");
        let body = UnpublishRequest { volume_id, node_id };
        match self.post("v1/unpublish", &body).await? {
            Ok(_) => Ok(()),
            Err(reason) => Err(Error::Unpublish {
                volume_id: volume_id.to_string(),
                node_id: node_id.to_string(),
                reason,
            }),
        }
    }
}
