//! AttachmentRequest CRD
//!
//! The declarative record of "this volume should be attached to this node
//! with this role", together with the attachment state the reconciler
//! observed on the backend.

use chrono::{DateTime, Utc};
use kube::api::ObjectMeta;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// Well-Known Keys
// =============================================================================

/// Finalizer that keeps an AttachmentRequest around until the volume has been
/// unpublished from its node
pub const ATTACHMENT_FINALIZER: &str = "disk.csi.azure.com/attachment-protection";

/// Label mirroring `status.detail.role`
pub const ROLE_LABEL: &str = "disk.csi.azure.com/role";

/// Volume context key carrying the requested role to the backend
pub const ROLE_CONTEXT_KEY: &str = "role";

/// Maximum length of a Kubernetes object name
const MAX_NAME_LENGTH: usize = 253;

// =============================================================================
// AttachmentRequest CRD
// =============================================================================

/// AttachmentRequest asks for one volume to be attached to one node.
///
/// It is created in `Pending` by the provisioning path (or by recovery) and
/// from then on only the attach/detach reconciler writes its status.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "disk.csi.azure.com",
    version = "v1alpha1",
    kind = "AttachmentRequest",
    plural = "attachmentrequests",
    shortname = "ar",
    status = "AttachmentRequestStatus",
    printcolumn = r#"{"name": "Volume", "type": "string", "jsonPath": ".spec.volumeName"}"#,
    printcolumn = r#"{"name": "Node", "type": "string", "jsonPath": ".spec.nodeId"}"#,
    printcolumn = r#"{"name": "Requested", "type": "string", "jsonPath": ".spec.requestedRole"}"#,
    printcolumn = r#"{"name": "Role", "type": "string", "jsonPath": ".status.detail.role"}"#,
    printcolumn = r#"{"name": "State", "type": "string", "jsonPath": ".status.state"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRequestSpec {
    /// Backend identifier of the volume (e.g. a managed disk URI)
    pub volume_id: String,

    /// Name of the PersistentVolume backing this request, if known
    #[serde(default)]
    pub volume_name: String,

    /// Node the volume should be attached to
    pub node_id: String,

    /// Role the attachment should have; Replica -> Primary requests promotion
    #[serde(default)]
    pub requested_role: Role,

    /// Context handed to the backend on publish
    #[serde(default)]
    pub volume_context: BTreeMap<String, String>,
}

// =============================================================================
// Sub-Types
// =============================================================================

/// Attachment role
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum Role {
    #[default]
    Primary,
    Replica,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Primary => "Primary",
            Role::Replica => "Replica",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Status
// =============================================================================

/// Observed state of an AttachmentRequest
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRequestStatus {
    /// Lifecycle state
    #[serde(default)]
    pub state: AttachmentState,

    /// Backend details, present while the volume is attached
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<AttachmentDetail>,

    /// Last failure, cleared on the next successful transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AttachmentError>,
}

/// Attachment lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum AttachmentState {
    #[default]
    Pending,
    Attaching,
    Attached,
    Detaching,
    Detached,
    Error,
}

impl std::fmt::Display for AttachmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttachmentState::Pending => write!(f, "Pending"),
            AttachmentState::Attaching => write!(f, "Attaching"),
            AttachmentState::Attached => write!(f, "Attached"),
            AttachmentState::Detaching => write!(f, "Detaching"),
            AttachmentState::Detached => write!(f, "Detached"),
            AttachmentState::Error => write!(f, "Error"),
        }
    }
}

/// What the backend reported for an attached volume
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentDetail {
    /// Opaque key/value data returned by publish
    #[serde(default)]
    pub publish_context: BTreeMap<String, String>,

    /// Role the attachment actually has
    pub role: Role,
}

/// Recorded failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentError {
    /// Short machine-readable reason
    pub code: String,

    /// Human-readable message
    pub message: String,

    /// When the failure was recorded
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub occurred_at: Option<DateTime<Utc>>,
}

impl AttachmentError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            occurred_at: Some(Utc::now()),
        }
    }
}

// =============================================================================
// Implementations
// =============================================================================

impl AttachmentRequest {
    /// Build a request for (volume, node) named by [`attachment_name`]
    pub fn for_volume(
        namespace: &str,
        volume_id: &str,
        volume_name: &str,
        node_id: &str,
        role: Role,
    ) -> Self {
        let mut request = AttachmentRequest::new(
            &attachment_name(volume_id, node_id),
            AttachmentRequestSpec {
                volume_id: volume_id.to_string(),
                volume_name: volume_name.to_string(),
                node_id: node_id.to_string(),
                requested_role: role,
                volume_context: BTreeMap::new(),
            },
        );
        request.metadata = ObjectMeta {
            namespace: Some(namespace.to_string()),
            ..request.metadata
        };
        request
    }

    /// Current lifecycle state (Pending when no status was written yet)
    pub fn state(&self) -> AttachmentState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }

    /// Role the attachment actually has, if attached
    pub fn actual_role(&self) -> Option<Role> {
        self.status
            .as_ref()
            .and_then(|s| s.detail.as_ref())
            .map(|d| d.role)
    }

    /// Whether an external actor asked for detachment
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Whether our finalizer is present
    pub fn has_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == ATTACHMENT_FINALIZER)
    }

    /// Value of the role label, if set
    pub fn role_label(&self) -> Option<&str> {
        self.labels().get(ROLE_LABEL).map(String::as_str)
    }

    /// Whether promotion from Replica to Primary has been requested
    pub fn wants_promotion(&self) -> bool {
        self.spec.requested_role == Role::Primary && self.actual_role() == Some(Role::Replica)
    }

    /// Check the identity fields the reconciler depends on
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.spec.volume_id.trim().is_empty() {
            return Err("spec.volumeId is empty".into());
        }
        if self.spec.node_id.trim().is_empty() {
            return Err("spec.nodeId is empty".into());
        }
        Ok(())
    }
}

/// Deterministic object name for a (volume, node) pair.
///
/// Uses the last path segment of the volume ID (the disk name for URI-style
/// IDs) so recovery and the provisioning path agree on one name per pair.
pub fn attachment_name(volume_id: &str, node_id: &str) -> String {
    let disk = volume_id
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(volume_id);
    let mut name = format!("{}-{}-attachment", sanitize(disk), sanitize(node_id));
    name.truncate(MAX_NAME_LENGTH);
    name.trim_matches('-').to_string()
}

/// Lowercase and replace anything outside DNS-1123 with '-'
fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect::<String>()
        .trim_matches('-')
        .to_string()
}
