//! Error types for the Disk Attach Operator
//!
//! Provides structured error types for the attach/detach reconciler, the
//! migration progress tracker, and the cluster/backend adapters they call.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    ResourceExists { kind: String, name: String },

    #[error("Conflicting update on {kind}/{name}")]
    Conflict { kind: String, name: String },

    #[error("Gave up updating {kind}/{name} after {attempts} conflicting writes")]
    ConflictRetriesExhausted {
        kind: String,
        name: String,
        attempts: u32,
    },

    // =========================================================================
    // Attachment Errors
    // =========================================================================
    #[error("Publish of volume {volume_id} to node {node_id} failed: {reason}")]
    Publish {
        volume_id: String,
        node_id: String,
        reason: String,
    },

    #[error("Unpublish of volume {volume_id} from node {node_id} failed: {reason}")]
    Unpublish {
        volume_id: String,
        node_id: String,
        reason: String,
    },

    #[error("Reconcile of {key} timed out after {timeout:?}")]
    ReconcileTimeout { key: String, timeout: Duration },

    // =========================================================================
    // Backend Errors
    // =========================================================================
    #[error("Backend unavailable: {backend}")]
    BackendUnavailable { backend: String },

    #[error("Backend request error: {0}")]
    BackendRequest(#[from] reqwest::Error),

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("Migration status parse error: {0}")]
    MigrationStatusParse(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Kube(_)
            | Error::Conflict { .. }
            | Error::ConflictRetriesExhausted { .. }
            | Error::Publish { .. }
            | Error::Unpublish { .. }
            | Error::ReconcileTimeout { .. }
            | Error::BackendUnavailable { .. }
            | Error::BackendRequest(_) => ErrorAction::RequeueWithBackoff,

            // Deleted underneath us - the next watch event decides
            Error::ResourceNotFound { .. } => ErrorAction::NoRequeue,

            // Someone else created it first - look again shortly
            Error::ResourceExists { .. } => ErrorAction::RequeueAfter(Duration::from_secs(5)),

            // Configuration/validation errors - don't retry automatically
            Error::Configuration(_)
            | Error::MigrationStatusParse(_) => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Kube(_)
                | Error::Conflict { .. }
                | Error::BackendUnavailable { .. }
                | Error::BackendRequest(_)
                | Error::ReconcileTimeout { .. }
        )
    }

    /// Check if this error is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict { .. } => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 409 && resp.reason == "Conflict",
            _ => false,
        }
    }

    /// Check if this error means the object does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::ResourceNotFound { .. } => true,
            Error::Kube(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// Check if this error means the object already exists
    pub fn is_already_exists(&self) -> bool {
        match self {
            Error::ResourceExists { .. } => true,
            Error::Kube(kube::Error::Api(resp)) => {
                resp.code == 409 && resp.reason == "AlreadyExists"
            }
            _ => false,
        }
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;
