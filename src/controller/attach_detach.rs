//! Attach/Detach Reconciler
//!
//! Drives AttachmentRequests through their lifecycle:
//!
//! ```text
//!   Pending ──publish──▶ Attaching ──ok──▶ Attached ──deletion──▶ Detaching ──unpublish ok──▶ Detached
//!      ▲                    │                  │                      │
//!      └──── Error ◀──fail──┘          promote (Replica→Primary)   fail: stay Detaching, retry
//! ```
//!
//! Every decision is made from the latest stored object alone, so a
//! reconcile may start from any state after a restart or a collapsed burst
//! of events. Writes re-read the object and retry on version conflicts.
//! [`AttachDetachReconciler::recover`] rebuilds requests for attachments the
//! cluster knows about but that have no AttachmentRequest.

use crate::controller::metrics::{ControllerMetrics, RESULT_FAILURE, RESULT_SUCCESS};
use crate::controller::queue::WorkQueue;
use crate::crd::{
    AttachmentDetail, AttachmentError, AttachmentRequest,
    AttachmentRequestStatus, AttachmentState, Role, ATTACHMENT_FINALIZER, ROLE_CONTEXT_KEY,
    ROLE_LABEL,
};
use crate::domain::ports::{AttachmentProvisionerRef, ClusterClientRef};
use crate::error::{Error, ErrorAction, Result};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use k8s_openapi::api::storage::v1::VolumeAttachment;
use kube::ResourceExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const ATTACHMENT_REQUEST_KIND: &str = "AttachmentRequest";

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the attach/detach reconciler
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// CSI driver name VolumeAttachments and PersistentVolumes must carry
    pub driver_name: String,
    /// Namespace AttachmentRequests live in
    pub namespace: String,
    /// Deadline for one reconcile attempt
    pub reconcile_timeout: Duration,
    /// Attempts per write before giving up on conflicts
    pub conflict_retry_budget: u32,
    /// First delay between conflicting writes
    pub conflict_retry_delay: Duration,
    /// First delay between incomplete recovery passes
    pub recovery_retry_delay: Duration,
    /// Longest delay between recovery passes
    pub recovery_retry_max_delay: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            driver_name: "disk.csi.azure.com".to_string(),
            namespace: "azure-disk-csi".to_string(),
            reconcile_timeout: Duration::from_secs(120),
            conflict_retry_budget: 5,
            conflict_retry_delay: Duration::from_millis(50),
            recovery_retry_delay: Duration::from_secs(1),
            recovery_retry_max_delay: Duration::from_secs(60),
        }
    }
}

// =============================================================================
// Results
// =============================================================================

/// Summary of a recovery pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// AttachmentRequests created
    pub created: u32,
    /// Attachments that already had a request
    pub skipped: u32,
    /// VolumeAttachments that do not belong to this driver
    pub ignored: u32,
    /// Attachments that could not be inspected or whose request could not
    /// be created
    pub failed: u32,
    /// Attachments whose derived name is held by a request for another
    /// (volume, node) pair
    pub name_collisions: u32,
}

/// Which part of the object a write replaces
#[derive(Debug, Clone, Copy)]
enum WriteTarget {
    Object,
    Status,
}

// =============================================================================
// Reconciler
// =============================================================================

/// Reconciles AttachmentRequests against the attachment backend
pub struct AttachDetachReconciler {
    config: ReconcilerConfig,
    client: ClusterClientRef,
    provisioner: AttachmentProvisionerRef,
    metrics: Arc<ControllerMetrics>,
}

impl AttachDetachReconciler {
    /// Create a new reconciler
    pub fn new(
        config: ReconcilerConfig,
        client: ClusterClientRef,
        provisioner: AttachmentProvisionerRef,
        metrics: Arc<ControllerMetrics>,
    ) -> Self {
        Self {
            config,
            client,
            provisioner,
            metrics,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Reconcile the AttachmentRequest called `name`
    pub async fn reconcile(&self, name: &str) -> Result<()> {
        match self.reconcile_inner(name).await {
            Err(e) if e.is_not_found() => {
                debug!(attachment = %name, "AttachmentRequest gone, nothing to do");
                Ok(())
            }
            other => other,
        }
    }

    async fn reconcile_inner(&self, name: &str) -> Result<()> {
        let Some(request) = self.client.get_attachment_request(name).await? else {
            debug!(attachment = %name, "AttachmentRequest not found");
            return Ok(());
        };

        if let Err(reason) = request.validate() {
            warn!(attachment = %name, %reason, "Ignoring malformed AttachmentRequest");
            return Ok(());
        }

        if request.is_deleting() {
            return self.detach(&request).await;
        }

        match request.state() {
            AttachmentState::Pending | AttachmentState::Attaching | AttachmentState::Error => {
                self.attach(&request).await
            }
            AttachmentState::Attached => self.reconcile_attached(&request).await,
            AttachmentState::Detaching => {
                warn!(
                    attachment = %name,
                    "AttachmentRequest is Detaching without a deletion request, leaving as is"
                );
                Ok(())
            }
            AttachmentState::Detached => Ok(()),
        }
    }

    // =========================================================================
    // Attach
    // =========================================================================

    async fn attach(&self, request: &AttachmentRequest) -> Result<()> {
        let name = request.name_any();
        let volume_id = request.spec.volume_id.as_str();
        let node_id = request.spec.node_id.as_str();
        let role = request.spec.requested_role;

        info!(attachment = %name, %volume_id, %node_id, %role, "Attaching volume");

        // The finalizer must be in place before anything can be attached
        self.update_object(&name, add_finalizer).await?;
        let request = self
            .update_status(&name, |status| {
                status.state = AttachmentState::Attaching;
            })
            .await?;

        let context = publish_context_for(&request.spec.volume_context, role);
        match self.provisioner.publish(volume_id, node_id, &context).await {
            Ok(publish_context) => {
                self.metrics.record_operation("publish", true);
                self.update_status(&name, |status| {
                    status.state = AttachmentState::Attached;
                    status.detail = Some(AttachmentDetail {
                        publish_context: publish_context.clone(),
                        role,
                    });
                    status.error = None;
                })
                .await?;
                self.update_object(&name, |obj| set_role_label(obj, role))
                    .await?;
                info!(attachment = %name, %volume_id, %node_id, %role, "Volume attached");
                Ok(())
            }
            Err(e) => {
                self.metrics.record_operation("publish", false);
                let reason = backend_reason(e);
                warn!(attachment = %name, %volume_id, %node_id, error = %reason, "Publish failed");
                self.update_status(&name, |status| {
                    status.state = AttachmentState::Error;
                    status.error = Some(AttachmentError::new("PublishFailed", reason.clone()));
                })
                .await?;
                Err(Error::Publish {
                    volume_id: volume_id.to_string(),
                    node_id: node_id.to_string(),
                    reason,
                })
            }
        }
    }

    async fn reconcile_attached(&self, request: &AttachmentRequest) -> Result<()> {
        let name = request.name_any();
        let Some(actual) = request.actual_role() else {
            warn!(attachment = %name, "Attached AttachmentRequest has no detail, leaving as is");
            return Ok(());
        };

        if request.wants_promotion() {
            return self.promote(request).await;
        }

        if request.spec.requested_role == Role::Replica && actual == Role::Primary {
            warn!(attachment = %name, "Demotion to Replica is not supported in place");
        }

        if request.role_label() != Some(actual.as_str()) {
            self.update_object(&name, |obj| set_role_label(obj, actual))
                .await?;
        }
        Ok(())
    }

    async fn promote(&self, request: &AttachmentRequest) -> Result<()> {
        let name = request.name_any();
        let volume_id = request.spec.volume_id.as_str();
        let node_id = request.spec.node_id.as_str();

        info!(attachment = %name, %volume_id, %node_id, "Promoting attachment to Primary");

        let context = publish_context_for(&request.spec.volume_context, Role::Primary);
        match self.provisioner.publish(volume_id, node_id, &context).await {
            Ok(publish_context) => {
                self.metrics.record_operation("promote", true);
                self.update_status(&name, |status| {
                    if let Some(detail) = status.detail.as_mut() {
                        detail.role = Role::Primary;
                        detail.publish_context = publish_context.clone();
                    }
                    status.error = None;
                })
                .await?;
                self.update_object(&name, |obj| set_role_label(obj, Role::Primary))
                    .await?;
                info!(attachment = %name, "Attachment promoted to Primary");
                Ok(())
            }
            Err(e) => {
                self.metrics.record_operation("promote", false);
                let reason = backend_reason(e);
                warn!(attachment = %name, error = %reason, "Promotion failed");
                self.update_status(&name, |status| {
                    status.error = Some(AttachmentError::new("PromoteFailed", reason.clone()));
                })
                .await?;
                Err(Error::Publish {
                    volume_id: volume_id.to_string(),
                    node_id: node_id.to_string(),
                    reason,
                })
            }
        }
    }

    // =========================================================================
    // Detach
    // =========================================================================

    async fn detach(&self, request: &AttachmentRequest) -> Result<()> {
        let name = request.name_any();
        let volume_id = request.spec.volume_id.as_str();
        let node_id = request.spec.node_id.as_str();

        match request.state() {
            AttachmentState::Detached => {
                self.update_object(&name, remove_finalizer).await?;
                return Ok(());
            }
            AttachmentState::Pending if !request.has_finalizer() => {
                // Never reached the backend
                self.update_status(&name, |status| {
                    status.state = AttachmentState::Detached;
                    status.detail = None;
                })
                .await?;
                return Ok(());
            }
            _ => {}
        }

        info!(attachment = %name, %volume_id, %node_id, "Detaching volume");
        self.update_status(&name, |status| {
            status.state = AttachmentState::Detaching;
        })
        .await?;

        match self.provisioner.unpublish(volume_id, node_id).await {
            Ok(()) => {
                self.metrics.record_operation("unpublish", true);
                self.update_status(&name, |status| {
                    status.state = AttachmentState::Detached;
                    status.detail = None;
                    status.error = None;
                })
                .await?;
                self.update_object(&name, remove_finalizer).await?;
                info!(attachment = %name, %volume_id, %node_id, "Volume detached");
                Ok(())
            }
            Err(e) => {
                self.metrics.record_operation("unpublish", false);
                let reason = backend_reason(e);
                warn!(attachment = %name, %volume_id, %node_id, error = %reason, "Unpublish failed");
                self.update_status(&name, |status| {
                    status.error = Some(AttachmentError::new("UnpublishFailed", reason.clone()));
                })
                .await?;
                Err(Error::Unpublish {
                    volume_id: volume_id.to_string(),
                    node_id: node_id.to_string(),
                    reason,
                })
            }
        }
    }

    // =========================================================================
    // Write-Back
    // =========================================================================

    async fn update_status<F>(&self, name: &str, mut mutate: F) -> Result<AttachmentRequest>
    where
        F: FnMut(&mut AttachmentRequestStatus) + Send,
    {
        self.write_with_retry(name, WriteTarget::Status, |obj| {
            let before = obj.status.clone();
            let status = obj.status.get_or_insert_with(Default::default);
            mutate(status);
            obj.status != before
        })
        .await
    }

    async fn update_object<F>(&self, name: &str, mutate: F) -> Result<AttachmentRequest>
    where
        F: FnMut(&mut AttachmentRequest) -> bool + Send,
    {
        self.write_with_retry(name, WriteTarget::Object, mutate).await
    }

    /// Re-read, mutate, conditionally write; retry on version conflicts.
    ///
    /// `mutate` returns whether it changed anything; unchanged objects are
    /// not written.
    async fn write_with_retry<F>(
        &self,
        name: &str,
        target: WriteTarget,
        mut mutate: F,
    ) -> Result<AttachmentRequest>
    where
        F: FnMut(&mut AttachmentRequest) -> bool + Send,
    {
        let mut policy = ExponentialBackoff {
            current_interval: self.config.conflict_retry_delay,
            initial_interval: self.config.conflict_retry_delay,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let mut latest = self
                .client
                .get_attachment_request(name)
                .await?
                .ok_or_else(|| Error::ResourceNotFound {
                    kind: ATTACHMENT_REQUEST_KIND.to_string(),
                    name: name.to_string(),
                })?;

            if !mutate(&mut latest) {
                return Ok(latest);
            }

            let written = match target {
                WriteTarget::Object => self.client.replace_attachment_request(&latest).await,
                WriteTarget::Status => {
                    self.client.replace_attachment_request_status(&latest).await
                }
            };

            match written {
                Ok(obj) => return Ok(obj),
                Err(e) if e.is_conflict() && attempts < self.config.conflict_retry_budget => {
                    let delay = policy
                        .next_backoff()
                        .unwrap_or(self.config.conflict_retry_delay);
                    debug!(attachment = %name, attempts, ?delay, "Write conflicted, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_conflict() => {
                    return Err(Error::ConflictRetriesExhausted {
                        kind: ATTACHMENT_REQUEST_KIND.to_string(),
                        name: name.to_string(),
                        attempts,
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    /// Create AttachmentRequests for attachments of this driver that have none.
    ///
    /// Safe to run repeatedly: requests are matched by their derived name and
    /// by (volume, node), and existing ones are never modified. A failure on
    /// one attachment is counted in the report and the pass moves on; only a
    /// failed listing fails the whole pass.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        info!(driver = %self.config.driver_name, "Recovering AttachmentRequests");

        let existing = self.client.list_attachment_requests().await?;
        let mut known_names: HashMap<String, (String, String)> = existing
            .iter()
            .map(|r| (r.name_any(), (r.spec.volume_id.clone(), r.spec.node_id.clone())))
            .collect();
        let mut known_pairs: HashSet<(String, String)> =
            known_names.values().cloned().collect();

        let mut report = RecoveryReport::default();
        for attachment in self.client.list_volume_attachments().await? {
            let request = match self.request_for_attachment(&attachment).await {
                Ok(Some(request)) => request,
                Ok(None) => {
                    report.ignored += 1;
                    continue;
                }
                Err(e) => {
                    error!(
                        volume_attachment = %attachment.name_any(),
                        error = %e,
                        "Failed to inspect VolumeAttachment"
                    );
                    report.failed += 1;
                    continue;
                }
            };

            let name = request.name_any();
            let pair = (request.spec.volume_id.clone(), request.spec.node_id.clone());
            if known_pairs.contains(&pair) {
                report.skipped += 1;
                continue;
            }
            if let Some(taken_by) = known_names.get(&name) {
                warn!(
                    attachment = %name,
                    volume_id = %pair.0,
                    node_id = %pair.1,
                    existing_volume_id = %taken_by.0,
                    "AttachmentRequest name already used by another volume, not recovered"
                );
                report.name_collisions += 1;
                continue;
            }

            match self.client.create_attachment_request(&request).await {
                Ok(_) => {
                    info!(
                        attachment = %name,
                        volume_id = %pair.0,
                        node_id = %pair.1,
                        state = %request.state(),
                        "Recovered AttachmentRequest"
                    );
                    report.created += 1;
                }
                Err(e) if e.is_already_exists() => {
                    // Created since the listing; compare against what is stored
                    match self.client.get_attachment_request(&name).await {
                        Ok(Some(stored))
                            if stored.spec.volume_id != pair.0 || stored.spec.node_id != pair.1 =>
                        {
                            warn!(
                                attachment = %name,
                                volume_id = %pair.0,
                                existing_volume_id = %stored.spec.volume_id,
                                "AttachmentRequest name already used by another volume, not recovered"
                            );
                            report.name_collisions += 1;
                            continue;
                        }
                        _ => report.skipped += 1,
                    }
                }
                Err(e) => {
                    error!(attachment = %name, error = %e, "Failed to recover AttachmentRequest");
                    report.failed += 1;
                    continue;
                }
            }
            known_names.insert(name, pair.clone());
            known_pairs.insert(pair);
        }

        info!(
            created = report.created,
            skipped = report.skipped,
            ignored = report.ignored,
            failed = report.failed,
            name_collisions = report.name_collisions,
            "Recovery finished"
        );
        Ok(report)
    }

    /// Run [`recover`](Self::recover) until a pass lists everything and
    /// fails on nothing, backing off between passes.
    ///
    /// Returns the complete report, or `None` when `shutdown` fired first.
    pub async fn recover_until_complete(
        &self,
        shutdown: &CancellationToken,
    ) -> Option<RecoveryReport> {
        let mut policy = ExponentialBackoff {
            current_interval: self.config.recovery_retry_delay,
            initial_interval: self.config.recovery_retry_delay,
            max_interval: self.config.recovery_retry_max_delay,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };

        loop {
            match self.recover().await {
                Ok(report) if report.failed == 0 => return Some(report),
                Ok(report) => warn!(failed = report.failed, "Recovery incomplete"),
                Err(e) => warn!(error = %e, "Recovery failed"),
            }

            let delay = policy
                .next_backoff()
                .unwrap_or(self.config.recovery_retry_max_delay);
            info!(?delay, "Retrying recovery");
            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Build the request a VolumeAttachment implies, if it belongs to us
    async fn request_for_attachment(
        &self,
        attachment: &VolumeAttachment,
    ) -> Result<Option<AttachmentRequest>> {
        let driver = self.config.driver_name.as_str();
        if attachment.spec.attacher != driver {
            return Ok(None);
        }
        let Some(pv_name) = attachment.spec.source.persistent_volume_name.as_deref() else {
            debug!(attachment = %attachment.name_any(), "VolumeAttachment has no PersistentVolume source");
            return Ok(None);
        };
        let Some(pv) = self.client.get_persistent_volume(pv_name).await? else {
            warn!(volume = %pv_name, "PersistentVolume of VolumeAttachment not found");
            return Ok(None);
        };
        let Some(csi) = pv.spec.as_ref().and_then(|s| s.csi.as_ref()) else {
            return Ok(None);
        };
        if csi.driver != driver {
            return Ok(None);
        }

        let node_id = attachment.spec.node_name.as_str();
        let mut request = AttachmentRequest::for_volume(
            &self.config.namespace,
            &csi.volume_handle,
            pv_name,
            node_id,
            Role::Primary,
        );

        let attached = attachment
            .status
            .as_ref()
            .map(|s| s.attached)
            .unwrap_or(false);
        if attached {
            let publish_context = attachment
                .status
                .as_ref()
                .and_then(|s| s.attachment_metadata.clone())
                .unwrap_or_default();
            add_finalizer(&mut request);
            set_role_label(&mut request, Role::Primary);
            request.status = Some(AttachmentRequestStatus {
                state: AttachmentState::Attached,
                detail: Some(AttachmentDetail {
                    publish_context,
                    role: Role::Primary,
                }),
                error: None,
            });
        } else {
            request.status = Some(AttachmentRequestStatus::default());
        }

        Ok(Some(request))
    }

    // =========================================================================
    // Workers
    // =========================================================================

    /// Run `workers` reconcile loops over `queue` until `shutdown` fires
    pub async fn run(
        self: Arc<Self>,
        queue: Arc<WorkQueue<String>>,
        workers: usize,
        shutdown: CancellationToken,
    ) {
        info!(workers, "Starting attach/detach workers");
        let handles: Vec<_> = (0..workers.max(1))
            .map(|id| {
                let reconciler = Arc::clone(&self);
                let queue = Arc::clone(&queue);
                tokio::spawn(async move { reconciler.worker(id, queue).await })
            })
            .collect();

        shutdown.cancelled().await;
        info!("Stopping attach/detach workers");
        queue.shut_down();
        for handle in futures::future::join_all(handles).await {
            if let Err(e) = handle {
                error!(error = %e, "Attach/detach worker panicked");
            }
        }
    }

    async fn worker(&self, id: usize, queue: Arc<WorkQueue<String>>) {
        debug!(worker = id, "Worker started");
        while let Some(key) = queue.get().await {
            self.process(&queue, key).await;
        }
        debug!(worker = id, "Worker stopped");
    }

    /// Reconcile one key taken from `queue` and schedule its follow-up
    pub async fn process(&self, queue: &Arc<WorkQueue<String>>, key: String) {
        let timeout = self.config.reconcile_timeout;
        let outcome = match tokio::time::timeout(timeout, self.reconcile(&key)).await {
            Ok(result) => result,
            Err(_) => Err(Error::ReconcileTimeout {
                key: key.clone(),
                timeout,
            }),
        };

        match outcome {
            Ok(()) => {
                self.metrics.record_reconcile(RESULT_SUCCESS);
                queue.forget(&key);
            }
            Err(e) => {
                let result = match e {
                    Error::ReconcileTimeout { .. } => "timeout",
                    _ => RESULT_FAILURE,
                };
                self.metrics.record_reconcile(result);
                match e.action() {
                    ErrorAction::RequeueWithBackoff => {
                        let delay = queue.add_rate_limited(key.clone());
                        warn!(attachment = %key, error = %e, ?delay, "Reconcile failed, requeued");
                    }
                    ErrorAction::RequeueAfter(delay) => {
                        warn!(attachment = %key, error = %e, ?delay, "Reconcile failed, requeued");
                        queue.add_after(key.clone(), delay);
                    }
                    ErrorAction::NoRequeue => {
                        warn!(attachment = %key, error = %e, "Reconcile failed, not retrying");
                        queue.forget(&key);
                    }
                }
            }
        }
        queue.done(&key);
    }
}

// =============================================================================
// Object Mutations
// =============================================================================

fn add_finalizer(obj: &mut AttachmentRequest) -> bool {
    let finalizers = obj.metadata.finalizers.get_or_insert_with(Vec::new);
    if finalizers.iter().any(|f| f == ATTACHMENT_FINALIZER) {
        return false;
    }
    finalizers.push(ATTACHMENT_FINALIZER.to_string());
    true
}

fn remove_finalizer(obj: &mut AttachmentRequest) -> bool {
    let Some(finalizers) = obj.metadata.finalizers.as_mut() else {
        return false;
    };
    let before = finalizers.len();
    finalizers.retain(|f| f != ATTACHMENT_FINALIZER);
    finalizers.len() != before
}

fn set_role_label(obj: &mut AttachmentRequest, role: Role) -> bool {
    let labels = obj.metadata.labels.get_or_insert_with(BTreeMap::new);
    let previous = labels.insert(ROLE_LABEL.to_string(), role.to_string());
    previous.as_deref() != Some(role.as_str())
}

/// Failure text of a backend call, without the publish/unpublish prefix the
/// reconciler adds again when it reports the error
fn backend_reason(e: Error) -> String {
    match e {
        Error::Publish { reason, .. } | Error::Unpublish { reason, .. } => reason,
        other => other.to_string(),
    }
}

/// Volume context for publish, carrying the role the backend should apply
fn publish_context_for(
    volume_context: &BTreeMap<String, String>,
    role: Role,
) -> BTreeMap<String, String> {
    let mut context = volume_context.clone();
    context.insert(ROLE_CONTEXT_KEY.to_string(), role.as_str().to_lowercase());
    context
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MemoryClusterClient;
    use crate::crd::attachment_name;
    use crate::domain::ports::AttachmentProvisioner;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::{
        CSIPersistentVolumeSource, PersistentVolume, PersistentVolumeSpec,
    };
    use k8s_openapi::api::storage::v1::{
        VolumeAttachmentSource, VolumeAttachmentSpec, VolumeAttachmentStatus,
    };
    use kube::api::ObjectMeta;
    use parking_lot::Mutex;

    const NAMESPACE: &str = "azure-disk-csi";
    const DRIVER: &str = "disk.csi.azure.com";
    const DISK_URI: &str =
        "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Compute/disks/disk0";

    // =========================================================================
    // Fakes
    // =========================================================================

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Publish {
            volume_id: String,
            node_id: String,
            context: BTreeMap<String, String>,
        },
        Unpublish {
            volume_id: String,
            node_id: String,
        },
    }

    /// Records calls; echoes `publish_result` or fails when told to
    #[derive(Default)]
    struct RecordingProvisioner {
        calls: Mutex<Vec<Call>>,
        publish_result: Mutex<BTreeMap<String, String>>,
        fail_publish: Mutex<bool>,
        /// Reason of a publish rejected by the backend itself
        publish_rejection: Mutex<Option<String>>,
        fail_unpublish: Mutex<bool>,
        publish_delay: Mutex<Option<Duration>>,
    }

    impl RecordingProvisioner {
        fn returning(context: &[(&str, &str)]) -> Arc<Self> {
            let provisioner = Self::default();
            *provisioner.publish_result.lock() = context
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            Arc::new(provisioner)
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }

        fn publish_count(&self) -> usize {
            self.calls()
                .iter()
                .filter(|c| matches!(c, Call::Publish { .. }))
                .count()
        }

        fn unpublish_count(&self) -> usize {
            self.calls()
                .iter()
                .filter(|c| matches!(c, Call::Unpublish { .. }))
                .count()
        }
    }

    #[async_trait]
    impl AttachmentProvisioner for RecordingProvisioner {
        async fn publish(
            &self,
            volume_id: &str,
            node_id: &str,
            volume_context: &BTreeMap<String, String>,
        ) -> Result<BTreeMap<String, String>> {
            self.calls.lock().push(Call::Publish {
                volume_id: volume_id.to_string(),
                node_id: node_id.to_string(),
                context: volume_context.clone(),
            });
            let delay = *self.publish_delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if *self.fail_publish.lock() {
                return Err(Error::BackendUnavailable {
                    backend: "fake".into(),
                });
            }
            if let Some(reason) = self.publish_rejection.lock().clone() {
                return Err(Error::Publish {
                    volume_id: volume_id.to_string(),
                    node_id: node_id.to_string(),
                    reason,
                });
            }
            Ok(self.publish_result.lock().clone())
        }

        async fn unpublish(&self, volume_id: &str, node_id: &str) -> Result<()> {
            self.calls.lock().push(Call::Unpublish {
                volume_id: volume_id.to_string(),
                node_id: node_id.to_string(),
            });
            if *self.fail_unpublish.lock() {
                return Err(Error::BackendUnavailable {
                    backend: "fake".into(),
                });
            }
            Ok(())
        }
    }

    struct Harness {
        client: Arc<MemoryClusterClient>,
        provisioner: Arc<RecordingProvisioner>,
        metrics: Arc<ControllerMetrics>,
        reconciler: AttachDetachReconciler,
    }

    fn harness(provisioner: Arc<RecordingProvisioner>) -> Harness {
        harness_with(
            ReconcilerConfig {
                conflict_retry_delay: Duration::from_millis(1),
                recovery_retry_delay: Duration::from_millis(1),
                ..ReconcilerConfig::default()
            },
            provisioner,
        )
    }

    fn harness_with(config: ReconcilerConfig, provisioner: Arc<RecordingProvisioner>) -> Harness {
        let client = Arc::new(MemoryClusterClient::new(NAMESPACE));
        let metrics = Arc::new(ControllerMetrics::new().unwrap());
        let reconciler = AttachDetachReconciler::new(
            config,
            client.clone(),
            provisioner.clone(),
            metrics.clone(),
        );
        Harness {
            client,
            provisioner,
            metrics,
            reconciler,
        }
    }

    fn request(volume_id: &str, node_id: &str, role: Role) -> AttachmentRequest {
        AttachmentRequest::for_volume(NAMESPACE, volume_id, "", node_id, role)
    }

    fn attached(
        volume_id: &str,
        node_id: &str,
        requested: Role,
        actual: Role,
        context: &[(&str, &str)],
    ) -> AttachmentRequest {
        let mut req = request(volume_id, node_id, requested);
        req.metadata.finalizers = Some(vec![ATTACHMENT_FINALIZER.to_string()]);
        req.metadata.labels = Some(BTreeMap::from([(
            ROLE_LABEL.to_string(),
            actual.to_string(),
        )]));
        req.status = Some(AttachmentRequestStatus {
            state: AttachmentState::Attached,
            detail: Some(AttachmentDetail {
                publish_context: context
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
                role: actual,
            }),
            error: None,
        });
        req
    }

    fn persistent_volume(name: &str, driver: &str, handle: &str) -> PersistentVolume {
        PersistentVolume {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                csi: Some(CSIPersistentVolumeSource {
                    driver: driver.to_string(),
                    volume_handle: handle.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            status: None,
        }
    }

    fn volume_attachment(
        name: &str,
        attacher: &str,
        node: &str,
        pv: &str,
        attached: bool,
    ) -> VolumeAttachment {
        VolumeAttachment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: VolumeAttachmentSpec {
                attacher: attacher.to_string(),
                node_name: node.to_string(),
                source: VolumeAttachmentSource {
                    persistent_volume_name: Some(pv.to_string()),
                    inline_volume_spec: None,
                },
            },
            status: Some(VolumeAttachmentStatus {
                attached,
                attachment_metadata: Some(BTreeMap::from([(
                    "LUN".to_string(),
                    "0".to_string(),
                )])),
                ..Default::default()
            }),
        }
    }

    // =========================================================================
    // Attach
    // =========================================================================

    #[tokio::test]
    async fn test_pending_request_becomes_attached() {
        let h = harness(RecordingProvisioner::returning(&[("attached", "true")]));
        h.client
            .insert_attachment_request(request("v0", "n0", Role::Primary));

        h.reconciler.reconcile("v0-n0-attachment").await.unwrap();

        let stored = h.client.attachment_request("v0-n0-attachment").unwrap();
        assert_eq!(
            stored.status,
            Some(AttachmentRequestStatus {
                state: AttachmentState::Attached,
                detail: Some(AttachmentDetail {
                    publish_context: BTreeMap::from([(
                        "attached".to_string(),
                        "true".to_string()
                    )]),
                    role: Role::Primary,
                }),
                error: None,
            })
        );
        assert!(stored.has_finalizer());
        assert_eq!(stored.role_label(), Some("Primary"));
        assert_eq!(h.metrics.operation_count("publish", true), 1);
    }

    #[tokio::test]
    async fn test_replica_attach_passes_role_to_backend() {
        let h = harness(RecordingProvisioner::returning(&[]));
        let mut req = request(DISK_URI, "n1", Role::Replica);
        req.spec.volume_context = BTreeMap::from([("cachingMode".to_string(), "None".to_string())]);
        h.client.insert_attachment_request(req);
        let name = attachment_name(DISK_URI, "n1");

        h.reconciler.reconcile(&name).await.unwrap();

        assert_eq!(
            h.provisioner.calls(),
            vec![Call::Publish {
                volume_id: DISK_URI.to_string(),
                node_id: "n1".to_string(),
                context: BTreeMap::from([
                    ("cachingMode".to_string(), "None".to_string()),
                    ("role".to_string(), "replica".to_string()),
                ]),
            }]
        );
        let stored = h.client.attachment_request(&name).unwrap();
        assert_eq!(stored.actual_role(), Some(Role::Replica));
        assert_eq!(stored.role_label(), Some("Replica"));
    }

    #[tokio::test]
    async fn test_publish_failure_records_error_and_retries() {
        let provisioner = RecordingProvisioner::returning(&[]);
        *provisioner.fail_publish.lock() = true;
        let h = harness(provisioner);
        h.client
            .insert_attachment_request(request("v0", "n0", Role::Primary));

        let result = h.reconciler.reconcile("v0-n0-attachment").await;
        assert_matches!(result, Err(Error::Publish { .. }));
        assert_eq!(
            result.unwrap_err().action(),
            ErrorAction::RequeueWithBackoff
        );

        let stored = h.client.attachment_request("v0-n0-attachment").unwrap();
        assert_eq!(stored.state(), AttachmentState::Error);
        let status = stored.status.unwrap();
        assert_eq!(status.detail, None);
        assert_eq!(status.error.unwrap().code, "PublishFailed");

        // The backend recovers; the Error state is retried
        *h.provisioner.fail_publish.lock() = false;
        h.reconciler.reconcile("v0-n0-attachment").await.unwrap();
        let stored = h.client.attachment_request("v0-n0-attachment").unwrap();
        assert_eq!(stored.state(), AttachmentState::Attached);
        assert!(stored.status.unwrap().error.is_none());
    }

    #[tokio::test]
    async fn test_backend_rejection_is_reported_once() {
        let provisioner = RecordingProvisioner::returning(&[]);
        *provisioner.publish_rejection.lock() = Some("500: disk busy".to_string());
        let h = harness(provisioner);
        h.client
            .insert_attachment_request(request("v0", "n0", Role::Primary));

        let err = h.reconciler.reconcile("v0-n0-attachment").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "Publish of volume v0 to node n0 failed: 500: disk busy"
        );
        let stored = h.client.attachment_request("v0-n0-attachment").unwrap();
        assert_eq!(stored.status.unwrap().error.unwrap().message, "500: disk busy");
    }

    #[tokio::test]
    async fn test_attaching_after_restart_publishes_again() {
        let h = harness(RecordingProvisioner::returning(&[("lun", "1")]));
        let mut req = request("v0", "n0", Role::Primary);
        req.metadata.finalizers = Some(vec![ATTACHMENT_FINALIZER.to_string()]);
        req.status = Some(AttachmentRequestStatus {
            state: AttachmentState::Attaching,
            ..Default::default()
        });
        h.client.insert_attachment_request(req);

        h.reconciler.reconcile("v0-n0-attachment").await.unwrap();
        assert_eq!(h.provisioner.publish_count(), 1);
        assert_eq!(
            h.client.attachment_request("v0-n0-attachment").unwrap().state(),
            AttachmentState::Attached
        );
    }

    #[tokio::test]
    async fn test_malformed_request_is_left_alone() {
        let h = harness(RecordingProvisioner::returning(&[]));
        h.client.insert_attachment_request(request("v0", "", Role::Primary));
        let name = attachment_name("v0", "");

        h.reconciler.reconcile(&name).await.unwrap();
        assert!(h.provisioner.calls().is_empty());
        assert_eq!(h.client.stats().request_writes(), 0);
    }

    #[tokio::test]
    async fn test_missing_request_is_noop() {
        let h = harness(RecordingProvisioner::returning(&[]));
        h.reconciler.reconcile("nope").await.unwrap();
        assert!(h.provisioner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_attached_request_is_stable() {
        let h = harness(RecordingProvisioner::returning(&[]));
        h.client.insert_attachment_request(attached(
            "v0",
            "n0",
            Role::Primary,
            Role::Primary,
            &[("lun", "0")],
        ));

        h.reconciler.reconcile("v0-n0-attachment").await.unwrap();
        h.reconciler.reconcile("v0-n0-attachment").await.unwrap();
        assert!(h.provisioner.calls().is_empty());
        assert_eq!(h.client.stats().request_writes(), 0);
    }

    // =========================================================================
    // Promotion
    // =========================================================================

    #[tokio::test]
    async fn test_promotion_updates_role_and_label() {
        let h = harness(RecordingProvisioner::returning(&[("lun", "3")]));
        h.client.insert_attachment_request(attached(
            "v0",
            "n0",
            Role::Primary,
            Role::Replica,
            &[],
        ));

        h.reconciler.reconcile("v0-n0-attachment").await.unwrap();

        let stored = h.client.attachment_request("v0-n0-attachment").unwrap();
        assert_eq!(stored.state(), AttachmentState::Attached);
        assert_eq!(stored.actual_role(), Some(Role::Primary));
        assert_eq!(stored.role_label(), Some("Primary"));
        assert_matches!(
            h.provisioner.calls().as_slice(),
            [Call::Publish { context, .. }] if context.get("role").map(String::as_str) == Some("primary")
        );
    }

    #[tokio::test]
    async fn test_promotion_is_idempotent() {
        let h = harness(RecordingProvisioner::returning(&[("lun", "3")]));
        h.client.insert_attachment_request(attached(
            "v0",
            "n0",
            Role::Primary,
            Role::Replica,
            &[],
        ));

        h.reconciler.reconcile("v0-n0-attachment").await.unwrap();
        let first = h.client.attachment_request("v0-n0-attachment").unwrap();

        // Backend would now answer differently; it must not be asked again
        *h.provisioner.publish_result.lock() = BTreeMap::from([("lun".into(), "9".into())]);
        h.reconciler.reconcile("v0-n0-attachment").await.unwrap();
        let second = h.client.attachment_request("v0-n0-attachment").unwrap();

        assert_eq!(h.provisioner.publish_count(), 1);
        assert_eq!(second.actual_role(), Some(Role::Primary));
        assert_eq!(
            second.status.unwrap().detail.unwrap().publish_context,
            first.status.unwrap().detail.unwrap().publish_context
        );
    }

    #[tokio::test]
    async fn test_promotion_failure_keeps_replica() {
        let provisioner = RecordingProvisioner::returning(&[]);
        *provisioner.fail_publish.lock() = true;
        let h = harness(provisioner);
        h.client.insert_attachment_request(attached(
            "v0",
            "n0",
            Role::Primary,
            Role::Replica,
            &[("lun", "1")],
        ));

        assert!(h.reconciler.reconcile("v0-n0-attachment").await.is_err());
        let stored = h.client.attachment_request("v0-n0-attachment").unwrap();
        assert_eq!(stored.state(), AttachmentState::Attached);
        assert_eq!(stored.actual_role(), Some(Role::Replica));
        assert_eq!(stored.role_label(), Some("Replica"));
        assert_eq!(stored.status.unwrap().error.unwrap().code, "PromoteFailed");
    }

    #[tokio::test]
    async fn test_out_of_sync_label_is_repaired() {
        let h = harness(RecordingProvisioner::returning(&[]));
        let mut req = attached("v0", "n0", Role::Primary, Role::Primary, &[]);
        req.metadata.labels = None;
        h.client.insert_attachment_request(req);

        h.reconciler.reconcile("v0-n0-attachment").await.unwrap();
        let stored = h.client.attachment_request("v0-n0-attachment").unwrap();
        assert_eq!(stored.role_label(), Some("Primary"));
        assert!(h.provisioner.calls().is_empty());
    }

    // =========================================================================
    // Detach
    // =========================================================================

    #[tokio::test]
    async fn test_deletion_detaches_exactly_once() {
        let h = harness(RecordingProvisioner::returning(&[]));
        let mut req = attached("v0", "n0", Role::Primary, Role::Primary, &[("lun", "0")]);
        // A second finalizer keeps the object visible after ours is removed
        req.metadata
            .finalizers
            .as_mut()
            .unwrap()
            .push("example.com/audit".to_string());
        h.client.insert_attachment_request(req);
        h.client.request_deletion("v0-n0-attachment").unwrap();

        h.reconciler.reconcile("v0-n0-attachment").await.unwrap();

        let stored = h.client.attachment_request("v0-n0-attachment").unwrap();
        assert_eq!(stored.state(), AttachmentState::Detached);
        assert_eq!(stored.status.as_ref().unwrap().detail, None);
        assert!(!stored.has_finalizer());
        assert_eq!(
            h.provisioner.calls(),
            vec![Call::Unpublish {
                volume_id: "v0".into(),
                node_id: "n0".into()
            }]
        );

        h.reconciler.reconcile("v0-n0-attachment").await.unwrap();
        assert_eq!(h.provisioner.unpublish_count(), 1);
    }

    #[tokio::test]
    async fn test_finalizer_removal_releases_object() {
        let h = harness(RecordingProvisioner::returning(&[]));
        h.client.insert_attachment_request(attached(
            "v0",
            "n0",
            Role::Primary,
            Role::Primary,
            &[],
        ));
        h.client.request_deletion("v0-n0-attachment").unwrap();

        h.reconciler.reconcile("v0-n0-attachment").await.unwrap();
        assert!(h.client.attachment_request("v0-n0-attachment").is_none());

        h.reconciler.reconcile("v0-n0-attachment").await.unwrap();
        assert_eq!(h.provisioner.unpublish_count(), 1);
    }

    #[tokio::test]
    async fn test_unpublish_failure_stays_detaching() {
        let provisioner = RecordingProvisioner::returning(&[]);
        *provisioner.fail_unpublish.lock() = true;
        let h = harness(provisioner);
        h.client.insert_attachment_request(attached(
            "v0",
            "n0",
            Role::Primary,
            Role::Primary,
            &[("lun", "0")],
        ));
        h.client.request_deletion("v0-n0-attachment").unwrap();

        assert_matches!(
            h.reconciler.reconcile("v0-n0-attachment").await,
            Err(Error::Unpublish { .. })
        );
        let stored = h.client.attachment_request("v0-n0-attachment").unwrap();
        assert_eq!(stored.state(), AttachmentState::Detaching);
        assert!(stored.has_finalizer());
        let status = stored.status.unwrap();
        assert_eq!(
            status.detail.unwrap().publish_context.get("lun").map(String::as_str),
            Some("0")
        );
        assert_eq!(status.error.unwrap().code, "UnpublishFailed");

        *h.provisioner.fail_unpublish.lock() = false;
        h.reconciler.reconcile("v0-n0-attachment").await.unwrap();
        assert!(h.client.attachment_request("v0-n0-attachment").is_none());
        assert_eq!(h.provisioner.unpublish_count(), 2);
    }

    #[tokio::test]
    async fn test_detached_request_never_unpublishes() {
        let h = harness(RecordingProvisioner::returning(&[]));
        let mut req = request("v0", "n0", Role::Primary);
        req.metadata.finalizers = Some(vec!["example.com/audit".to_string()]);
        req.status = Some(AttachmentRequestStatus {
            state: AttachmentState::Detached,
            ..Default::default()
        });
        h.client.insert_attachment_request(req);
        h.client.request_deletion("v0-n0-attachment").unwrap();

        h.reconciler.reconcile("v0-n0-attachment").await.unwrap();
        assert!(h.provisioner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unpublished_pending_request_skips_backend_on_delete() {
        let h = harness(RecordingProvisioner::returning(&[]));
        let mut req = request("v0", "n0", Role::Primary);
        req.metadata.finalizers = Some(vec!["example.com/audit".to_string()]);
        h.client.insert_attachment_request(req);
        h.client.request_deletion("v0-n0-attachment").unwrap();

        h.reconciler.reconcile("v0-n0-attachment").await.unwrap();
        assert!(h.provisioner.calls().is_empty());
        assert_eq!(
            h.client.attachment_request("v0-n0-attachment").unwrap().state(),
            AttachmentState::Detached
        );
    }

    // =========================================================================
    // Write Conflicts
    // =========================================================================

    #[tokio::test]
    async fn test_conflicts_are_retried_transparently() {
        let h = harness(RecordingProvisioner::returning(&[]));
        h.client
            .insert_attachment_request(request("v0", "n0", Role::Primary));
        h.client.inject_conflicts(2);

        h.reconciler.reconcile("v0-n0-attachment").await.unwrap();
        assert_eq!(
            h.client.attachment_request("v0-n0-attachment").unwrap().state(),
            AttachmentState::Attached
        );
        assert_eq!(h.provisioner.publish_count(), 1);
    }

    #[tokio::test]
    async fn test_conflict_budget_exhaustion_is_retryable() {
        let h = harness(RecordingProvisioner::returning(&[]));
        h.client
            .insert_attachment_request(request("v0", "n0", Role::Primary));
        h.client.inject_conflicts(100);

        let err = h.reconciler.reconcile("v0-n0-attachment").await.unwrap_err();
        assert_matches!(err, Error::ConflictRetriesExhausted { attempts: 5, .. });
        assert!(err.is_retryable());
        assert!(h.provisioner.calls().is_empty());
    }

    // =========================================================================
    // Recovery
    // =========================================================================

    #[tokio::test]
    async fn test_recovery_creates_missing_request_once() {
        let h = harness(RecordingProvisioner::returning(&[]));
        h.client
            .insert_volume(persistent_volume("pv-0", DRIVER, DISK_URI));
        h.client
            .insert_volume_attachment(volume_attachment("csi-0", DRIVER, "node-0", "pv-0", true));

        let report = h.reconciler.recover().await.unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(h.client.attachment_requests().len(), 1);

        let recovered = h
            .client
            .attachment_request(&attachment_name(DISK_URI, "node-0"))
            .unwrap();
        assert_eq!(recovered.spec.volume_id, DISK_URI);
        assert_eq!(recovered.spec.volume_name, "pv-0");
        assert_eq!(recovered.state(), AttachmentState::Attached);
        assert_eq!(recovered.actual_role(), Some(Role::Primary));
        assert!(recovered.has_finalizer());

        let report = h.reconciler.recover().await.unwrap();
        assert_eq!(report.created, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(h.client.attachment_requests().len(), 1);
        assert!(h.provisioner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_recovery_of_unattached_volume_is_pending() {
        let h = harness(RecordingProvisioner::returning(&[("lun", "2")]));
        h.client
            .insert_volume(persistent_volume("pv-0", DRIVER, DISK_URI));
        h.client
            .insert_volume_attachment(volume_attachment("csi-0", DRIVER, "node-0", "pv-0", false));

        h.reconciler.recover().await.unwrap();
        let name = attachment_name(DISK_URI, "node-0");
        assert_eq!(
            h.client.attachment_request(&name).unwrap().state(),
            AttachmentState::Pending
        );

        // Normal reconciliation takes it from there
        h.reconciler.reconcile(&name).await.unwrap();
        assert_eq!(
            h.client.attachment_request(&name).unwrap().state(),
            AttachmentState::Attached
        );
    }

    #[tokio::test]
    async fn test_recovery_ignores_foreign_attachments() {
        let h = harness(RecordingProvisioner::returning(&[]));
        h.client
            .insert_volume(persistent_volume("pv-0", "file.csi.azure.com", DISK_URI));
        h.client
            .insert_volume(persistent_volume("pv-1", DRIVER, DISK_URI));
        h.client.insert_volume_attachment(volume_attachment(
            "csi-0",
            "file.csi.azure.com",
            "node-0",
            "pv-0",
            true,
        ));
        // Attacher matches but the volume belongs to another driver
        h.client
            .insert_volume_attachment(volume_attachment("csi-1", DRIVER, "node-0", "pv-0", true));
        // Volume record is gone
        h.client
            .insert_volume_attachment(volume_attachment("csi-2", DRIVER, "node-0", "pv-9", true));

        let report = h.reconciler.recover().await.unwrap();
        assert_eq!(
            report,
            RecoveryReport {
                created: 0,
                skipped: 0,
                ignored: 3,
                failed: 0,
                name_collisions: 0,
            }
        );
        assert!(h.client.attachment_requests().is_empty());
    }

    #[tokio::test]
    async fn test_recovery_leaves_existing_requests_untouched() {
        let h = harness(RecordingProvisioner::returning(&[]));
        h.client
            .insert_volume(persistent_volume("pv-0", DRIVER, DISK_URI));
        h.client
            .insert_volume_attachment(volume_attachment("csi-0", DRIVER, "node-0", "pv-0", true));

        // Same pair under a different name, as a provisioning path might create it
        let mut existing = request(DISK_URI, "node-0", Role::Replica);
        existing.metadata.name = Some("custom-name".to_string());
        h.client.insert_attachment_request(existing);

        let report = h.reconciler.recover().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(h.client.attachment_requests().len(), 1);
        let untouched = h.client.attachment_request("custom-name").unwrap();
        assert_eq!(untouched.spec.requested_role, Role::Replica);
        assert_eq!(untouched.state(), AttachmentState::Pending);
    }

    #[tokio::test]
    async fn test_recovery_continues_past_failed_volume_read() {
        let h = harness(RecordingProvisioner::returning(&[]));
        h.client
            .insert_volume(persistent_volume("pv-a", DRIVER, "/disks/disk-a"));
        h.client
            .insert_volume(persistent_volume("pv-b", DRIVER, "/disks/disk-b"));
        h.client
            .insert_volume_attachment(volume_attachment("csi-a", DRIVER, "node-0", "pv-a", true));
        h.client
            .insert_volume_attachment(volume_attachment("csi-b", DRIVER, "node-0", "pv-b", true));
        h.client.inject_volume_get_failures("pv-a", 1);

        let report = h.reconciler.recover().await.unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(report.failed, 1);
        assert!(h
            .client
            .attachment_request(&attachment_name("/disks/disk-b", "node-0"))
            .is_some());

        // The next pass picks up what the first one missed
        let report = h.reconciler.recover().await.unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(h.client.attachment_requests().len(), 2);
    }

    #[tokio::test]
    async fn test_recover_until_complete_retries_failed_attachments() {
        let h = harness(RecordingProvisioner::returning(&[]));
        h.client
            .insert_volume(persistent_volume("pv-a", DRIVER, "/disks/disk-a"));
        h.client
            .insert_volume_attachment(volume_attachment("csi-a", DRIVER, "node-0", "pv-a", true));
        h.client.inject_volume_get_failures("pv-a", 2);

        let report = h
            .reconciler
            .recover_until_complete(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(h.client.attachment_requests().len(), 1);
    }

    #[tokio::test]
    async fn test_recover_until_complete_stops_on_shutdown() {
        let h = harness(RecordingProvisioner::returning(&[]));
        h.client
            .insert_volume(persistent_volume("pv-a", DRIVER, "/disks/disk-a"));
        h.client
            .insert_volume_attachment(volume_attachment("csi-a", DRIVER, "node-0", "pv-a", true));
        h.client.inject_volume_get_failures("pv-a", u32::MAX);

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        assert_eq!(h.reconciler.recover_until_complete(&shutdown).await, None);
        assert!(h.client.attachment_requests().is_empty());
    }

    #[tokio::test]
    async fn test_recovery_reports_name_collision() {
        let other_group =
            "/subscriptions/sub/resourceGroups/other/providers/Microsoft.Compute/disks/disk0";
        let h = harness(RecordingProvisioner::returning(&[]));
        h.client
            .insert_volume(persistent_volume("pv-0", DRIVER, DISK_URI));
        h.client
            .insert_volume_attachment(volume_attachment("csi-0", DRIVER, "node-0", "pv-0", true));
        h.client
            .insert_attachment_request(request(other_group, "node-0", Role::Primary));
        assert_eq!(
            attachment_name(other_group, "node-0"),
            attachment_name(DISK_URI, "node-0")
        );

        let report = h.reconciler.recover().await.unwrap();
        assert_eq!(report.name_collisions, 1);
        assert_eq!(report.skipped, 0);
        assert_eq!(report.created, 0);
        let stored = h
            .client
            .attachment_request(&attachment_name(DISK_URI, "node-0"))
            .unwrap();
        assert_eq!(stored.spec.volume_id, other_group);
    }

    // =========================================================================
    // Workers
    // =========================================================================

    #[tokio::test]
    async fn test_process_forgets_key_on_success() {
        let h = harness(RecordingProvisioner::returning(&[]));
        h.client
            .insert_attachment_request(request("v0", "n0", Role::Primary));
        let queue = WorkQueue::new();
        queue.add("v0-n0-attachment".to_string());

        let key = queue.get().await.unwrap();
        h.reconciler.process(&queue, key).await;

        assert_eq!(queue.num_requeues(&"v0-n0-attachment".to_string()), 0);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_process_backs_off_on_failure() {
        let provisioner = RecordingProvisioner::returning(&[]);
        *provisioner.fail_publish.lock() = true;
        let h = harness(provisioner);
        h.client
            .insert_attachment_request(request("v0", "n0", Role::Primary));
        let queue = WorkQueue::new();
        queue.add("v0-n0-attachment".to_string());

        let key = queue.get().await.unwrap();
        h.reconciler.process(&queue, key).await;

        assert_eq!(queue.num_requeues(&"v0-n0-attachment".to_string()), 1);
    }

    #[tokio::test]
    async fn test_process_times_out_slow_backend() {
        let provisioner = RecordingProvisioner::returning(&[]);
        *provisioner.publish_delay.lock() = Some(Duration::from_secs(30));
        let h = harness_with(
            ReconcilerConfig {
                reconcile_timeout: Duration::from_millis(20),
                ..ReconcilerConfig::default()
            },
            provisioner,
        );
        h.client
            .insert_attachment_request(request("v0", "n0", Role::Primary));
        let queue = WorkQueue::new();
        queue.add("v0-n0-attachment".to_string());

        let key = queue.get().await.unwrap();
        h.reconciler.process(&queue, key).await;

        assert_eq!(h.metrics.reconciles.with_label_values(&["timeout"]).get(), 1);
        assert_eq!(queue.num_requeues(&"v0-n0-attachment".to_string()), 1);
        // Abandoned mid-publish; the next attempt starts from Attaching
        assert_eq!(
            h.client.attachment_request("v0-n0-attachment").unwrap().state(),
            AttachmentState::Attaching
        );
    }

    #[tokio::test]
    async fn test_run_drains_queue_until_shutdown() {
        let h = harness(RecordingProvisioner::returning(&[]));
        for node in ["n0", "n1", "n2"] {
            h.client
                .insert_attachment_request(request("v0", node, Role::Replica));
        }
        let queue = WorkQueue::new();
        for node in ["n0", "n1", "n2"] {
            queue.add(attachment_name("v0", node));
        }

        let shutdown = CancellationToken::new();
        let reconciler = Arc::new(h.reconciler);
        let runner = tokio::spawn(reconciler.run(queue.clone(), 2, shutdown.clone()));

        let client = h.client.clone();
        let all_attached = async move {
            loop {
                if client
                    .attachment_requests()
                    .iter()
                    .all(|r| r.state() == AttachmentState::Attached)
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), all_attached)
            .await
            .expect("all requests should attach");

        shutdown.cancel();
        runner.await.unwrap();
        assert_eq!(h.provisioner.publish_count(), 3);
    }
}
