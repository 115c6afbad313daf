//! In-Memory Cluster Client
//!
//! A [`ClusterClient`] that keeps objects in process. It follows API server
//! semantics closely enough for the controllers: resource versions with
//! conditional writes, finalizer-gated deletion, and a status subresource.
//! Call counters plus conflict and read-failure injection make it the test
//! double of choice.

use crate::crd::AttachmentRequest;
use crate::domain::ports::ClusterClient;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::PersistentVolume;
use k8s_openapi::api::storage::v1::VolumeAttachment;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

const ATTACHMENT_REQUEST_KIND: &str = "AttachmentRequest";
const PERSISTENT_VOLUME_KIND: &str = "PersistentVolume";

// =============================================================================
// Call Statistics
// =============================================================================

/// Counts of calls made against the store
#[derive(Debug, Default)]
pub struct CallStats {
    pub request_gets: AtomicU64,
    pub request_creates: AtomicU64,
    pub request_replaces: AtomicU64,
    pub status_replaces: AtomicU64,
    pub volume_gets: AtomicU64,
    pub volume_patches: AtomicU64,
}

impl CallStats {
    /// Total writes against AttachmentRequests
    pub fn request_writes(&self) -> u64 {
        self.request_creates.load(Ordering::Relaxed)
            + self.request_replaces.load(Ordering::Relaxed)
            + self.status_replaces.load(Ordering::Relaxed)
    }

    /// Total calls against PersistentVolumes
    pub fn volume_calls(&self) -> u64 {
        self.volume_gets.load(Ordering::Relaxed) + self.volume_patches.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Memory Cluster Client
// =============================================================================

/// In-process cluster store
#[derive(Debug, Default)]
pub struct MemoryClusterClient {
    namespace: String,
    requests: RwLock<BTreeMap<String, AttachmentRequest>>,
    volumes: RwLock<BTreeMap<String, PersistentVolume>>,
    volume_attachments: RwLock<BTreeMap<String, VolumeAttachment>>,
    next_version: AtomicU64,
    /// Number of upcoming AttachmentRequest writes to reject with a conflict
    injected_conflicts: AtomicU32,
    /// Upcoming PersistentVolume reads to fail, per volume
    injected_volume_failures: RwLock<BTreeMap<String, u32>>,
    stats: CallStats,
}

impl MemoryClusterClient {
    /// Create an empty store for `namespace`
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            next_version: AtomicU64::new(1),
            ..Default::default()
        }
    }

    /// Call statistics
    pub fn stats(&self) -> &CallStats {
        &self.stats
    }

    fn bump_version(&self) -> String {
        self.next_version.fetch_add(1, Ordering::Relaxed).to_string()
    }

    /// Seed an AttachmentRequest, bypassing counters and conflict checks
    pub fn insert_attachment_request(&self, mut request: AttachmentRequest) {
        request.metadata.namespace = Some(self.namespace.clone());
        request.metadata.resource_version = Some(self.bump_version());
        self.requests.write().insert(request.name_any(), request);
    }

    /// Seed a PersistentVolume
    pub fn insert_volume(&self, mut volume: PersistentVolume) {
        volume.metadata.resource_version = Some(self.bump_version());
        self.volumes.write().insert(volume.name_any(), volume);
    }

    /// Seed a VolumeAttachment
    pub fn insert_volume_attachment(&self, attachment: VolumeAttachment) {
        self.volume_attachments
            .write()
            .insert(attachment.name_any(), attachment);
    }

    /// Remove a PersistentVolume, as if deleted concurrently
    pub fn remove_volume(&self, name: &str) {
        self.volumes.write().remove(name);
    }

    /// Snapshot of an AttachmentRequest
    pub fn attachment_request(&self, name: &str) -> Option<AttachmentRequest> {
        self.requests.read().get(name).cloned()
    }

    /// Snapshot of all AttachmentRequests
    pub fn attachment_requests(&self) -> Vec<AttachmentRequest> {
        self.requests.read().values().cloned().collect()
    }

    /// Snapshot of a PersistentVolume
    pub fn volume(&self, name: &str) -> Option<PersistentVolume> {
        self.volumes.read().get(name).cloned()
    }

    /// Mark an AttachmentRequest for deletion.
    ///
    /// Objects without finalizers disappear immediately, the rest get a
    /// deletion timestamp and linger until their finalizers are removed.
    pub fn request_deletion(&self, name: &str) -> Result<()> {
        let mut requests = self.requests.write();
        let request = requests.get_mut(name).ok_or_else(|| not_found(name))?;
        if request.finalizers().is_empty() {
            requests.remove(name);
            return Ok(());
        }
        if request.metadata.deletion_timestamp.is_none() {
            request.metadata.deletion_timestamp = Some(Time(Utc::now()));
            request.metadata.resource_version = Some(self.bump_version());
        }
        Ok(())
    }

    /// Reject the next `count` AttachmentRequest replace calls with a conflict
    pub fn inject_conflicts(&self, count: u32) {
        self.injected_conflicts.store(count, Ordering::SeqCst);
    }

    /// Fail the next `count` reads of PersistentVolume `name`
    pub fn inject_volume_get_failures(&self, name: &str, count: u32) {
        self.injected_volume_failures
            .write()
            .insert(name.to_string(), count);
    }

    fn take_injected_volume_failure(&self, name: &str) -> bool {
        let mut failures = self.injected_volume_failures.write();
        match failures.get_mut(name) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    fn take_injected_conflict(&self) -> bool {
        self.injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Check the caller's resource version against the stored one
    fn check_version(&self, stored: &AttachmentRequest, incoming: &AttachmentRequest) -> Result<()> {
        if self.take_injected_conflict() {
            return Err(conflict(&incoming.name_any()));
        }
        match &incoming.metadata.resource_version {
            Some(version) if stored.metadata.resource_version.as_ref() != Some(version) => {
                Err(conflict(&incoming.name_any()))
            }
            _ => Ok(()),
        }
    }
}

fn not_found(name: &str) -> Error {
    Error::ResourceNotFound {
        kind: ATTACHMENT_REQUEST_KIND.to_string(),
        name: name.to_string(),
    }
}

fn conflict(name: &str) -> Error {
    Error::Conflict {
        kind: ATTACHMENT_REQUEST_KIND.to_string(),
        name: name.to_string(),
    }
}

#[async_trait]
impl ClusterClient for MemoryClusterClient {
    async fn get_attachment_request(&self, name: &str) -> Result<Option<AttachmentRequest>> {
        self.stats.request_gets.fetch_add(1, Ordering::Relaxed);
        Ok(self.requests.read().get(name).cloned())
    }

    async fn list_attachment_requests(&self) -> Result<Vec<AttachmentRequest>> {
        Ok(self.attachment_requests())
    }

    async fn create_attachment_request(
        &self,
        request: &AttachmentRequest,
    ) -> Result<AttachmentRequest> {
        self.stats.request_creates.fetch_add(1, Ordering::Relaxed);
        let name = request.name_any();
        let mut requests = self.requests.write();
        if requests.contains_key(&name) {
            return Err(Error::ResourceExists {
                kind: ATTACHMENT_REQUEST_KIND.to_string(),
                name,
            });
        }

        let mut created = request.clone();
        created.metadata.namespace = Some(self.namespace.clone());
        created.metadata.resource_version = Some(self.bump_version());
        created.metadata.creation_timestamp = Some(Time(Utc::now()));
        requests.insert(name, created.clone());
        Ok(created)
    }

    async fn replace_attachment_request(
        &self,
        request: &AttachmentRequest,
    ) -> Result<AttachmentRequest> {
        self.stats.request_replaces.fetch_add(1, Ordering::Relaxed);
        let name = request.name_any();
        let mut requests = self.requests.write();
        let stored = requests.get(&name).ok_or_else(|| not_found(&name))?;
        self.check_version(stored, request)?;

        let mut updated = stored.clone();
        updated.metadata.labels = request.metadata.labels.clone();
        updated.metadata.annotations = request.metadata.annotations.clone();
        updated.metadata.finalizers = request.metadata.finalizers.clone();
        updated.spec = request.spec.clone();
        updated.metadata.resource_version = Some(self.bump_version());

        if updated.metadata.deletion_timestamp.is_some() && updated.finalizers().is_empty() {
            requests.remove(&name);
        } else {
            requests.insert(name, updated.clone());
        }
        Ok(updated)
    }

    async fn replace_attachment_request_status(
        &self,
        request: &AttachmentRequest,
    ) -> Result<AttachmentRequest> {
        self.stats.status_replaces.fetch_add(1, Ordering::Relaxed);
        let name = request.name_any();
        let mut requests = self.requests.write();
        let stored = requests.get(&name).ok_or_else(|| not_found(&name))?;
        self.check_version(stored, request)?;

        let mut updated = stored.clone();
        updated.status = request.status.clone();
        updated.metadata.resource_version = Some(self.bump_version());
        requests.insert(name, updated.clone());
        Ok(updated)
    }

    async fn list_volume_attachments(&self) -> Result<Vec<VolumeAttachment>> {
        Ok(self.volume_attachments.read().values().cloned().collect())
    }

    async fn get_persistent_volume(&self, name: &str) -> Result<Option<PersistentVolume>> {
        self.stats.volume_gets.fetch_add(1, Ordering::Relaxed);
        if self.take_injected_volume_failure(name) {
            return Err(Error::Internal(format!("injected failure reading {name}")));
        }
        Ok(self.volumes.read().get(name).cloned())
    }

    async fn patch_volume_annotations(
        &self,
        name: &str,
        annotations: &BTreeMap<String, Option<String>>,
    ) -> Result<PersistentVolume> {
        self.stats.volume_patches.fetch_add(1, Ordering::Relaxed);
        let mut volumes = self.volumes.write();
        let volume = volumes.get_mut(name).ok_or_else(|| Error::ResourceNotFound {
            kind: PERSISTENT_VOLUME_KIND.to_string(),
            name: name.to_string(),
        })?;

        let current = volume.metadata.annotations.get_or_insert_with(BTreeMap::new);
        for (key, value) in annotations {
            match value {
                Some(value) => {
                    current.insert(key.clone(), value.clone());
                }
                None => {
                    current.remove(key);
                }
            }
        }
        volume.metadata.resource_version = Some(self.bump_version());
        Ok(volume.clone())
    }
}
