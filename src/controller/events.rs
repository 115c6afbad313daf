//! Watch Event Pumps
//!
//! Turns kube watch streams into work: AttachmentRequest events enqueue the
//! object's name, PersistentVolume events go to the migration tracker.
//! Both pumps run until the shutdown token fires or the stream ends.
//!
//! AttachmentRequest events are enqueued only when the spec generation or
//! the deletion mark changed. Status writes by the reconciler itself would
//! otherwise come straight back as work and bypass the retry backoff.

use crate::controller::migration::MigrationProgressTracker;
use crate::controller::queue::WorkQueue;
use crate::crd::AttachmentRequest;
use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::api::core::v1::PersistentVolume;
use kube::runtime::watcher::Event;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, ResourceExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Last seen (generation, deleting) per AttachmentRequest
#[derive(Debug, Default)]
pub struct AttachmentChangeFilter {
    seen: DashMap<String, (Option<i64>, bool)>,
}

impl AttachmentChangeFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `request` and report whether it changed in a way that needs work
    pub fn observe(&self, request: &AttachmentRequest) -> bool {
        let current = (request.metadata.generation, request.is_deleting());
        match self.seen.insert(request.name_any(), current) {
            Some(previous) => previous != current,
            None => true,
        }
    }

    pub fn forget(&self, name: &str) {
        self.seen.remove(name);
    }

    pub fn clear(&self) {
        self.seen.clear();
    }
}

/// Enqueue the AttachmentRequests an event touches
pub fn enqueue_attachment_event(
    queue: &WorkQueue<String>,
    filter: &AttachmentChangeFilter,
    event: Event<AttachmentRequest>,
) {
    match event {
        Event::Applied(request) => {
            if filter.observe(&request) {
                queue.add(request.name_any());
            }
        }
        Event::Deleted(request) => filter.forget(&request.name_any()),
        Event::Restarted(requests) => {
            debug!(count = requests.len(), "AttachmentRequest watch restarted");
            filter.clear();
            for request in requests {
                filter.observe(&request);
                queue.add(request.name_any());
            }
        }
    }
}

/// Hand a PersistentVolume event to the migration tracker
pub fn dispatch_volume_event(tracker: &Arc<MigrationProgressTracker>, event: Event<PersistentVolume>) {
    match event {
        Event::Applied(volume) => {
            tracker.handle_volume_event(&volume);
        }
        Event::Deleted(volume) => tracker.handle_volume_deleted(&volume.name_any()),
        Event::Restarted(volumes) => {
            debug!(count = volumes.len(), "PersistentVolume watch restarted");
            tracker.cache().replace_all(&volumes);
            for volume in &volumes {
                tracker.handle_volume_event(volume);
            }
        }
    }
}

/// Watch AttachmentRequests and feed `queue`
pub async fn watch_attachment_requests(
    api: Api<AttachmentRequest>,
    queue: Arc<WorkQueue<String>>,
    shutdown: CancellationToken,
) {
    info!("Watching AttachmentRequests");
    let filter = AttachmentChangeFilter::new();
    let stream = watcher(api, watcher::Config::default()).default_backoff();
    tokio::pin!(stream);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = stream.next() => match event {
                Some(Ok(event)) => enqueue_attachment_event(&queue, &filter, event),
                Some(Err(e)) => warn!(error = %e, "AttachmentRequest watch error"),
                None => break,
            },
        }
    }
    info!("AttachmentRequest watch stopped");
}

/// Watch PersistentVolumes and feed `tracker`
pub async fn watch_persistent_volumes(
    api: Api<PersistentVolume>,
    tracker: Arc<MigrationProgressTracker>,
    shutdown: CancellationToken,
) {
    info!("Watching PersistentVolumes");
    let stream = watcher(api, watcher::Config::default()).default_backoff();
    tokio::pin!(stream);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = stream.next() => match event {
                Some(Ok(event)) => dispatch_volume_event(&tracker, event),
                Some(Err(e)) => warn!(error = %e, "PersistentVolume watch error"),
                None => break,
            },
        }
    }
    info!("PersistentVolume watch stopped");
}
