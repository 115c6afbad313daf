//! Migration Progress Tracker
//!
//! Watches PersistentVolumes of our driver that carry a source storage
//! account type annotation and records the conversion progress in a status
//! annotation:
//!
//! ```text
//!   <driver>/storageaccounttype                 source SKU (trigger)
//!   migration.<driver>/status                   converting | completed
//!   migration.<driver>/targetstorageaccounttype target SKU (never touched)
//! ```
//!
//! Event handling never blocks the watch: updates run on spawned tasks and a
//! per-volume guard keeps at most one of them in flight.

use crate::controller::metrics::ControllerMetrics;
use crate::domain::ports::ClusterClientRef;
use crate::error::{Error, Result};
use dashmap::DashMap;
use k8s_openapi::api::core::v1::PersistentVolume;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

// =============================================================================
// Migration Status
// =============================================================================

/// Progress of a storage account type conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationStatus {
    Converting,
    Completed,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::Converting => "converting",
            MigrationStatus::Completed => "completed",
        }
    }
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationStatus {
    type Err = Error;

    /// Accepts annotation values written by older controllers, which used
    /// free-form casing
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "converting" => Ok(MigrationStatus::Converting),
            "completed" => Ok(MigrationStatus::Completed),
            _ => Err(Error::MigrationStatusParse(s.to_string())),
        }
    }
}

// =============================================================================
// Annotation Keys
// =============================================================================

/// Annotation keys derived from the driver name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationAnnotationKeys {
    pub source_sku: String,
    pub status: String,
    pub target_sku: String,
}

impl MigrationAnnotationKeys {
    pub fn for_driver(driver: &str) -> Self {
        Self {
            source_sku: format!("{driver}/storageaccounttype"),
            status: format!("migration.{driver}/status"),
            target_sku: format!("migration.{driver}/targetstorageaccounttype"),
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// CSI driver whose volumes are tracked
    pub driver_name: String,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            driver_name: "disk.csi.azure.com".to_string(),
        }
    }
}

// =============================================================================
// Volume Cache
// =============================================================================

/// Last seen copy of every PersistentVolume, fed by the watch
#[derive(Debug, Default)]
pub struct VolumeCache {
    volumes: DashMap<String, PersistentVolume>,
}

impl VolumeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `volume`, replacing any older copy
    pub fn apply(&self, volume: &PersistentVolume) {
        self.volumes.insert(volume.name_any(), volume.clone());
    }

    pub fn remove(&self, name: &str) {
        self.volumes.remove(name);
    }

    /// Replace the whole cache, after a watch restart
    pub fn replace_all(&self, volumes: &[PersistentVolume]) {
        self.volumes.clear();
        for volume in volumes {
            self.apply(volume);
        }
    }

    pub fn get(&self, name: &str) -> Option<PersistentVolume> {
        self.volumes.get(name).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }

    /// Names of cached volumes matching `predicate`, sorted
    pub fn names_where<F>(&self, predicate: F) -> Vec<String>
    where
        F: Fn(&PersistentVolume) -> bool,
    {
        let mut names: Vec<String> = self
            .volumes
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }
}

// =============================================================================
// Tracker
// =============================================================================

/// Records conversion progress on PersistentVolume annotations
pub struct MigrationProgressTracker {
    config: TrackerConfig,
    keys: MigrationAnnotationKeys,
    client: Option<ClusterClientRef>,
    /// Volumes with an update task running
    in_flight: DashMap<String, ()>,
    cache: VolumeCache,
    metrics: Arc<ControllerMetrics>,
}

impl MigrationProgressTracker {
    /// Create a tracker. Without a client every update fails with a
    /// configuration error.
    pub fn new(
        config: TrackerConfig,
        client: Option<ClusterClientRef>,
        metrics: Arc<ControllerMetrics>,
    ) -> Self {
        let keys = MigrationAnnotationKeys::for_driver(&config.driver_name);
        Self {
            config,
            keys,
            client,
            in_flight: DashMap::new(),
            cache: VolumeCache::new(),
            metrics,
        }
    }

    pub fn keys(&self) -> &MigrationAnnotationKeys {
        &self.keys
    }

    pub fn cache(&self) -> &VolumeCache {
        &self.cache
    }

    /// Whether a volume event deserves a progress update
    pub fn is_migration_candidate(&self, volume: &PersistentVolume) -> bool {
        let Some(csi) = volume.spec.as_ref().and_then(|s| s.csi.as_ref()) else {
            return false;
        };
        if csi.driver != self.config.driver_name {
            return false;
        }
        let annotations = volume.annotations();
        if !annotations.contains_key(&self.keys.source_sku) {
            return false;
        }
        !matches!(
            annotations.get(&self.keys.status).map(|v| v.parse()),
            Some(Ok(MigrationStatus::Completed))
        )
    }

    /// Current status annotation of a volume, if it parses
    pub fn status_of(&self, volume: &PersistentVolume) -> Option<MigrationStatus> {
        volume
            .annotations()
            .get(&self.keys.status)
            .and_then(|v| v.parse().ok())
    }

    /// Names of cached volumes whose migration has not completed
    pub fn in_progress(&self) -> Vec<String> {
        self.cache
            .names_where(|volume| self.is_migration_candidate(volume))
    }

    /// Handle an added or modified volume.
    ///
    /// Returns the handle of the spawned update, or `None` when the event
    /// was filtered out or an update for the volume is already running.
    pub fn handle_volume_event(
        self: &Arc<Self>,
        volume: &PersistentVolume,
    ) -> Option<JoinHandle<Result<()>>> {
        self.cache.apply(volume);

        if !self.is_migration_candidate(volume) {
            trace!(volume = %volume.name_any(), "Not a migration candidate");
            return None;
        }

        let name = volume.name_any();
        if self.in_flight.insert(name.clone(), ()).is_some() {
            debug!(volume = %name, "Migration update already in flight");
            return None;
        }

        let guard = InFlightGuard {
            tracker: Arc::clone(self),
            name,
        };
        Some(tokio::spawn(async move {
            let result = guard.tracker.record_from_event(&guard.name).await;
            if let Err(e) = &result {
                warn!(volume = %guard.name, error = %e, "Failed to record migration progress");
            }
            result
        }))
    }

    /// Handle a deleted volume
    pub fn handle_volume_deleted(&self, name: &str) {
        self.cache.remove(name);
    }

    /// Record `status` on a volume
    pub async fn update_progress(
        &self,
        volume: &PersistentVolume,
        status: MigrationStatus,
    ) -> Result<()> {
        self.update_progress_by_name(&volume.name_any(), status)
            .await
    }

    /// Record that the conversion of a volume finished
    pub async fn mark_completed(&self, volume: &PersistentVolume) -> Result<()> {
        self.update_progress(volume, MigrationStatus::Completed).await
    }

    fn client(&self) -> Result<&ClusterClientRef> {
        self.client.as_ref().ok_or_else(|| {
            Error::Configuration("migration tracker has no cluster client".to_string())
        })
    }

    /// Event path: the event may be stale, so the filter is applied again to
    /// the stored object before anything is written
    async fn record_from_event(&self, name: &str) -> Result<()> {
        let client = self.client()?;
        let Some(current) = client.get_persistent_volume(name).await? else {
            debug!(volume = %name, "Volume gone before progress update");
            return Ok(());
        };
        self.cache.apply(&current);

        if !self.is_migration_candidate(&current) {
            debug!(volume = %name, "Stored volume is no longer a migration candidate");
            return Ok(());
        }
        self.write_status(client, &current, MigrationStatus::Converting)
            .await
    }

    async fn update_progress_by_name(&self, name: &str, status: MigrationStatus) -> Result<()> {
        let client = self.client()?;
        let Some(current) = client.get_persistent_volume(name).await? else {
            debug!(volume = %name, "Volume gone before progress update");
            return Ok(());
        };
        self.write_status(client, &current, status).await
    }

    /// Patch the status annotation of `current`. `Completed` is terminal.
    async fn write_status(
        &self,
        client: &ClusterClientRef,
        current: &PersistentVolume,
        status: MigrationStatus,
    ) -> Result<()> {
        let name = current.name_any();
        let name = name.as_str();
        match self.status_of(current) {
            Some(stored) if stored == status => {
                trace!(volume = %name, %status, "Migration status unchanged");
                return Ok(());
            }
            Some(MigrationStatus::Completed) => {
                debug!(volume = %name, %status, "Migration already completed, not rewinding");
                return Ok(());
            }
            _ => {}
        }

        let patch = BTreeMap::from([(self.keys.status.clone(), Some(status.to_string()))]);
        match client.patch_volume_annotations(name, &patch).await {
            Ok(updated) => {
                self.metrics.record_migration_update(status.as_str(), true);
                self.cache.apply(&updated);
                let target = updated.annotations().get(&self.keys.target_sku).cloned();
                info!(volume = %name, %status, target_sku = ?target, "Recorded migration progress");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(volume = %name, "Volume deleted during progress update");
                Ok(())
            }
            Err(e) => {
                self.metrics.record_migration_update(status.as_str(), false);
                Err(e)
            }
        }
    }
}

/// Releases a volume's in-flight entry when the update task ends, however
/// it ends
struct InFlightGuard {
    tracker: Arc<MigrationProgressTracker>,
    name: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.tracker.in_flight.remove(&self.name);
    }
}
