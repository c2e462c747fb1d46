use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use common::{compute_fingerprint, now_millis, Asset, Track};
use library::{StoreError, TrackStore};
use metadata::{resolve_fields, PartialMetadata};
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::artwork::{ArtworkCache, ArtworkPayload};
use crate::projection::LibraryProjection;
use crate::settings::{DurationFilterConfig, FolderFilterMode, SettingsError, SettingsStore};
use crate::sources::{AssetSource, PermissionGate, SourceError, TagReader};
use crate::state::{IndexerPhase, IndexerStatus};

/// Assets processed between cooperative yields.
const BATCH_SIZE: usize = 10;
/// How long the `complete` phase stays visible before auto-idling.
const COMPLETE_GRACE: Duration = Duration::from_secs(3);

#[derive(Debug)]
pub enum IndexError {
    Store(StoreError),
    Source(SourceError),
    Settings(SettingsError),
}

impl std::fmt::Display for IndexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexError::Store(err) => write!(f, "store error: {}", err),
            IndexError::Source(err) => write!(f, "source error: {}", err),
            IndexError::Settings(err) => write!(f, "settings error: {}", err),
        }
    }
}

impl std::error::Error for IndexError {}

impl From<StoreError> for IndexError {
    fn from(err: StoreError) -> Self {
        IndexError::Store(err)
    }
}

impl From<SourceError> for IndexError {
    fn from(err: SourceError) -> Self {
        IndexError::Source(err)
    }
}

impl From<SettingsError> for IndexError {
    fn from(err: SettingsError) -> Self {
        IndexError::Settings(err)
    }
}

enum ScanEnd {
    Completed,
    Cancelled,
    Denied,
}

/// Pause flag honored at the same checkpoints as cancellation. A paused run
/// keeps its state and resumes exactly where it stopped.
struct PauseGate {
    tx: watch::Sender<bool>,
}

impl PauseGate {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    fn pause(&self) {
        self.tx.send_replace(true);
    }

    fn resume(&self) {
        self.tx.send_replace(false);
    }

    fn is_paused(&self) -> bool {
        *self.tx.borrow()
    }

    async fn wait_resumed(&self) {
        let mut rx = self.tx.subscribe();
        while *rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

struct IndexerInner {
    store: TrackStore,
    projection: LibraryProjection,
    status: IndexerStatus,
    source: Arc<dyn AssetSource>,
    permissions: Arc<dyn PermissionGate>,
    tags: Arc<dyn TagReader>,
    artwork: ArtworkCache,
    settings: SettingsStore,
    cancel: RwLock<Option<CancellationToken>>,
    pause: PauseGate,
}

/// The library-synchronization engine: enumerates device assets, diffs them
/// against the persistent store, processes changes in bounded batches, and
/// reconciles deletions. One instance per app; at most one scan at a time.
///
/// Cloning yields another handle to the same engine. Every collaborator is
/// injected, so tests run the full machine against in-memory sources and
/// scratch directories.
#[derive(Clone)]
pub struct MediaIndexer {
    inner: Arc<IndexerInner>,
}

impl MediaIndexer {
    pub fn new(
        store: TrackStore,
        source: Arc<dyn AssetSource>,
        permissions: Arc<dyn PermissionGate>,
        tags: Arc<dyn TagReader>,
        artwork: ArtworkCache,
        settings: SettingsStore,
    ) -> Self {
        Self {
            inner: Arc::new(IndexerInner {
                store,
                projection: LibraryProjection::new(),
                status: IndexerStatus::new(),
                source,
                permissions,
                tags,
                artwork,
                settings,
                cancel: RwLock::new(None),
                pause: PauseGate::new(),
            }),
        }
    }

    pub fn status(&self) -> IndexerStatus {
        self.inner.status.clone()
    }

    pub fn projection(&self) -> LibraryProjection {
        self.inner.projection.clone()
    }

    pub fn store(&self) -> &TrackStore {
        &self.inner.store
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.inner.settings
    }

    pub fn artwork(&self) -> &ArtworkCache {
        &self.inner.artwork
    }

    /// Seeds the projection from the persisted live rows without scanning.
    pub fn load_library_from_store(&self) -> Result<(), IndexError> {
        let tracks = self.inner.store.get_all()?;
        self.inner.projection.set(tracks);
        Ok(())
    }

    /// Runs one full index pass. A second call while a scan is active is a
    /// logged no-op. Completes when the scan ends, was cancelled, or failed;
    /// failures are logged and land the state machine back on `idle`.
    pub async fn start_indexing(&self, force_full_scan: bool, force_full_rescan: bool) {
        let generation = match self.inner.status.try_begin() {
            Some(generation) => generation,
            None => {
                info!("Indexing already in progress; ignoring start request");
                return;
            }
        };

        let cancel = CancellationToken::new();
        *self.inner.cancel.write() = Some(cancel.clone());
        // A fresh run always starts unpaused.
        self.inner.pause.resume();

        let outcome = self
            .run_scan(force_full_scan, force_full_rescan, &cancel)
            .await;
        *self.inner.cancel.write() = None;

        match outcome {
            Ok(ScanEnd::Completed) => {
                self.inner.status.complete();
                self.schedule_idle(generation);
            }
            Ok(ScanEnd::Cancelled) => {
                info!("Library scan cancelled");
                self.inner.status.reset_idle();
            }
            Ok(ScanEnd::Denied) => {
                info!("Media library permission denied; scan skipped");
                self.inner.status.reset_idle();
            }
            Err(err) => {
                warn!("Library scan failed: {}", err);
                self.inner.status.reset_idle();
            }
        }
    }

    /// Cancels the active scan at its next checkpoint. Committed work stays
    /// committed; the cleanup phase is skipped for this run.
    pub fn stop_indexing(&self) {
        if let Some(token) = self.inner.cancel.read().clone() {
            token.cancel();
        }
    }

    pub fn pause_indexing(&self) {
        self.inner.pause.pause();
    }

    pub fn resume_indexing(&self) {
        self.inner.pause.resume();
    }

    /// Full scan that bypasses fingerprint skipping when `full_rescan` is
    /// set, re-extracting metadata for every asset.
    pub async fn force_reindex(&self, full_rescan: bool) {
        self.start_indexing(true, full_rescan).await;
    }

    pub async fn set_auto_scan(&self, enabled: bool) -> Result<bool, IndexError> {
        Ok(self.inner.settings.set_auto_scan(enabled).await?)
    }

    pub async fn set_duration_filter(
        &self,
        config: DurationFilterConfig,
    ) -> Result<DurationFilterConfig, IndexError> {
        let (applied, changed) = self.inner.settings.set_duration_filter(config).await?;
        if changed {
            self.spawn_reindex();
        }
        Ok(applied)
    }

    pub async fn set_folder_mode(
        &self,
        folder: &str,
        mode: Option<FolderFilterMode>,
    ) -> Result<bool, IndexError> {
        let changed = self.inner.settings.set_folder_mode(folder, mode).await?;
        if changed {
            self.spawn_reindex();
        }
        Ok(changed)
    }

    pub async fn set_all_folder_modes(
        &self,
        folders: &[String],
        mode: FolderFilterMode,
    ) -> Result<bool, IndexError> {
        let changed = self
            .inner
            .settings
            .set_all_folder_modes(folders, mode)
            .await?;
        if changed {
            self.spawn_reindex();
        }
        Ok(changed)
    }

    pub async fn clear_folder_filters(&self) -> Result<bool, IndexError> {
        let changed = self.inner.settings.clear_folder_filters().await?;
        if changed {
            self.spawn_reindex();
        }
        Ok(changed)
    }

    fn spawn_reindex(&self) {
        let engine = self.clone();
        tokio::spawn(async move {
            engine.start_indexing(false, false).await;
        });
    }

    fn schedule_idle(&self, generation: u64) {
        let status = self.inner.status.clone();
        tokio::spawn(async move {
            tokio::time::sleep(COMPLETE_GRACE).await;
            status.idle_after_grace(generation);
        });
    }

    async fn run_scan(
        &self,
        force_full_scan: bool,
        force_full_rescan: bool,
        cancel: &CancellationToken,
    ) -> Result<ScanEnd, IndexError> {
        let inner = &*self.inner;
        if !inner.permissions.request_access().await? {
            return Ok(ScanEnd::Denied);
        }

        // Perceived instant load: the persisted library shows up while the
        // device enumeration still runs.
        if !force_full_scan {
            let cached = inner.store.get_all()?;
            if !cached.is_empty() {
                inner.projection.set(cached);
            }
        }

        let folder_filters = inner.settings.folder_filters().await;
        let duration_filter = inner.settings.duration_filter().await;

        let mut assets: Vec<Asset> = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            if !self.checkpoint(cancel).await {
                return Ok(ScanEnd::Cancelled);
            }
            let page = inner.source.next_page(cursor.take()).await?;
            assets.extend(page.assets);
            if !page.has_more {
                break;
            }
            cursor = page.next_cursor;
        }

        // Pre-filters: an excluded asset is treated as absent, so the
        // cleanup phase below reconciles it like a deleted file.
        assets.retain(|asset| {
            folder_filters.allows_asset(asset) && duration_filter.allows(asset.duration)
        });

        let current_ids: HashSet<String> = assets.iter().map(|asset| asset.id.clone()).collect();
        inner.status.update(|state| {
            state.total_files = assets.len();
            state.phase = IndexerPhase::Processing;
        });

        let existing: HashMap<String, Track> = inner
            .store
            .get_all_with_deleted()?
            .into_iter()
            .map(|track| (track.id.clone(), track))
            .collect();

        let total = assets.len();
        for batch in assets.chunks(BATCH_SIZE) {
            for asset in batch {
                if !self.checkpoint(cancel).await {
                    return Ok(ScanEnd::Cancelled);
                }
                inner
                    .status
                    .update(|state| state.current_file = asset.display_name());

                if let Some(track) = self
                    .process_asset(asset, existing.get(&asset.id), force_full_rescan)
                    .await
                {
                    match inner.store.upsert(&track) {
                        // The projection only learns about durably stored rows.
                        Ok(()) => inner.projection.apply_upsert(track),
                        Err(err) => {
                            warn!("Failed to persist {}: {}", asset.display_name(), err)
                        }
                    }
                }

                inner.status.update(|state| {
                    state.processed_files += 1;
                    state.progress = if total == 0 {
                        100.0
                    } else {
                        state.processed_files as f64 / total as f64 * 100.0
                    };
                });
            }
            // Keep the host responsive between batches.
            tokio::task::yield_now().await;
        }

        if !self.checkpoint(cancel).await {
            return Ok(ScanEnd::Cancelled);
        }
        inner
            .status
            .update(|state| state.phase = IndexerPhase::Cleanup);

        for id in inner.store.all_ids()? {
            if !current_ids.contains(&id) {
                inner.store.mark_deleted(&id)?;
                inner.projection.apply_delete(&id);
            }
        }
        let purged = inner.store.purge_deleted()?;
        if purged > 0 {
            info!("Purged {} removed tracks", purged);
        }

        Ok(ScanEnd::Completed)
    }

    /// Processes one asset into a record, or `None` for a zero-cost skip.
    /// Every failure inside is contained to this asset.
    async fn process_asset(
        &self,
        asset: &Asset,
        existing: Option<&Track>,
        force_full_rescan: bool,
    ) -> Option<Track> {
        let inner = &*self.inner;
        let file_hash = compute_fingerprint(&asset.uri, asset.modification_time, asset.size_hint());

        if let Some(previous) = existing {
            if !force_full_rescan && previous.file_hash == file_hash {
                if previous.is_deleted {
                    // The asset came back; revive the record under its old id.
                    let mut revived = previous.clone();
                    revived.is_deleted = false;
                    return Some(revived);
                }
                return None;
            }
        }

        let extracted = match inner.tags.read(asset).await {
            Ok(extracted) => extracted,
            Err(err) => {
                warn!("Failed to read tags for {}: {}", asset.display_name(), err);
                PartialMetadata::default()
            }
        };

        let image = match extracted.artwork.as_ref() {
            Some(bytes) => {
                inner
                    .artwork
                    .persist(&ArtworkPayload::Bytes(bytes.clone()), &asset.id)
                    .await
            }
            // No payload: the previous artwork, if any, stays.
            None => existing.and_then(|track| track.image.clone()),
        };

        let fields = resolve_fields(&extracted, existing, &asset.filename);
        Some(Track {
            id: asset.id.clone(),
            title: fields.title,
            artist: fields.artist,
            album: fields.album,
            genre: fields.genre,
            uri: asset.uri.clone(),
            duration: asset.duration,
            image,
            file_hash,
            scan_time: now_millis(),
            is_deleted: false,
        })
    }

    /// Cancellation/pause checkpoint. Returns false when the run should stop
    /// advancing. Pausing blocks here until resumed or cancelled.
    async fn checkpoint(&self, cancel: &CancellationToken) -> bool {
        loop {
            if cancel.is_cancelled() {
                return false;
            }
            if !self.inner.pause.is_paused() {
                return true;
            }
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = self.inner.pause.wait_resumed() => {}
            }
        }
    }
}
