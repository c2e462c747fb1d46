use std::sync::Arc;

use common::Track;
use parking_lot::RwLock;
use tokio::sync::watch;

/// In-memory mirror of the live (non-tombstoned) library. The engine is the
/// single writer; UI and playback read snapshots or watch version ticks.
/// Always a subset of the store's current rows.
#[derive(Clone)]
pub struct LibraryProjection {
    tracks: Arc<RwLock<Vec<Track>>>,
    version: Arc<watch::Sender<u64>>,
}

impl LibraryProjection {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0u64);
        Self {
            tracks: Arc::new(RwLock::new(Vec::new())),
            version: Arc::new(tx),
        }
    }

    pub fn snapshot(&self) -> Vec<Track> {
        self.tracks.read().clone()
    }

    pub fn len(&self) -> usize {
        self.tracks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.read().is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tracks.read().iter().any(|track| track.id == id)
    }

    /// Ticks on every mutation; readers re-snapshot when the version moves.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    /// Whole-snapshot replace, used on cold load. Tombstoned rows never
    /// enter the projection.
    pub(crate) fn set(&self, mut tracks: Vec<Track>) {
        tracks.retain(|track| !track.is_deleted);
        *self.tracks.write() = tracks;
        self.bump();
    }

    pub(crate) fn apply_upsert(&self, track: Track) {
        if track.is_deleted {
            self.apply_delete(&track.id);
            return;
        }
        {
            let mut tracks = self.tracks.write();
            match tracks.iter_mut().find(|existing| existing.id == track.id) {
                Some(existing) => *existing = track,
                None => tracks.push(track),
            }
        }
        self.bump();
    }

    pub(crate) fn apply_delete(&self, id: &str) {
        let removed = {
            let mut tracks = self.tracks.write();
            let before = tracks.len();
            tracks.retain(|track| track.id != id);
            tracks.len() != before
        };
        if removed {
            self.bump();
        }
    }

    pub(crate) fn clear(&self) {
        self.tracks.write().clear();
        self.bump();
    }

    fn bump(&self) {
        self.version.send_modify(|version| *version += 1);
    }
}

impl Default for LibraryProjection {
    fn default() -> Self {
        Self::new()
    }
}
