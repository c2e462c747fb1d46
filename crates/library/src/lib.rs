use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use common::{now_millis, Track};
use redb::{
    CommitError, Database, DatabaseError, ReadableTable, StorageError, TableDefinition, TableError,
    TransactionError, WriteTransaction,
};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

const SCHEMA_VERSION: u32 = 2;
const HISTORY_CAP: usize = 50;

const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");
const TRACKS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("tracks");
// One byte per id: 0 = live, 1 = tombstoned. Existence checks and id diffs
// read this table without decoding full rows.
const TRACK_IDS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("track_ids");
const HISTORY_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("history");

const META_VERSION_KEY: &str = "version";

/// A play event, appended by playback collaborators. The indexer never
/// writes this table, so listening history survives any re-index.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlayEvent {
    pub id: String,
    pub track_id: String,
    pub timestamp: u64,
}

/// Durable track table keyed by the media-store asset id, with soft-delete
/// semantics. The single source of truth for the library.
#[derive(Clone)]
pub struct TrackStore {
    db: Arc<Database>,
    play_seq: Arc<AtomicU64>,
}

impl TrackStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let db = open_or_create_db(path)?;
        let store = Self {
            db: Arc::new(db),
            play_seq: Arc::new(AtomicU64::new(0)),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), StoreError> {
        let version = read_version(&self.db)?;
        let write_txn = self.db.begin_write()?;
        {
            write_txn.open_table(TRACKS_TABLE)?;
            write_txn.open_table(TRACK_IDS_TABLE)?;
            write_txn.open_table(HISTORY_TABLE)?;
            let mut meta_table = write_txn.open_table(META_TABLE)?;
            let version_bytes = encode_value(&SCHEMA_VERSION)?;
            meta_table.insert(META_VERSION_KEY, version_bytes.as_slice())?;
        }
        match version {
            Some(version) if version != SCHEMA_VERSION => {
                warn!("Track schema version mismatch ({}); clearing index", version);
                clear_table(&write_txn, TRACKS_TABLE)?;
                clear_table(&write_txn, TRACK_IDS_TABLE)?;
            }
            _ => {}
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Live (non-tombstoned) rows.
    pub fn get_all(&self) -> Result<Vec<Track>, StoreError> {
        self.read_tracks(false)
    }

    /// Every row including tombstones; used by the reconciliation phase.
    pub fn get_all_with_deleted(&self) -> Result<Vec<Track>, StoreError> {
        self.read_tracks(true)
    }

    fn read_tracks(&self, include_deleted: bool) -> Result<Vec<Track>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TRACKS_TABLE)?;
        let mut tracks = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            let track: Track = decode_value(entry.1.value())?;
            if include_deleted || !track.is_deleted {
                tracks.push(track);
            }
        }
        Ok(tracks)
    }

    pub fn get_by_id(&self, id: &str) -> Result<Option<Track>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TRACKS_TABLE)?;
        let track = match table.get(id)? {
            Some(value) => Some(decode_value(value.value())?),
            None => None,
        };
        Ok(track)
    }

    /// Insert-or-replace, full-row semantics. Callers pass a complete record
    /// carrying a fresh fingerprint and scan time; there are no
    /// partial-field updates.
    pub fn upsert(&self, track: &Track) -> Result<(), StoreError> {
        let write_txn = self.db.begin_write()?;
        write_track(&write_txn, track)?;
        write_txn.commit()?;
        Ok(())
    }

    /// Batch upsert in a single transaction: either every row in the slice
    /// becomes visible or none does.
    pub fn upsert_many(&self, tracks: &[Track]) -> Result<(), StoreError> {
        if tracks.is_empty() {
            return Ok(());
        }
        let write_txn = self.db.begin_write()?;
        for track in tracks {
            write_track(&write_txn, track)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Sets the tombstone flag, keeping the row queryable until the next
    /// purge. Returns false when the id is unknown.
    pub fn mark_deleted(&self, id: &str) -> Result<bool, StoreError> {
        let write_txn = self.db.begin_write()?;
        {
            let mut tracks_table = write_txn.open_table(TRACKS_TABLE)?;
            let mut track: Track = match tracks_table.get(id)? {
                Some(value) => decode_value(value.value())?,
                None => return Ok(false),
            };
            track.is_deleted = true;
            let bytes = encode_value(&track)?;
            tracks_table.insert(id, bytes.as_slice())?;
            let mut ids_table = write_txn.open_table(TRACK_IDS_TABLE)?;
            ids_table.insert(id, tombstone_bytes(true))?;
        }
        write_txn.commit()?;
        Ok(true)
    }

    /// Physically removes every tombstoned row. Returns the purge count.
    pub fn purge_deleted(&self) -> Result<usize, StoreError> {
        let write_txn = self.db.begin_write()?;
        let purged = {
            let mut ids_table = write_txn.open_table(TRACK_IDS_TABLE)?;
            let mut doomed = Vec::new();
            for entry in ids_table.iter()? {
                let entry = entry?;
                if entry.1.value().first().copied().unwrap_or(0) != 0 {
                    doomed.push(entry.0.value().to_string());
                }
            }
            let mut tracks_table = write_txn.open_table(TRACKS_TABLE)?;
            for id in &doomed {
                tracks_table.remove(id.as_str())?;
                ids_table.remove(id.as_str())?;
            }
            doomed.len()
        };
        write_txn.commit()?;
        Ok(purged)
    }

    /// Live ids, off the lightweight index.
    pub fn all_ids(&self) -> Result<Vec<String>, StoreError> {
        self.read_ids(false)
    }

    pub fn all_ids_with_deleted(&self) -> Result<Vec<String>, StoreError> {
        self.read_ids(true)
    }

    fn read_ids(&self, include_deleted: bool) -> Result<Vec<String>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TRACK_IDS_TABLE)?;
        let mut ids = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            let tombstoned = entry.1.value().first().copied().unwrap_or(0) != 0;
            if include_deleted || !tombstoned {
                ids.push(entry.0.value().to_string());
            }
        }
        Ok(ids)
    }

    /// Appends a play event and prunes the log to the most recent
    /// `HISTORY_CAP` entries.
    pub fn record_play(&self, track_id: &str) -> Result<(), StoreError> {
        let timestamp = now_millis();
        // The sequence keeps same-millisecond plays in insertion order.
        let seq = self.play_seq.fetch_add(1, Ordering::Relaxed);
        let key = format!("{:020}-{:08}-{}", timestamp, seq, Uuid::new_v4());
        let event = PlayEvent {
            id: key.clone(),
            track_id: track_id.to_string(),
            timestamp,
        };
        let bytes = encode_value(&event)?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(HISTORY_TABLE)?;
            table.insert(key.as_str(), bytes.as_slice())?;
            let mut keys: Vec<String> = Vec::new();
            for entry in table.iter()? {
                let entry = entry?;
                keys.push(entry.0.value().to_string());
            }
            if keys.len() > HISTORY_CAP {
                // Keys sort chronologically, so the overflow is the head.
                for key in &keys[..keys.len() - HISTORY_CAP] {
                    table.remove(key.as_str())?;
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Most recent plays first.
    pub fn recent_plays(&self, limit: usize) -> Result<Vec<PlayEvent>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(HISTORY_TABLE)?;
        let mut events = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            let event: PlayEvent = decode_value(entry.1.value())?;
            events.push(event);
        }
        events.reverse();
        events.truncate(limit);
        Ok(events)
    }
}

#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Redb(redb::Error),
    Bincode(Box<bincode::ErrorKind>),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io(err) => write!(f, "io error: {}", err),
            StoreError::Redb(err) => write!(f, "db error: {}", err),
            StoreError::Bincode(err) => write!(f, "bincode error: {}", err),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err)
    }
}

impl From<redb::Error> for StoreError {
    fn from(err: redb::Error) -> Self {
        StoreError::Redb(err)
    }
}

impl From<DatabaseError> for StoreError {
    fn from(err: DatabaseError) -> Self {
        StoreError::Redb(err.into())
    }
}

impl From<TableError> for StoreError {
    fn from(err: TableError) -> Self {
        StoreError::Redb(err.into())
    }
}

impl From<TransactionError> for StoreError {
    fn from(err: TransactionError) -> Self {
        StoreError::Redb(err.into())
    }
}

impl From<StorageError> for StoreError {
    fn from(err: StorageError) -> Self {
        StoreError::Redb(err.into())
    }
}

impl From<CommitError> for StoreError {
    fn from(err: CommitError) -> Self {
        StoreError::Redb(err.into())
    }
}

impl From<Box<bincode::ErrorKind>> for StoreError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        StoreError::Bincode(err)
    }
}

fn open_or_create_db(path: &Path) -> Result<Database, StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    if path.exists() {
        Ok(Database::open(path)?)
    } else {
        Ok(Database::create(path)?)
    }
}

fn write_track(txn: &WriteTransaction, track: &Track) -> Result<(), StoreError> {
    let bytes = encode_value(track)?;
    let mut tracks_table = txn.open_table(TRACKS_TABLE)?;
    tracks_table.insert(track.id.as_str(), bytes.as_slice())?;
    let mut ids_table = txn.open_table(TRACK_IDS_TABLE)?;
    ids_table.insert(track.id.as_str(), tombstone_bytes(track.is_deleted))?;
    Ok(())
}

fn read_version(db: &Database) -> Result<Option<u32>, StoreError> {
    let read_txn = db.begin_read()?;
    let table = match read_txn.open_table(META_TABLE) {
        Ok(table) => table,
        Err(TableError::TableDoesNotExist(_)) => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let version = match table.get(META_VERSION_KEY)? {
        Some(value) => Some(decode_value(value.value())?),
        None => None,
    };
    Ok(version)
}

fn clear_table(
    txn: &WriteTransaction,
    table: TableDefinition<&str, &[u8]>,
) -> Result<(), StoreError> {
    match txn.delete_table(table) {
        Ok(_) => {}
        Err(TableError::TableDoesNotExist(_)) => {}
        Err(err) => return Err(err.into()),
    }
    txn.open_table(table)?;
    Ok(())
}

fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    Ok(bincode::serialize(value)?)
}

fn decode_value<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, StoreError> {
    Ok(bincode::deserialize(bytes)?)
}

fn tombstone_bytes(deleted: bool) -> &'static [u8] {
    if deleted {
        &[1u8]
    } else {
        &[0u8]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn track(id: &str) -> Track {
        Track {
            id: id.to_string(),
            title: format!("Track {}", id),
            artist: Some("Artist".into()),
            album: Some("Album".into()),
            genre: None,
            uri: format!("file:///music/{}.mp3", id),
            duration: 180.0,
            image: None,
            file_hash: format!("hash-{}", id),
            scan_time: 1,
            is_deleted: false,
        }
    }

    fn open_store(dir: &TempDir) -> TrackStore {
        TrackStore::open(&dir.path().join("library.redb")).unwrap()
    }

    #[test]
    fn upsert_and_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.upsert(&track("a")).unwrap();
        let loaded = store.get_by_id("a").unwrap().unwrap();
        assert_eq!(loaded, track("a"));
        assert!(store.get_by_id("missing").unwrap().is_none());
    }

    #[test]
    fn upsert_replaces_the_full_row() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.upsert(&track("a")).unwrap();
        let mut updated = track("a");
        updated.title = "Renamed".into();
        updated.file_hash = "hash-2".into();
        store.upsert(&updated).unwrap();
        let loaded = store.get_by_id("a").unwrap().unwrap();
        assert_eq!(loaded.title, "Renamed");
        assert_eq!(loaded.file_hash, "hash-2");
        assert_eq!(store.get_all().unwrap().len(), 1);
    }

    #[test]
    fn tombstones_hide_rows_from_default_reads() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.upsert(&track("a")).unwrap();
        store.upsert(&track("b")).unwrap();
        assert!(store.mark_deleted("a").unwrap());
        assert!(!store.mark_deleted("missing").unwrap());

        let live = store.get_all().unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, "b");
        assert_eq!(store.all_ids().unwrap(), vec!["b".to_string()]);

        let all = store.get_all_with_deleted().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(store.all_ids_with_deleted().unwrap().len(), 2);
        // Still queryable by id until purged.
        assert!(store.get_by_id("a").unwrap().unwrap().is_deleted);
    }

    #[test]
    fn purge_removes_only_tombstoned_rows() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.upsert(&track("a")).unwrap();
        store.upsert(&track("b")).unwrap();
        store.mark_deleted("a").unwrap();

        assert_eq!(store.purge_deleted().unwrap(), 1);
        assert!(store.get_by_id("a").unwrap().is_none());
        assert_eq!(store.all_ids_with_deleted().unwrap(), vec!["b".to_string()]);
        assert_eq!(store.purge_deleted().unwrap(), 0);
    }

    #[test]
    fn upsert_many_commits_the_whole_batch() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let batch: Vec<Track> = (0..10).map(|i| track(&format!("t{}", i))).collect();
        store.upsert_many(&batch).unwrap();
        assert_eq!(store.get_all().unwrap().len(), 10);
        store.upsert_many(&[]).unwrap();
        assert_eq!(store.get_all().unwrap().len(), 10);
    }

    #[test]
    fn reviving_a_tombstoned_row_clears_the_index_flag() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        store.upsert(&track("a")).unwrap();
        store.mark_deleted("a").unwrap();
        store.upsert(&track("a")).unwrap();
        assert_eq!(store.all_ids().unwrap(), vec!["a".to_string()]);
        assert_eq!(store.purge_deleted().unwrap(), 0);
    }

    #[test]
    fn history_is_capped_to_the_most_recent_window() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        for i in 0..60 {
            store.record_play(&format!("t{}", i)).unwrap();
        }
        let recent = store.recent_plays(100).unwrap();
        assert_eq!(recent.len(), 50);
        // Newest first; the earliest ten plays were pruned.
        assert_eq!(recent[0].track_id, "t59");
        assert!(recent.iter().all(|event| event.track_id != "t0"));
    }

    #[test]
    fn history_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = open_store(&dir);
            store.record_play("a").unwrap();
        }
        let store = open_store(&dir);
        assert_eq!(store.recent_plays(10).unwrap().len(), 1);
    }
}
