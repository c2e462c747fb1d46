use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Maximum length of a fingerprint or cache key, counted in bytes. Keys are
/// used as filenames, so they must stay well under common filesystem limits.
const KEY_MAX_LEN: usize = 64;
const HASH_SUFFIX_LEN: usize = 12;

/// An audio entry as exposed by the device media store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Asset {
    pub id: String,
    pub uri: String,
    pub filename: String,
    /// Last-modified time, epoch milliseconds.
    pub modification_time: u64,
    /// Duration in seconds; zero when the store does not know it.
    pub duration: f64,
    /// File size in bytes; zero when the store does not expose it.
    pub size: u64,
}

impl Asset {
    pub fn display_name(&self) -> String {
        if !self.filename.is_empty() {
            return self.filename.clone();
        }
        self.uri
            .rsplit('/')
            .next()
            .unwrap_or(self.uri.as_str())
            .to_string()
    }

    /// Size-or-duration proxy fed into the fingerprint. Duration is the
    /// preferred signal (the media store reports it without touching the
    /// file); byte size stands in when duration is unknown.
    pub fn size_hint(&self) -> u64 {
        if self.duration > 0.0 {
            (self.duration * 1000.0) as u64
        } else {
            self.size
        }
    }
}

/// A durable library record, keyed by the media-store asset id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub artist: Option<String>,
    #[serde(default)]
    pub album: Option<String>,
    #[serde(default)]
    pub genre: Option<String>,
    pub uri: String,
    /// Duration in seconds.
    pub duration: f64,
    /// Reference into the artwork cache, if any.
    #[serde(default)]
    pub image: Option<String>,
    pub file_hash: String,
    /// Epoch milliseconds of the last successful processing pass.
    pub scan_time: u64,
    #[serde(default)]
    pub is_deleted: bool,
}

pub fn stable_id(input: &str) -> String {
    blake3::hash(input.as_bytes()).to_hex().to_string()
}

/// Cheap change-detection fingerprint over the media store's free signals.
/// Deterministic; not a content digest. A stale fingerprint can only occur
/// if uri, mtime and the size hint are all unchanged, in which case the
/// asset is treated as unchanged by design.
pub fn compute_fingerprint(uri: &str, modification_time: u64, size_hint: u64) -> String {
    let raw = format!("{}-{}-{}", uri, modification_time, size_hint);
    keyed(&raw)
}

/// Filesystem-safe cache key for a raw id. Sanitization alone can alias two
/// distinct ids (`a/b` and `a_b` both sanitize to `a_b`), so the key carries
/// a short content hash of the raw input.
pub fn cache_key(raw: &str) -> String {
    keyed(raw)
}

fn keyed(raw: &str) -> String {
    let mut prefix = sanitize_component(raw);
    prefix.truncate(KEY_MAX_LEN - HASH_SUFFIX_LEN - 1);
    let digest = blake3::hash(raw.as_bytes()).to_hex().to_string();
    format!("{}-{}", prefix, &digest[..HASH_SUFFIX_LEN])
}

/// Maps arbitrary text onto `[A-Za-z0-9_]`.
pub fn sanitize_component(raw: &str) -> String {
    raw.chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
        .collect()
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_millis() as u64
}

pub fn relpath_from(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    Some(path_to_slash_string(rel))
}

fn path_to_slash_string(path: &Path) -> String {
    let parts: Vec<String> = path
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    parts.join("/")
}
