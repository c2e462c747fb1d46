use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use common::{relpath_from, stable_id, Asset};
use lofty::prelude::AudioFile;
use metadata::{MetadataError, PartialMetadata};
use parking_lot::Mutex;
use tracing::warn;
use walkdir::WalkDir;

pub const DEFAULT_PAGE_SIZE: usize = 500;

#[derive(Debug)]
pub enum SourceError {
    Io(std::io::Error),
    Unavailable(String),
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceError::Io(err) => write!(f, "io error: {}", err),
            SourceError::Unavailable(message) => write!(f, "source unavailable: {}", message),
        }
    }
}

impl std::error::Error for SourceError {}

impl From<std::io::Error> for SourceError {
    fn from(err: std::io::Error) -> Self {
        SourceError::Io(err)
    }
}

/// One page of a device-asset enumeration.
pub struct AssetPage {
    pub assets: Vec<Asset>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

/// Read access to the device media library; on mobile targets this wraps the
/// OS permission prompt.
#[async_trait]
pub trait PermissionGate: Send + Sync {
    async fn request_access(&self) -> Result<bool, SourceError>;
}

/// Always-granted gate for filesystem-backed sources.
pub struct OpenPermissions;

#[async_trait]
impl PermissionGate for OpenPermissions {
    async fn request_access(&self) -> Result<bool, SourceError> {
        Ok(true)
    }
}

/// Paginated enumeration of the device's audio assets. `next_page(None)`
/// starts a fresh enumeration; the returned cursor resumes it.
#[async_trait]
pub trait AssetSource: Send + Sync {
    async fn next_page(&self, cursor: Option<String>) -> Result<AssetPage, SourceError>;
}

/// Per-asset tag extraction seam; mocked in tests to count and fail reads.
#[async_trait]
pub trait TagReader: Send + Sync {
    async fn read(&self, asset: &Asset) -> Result<PartialMetadata, MetadataError>;
}

/// Reads embedded tags with lofty off the runtime's blocking pool.
pub struct LoftyTagReader;

#[async_trait]
impl TagReader for LoftyTagReader {
    async fn read(&self, asset: &Asset) -> Result<PartialMetadata, MetadataError> {
        let path = path_from_uri(&asset.uri);
        tokio::task::spawn_blocking(move || metadata::extract(&path))
            .await
            .map_err(|err| {
                MetadataError::Io(std::io::Error::new(std::io::ErrorKind::Other, err))
            })?
    }
}

pub(crate) fn path_from_uri(uri: &str) -> PathBuf {
    PathBuf::from(uri.strip_prefix("file://").unwrap_or(uri))
}

/// Directory-walk stand-in for the device media store: every audio file
/// under `root` becomes an asset with a stable id derived from its relative
/// path. The walk happens once per enumeration (cursor `None`) and pages are
/// served from that listing.
pub struct FsAssetSource {
    root: PathBuf,
    page_size: usize,
    listing: Mutex<Option<Arc<Vec<Asset>>>>,
}

impl FsAssetSource {
    pub fn new(root: PathBuf) -> Self {
        Self::with_page_size(root, DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(root: PathBuf, page_size: usize) -> Self {
        Self {
            root,
            page_size: page_size.max(1),
            listing: Mutex::new(None),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn load_listing(&self) -> Result<Arc<Vec<Asset>>, SourceError> {
        if let Some(cached) = self.listing.lock().clone() {
            return Ok(cached);
        }
        let root = self.root.clone();
        let assets = tokio::task::spawn_blocking(move || walk_audio_assets(&root))
            .await
            .map_err(|err| SourceError::Unavailable(err.to_string()))?;
        let assets = Arc::new(assets);
        *self.listing.lock() = Some(Arc::clone(&assets));
        Ok(assets)
    }
}

#[async_trait]
impl AssetSource for FsAssetSource {
    async fn next_page(&self, cursor: Option<String>) -> Result<AssetPage, SourceError> {
        let offset = match cursor.as_deref() {
            Some(raw) => raw
                .parse::<usize>()
                .map_err(|_| SourceError::Unavailable(format!("bad cursor: {}", raw)))?,
            None => {
                // A fresh enumeration re-walks the tree.
                *self.listing.lock() = None;
                0
            }
        };
        let assets = self.load_listing().await?;
        let start = offset.min(assets.len());
        let end = (start + self.page_size).min(assets.len());
        let has_more = end < assets.len();
        Ok(AssetPage {
            assets: assets[start..end].to_vec(),
            next_cursor: has_more.then(|| end.to_string()),
            has_more,
        })
    }
}

fn walk_audio_assets(root: &Path) -> Vec<Asset> {
    let mut assets = Vec::new();
    for entry in WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
    {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if !is_audio_file(path) {
            continue;
        }
        let relpath = match relpath_from(root, path) {
            Some(rel) => rel,
            None => continue,
        };
        let meta = match path.metadata() {
            Ok(meta) => meta,
            Err(err) => {
                warn!("Failed to stat {:?}: {}", path, err);
                continue;
            }
        };
        let modification_time = meta
            .modified()
            .ok()
            .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(0);

        assets.push(Asset {
            id: stable_id(&relpath),
            uri: path.to_string_lossy().to_string(),
            filename: path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default(),
            modification_time,
            duration: probe_duration(path),
            size: meta.len(),
        });
    }
    assets.sort_by(|a, b| a.uri.cmp(&b.uri));
    assets
}

// The device media store reports durations for free; the filesystem
// stand-in probes them so duration filters behave the same way.
fn probe_duration(path: &Path) -> f64 {
    match lofty::read_from_path(path) {
        Ok(file) => file.properties().duration().as_secs_f64(),
        Err(_) => 0.0,
    }
}

fn is_audio_file(path: &Path) -> bool {
    let ext = match path.extension() {
        Some(ext) => ext.to_string_lossy().to_ascii_lowercase(),
        None => return false,
    };
    matches!(
        ext.as_str(),
        "mp3" | "flac" | "m4a" | "aac" | "ogg" | "opus" | "wav"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn seed_files(dir: &TempDir, names: &[&str]) {
        for name in names {
            let path = dir.path().join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, b"not really audio").unwrap();
        }
    }

    async fn collect_all(source: &FsAssetSource) -> Vec<Asset> {
        let mut assets = Vec::new();
        let mut cursor = None;
        loop {
            let page = source.next_page(cursor.take()).await.unwrap();
            assets.extend(page.assets);
            if !page.has_more {
                break;
            }
            cursor = page.next_cursor;
        }
        assets
    }

    #[tokio::test]
    async fn walks_only_audio_files() {
        let dir = TempDir::new().unwrap();
        seed_files(&dir, &["a.mp3", "sub/b.flac", "cover.jpg", "notes.txt"]);
        let source = FsAssetSource::new(dir.path().to_path_buf());
        let assets = collect_all(&source).await;
        assert_eq!(assets.len(), 2);
        assert!(assets.iter().all(|asset| !asset.filename.ends_with(".jpg")));
    }

    #[tokio::test]
    async fn pagination_covers_the_whole_listing() {
        let dir = TempDir::new().unwrap();
        let names: Vec<String> = (0..7).map(|i| format!("t{}.mp3", i)).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        seed_files(&dir, &refs);

        let source = FsAssetSource::with_page_size(dir.path().to_path_buf(), 3);
        let first = source.next_page(None).await.unwrap();
        assert_eq!(first.assets.len(), 3);
        assert!(first.has_more);

        let assets = collect_all(&source).await;
        assert_eq!(assets.len(), 7);
    }

    #[tokio::test]
    async fn ids_are_stable_across_enumerations() {
        let dir = TempDir::new().unwrap();
        seed_files(&dir, &["a.mp3"]);
        let source = FsAssetSource::new(dir.path().to_path_buf());
        let first = collect_all(&source).await;
        let second = collect_all(&source).await;
        assert_eq!(first[0].id, second[0].id);
    }

    #[tokio::test]
    async fn bad_cursor_is_an_error() {
        let dir = TempDir::new().unwrap();
        let source = FsAssetSource::new(dir.path().to_path_buf());
        assert!(source.next_page(Some("not-a-number".into())).await.is_err());
    }
}
