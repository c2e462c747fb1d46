use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use common::cache_key;
use tracing::warn;

/// Artwork as handed over by the tag reader or an external caller.
#[derive(Clone, Debug)]
pub enum ArtworkPayload {
    /// Raw image bytes (embedded cover).
    Bytes(Vec<u8>),
    /// Base64 text, optionally wrapped in a `data:` URI.
    Base64(String),
    /// Already a filesystem/content reference; passed through untouched.
    FileRef(String),
}

/// Content-addressed artwork store under a single cache directory. Entries
/// are keyed by the track id, so unchanged tracks never decode or write
/// twice.
#[derive(Clone)]
pub struct ArtworkCache {
    dir: PathBuf,
}

impl ArtworkCache {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entry_path(&self, track_id: &str) -> PathBuf {
        self.dir.join(format!("{}.jpg", cache_key(track_id)))
    }

    /// Persists artwork for a track and returns the reference to put on the
    /// record. Infallible by contract: any problem degrades to `None`
    /// ("no artwork") for this track and the scan moves on.
    pub async fn persist(&self, payload: &ArtworkPayload, track_id: &str) -> Option<String> {
        match self.persist_inner(payload, track_id).await {
            Ok(result) => result,
            Err(err) => {
                warn!("Failed to cache artwork for {}: {}", track_id, err);
                None
            }
        }
    }

    async fn persist_inner(
        &self,
        payload: &ArtworkPayload,
        track_id: &str,
    ) -> Result<Option<String>, std::io::Error> {
        let path = self.entry_path(track_id);
        if tokio::fs::try_exists(&path).await? {
            return Ok(Some(path.to_string_lossy().to_string()));
        }

        let data = match payload {
            ArtworkPayload::FileRef(reference) => return Ok(Some(reference.clone())),
            ArtworkPayload::Bytes(bytes) => bytes.clone(),
            ArtworkPayload::Base64(text) => {
                let raw = if text.starts_with("data:") {
                    text.split_once(',').map(|(_, rest)| rest).unwrap_or("")
                } else {
                    text.as_str()
                };
                match BASE64.decode(raw.trim()) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        warn!("Undecodable artwork payload for {}: {}", track_id, err);
                        return Ok(None);
                    }
                }
            }
        };
        if data.is_empty() {
            return Ok(None);
        }

        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(&path, &data).await?;
        Ok(Some(path.to_string_lossy().to_string()))
    }

    /// Drops the whole cache directory.
    pub async fn clear(&self) {
        if let Err(err) = tokio::fs::remove_dir_all(&self.dir).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to clear artwork cache: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cache(dir: &TempDir) -> ArtworkCache {
        ArtworkCache::new(dir.path().join("artwork"))
    }

    #[tokio::test]
    async fn writes_bytes_under_the_track_key() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        let reference = cache
            .persist(&ArtworkPayload::Bytes(vec![1, 2, 3]), "track-1")
            .await
            .unwrap();
        assert_eq!(tokio::fs::read(&reference).await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn existing_entries_are_not_rewritten() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        let first = cache
            .persist(&ArtworkPayload::Bytes(vec![1]), "track-1")
            .await
            .unwrap();
        let second = cache
            .persist(&ArtworkPayload::Bytes(vec![9, 9, 9]), "track-1")
            .await
            .unwrap();
        assert_eq!(first, second);
        // The original bytes survive the second call.
        assert_eq!(tokio::fs::read(&second).await.unwrap(), vec![1]);
    }

    #[tokio::test]
    async fn file_references_pass_through() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        let reference = cache
            .persist(
                &ArtworkPayload::FileRef("file:///covers/a.jpg".into()),
                "track-1",
            )
            .await;
        assert_eq!(reference.as_deref(), Some("file:///covers/a.jpg"));
    }

    #[tokio::test]
    async fn decodes_data_uris() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        let payload = ArtworkPayload::Base64(format!("data:image/jpeg;base64,{}", BASE64.encode([7u8, 8, 9])));
        let reference = cache.persist(&payload, "track-1").await.unwrap();
        assert_eq!(tokio::fs::read(&reference).await.unwrap(), vec![7, 8, 9]);
    }

    #[tokio::test]
    async fn garbage_payloads_degrade_to_none() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        assert!(cache
            .persist(&ArtworkPayload::Base64("!!not base64!!".into()), "track-1")
            .await
            .is_none());
        assert!(cache
            .persist(&ArtworkPayload::Bytes(Vec::new()), "track-2")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn distinct_ids_never_share_an_entry() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        // Both ids sanitize to the same text; the hash suffix keeps them apart.
        let first = cache
            .persist(&ArtworkPayload::Bytes(vec![1]), "a/b")
            .await
            .unwrap();
        let second = cache
            .persist(&ArtworkPayload::Bytes(vec![2]), "a_b")
            .await
            .unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn clear_removes_the_cache_dir() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        cache
            .persist(&ArtworkPayload::Bytes(vec![1]), "track-1")
            .await
            .unwrap();
        cache.clear().await;
        assert!(!cache.dir().exists());
        // Clearing an absent cache is fine.
        cache.clear().await;
    }
}
