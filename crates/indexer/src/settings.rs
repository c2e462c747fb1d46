use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use common::Asset;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;

const AUTO_SCAN_FILE: &str = "auto-scan.json";
const FOLDER_FILTER_FILE: &str = "folder-filters.json";
const DURATION_FILTER_FILE: &str = "duration-filter.json";
const MAX_CUSTOM_MINIMUM_SECS: u32 = 1200;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoScanConfig {
    pub enabled: bool,
}

impl Default for AutoScanConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FolderFilterMode {
    Allow,
    Deny,
}

/// Per-folder allow/deny list. As soon as one folder is explicitly allowed
/// the config is an allow-list and unlisted folders are excluded; denied
/// folders are always excluded; with no allow entries unlisted folders pass.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FolderFilterConfig {
    pub folders: BTreeMap<String, FolderFilterMode>,
}

impl FolderFilterConfig {
    pub fn allows(&self, folder_path: &str) -> bool {
        if let Some(mode) = self.folders.get(folder_path) {
            return *mode == FolderFilterMode::Allow;
        }
        !self
            .folders
            .values()
            .any(|mode| *mode == FolderFilterMode::Allow)
    }

    pub fn allows_asset(&self, asset: &Asset) -> bool {
        self.allows(&folder_path_from_uri(&asset.uri))
    }

    pub fn is_unfiltered(&self) -> bool {
        self.folders.is_empty()
    }
}

/// The folder component of an asset uri: everything before the last slash.
pub fn folder_path_from_uri(uri: &str) -> String {
    match uri.rfind('/') {
        Some(idx) => uri[..idx].to_string(),
        None => String::new(),
    }
}

pub fn folder_name_from_path(path: &str) -> String {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
        .to_string()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DurationFilterMode {
    Off,
    Min30s,
    Min60s,
    Min120s,
    Custom,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DurationFilterConfig {
    pub mode: DurationFilterMode,
    pub custom_minimum_seconds: u32,
}

impl Default for DurationFilterConfig {
    fn default() -> Self {
        Self {
            mode: DurationFilterMode::Off,
            custom_minimum_seconds: 180,
        }
    }
}

impl DurationFilterConfig {
    pub fn minimum_seconds(&self) -> u32 {
        match self.mode {
            DurationFilterMode::Off => 0,
            DurationFilterMode::Min30s => 30,
            DurationFilterMode::Min60s => 60,
            DurationFilterMode::Min120s => 120,
            DurationFilterMode::Custom => self.custom_minimum_seconds.min(MAX_CUSTOM_MINIMUM_SECS),
        }
    }

    /// Assets with no usable duration fail any active minimum.
    pub fn allows(&self, duration_secs: f64) -> bool {
        let minimum = self.minimum_seconds();
        if minimum == 0 {
            return true;
        }
        if !duration_secs.is_finite() || duration_secs <= 0.0 {
            return false;
        }
        duration_secs >= f64::from(minimum)
    }

    pub fn label(&self) -> String {
        match self.mode {
            DurationFilterMode::Off => "No filter".to_string(),
            DurationFilterMode::Min30s => "At least 30s".to_string(),
            DurationFilterMode::Min60s => "At least 1m".to_string(),
            DurationFilterMode::Min120s => "At least 2m".to_string(),
            DurationFilterMode::Custom => {
                let seconds = self.minimum_seconds();
                if seconds < 60 {
                    return format!("Custom {}s", seconds);
                }
                let minutes = seconds / 60;
                let rest = seconds % 60;
                if rest > 0 {
                    format!("Custom {}m {}s", minutes, rest)
                } else {
                    format!("Custom {}m", minutes)
                }
            }
        }
    }

    fn sanitized(mut self) -> Self {
        self.custom_minimum_seconds = self.custom_minimum_seconds.min(MAX_CUSTOM_MINIMUM_SECS);
        self
    }
}

#[derive(Debug)]
pub enum SettingsError {
    Io(std::io::Error),
    Json(serde_json::Error),
}

impl std::fmt::Display for SettingsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SettingsError::Io(err) => write!(f, "io error: {}", err),
            SettingsError::Json(err) => write!(f, "json error: {}", err),
        }
    }
}

impl std::error::Error for SettingsError {}

impl From<std::io::Error> for SettingsError {
    fn from(err: std::io::Error) -> Self {
        SettingsError::Io(err)
    }
}

impl From<serde_json::Error> for SettingsError {
    fn from(err: serde_json::Error) -> Self {
        SettingsError::Json(err)
    }
}

/// Three small JSON documents under one settings directory. Loads are lazy
/// and memoized; the per-document async mutex makes concurrent first loads
/// safe (the second caller waits and reads the memo). Missing or corrupt
/// documents fall back to defaults.
pub struct SettingsStore {
    dir: PathBuf,
    auto_scan: Mutex<Option<AutoScanConfig>>,
    folder_filters: Mutex<Option<FolderFilterConfig>>,
    duration_filter: Mutex<Option<DurationFilterConfig>>,
}

impl SettingsStore {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            auto_scan: Mutex::new(None),
            folder_filters: Mutex::new(None),
            duration_filter: Mutex::new(None),
        }
    }

    pub async fn auto_scan(&self) -> AutoScanConfig {
        let mut memo = self.auto_scan.lock().await;
        if let Some(config) = memo.as_ref() {
            return config.clone();
        }
        let config: AutoScanConfig = read_document(&self.dir.join(AUTO_SCAN_FILE)).await;
        *memo = Some(config.clone());
        config
    }

    pub async fn set_auto_scan(&self, enabled: bool) -> Result<bool, SettingsError> {
        let mut memo = self.auto_scan.lock().await;
        let current = match memo.as_ref() {
            Some(config) => config.clone(),
            None => read_document(&self.dir.join(AUTO_SCAN_FILE)).await,
        };
        let next = AutoScanConfig { enabled };
        let changed = next != current;
        if changed {
            write_document(&self.dir.join(AUTO_SCAN_FILE), &next).await?;
        }
        *memo = Some(next);
        Ok(changed)
    }

    pub async fn folder_filters(&self) -> FolderFilterConfig {
        let mut memo = self.folder_filters.lock().await;
        if let Some(config) = memo.as_ref() {
            return config.clone();
        }
        let config: FolderFilterConfig = read_document(&self.dir.join(FOLDER_FILTER_FILE)).await;
        *memo = Some(config.clone());
        config
    }

    /// Sets or clears (`None`) the mode of one folder.
    pub async fn set_folder_mode(
        &self,
        folder: &str,
        mode: Option<FolderFilterMode>,
    ) -> Result<bool, SettingsError> {
        self.update_folder_filters(|config| match mode {
            Some(mode) => {
                config.folders.insert(folder.to_string(), mode);
            }
            None => {
                config.folders.remove(folder);
            }
        })
        .await
    }

    pub async fn set_all_folder_modes(
        &self,
        folders: &[String],
        mode: FolderFilterMode,
    ) -> Result<bool, SettingsError> {
        self.update_folder_filters(|config| {
            for folder in folders {
                config.folders.insert(folder.clone(), mode);
            }
        })
        .await
    }

    pub async fn clear_folder_filters(&self) -> Result<bool, SettingsError> {
        self.update_folder_filters(|config| config.folders.clear())
            .await
    }

    async fn update_folder_filters(
        &self,
        apply: impl FnOnce(&mut FolderFilterConfig),
    ) -> Result<bool, SettingsError> {
        let mut memo = self.folder_filters.lock().await;
        let current = match memo.as_ref() {
            Some(config) => config.clone(),
            None => read_document(&self.dir.join(FOLDER_FILTER_FILE)).await,
        };
        let mut next = current.clone();
        apply(&mut next);
        let changed = next != current;
        if changed {
            write_document(&self.dir.join(FOLDER_FILTER_FILE), &next).await?;
        }
        *memo = Some(next);
        Ok(changed)
    }

    pub async fn duration_filter(&self) -> DurationFilterConfig {
        let mut memo = self.duration_filter.lock().await;
        if let Some(config) = memo.as_ref() {
            return *config;
        }
        let config: DurationFilterConfig =
            read_document::<DurationFilterConfig>(&self.dir.join(DURATION_FILTER_FILE))
                .await
                .sanitized();
        *memo = Some(config);
        config
    }

    pub async fn set_duration_filter(
        &self,
        config: DurationFilterConfig,
    ) -> Result<(DurationFilterConfig, bool), SettingsError> {
        let mut memo = self.duration_filter.lock().await;
        let current = match memo.as_ref() {
            Some(config) => *config,
            None => read_document::<DurationFilterConfig>(&self.dir.join(DURATION_FILTER_FILE))
                .await
                .sanitized(),
        };
        let next = config.sanitized();
        let changed = next != current;
        if changed {
            write_document(&self.dir.join(DURATION_FILTER_FILE), &next).await?;
        }
        *memo = Some(next);
        Ok((next, changed))
    }
}

async fn read_document<T: DeserializeOwned + Default>(path: &Path) -> T {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(_) => return T::default(),
    };
    match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        Err(err) => {
            warn!("Unreadable settings document {:?}: {}", path, err);
            T::default()
        }
    }
}

async fn write_document<T: Serialize>(path: &Path, value: &T) -> Result<(), SettingsError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let bytes = serde_json::to_vec_pretty(value)?;
    tokio::fs::write(path, bytes).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn defaults_when_documents_are_missing() {
        let dir = TempDir::new().unwrap();
        let store = SettingsStore::new(dir.path().join("settings"));
        assert!(store.auto_scan().await.enabled);
        assert!(store.folder_filters().await.is_unfiltered());
        assert_eq!(store.duration_filter().await.mode, DurationFilterMode::Off);
    }

    #[tokio::test]
    async fn set_persists_and_survives_a_fresh_store() {
        let dir = TempDir::new().unwrap();
        let settings_dir = dir.path().join("settings");
        {
            let store = SettingsStore::new(settings_dir.clone());
            assert!(store.set_auto_scan(false).await.unwrap());
            let (applied, changed) = store
                .set_duration_filter(DurationFilterConfig {
                    mode: DurationFilterMode::Custom,
                    custom_minimum_seconds: 4000,
                })
                .await
                .unwrap();
            assert!(changed);
            // Clamped on write.
            assert_eq!(applied.custom_minimum_seconds, 1200);
            assert!(store
                .set_folder_mode("/music/voice-memos", Some(FolderFilterMode::Deny))
                .await
                .unwrap());
        }

        let store = SettingsStore::new(settings_dir);
        assert!(!store.auto_scan().await.enabled);
        assert_eq!(store.duration_filter().await.minimum_seconds(), 1200);
        assert!(!store.folder_filters().await.allows("/music/voice-memos"));
    }

    #[tokio::test]
    async fn unchanged_sets_report_no_change() {
        let dir = TempDir::new().unwrap();
        let store = SettingsStore::new(dir.path().join("settings"));
        assert!(store.set_auto_scan(false).await.unwrap());
        assert!(!store.set_auto_scan(false).await.unwrap());
        assert!(!store.clear_folder_filters().await.unwrap());
    }

    #[tokio::test]
    async fn corrupt_documents_fall_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let settings_dir = dir.path().join("settings");
        tokio::fs::create_dir_all(&settings_dir).await.unwrap();
        tokio::fs::write(settings_dir.join(AUTO_SCAN_FILE), b"{nope")
            .await
            .unwrap();
        let store = SettingsStore::new(settings_dir);
        assert!(store.auto_scan().await.enabled);
    }

    #[tokio::test]
    async fn concurrent_first_loads_agree() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SettingsStore::new(dir.path().join("settings")));
        let a = tokio::spawn({
            let store = Arc::clone(&store);
            async move { store.duration_filter().await }
        });
        let b = tokio::spawn({
            let store = Arc::clone(&store);
            async move { store.duration_filter().await }
        });
        assert_eq!(a.await.unwrap(), b.await.unwrap());
    }

    #[test]
    fn folder_filter_semantics() {
        let mut config = FolderFilterConfig::default();
        assert!(config.allows("/music/anything"));

        config
            .folders
            .insert("/music/podcasts".into(), FolderFilterMode::Deny);
        assert!(!config.allows("/music/podcasts"));
        assert!(config.allows("/music/albums"));

        // One allow entry flips the config to an allow-list.
        config
            .folders
            .insert("/music/albums".into(), FolderFilterMode::Allow);
        assert!(config.allows("/music/albums"));
        assert!(!config.allows("/music/elsewhere"));
    }

    #[test]
    fn folder_path_helpers() {
        assert_eq!(
            folder_path_from_uri("/storage/music/album/track.mp3"),
            "/storage/music/album"
        );
        assert_eq!(folder_path_from_uri("track.mp3"), "");
        assert_eq!(folder_name_from_path("/storage/music/album"), "album");
        assert_eq!(folder_name_from_path("/storage/music/album/"), "album");
    }

    #[test]
    fn duration_filter_thresholds() {
        let mut config = DurationFilterConfig::default();
        assert!(config.allows(0.0));
        assert!(config.allows(f64::NAN));

        config.mode = DurationFilterMode::Min60s;
        assert!(!config.allows(59.9));
        assert!(config.allows(60.0));
        assert!(!config.allows(0.0));
        assert!(!config.allows(f64::NAN));

        config.mode = DurationFilterMode::Custom;
        config.custom_minimum_seconds = 90;
        assert_eq!(config.minimum_seconds(), 90);
        assert_eq!(config.label(), "Custom 1m 30s");
    }
}
