mod artwork;
mod engine;
mod projection;
mod settings;
mod sources;
mod state;
mod watch;

pub use artwork::{ArtworkCache, ArtworkPayload};
pub use engine::{IndexError, MediaIndexer};
pub use projection::LibraryProjection;
pub use settings::{
    folder_name_from_path, folder_path_from_uri, AutoScanConfig, DurationFilterConfig,
    DurationFilterMode, FolderFilterConfig, FolderFilterMode, SettingsError, SettingsStore,
};
pub use sources::{
    AssetPage, AssetSource, FsAssetSource, LoftyTagReader, OpenPermissions, PermissionGate,
    SourceError, TagReader, DEFAULT_PAGE_SIZE,
};
pub use state::{IndexerPhase, IndexerState, IndexerStatus};
pub use watch::configure_watcher;
