use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use indexer::{
    ArtworkCache, FsAssetSource, IndexerPhase, LoftyTagReader, MediaIndexer, OpenPermissions,
    SettingsStore,
};
use library::TrackStore;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut args = env::args().skip(1);
    let music_root = args
        .next()
        .or_else(|| env::var("MUSIC_ROOT").ok())
        .ok_or("MUSIC_ROOT not set and no path argument")?;
    let state_dir = args
        .next()
        .or_else(|| env::var("STATE_DIR").ok())
        .unwrap_or_else(|| "data".to_string());
    let state_dir = PathBuf::from(state_dir);

    let store = TrackStore::open(&state_dir.join("library.redb"))?;
    let indexer = MediaIndexer::new(
        store,
        Arc::new(FsAssetSource::new(PathBuf::from(&music_root))),
        Arc::new(OpenPermissions),
        Arc::new(LoftyTagReader),
        ArtworkCache::new(state_dir.join("artwork")),
        SettingsStore::new(state_dir.join("settings")),
    );

    let mut status = indexer.status().subscribe();
    let progress = tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let state = status.borrow().clone();
            if state.phase == IndexerPhase::Processing && !state.current_file.is_empty() {
                eprint!(
                    "\r[{:>3.0}%] {}/{} {}",
                    state.progress, state.processed_files, state.total_files, state.current_file
                );
            }
        }
    });

    indexer.start_indexing(false, false).await;
    progress.abort();
    eprintln!();

    println!("Indexed: {} tracks", indexer.projection().len());
    Ok(())
}
