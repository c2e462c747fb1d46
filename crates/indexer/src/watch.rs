use std::path::PathBuf;
use std::time::Duration;

use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::info;

use crate::engine::MediaIndexer;

/// Watches a filesystem-backed media root and re-indexes after a quiet
/// period, provided the auto-scan preference is on. The returned watcher
/// must be kept alive; dropping it stops the events.
pub fn configure_watcher(
    indexer: MediaIndexer,
    root: PathBuf,
    debounce: Duration,
) -> Result<RecommendedWatcher, notify::Error> {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Event>();
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        },
        NotifyConfig::default(),
    )?;

    watcher.watch(&root, RecursiveMode::Recursive)?;
    info!(
        "Watching {} for changes (debounce {}s)",
        root.display(),
        debounce.as_secs()
    );

    tokio::spawn(async move {
        watch_loop(indexer, rx, debounce).await;
    });

    Ok(watcher)
}

async fn watch_loop(
    indexer: MediaIndexer,
    mut rx: UnboundedReceiver<Event>,
    debounce: Duration,
) {
    loop {
        let event = match rx.recv().await {
            Some(event) => event,
            None => break,
        };
        if !is_relevant_event(&event) {
            continue;
        }

        loop {
            tokio::select! {
                _ = tokio::time::sleep(debounce) => {
                    if indexer.settings().auto_scan().await.enabled {
                        info!("Media changes detected; auto-scan starting");
                        indexer.start_indexing(false, false).await;
                    } else {
                        info!("Media changes detected; auto-scan disabled");
                    }
                    break;
                }
                maybe_event = rx.recv() => {
                    if let Some(event) = maybe_event {
                        if !is_relevant_event(&event) {
                            continue;
                        }
                    } else {
                        return;
                    }
                }
            }
        }
    }
}

fn is_relevant_event(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}
