use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use library::{LibraryStore, LocalLibrary};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{info, warn};

/// Filesystem watch over every registered folder. A burst of changes ends
/// in one `refresh_all` once the debounce window passes quietly.
#[derive(Clone)]
pub struct FolderWatcher {
    enabled: bool,
    tx: UnboundedSender<Event>,
    watcher: Arc<Mutex<Option<RecommendedWatcher>>>,
}

impl FolderWatcher {
    pub fn start<S: LibraryStore>(
        library: LocalLibrary<S>,
        enabled: bool,
        debounce: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<Event>();
        if enabled {
            tokio::spawn(async move {
                watch_loop(library, rx, debounce).await;
            });
        } else {
            info!("Watcher disabled (watch_folders=false)");
        }
        Self {
            enabled,
            tx,
            watcher: Arc::new(Mutex::new(None)),
        }
    }

    /// Replaces the watched set. An empty set drops the watcher.
    pub fn configure(&self, folders: &[String]) {
        if !self.enabled {
            return;
        }
        if folders.is_empty() {
            *self.watcher.lock() = None;
            return;
        }
        match setup_watcher(self.tx.clone(), folders) {
            Ok(watcher) => {
                info!("Watching {} folders for changes", folders.len());
                *self.watcher.lock() = Some(watcher);
            }
            Err(err) => {
                warn!("Failed to start watcher: {}", err);
                *self.watcher.lock() = None;
            }
        }
    }
}

fn setup_watcher(
    tx: UnboundedSender<Event>,
    folders: &[String],
) -> Result<RecommendedWatcher, notify::Error> {
    let mut watcher = RecommendedWatcher::new(
        move |res| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        },
        NotifyConfig::default(),
    )?;

    for folder in folders {
        if let Err(err) = watcher.watch(Path::new(folder), RecursiveMode::Recursive) {
            warn!("Cannot watch {}: {}", folder, err);
        }
    }
    Ok(watcher)
}

async fn watch_loop<S: LibraryStore>(
    library: LocalLibrary<S>,
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
                    info!("Folder changes settled; refreshing library");
                    if let Some(summary) = library.refresh_all().await {
                        info!(
                            "Auto-refresh complete: {} added, {} updated, {} removed",
                            summary.stats.added, summary.stats.updated, summary.stats.removed
                        );
                    }
                    break;
                }
                maybe_event = rx.recv() => {
                    if maybe_event.is_none() {
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
