use std::path::{Path, PathBuf};

use common::{path_string, Codec};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use walkdir::WalkDir;

use crate::scan::ScanWarning;

#[derive(Debug)]
pub enum WalkItem {
    File(PathBuf),
    Warning(ScanWarning),
}

#[derive(Clone, Debug, Default)]
pub struct WalkOptions {
    pub follow_links: bool,
}

/// Lazily enumerates audio candidates under `root`. Unreadable entries turn
/// into warnings and traversal moves on to their siblings.
pub fn walk(root: &Path, options: &WalkOptions) -> impl Iterator<Item = WalkItem> {
    WalkDir::new(root)
        .follow_links(options.follow_links)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => {
                if entry.file_type().is_file() && Codec::from_path(entry.path()).is_some() {
                    Some(WalkItem::File(entry.into_path()))
                } else {
                    None
                }
            }
            Err(err) => Some(WalkItem::Warning(ScanWarning::Walk {
                path: err.path().map(path_string).unwrap_or_default(),
                error: err.to_string(),
            })),
        })
}

/// Drives [`walk`] on a blocking thread into `tx`. Stops at the next entry
/// once `cancel` fires or the receiver goes away.
pub fn spawn_walker(
    root: PathBuf,
    options: WalkOptions,
    tx: mpsc::Sender<WalkItem>,
    cancel: CancellationToken,
) -> JoinHandle<usize> {
    tokio::task::spawn_blocking(move || {
        let mut files = 0usize;
        for item in walk(&root, &options) {
            if cancel.is_cancelled() {
                debug!("Walk of {:?} cancelled after {} files", root, files);
                return files;
            }
            if matches!(item, WalkItem::File(_)) {
                files += 1;
            }
            if tx.blocking_send(item).is_err() {
                debug!("Walk of {:?} abandoned after {} files", root, files);
                return files;
            }
        }
        debug!("Walk of {:?} finished: {} files", root, files);
        files
    })
}
