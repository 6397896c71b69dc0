use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use library::{default_concurrency, LibraryEvent, LocalLibrary, LocalLibraryDb, Scanner};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut args = env::args().skip(1);
    let index_path = args
        .next()
        .or_else(|| env::var("INDEX_PATH").ok())
        .unwrap_or_else(|| "data/locallib.redb".to_string());
    let folders: Vec<String> = args.collect();
    if folders.is_empty() {
        return Err("usage: import_scan <index_path> <folder>...".into());
    }

    let index_path = PathBuf::from(index_path);
    if let Some(parent) = index_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let store = Arc::new(LocalLibraryDb::open(&index_path)?);
    let notifier = |event: LibraryEvent| {
        if let LibraryEvent::Progress(tick) = event {
            if tick.scan_progress == tick.scan_total || tick.scan_progress % 500 == 0 {
                info!("Scanned {}/{}", tick.scan_progress, tick.scan_total);
            }
        }
    };
    let library = LocalLibrary::new(store, Scanner::new(default_concurrency()), Arc::new(notifier));

    let summary = library.set_folders(folders).await?;
    for warning in &summary.warnings {
        info!("Skipped: {:?}", warning);
    }
    let total = library.get_metas().await?.len();

    println!(
        "Indexed: {} added, {} updated, {} unchanged, {} removed ({} tracks, {} warnings)",
        summary.stats.added,
        summary.stats.updated,
        summary.stats.unchanged,
        summary.stats.removed,
        total,
        summary.warnings.len()
    );

    Ok(())
}
