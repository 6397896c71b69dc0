mod config;
mod ipc;
mod watch;

use std::sync::Arc;
use std::time::Duration;

use library::{
    default_concurrency, ChannelNotifier, LocalLibrary, LocalLibraryDb, Scanner, WalkOptions,
};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::{config_path_from_env, load_or_create_config, resolve_path};
use crate::watch::FolderWatcher;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // stdout carries the host protocol, so logs go to stderr.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config_path = config_path_from_env();
    let (config, created) = load_or_create_config(&config_path)?;
    if created {
        info!("Created default config at {:?}", config_path);
    } else {
        info!("Loaded config from {:?}", config_path);
    }

    let index_path = resolve_path(&config_path, config.index_path.trim());
    if let Some(parent) = index_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let store = Arc::new(LocalLibraryDb::open(&index_path)?);

    let concurrency = if config.scan_concurrency == 0 {
        default_concurrency()
    } else {
        config.scan_concurrency
    };
    let scanner = Scanner::new(concurrency)
        .with_walk_buffer(config.walk_buffer)
        .with_walk_options(WalkOptions {
            follow_links: config.follow_links,
        });

    let (notifier, events) = ChannelNotifier::new(config.notify_queue);
    let library = LocalLibrary::new(store, scanner, Arc::new(notifier));

    let watcher = FolderWatcher::start(
        library.clone(),
        config.watch_folders,
        Duration::from_secs(config.watch_debounce_secs),
    );
    match library.get_local_folders().await {
        Ok(folders) => {
            info!("{} registered folders", folders.len());
            watcher.configure(&folders);
        }
        Err(err) => warn!("Failed to read registered folders: {}", err),
    }

    let (reply_tx, reply_rx) = mpsc::channel(config.notify_queue);
    let writer = tokio::spawn(ipc::write_outbound(tokio::io::stdout(), events, reply_rx));

    // Dropping the serve future releases its library handle and reply
    // sender, which lets the writer finish once request tasks are done.
    tokio::select! {
        result = ipc::serve(tokio::io::stdin(), library, watcher, reply_tx) => {
            if let Err(err) = result {
                warn!("Failed reading host requests: {}", err);
            }
        }
        _ = shutdown_signal() => {}
    }

    ipc::drain_writer(writer, DRAIN_TIMEOUT).await;
    info!("Daemon stopped.");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(err) => {
                warn!("Failed to install terminate signal handler: {}", err);
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", err);
        }
    }

    info!("Shutdown signal received.");
}
