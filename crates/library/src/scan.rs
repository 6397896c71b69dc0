use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use common::{path_string, Codec, Folder, Track};
use metadata::{ExtractionError, ExtractionErrorKind};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::walk::{spawn_walker, WalkItem, WalkOptions};

pub const DEFAULT_WALK_BUFFER: usize = 256;

/// Output of one scan, keyed by track uuid.
pub type ScanResult = HashMap<String, Track>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressTick {
    pub scan_progress: usize,
    pub scan_total: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScanWarning {
    Path {
        folder: String,
        error: String,
    },
    Walk {
        path: String,
        error: String,
    },
    Extraction {
        path: String,
        error: ExtractionErrorKind,
        message: String,
    },
}

impl ScanWarning {
    fn extraction(path: &Path, err: &ExtractionError) -> Self {
        ScanWarning::Extraction {
            path: path_string(path),
            error: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Discovered/completed pair for one scan. Only the scan loop writes it;
/// anyone may snapshot it.
#[derive(Debug, Default)]
pub struct ScanCounters {
    discovered: AtomicUsize,
    completed: AtomicUsize,
}

impl ScanCounters {
    pub fn snapshot(&self) -> ProgressTick {
        let done = self.completed.load(Ordering::SeqCst);
        let total = self.discovered.load(Ordering::SeqCst);
        ProgressTick {
            scan_progress: done,
            scan_total: total.max(done),
        }
    }

    fn discover(&self) {
        self.discovered.fetch_add(1, Ordering::SeqCst);
    }

    fn complete(&self) -> ProgressTick {
        let done = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        ProgressTick {
            scan_progress: done,
            scan_total: self.discovered.load(Ordering::SeqCst),
        }
    }
}

#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub tracks: ScanResult,
    pub warnings: Vec<ScanWarning>,
    /// Folders whose roots were reachable; only these may be reconciled.
    pub scanned: Vec<Folder>,
}

impl ScanOutcome {
    pub fn extraction_failures(&self) -> usize {
        self.warnings
            .iter()
            .filter(|warning| matches!(warning, ScanWarning::Extraction { .. }))
            .count()
    }
}

#[derive(Debug)]
pub enum ScanError {
    Cancelled,
    NoAccessibleRoots(Vec<String>),
    Join(String),
}

impl std::fmt::Display for ScanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanError::Cancelled => write!(f, "scan cancelled"),
            ScanError::NoAccessibleRoots(folders) => {
                write!(f, "no accessible folders: {}", folders.join(", "))
            }
            ScanError::Join(err) => write!(f, "scan task failed: {}", err),
        }
    }
}

impl std::error::Error for ScanError {}

type Extracted = (PathBuf, Result<Track, ExtractionError>);

#[derive(Clone, Debug)]
pub struct Scanner {
    concurrency: usize,
    walk_buffer: usize,
    walk: WalkOptions,
}

impl Default for Scanner {
    fn default() -> Self {
        Self::new(default_concurrency())
    }
}

impl Scanner {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            walk_buffer: DEFAULT_WALK_BUFFER,
            walk: WalkOptions::default(),
        }
    }

    pub fn with_walk_buffer(mut self, walk_buffer: usize) -> Self {
        self.walk_buffer = walk_buffer.max(1);
        self
    }

    pub fn with_walk_options(mut self, walk: WalkOptions) -> Self {
        self.walk = walk;
        self
    }

    pub async fn scan_folders_and_get_meta<F>(
        &self,
        folders: &[Folder],
        on_progress: F,
        cancel: &CancellationToken,
    ) -> Result<ScanOutcome, ScanError>
    where
        F: FnMut(ProgressTick),
    {
        self.scan_with_counters(folders, &ScanCounters::default(), on_progress, cancel)
            .await
    }

    /// Walks every folder concurrently and extracts what the walkers find
    /// through a pool of at most `concurrency` blocking tasks. `on_progress`
    /// fires once per finished file, from this task.
    pub async fn scan_with_counters<F>(
        &self,
        folders: &[Folder],
        counters: &ScanCounters,
        mut on_progress: F,
        cancel: &CancellationToken,
    ) -> Result<ScanOutcome, ScanError>
    where
        F: FnMut(ProgressTick),
    {
        let mut outcome = ScanOutcome::default();
        let mut seen = HashSet::new();
        let (tx, mut rx) = mpsc::channel::<WalkItem>(self.walk_buffer);
        let mut walkers = Vec::new();

        for folder in folders {
            if !seen.insert(folder.path.clone()) {
                continue;
            }
            match check_root(&folder.path).await {
                Ok(()) => {
                    outcome.scanned.push(folder.clone());
                    walkers.push(spawn_walker(
                        PathBuf::from(&folder.path),
                        self.walk.clone(),
                        tx.clone(),
                        cancel.clone(),
                    ));
                }
                Err(err) => {
                    warn!("Skipping folder {}: {}", folder.path, err);
                    outcome.warnings.push(ScanWarning::Path {
                        folder: folder.path.clone(),
                        error: err.to_string(),
                    });
                }
            }
        }
        drop(tx);

        if outcome.scanned.is_empty() && !seen.is_empty() {
            return Err(ScanError::NoAccessibleRoots(seen.into_iter().collect()));
        }
        if !walkers.is_empty() {
            info!(
                "Scanning {} folders (concurrency {})",
                outcome.scanned.len(),
                self.concurrency
            );
        }

        let mut pool: JoinSet<Extracted> = JoinSet::new();
        let mut walking = !walkers.is_empty();

        while walking || !pool.is_empty() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    pool.abort_all();
                    info!(
                        "Scan cancelled at {}/{}",
                        counters.snapshot().scan_progress,
                        counters.snapshot().scan_total
                    );
                    return Err(ScanError::Cancelled);
                }
                Some(joined) = pool.join_next(), if !pool.is_empty() => {
                    let (path, result) = joined.map_err(|err| ScanError::Join(err.to_string()))?;
                    match result {
                        Ok(track) => {
                            outcome.tracks.insert(track.uuid.clone(), track);
                        }
                        Err(err) => {
                            warn!("Failed to read tags for {:?}: {}", path, err);
                            outcome.warnings.push(ScanWarning::extraction(&path, &err));
                        }
                    }
                    on_progress(counters.complete());
                }
                item = rx.recv(), if walking && pool.len() < self.concurrency => {
                    match item {
                        Some(WalkItem::File(path)) => {
                            counters.discover();
                            pool.spawn_blocking(move || extract_guarded(path));
                        }
                        Some(WalkItem::Warning(warning)) => {
                            debug!("Walk warning: {:?}", warning);
                            outcome.warnings.push(warning);
                        }
                        None => walking = false,
                    }
                }
            }
        }

        for walker in walkers {
            walker
                .await
                .map_err(|err| ScanError::Join(err.to_string()))?;
        }

        let tick = counters.snapshot();
        info!(
            "Scan finished: {} tracks from {} files, {} warnings",
            outcome.tracks.len(),
            tick.scan_total,
            outcome.warnings.len()
        );
        Ok(outcome)
    }

    /// Extracts explicit file paths with the same pool bound as a scan.
    /// Paths outside the audio allowlist are skipped; results keep input order.
    pub async fn extract_files(
        &self,
        paths: &[PathBuf],
    ) -> Result<(Vec<Track>, Vec<ScanWarning>), ScanError> {
        let mut pending = paths
            .iter()
            .filter(|path| Codec::from_path(path).is_some())
            .cloned()
            .enumerate();
        let mut pool: JoinSet<(usize, Extracted)> = JoinSet::new();
        let mut done: Vec<(usize, Track)> = Vec::new();
        let mut warnings = Vec::new();

        loop {
            while pool.len() < self.concurrency {
                match pending.next() {
                    Some((idx, path)) => {
                        pool.spawn_blocking(move || (idx, extract_guarded(path)));
                    }
                    None => break,
                }
            }
            let joined = match pool.join_next().await {
                Some(joined) => joined,
                None => break,
            };
            let (idx, (path, result)) = joined.map_err(|err| ScanError::Join(err.to_string()))?;
            match result {
                Ok(track) => done.push((idx, track)),
                Err(err) => {
                    warn!("Failed to read tags for {:?}: {}", path, err);
                    warnings.push(ScanWarning::extraction(&path, &err));
                }
            }
        }

        done.sort_by_key(|(idx, _)| *idx);
        Ok((done.into_iter().map(|(_, track)| track).collect(), warnings))
    }
}

pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(4)
        .max(2)
}

async fn check_root(path: &str) -> std::io::Result<()> {
    let meta = tokio::fs::metadata(path).await?;
    if meta.is_dir() {
        Ok(())
    } else {
        Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "not a directory",
        ))
    }
}

fn extract_guarded(path: PathBuf) -> Extracted {
    let result = panic::catch_unwind(AssertUnwindSafe(|| metadata::extract(&path)))
        .unwrap_or_else(|_| {
            Err(ExtractionError::Unreadable(std::io::Error::new(
                std::io::ErrorKind::Other,
                "extractor panicked",
            )))
        });
    (path, result)
}
