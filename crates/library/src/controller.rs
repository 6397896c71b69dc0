use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use common::{normalize_folder, Folder, Track};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::db::LibraryStore;
use crate::events::{LibraryEvent, Notifier};
use crate::reconcile::MergeStats;
use crate::scan::{
    ProgressTick, ScanCounters, ScanError, ScanOutcome, ScanResult, ScanWarning, Scanner,
};
use crate::LibraryError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FolderState {
    Scanning,
    Idle,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ScanSummary {
    pub stats: MergeStats,
    pub warnings: Vec<ScanWarning>,
}

#[derive(Debug)]
pub enum ControllerError {
    Library(LibraryError),
    Scan(ScanError),
    Join(String),
}

impl std::fmt::Display for ControllerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControllerError::Library(err) => write!(f, "{}", err),
            ControllerError::Scan(err) => write!(f, "{}", err),
            ControllerError::Join(err) => write!(f, "task failed: {}", err),
        }
    }
}

impl std::error::Error for ControllerError {}

impl From<LibraryError> for ControllerError {
    fn from(err: LibraryError) -> Self {
        ControllerError::Library(err)
    }
}

impl From<ScanError> for ControllerError {
    fn from(err: ScanError) -> Self {
        ControllerError::Scan(err)
    }
}

impl ControllerError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ControllerError::Scan(ScanError::Cancelled))
    }
}

struct ActiveScan {
    folders: Vec<String>,
    cancel: CancellationToken,
    counters: Arc<ScanCounters>,
}

/// Caller-facing library operations: registers folders, runs scans and
/// reconciles them into the store, and pushes results to the notifier.
pub struct LocalLibrary<S: LibraryStore> {
    store: Arc<S>,
    scanner: Scanner,
    notifier: Arc<dyn Notifier>,
    active: Arc<Mutex<HashMap<u64, ActiveScan>>>,
    next_scan: Arc<AtomicU64>,
    merge_lock: Arc<tokio::sync::Mutex<()>>,
    folder_states: Arc<RwLock<HashMap<String, FolderState>>>,
}

impl<S: LibraryStore> Clone for LocalLibrary<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            scanner: self.scanner.clone(),
            notifier: Arc::clone(&self.notifier),
            active: Arc::clone(&self.active),
            next_scan: Arc::clone(&self.next_scan),
            merge_lock: Arc::clone(&self.merge_lock),
            folder_states: Arc::clone(&self.folder_states),
        }
    }
}

impl<S: LibraryStore> LocalLibrary<S> {
    pub fn new(store: Arc<S>, scanner: Scanner, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            store,
            scanner,
            notifier,
            active: Arc::new(Mutex::new(HashMap::new())),
            next_scan: Arc::new(AtomicU64::new(1)),
            merge_lock: Arc::new(tokio::sync::Mutex::new(())),
            folder_states: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> Arc<S> {
        Arc::clone(&self.store)
    }

    pub async fn get_metas(&self) -> Result<Vec<Track>, ControllerError> {
        self.with_store(|store| store.get_tracks()).await
    }

    pub async fn get_local_folders(&self) -> Result<Vec<String>, ControllerError> {
        let folders = self.with_store(|store| store.get_local_folders()).await?;
        Ok(folders.into_iter().map(|folder| folder.path).collect())
    }

    /// Registers `paths`, scans them and replaces their indexed contents.
    pub async fn set_folders(&self, paths: Vec<String>) -> Result<ScanSummary, ControllerError> {
        let normalized: Vec<String> = paths.iter().map(|path| normalize_folder(path)).collect();
        let folders = self
            .with_store(move |store| {
                normalized
                    .iter()
                    .map(|path| store.add_folder(path))
                    .collect::<Result<Vec<Folder>, LibraryError>>()
            })
            .await?;
        self.scan_and_merge(folders).await
    }

    /// Drops the folder and every track under it.
    pub async fn remove_folder(&self, path: &str) -> Result<Vec<Track>, ControllerError> {
        let normalized = normalize_folder(path);
        let key = normalized.clone();
        let removed = self
            .with_store(move |store| store.remove_local_folder(&key))
            .await?;
        self.folder_states.write().remove(&normalized);
        self.notifier.send(LibraryEvent::Removed(removed.clone()));
        self.publish_library().await?;
        Ok(removed)
    }

    /// Rescans every registered folder. Failures surface as an error event,
    /// never as an `Err` to the caller.
    pub async fn refresh_all(&self) -> Option<ScanSummary> {
        let result = match self.with_store(|store| store.get_local_folders()).await {
            Ok(folders) => self.scan_and_merge(folders).await,
            Err(err) => Err(err),
        };
        match result {
            Ok(summary) => Some(summary),
            Err(err) if err.is_cancelled() => {
                info!("Refresh superseded by a newer scan");
                None
            }
            Err(err) => {
                warn!("Refresh failed: {}", err);
                self.notifier.send(LibraryEvent::Error(err.to_string()));
                None
            }
        }
    }

    /// Reads explicit files without registering anything.
    pub async fn import_single_files(
        &self,
        paths: Vec<String>,
    ) -> Result<Vec<Track>, ControllerError> {
        let paths: Vec<PathBuf> = paths.iter().map(PathBuf::from).collect();
        let (tracks, warnings) = self.scanner.extract_files(&paths).await?;
        if !warnings.is_empty() {
            warn!("{} dropped files could not be read", warnings.len());
        }
        self.notifier.send(LibraryEvent::QueueAdd(tracks.clone()));
        Ok(tracks)
    }

    pub fn folder_states(&self) -> Vec<(String, FolderState)> {
        let mut states: Vec<(String, FolderState)> = self
            .folder_states
            .read()
            .iter()
            .map(|(path, state)| (path.clone(), *state))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    /// Combined progress of every scan still running.
    pub fn scan_progress(&self) -> Option<ProgressTick> {
        let active = self.active.lock();
        if active.is_empty() {
            return None;
        }
        let mut total = ProgressTick::default();
        for scan in active.values() {
            let tick = scan.counters.snapshot();
            total.scan_progress += tick.scan_progress;
            total.scan_total += tick.scan_total;
        }
        Some(total)
    }

    async fn scan_and_merge(&self, folders: Vec<Folder>) -> Result<ScanSummary, ControllerError> {
        let (scan_id, cancel, counters) = self.begin_scan(&folders);
        let notifier = Arc::clone(&self.notifier);
        let scanned = self
            .scanner
            .scan_with_counters(
                &folders,
                &counters,
                |tick| notifier.send(LibraryEvent::Progress(tick)),
                &cancel,
            )
            .await;

        let result = match scanned {
            Ok(outcome) => self.merge(outcome, &cancel).await,
            Err(err) => Err(err.into()),
        };
        self.finish_scan(scan_id);

        let summary = result?;
        info!(
            "Library updated: {} added, {} updated, {} unchanged, {} removed",
            summary.stats.added, summary.stats.updated, summary.stats.unchanged, summary.stats.removed
        );
        self.publish_library().await?;
        Ok(summary)
    }

    async fn merge(
        &self,
        outcome: ScanOutcome,
        cancel: &CancellationToken,
    ) -> Result<ScanSummary, ControllerError> {
        let _guard = self.merge_lock.lock().await;
        if cancel.is_cancelled() {
            return Err(ScanError::Cancelled.into());
        }
        let scanned = outcome.scanned;
        let tracks: ScanResult = outcome.tracks;
        let stats = self
            .with_store(move |store| store.merge_scan_result(&scanned, &tracks))
            .await?;
        Ok(ScanSummary {
            stats,
            warnings: outcome.warnings,
        })
    }

    /// Supersedes running scans whose folders are all part of this one.
    fn begin_scan(&self, folders: &[Folder]) -> (u64, CancellationToken, Arc<ScanCounters>) {
        let paths: Vec<String> = folders.iter().map(|folder| folder.path.clone()).collect();
        let scan_id = self.next_scan.fetch_add(1, Ordering::SeqCst);
        let cancel = CancellationToken::new();
        let counters = Arc::new(ScanCounters::default());

        let mut active = self.active.lock();
        for scan in active.values() {
            if scan.folders.iter().all(|path| paths.contains(path)) {
                scan.cancel.cancel();
            }
        }
        active.insert(
            scan_id,
            ActiveScan {
                folders: paths.clone(),
                cancel: cancel.clone(),
                counters: Arc::clone(&counters),
            },
        );
        drop(active);

        let mut states = self.folder_states.write();
        for path in paths {
            states.insert(path, FolderState::Scanning);
        }
        (scan_id, cancel, counters)
    }

    fn finish_scan(&self, scan_id: u64) {
        let mut active = self.active.lock();
        let finished = match active.remove(&scan_id) {
            Some(scan) => scan,
            None => return,
        };
        let mut states = self.folder_states.write();
        for path in finished.folders {
            let still_scanning = active
                .values()
                .any(|scan| scan.folders.iter().any(|other| *other == path));
            if still_scanning {
                continue;
            }
            if let Some(state) = states.get_mut(&path) {
                *state = FolderState::Idle;
            }
        }
    }

    async fn publish_library(&self) -> Result<(), ControllerError> {
        let tracks = self.get_metas().await?;
        let index: ScanResult = tracks
            .into_iter()
            .map(|track| (track.uuid.clone(), track))
            .collect();
        self.notifier.send(LibraryEvent::Files(index));
        Ok(())
    }

    async fn with_store<T, F>(&self, f: F) -> Result<T, ControllerError>
    where
        F: FnOnce(&S) -> Result<T, LibraryError> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let result = tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|err| ControllerError::Join(err.to_string()))?;
        Ok(result?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::LocalLibraryDb;
    use common::path_string;
    use metadata::fixtures::{write_garbage, write_wav};
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    type Recorded = Arc<Mutex<Vec<LibraryEvent>>>;

    fn recorder() -> (Arc<dyn Notifier>, Recorded) {
        let events: Recorded = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let notifier: Arc<dyn Notifier> = Arc::new(move |event: LibraryEvent| sink.lock().push(event));
        (notifier, events)
    }

    fn library_in(dir: &TempDir) -> (LocalLibrary<LocalLibraryDb>, Recorded) {
        let store = LocalLibraryDb::open(&dir.path().join("library.redb")).unwrap();
        let (notifier, events) = recorder();
        (LocalLibrary::new(Arc::new(store), Scanner::new(2), notifier), events)
    }

    fn last_files(events: &Recorded) -> ScanResult {
        events
            .lock()
            .iter()
            .rev()
            .find_map(|event| match event {
                LibraryEvent::Files(tracks) => Some(tracks.clone()),
                _ => None,
            })
            .unwrap()
    }

    fn music_tree(root: &Path) {
        for name in ["a", "b"] {
            write_wav(&root.join(name).join("01.wav"), 0.1);
            write_wav(&root.join(name).join("cd1/01.wav"), 0.1);
        }
    }

    #[tokio::test]
    async fn set_folders_registers_scans_and_publishes() {
        let dir = TempDir::new().unwrap();
        let music = dir.path().join("music");
        music_tree(&music);
        write_garbage(&music.join("a/bad.mp3"));
        let (library, events) = library_in(&dir);

        let summary = library
            .set_folders(vec![path_string(&music.join("a")), path_string(&music.join("b"))])
            .await
            .unwrap();

        assert_eq!(summary.stats.added, 4);
        assert_eq!(summary.warnings.len(), 1);
        assert_eq!(library.get_metas().await.unwrap().len(), 4);
        assert_eq!(last_files(&events).len(), 4);

        let ticks: Vec<ProgressTick> = events
            .lock()
            .iter()
            .filter_map(|event| match event {
                LibraryEvent::Progress(tick) => Some(*tick),
                _ => None,
            })
            .collect();
        assert_eq!(
            ticks.last().copied(),
            Some(ProgressTick {
                scan_progress: 5,
                scan_total: 5,
            })
        );
        assert!(library
            .folder_states()
            .iter()
            .all(|(_, state)| *state == FolderState::Idle));
        assert!(library.scan_progress().is_none());
    }

    #[tokio::test]
    async fn adding_the_same_folder_twice_keeps_one_record() {
        let dir = TempDir::new().unwrap();
        let music = dir.path().join("music");
        music_tree(&music);
        let (library, _) = library_in(&dir);
        let a = path_string(&music.join("a"));

        library.set_folders(vec![a.clone()]).await.unwrap();
        let before = library.get_metas().await.unwrap();
        let summary = library.set_folders(vec![a.clone()]).await.unwrap();
        let after = library.get_metas().await.unwrap();

        assert_eq!(library.get_local_folders().await.unwrap(), vec![a]);
        assert_eq!(summary.stats.unchanged, 2);
        assert_eq!(summary.stats.added, 0);
        let mut before_ids: Vec<String> = before.into_iter().map(|t| t.uuid).collect();
        let mut after_ids: Vec<String> = after.into_iter().map(|t| t.uuid).collect();
        before_ids.sort();
        after_ids.sort();
        assert_eq!(before_ids, after_ids);
    }

    #[tokio::test]
    async fn remove_folder_prunes_only_its_tracks() {
        let dir = TempDir::new().unwrap();
        let music = dir.path().join("music");
        music_tree(&music);
        let (library, events) = library_in(&dir);
        let a = path_string(&music.join("a"));
        let b = path_string(&music.join("b"));
        library.set_folders(vec![a.clone(), b.clone()]).await.unwrap();

        let removed = library.remove_folder(&a).await.unwrap();

        assert_eq!(removed.len(), 2);
        let remaining = library.get_metas().await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|t| common::path_is_under(&b, &t.path)));
        assert_eq!(library.get_local_folders().await.unwrap(), vec![b]);
        assert!(events
            .lock()
            .iter()
            .any(|event| matches!(event, LibraryEvent::Removed(tracks) if tracks.len() == 2)));
        assert_eq!(last_files(&events).len(), 2);
        assert!(library.folder_states().iter().all(|(path, _)| *path != a));
    }

    #[tokio::test]
    async fn refresh_replaces_stale_entries() {
        let dir = TempDir::new().unwrap();
        let music = dir.path().join("music");
        music_tree(&music);
        let (library, _) = library_in(&dir);
        library
            .set_folders(vec![path_string(&music.join("a"))])
            .await
            .unwrap();

        fs::remove_file(music.join("a/cd1/01.wav")).unwrap();
        write_wav(&music.join("a/02.wav"), 0.1);
        let summary = library.refresh_all().await.unwrap();

        assert_eq!(summary.stats.added, 1);
        assert_eq!(summary.stats.removed, 1);
        assert_eq!(summary.stats.unchanged, 1);
        let mut paths: Vec<String> = library
            .get_metas()
            .await
            .unwrap()
            .into_iter()
            .map(|t| t.path)
            .collect();
        paths.sort();
        assert_eq!(
            paths,
            vec![
                path_string(&music.join("a/01.wav")),
                path_string(&music.join("a/02.wav")),
            ]
        );
    }

    #[tokio::test]
    async fn refresh_with_vanished_root_keeps_index_and_reports() {
        let dir = TempDir::new().unwrap();
        let music = dir.path().join("music");
        music_tree(&music);
        let (library, events) = library_in(&dir);
        library
            .set_folders(vec![path_string(&music.join("a"))])
            .await
            .unwrap();

        fs::remove_dir_all(music.join("a")).unwrap();
        assert!(library.refresh_all().await.is_none());

        assert_eq!(library.get_metas().await.unwrap().len(), 2);
        assert!(matches!(events.lock().last(), Some(LibraryEvent::Error(_))));
    }

    struct FailingMerge(LocalLibraryDb);

    impl LibraryStore for FailingMerge {
        fn get_tracks(&self) -> Result<Vec<Track>, LibraryError> {
            self.0.get_tracks()
        }

        fn get_local_folders(&self) -> Result<Vec<Folder>, LibraryError> {
            self.0.get_local_folders()
        }

        fn add_folder(&self, path: &str) -> Result<Folder, LibraryError> {
            self.0.add_folder(path)
        }

        fn remove_local_folder(&self, path: &str) -> Result<Vec<Track>, LibraryError> {
            self.0.remove_local_folder(path)
        }

        fn merge_scan_result(
            &self,
            _folders: &[Folder],
            _result: &ScanResult,
        ) -> Result<MergeStats, LibraryError> {
            Err(LibraryError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )))
        }
    }

    #[tokio::test]
    async fn failed_merge_emits_error_after_progress() {
        let dir = TempDir::new().unwrap();
        let music = dir.path().join("music");
        music_tree(&music);
        let db = LocalLibraryDb::open(&dir.path().join("library.redb")).unwrap();
        db.add_folder(&path_string(&music.join("a"))).unwrap();
        let (notifier, events) = recorder();
        let library = LocalLibrary::new(Arc::new(FailingMerge(db)), Scanner::new(2), notifier);

        assert!(library.refresh_all().await.is_none());

        let events = events.lock();
        assert!(events
            .iter()
            .any(|event| matches!(event, LibraryEvent::Progress(_))));
        match events.last() {
            Some(LibraryEvent::Error(message)) => assert!(message.contains("disk full")),
            other => panic!("unexpected last event: {:?}", other),
        }
        assert!(!events
            .iter()
            .any(|event| matches!(event, LibraryEvent::Files(_))));
        drop(events);
        assert!(library.get_metas().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn import_single_files_does_not_persist() {
        let dir = TempDir::new().unwrap();
        let loose = dir.path().join("loose.wav");
        write_wav(&loose, 0.1);
        let (library, events) = library_in(&dir);

        let tracks = library
            .import_single_files(vec![
                path_string(&loose),
                path_string(&dir.path().join("readme.txt")),
            ])
            .await
            .unwrap();

        assert_eq!(tracks.len(), 1);
        assert!(library.get_metas().await.unwrap().is_empty());
        assert!(library.get_local_folders().await.unwrap().is_empty());
        assert!(matches!(
            events.lock().last(),
            Some(LibraryEvent::QueueAdd(tracks)) if tracks.len() == 1
        ));
    }

    #[tokio::test]
    async fn newer_scan_supersedes_older_one() {
        let dir = TempDir::new().unwrap();
        let (library, _) = library_in(&dir);
        let a = path_string(&dir.path().join("music/a"));
        let folder = library.store().add_folder(&a).unwrap();

        let (_, older, _) = library.begin_scan(&[folder.clone()]);
        let (_, newer, _) = library.begin_scan(&[folder]);

        assert!(older.is_cancelled());
        assert!(!newer.is_cancelled());
        assert_eq!(library.folder_states(), vec![(a, FolderState::Scanning)]);
    }

    #[tokio::test]
    async fn results_reach_a_backed_up_host() {
        let dir = TempDir::new().unwrap();
        let music = dir.path().join("music");
        for idx in 0..8 {
            write_wav(&music.join(format!("{idx}.wav")), 0.05);
        }
        let store = LocalLibraryDb::open(&dir.path().join("library.redb")).unwrap();
        let (notifier, mut rx) = crate::events::ChannelNotifier::new(4);
        let library = LocalLibrary::new(Arc::new(store), Scanner::new(2), Arc::new(notifier));

        let summary = library
            .set_folders(vec![path_string(&music)])
            .await
            .unwrap();
        assert_eq!(summary.stats.added, 8);

        let events: Vec<LibraryEvent> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        let progress = events
            .iter()
            .filter(|event| matches!(event, LibraryEvent::Progress(_)))
            .count();
        assert_eq!(progress, 4);
        assert!(matches!(events.last(), Some(LibraryEvent::Files(index)) if index.len() == 8));
    }

    #[tokio::test]
    async fn scan_superseded_before_merge_leaves_store_untouched() {
        let dir = TempDir::new().unwrap();
        let music = dir.path().join("music");
        music_tree(&music);
        let (library, events) = library_in(&dir);
        let folder = library
            .store()
            .add_folder(&path_string(&music.join("a")))
            .unwrap();

        let (scan_id, cancel, counters) = library.begin_scan(&[folder.clone()]);
        let outcome = library
            .scanner
            .scan_with_counters(&[folder.clone()], &counters, |_| {}, &cancel)
            .await
            .unwrap();
        assert_eq!(outcome.tracks.len(), 2);

        let guard = library.merge_lock.lock().await;
        let merging = {
            let library = library.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { library.merge(outcome, &cancel).await })
        };
        tokio::task::yield_now().await;
        let (newer_id, _, _) = library.begin_scan(&[folder]);
        assert!(cancel.is_cancelled());
        drop(guard);

        let result = merging.await.unwrap();
        assert!(matches!(result, Err(ref err) if err.is_cancelled()));
        library.finish_scan(scan_id);
        library.finish_scan(newer_id);

        assert!(library.get_metas().await.unwrap().is_empty());
        assert!(!events
            .lock()
            .iter()
            .any(|event| matches!(event, LibraryEvent::Files(_))));
    }
}
