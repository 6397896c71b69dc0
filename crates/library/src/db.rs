use std::fs;
use std::path::Path;
use std::sync::Arc;

use common::{normalize_folder, path_is_under, Folder, Track};
use redb::{Database, ReadableTable, TableDefinition, TableError, WriteTransaction};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::reconcile::{plan_merge, MergeStats};
use crate::scan::ScanResult;
use crate::LibraryError;

const INDEX_VERSION: u32 = 1;

const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");
const FOLDERS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("folders");
const TRACKS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("tracks");

const META_VERSION_KEY: &str = "version";

/// Persistence the scan pipeline reconciles into. Implementations serialize
/// their own writers; every method is one atomic unit.
pub trait LibraryStore: Send + Sync + 'static {
    fn get_tracks(&self) -> Result<Vec<Track>, LibraryError>;
    fn get_local_folders(&self) -> Result<Vec<Folder>, LibraryError>;
    fn add_folder(&self, path: &str) -> Result<Folder, LibraryError>;
    fn remove_local_folder(&self, path: &str) -> Result<Vec<Track>, LibraryError>;
    fn merge_scan_result(
        &self,
        folders: &[Folder],
        result: &ScanResult,
    ) -> Result<MergeStats, LibraryError>;
}

#[derive(Clone)]
pub struct LocalLibraryDb {
    db: Arc<Database>,
}

impl LocalLibraryDb {
    pub fn open(path: &Path) -> Result<Self, LibraryError> {
        let db = open_or_create_db(path)?;
        let store = Self { db: Arc::new(db) };
        store.init_tables()?;
        info!("Opened library index at {:?}", path);
        Ok(store)
    }

    fn init_tables(&self) -> Result<(), LibraryError> {
        let version = read_version(&self.db)?;
        let write_txn = self.db.begin_write()?;
        match version {
            Some(version) if version == INDEX_VERSION => {}
            Some(version) => {
                warn!("Index version mismatch ({}); dropping folders and tracks", version);
                clear_table(&write_txn, FOLDERS_TABLE)?;
                clear_table(&write_txn, TRACKS_TABLE)?;
            }
            None => debug!("Initializing empty library index"),
        }
        {
            let mut meta_table = write_txn.open_table(META_TABLE)?;
            let _ = write_txn.open_table(FOLDERS_TABLE)?;
            let _ = write_txn.open_table(TRACKS_TABLE)?;
            let version_bytes = encode_value(&INDEX_VERSION)?;
            meta_table.insert(META_VERSION_KEY, version_bytes.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

impl LibraryStore for LocalLibraryDb {
    fn get_tracks(&self) -> Result<Vec<Track>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(TRACKS_TABLE)?;
        let mut tracks = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            let track: Track = decode_value(entry.1.value())?;
            tracks.push(track);
        }
        Ok(tracks)
    }

    fn get_local_folders(&self) -> Result<Vec<Folder>, LibraryError> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(FOLDERS_TABLE)?;
        let mut folders = Vec::new();
        for entry in table.iter()? {
            let entry = entry?;
            let folder: Folder = decode_value(entry.1.value())?;
            folders.push(folder);
        }
        Ok(folders)
    }

    fn add_folder(&self, path: &str) -> Result<Folder, LibraryError> {
        let path = normalize_folder(path);
        let write_txn = self.db.begin_write()?;
        let folder = {
            let mut table = write_txn.open_table(FOLDERS_TABLE)?;
            let existing = match table.get(path.as_str())? {
                Some(value) => Some(decode_value::<Folder>(value.value())?),
                None => None,
            };
            match existing {
                Some(folder) => folder,
                None => {
                    let folder = Folder::new(&path);
                    let bytes = encode_value(&folder)?;
                    table.insert(path.as_str(), bytes.as_slice())?;
                    info!("Registered folder {}", folder.path);
                    folder
                }
            }
        };
        write_txn.commit()?;
        Ok(folder)
    }

    fn remove_local_folder(&self, path: &str) -> Result<Vec<Track>, LibraryError> {
        let path = normalize_folder(path);
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut folders_table = write_txn.open_table(FOLDERS_TABLE)?;
            let mut tracks_table = write_txn.open_table(TRACKS_TABLE)?;
            folders_table.remove(path.as_str())?;

            let mut removed = Vec::new();
            for entry in tracks_table.iter()? {
                let entry = entry?;
                let track: Track = decode_value(entry.1.value())?;
                if path_is_under(&path, &track.path) {
                    removed.push(track);
                }
            }
            for track in &removed {
                tracks_table.remove(track.uuid.as_str())?;
            }
            removed
        };
        write_txn.commit()?;
        info!("Removed folder {} ({} tracks)", path, removed.len());
        Ok(removed)
    }

    fn merge_scan_result(
        &self,
        folders: &[Folder],
        result: &ScanResult,
    ) -> Result<MergeStats, LibraryError> {
        let write_txn = self.db.begin_write()?;
        let stats = {
            let folders_table = write_txn.open_table(FOLDERS_TABLE)?;
            let mut tracks_table = write_txn.open_table(TRACKS_TABLE)?;

            let mut registered = Vec::with_capacity(folders.len());
            for folder in folders {
                if folders_table.get(folder.path.as_str())?.is_some() {
                    registered.push(folder.clone());
                } else {
                    debug!("Folder {} was removed during the scan; skipping", folder.path);
                }
            }

            let mut existing = Vec::new();
            for entry in tracks_table.iter()? {
                let entry = entry?;
                existing.push(decode_value::<Track>(entry.1.value())?);
            }

            let plan = plan_merge(&existing, &registered, result);
            for uuid in &plan.removals {
                tracks_table.remove(uuid.as_str())?;
            }
            for track in &plan.upserts {
                let bytes = encode_value(track)?;
                tracks_table.insert(track.uuid.as_str(), bytes.as_slice())?;
            }
            if plan.orphaned > 0 {
                debug!("Discarded {} tracks outside registered folders", plan.orphaned);
            }
            plan.stats
        };
        write_txn.commit()?;
        Ok(stats)
    }
}

fn open_or_create_db(path: &Path) -> Result<Database, LibraryError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    if path.exists() {
        Ok(Database::open(path)?)
    } else {
        Ok(Database::create(path)?)
    }
}

fn read_version(db: &Database) -> Result<Option<u32>, LibraryError> {
    let read_txn = db.begin_read()?;
    let table = match read_txn.open_table(META_TABLE) {
        Ok(table) => table,
        Err(TableError::TableDoesNotExist(_)) => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let version = match table.get(META_VERSION_KEY)? {
        Some(value) => Some(decode_value(value.value())?),
        None => None,
    };
    Ok(version)
}

fn clear_table(
    txn: &WriteTransaction,
    table: TableDefinition<&str, &[u8]>,
) -> Result<(), LibraryError> {
    match txn.delete_table(table) {
        Ok(_) => Ok(()),
        Err(TableError::TableDoesNotExist(_)) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, LibraryError> {
    Ok(bincode::serialize(value)?)
}

fn decode_value<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, LibraryError> {
    Ok(bincode::deserialize(bytes)?)
}
