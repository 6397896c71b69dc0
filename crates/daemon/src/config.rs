use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const CONFIG_VERSION: u32 = 1;

const DEFAULT_INDEX_PATH: &str = "locallib.redb";
const DEFAULT_WALK_BUFFER: usize = 256;
const DEFAULT_NOTIFY_QUEUE: usize = 1024;
const DEFAULT_WATCH_DEBOUNCE_SECS: u64 = 2;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LibraryConfig {
    pub version: u32,
    pub index_path: String,
    /// Extraction workers. Zero picks one per available core.
    pub scan_concurrency: usize,
    pub walk_buffer: usize,
    pub follow_links: bool,
    pub notify_queue: usize,
    pub watch_folders: bool,
    pub watch_debounce_secs: u64,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            index_path: DEFAULT_INDEX_PATH.to_string(),
            scan_concurrency: 0,
            walk_buffer: DEFAULT_WALK_BUFFER,
            follow_links: false,
            notify_queue: DEFAULT_NOTIFY_QUEUE,
            watch_folders: true,
            watch_debounce_secs: DEFAULT_WATCH_DEBOUNCE_SECS,
        }
    }
}

#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "io error: {}", err),
            ConfigError::Yaml(err) => write!(f, "yaml error: {}", err),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        ConfigError::Yaml(err)
    }
}

pub fn config_path_from_env() -> PathBuf {
    match env::var("LOCALLIB_CONFIG") {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value),
        _ => default_config_path(),
    }
}

fn default_config_path() -> PathBuf {
    match env::current_exe() {
        Ok(exe) => exe
            .parent()
            .map(|dir| dir.join("config.yaml"))
            .unwrap_or_else(|| PathBuf::from("config.yaml")),
        Err(_) => PathBuf::from("config.yaml"),
    }
}

pub fn load_or_create_config(path: &Path) -> Result<(LibraryConfig, bool), ConfigError> {
    if path.exists() {
        let contents = fs::read_to_string(path)?;
        let mut config: LibraryConfig = serde_yaml::from_str(&contents)?;
        if config.version < CONFIG_VERSION {
            config.version = CONFIG_VERSION;
        }
        if config.index_path.trim().is_empty() {
            config.index_path = DEFAULT_INDEX_PATH.to_string();
        }
        if config.walk_buffer == 0 {
            config.walk_buffer = DEFAULT_WALK_BUFFER;
        }
        if config.notify_queue == 0 {
            config.notify_queue = DEFAULT_NOTIFY_QUEUE;
        }
        if config.watch_debounce_secs == 0 {
            config.watch_debounce_secs = DEFAULT_WATCH_DEBOUNCE_SECS;
        }
        return Ok((config, false));
    }

    let config = LibraryConfig::default();
    save_config(path, &config)?;
    Ok((config, true))
}

pub fn save_config(path: &Path, config: &LibraryConfig) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let contents = serde_yaml::to_string(config)?;
    fs::write(path, contents)?;
    Ok(())
}

pub fn resolve_path(config_path: &Path, value: &str) -> PathBuf {
    let raw = PathBuf::from(value);
    if raw.is_absolute() {
        return raw;
    }
    let base = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    base.join(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/config.yaml");

        let (config, created) = load_or_create_config(&path).unwrap();
        assert!(created);
        assert!(path.exists());
        assert_eq!(config.index_path, DEFAULT_INDEX_PATH);

        let (reloaded, created) = load_or_create_config(&path).unwrap();
        assert!(!created);
        assert_eq!(reloaded.walk_buffer, config.walk_buffer);
    }

    #[test]
    fn zero_values_are_repaired() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(
            &path,
            "version: 0\nindex_path: ''\nwalk_buffer: 0\nnotify_queue: 0\nwatch_debounce_secs: 0\nscan_concurrency: 3\n",
        )
        .unwrap();

        let (config, _) = load_or_create_config(&path).unwrap();
        assert_eq!(config.version, CONFIG_VERSION);
        assert_eq!(config.index_path, DEFAULT_INDEX_PATH);
        assert_eq!(config.walk_buffer, DEFAULT_WALK_BUFFER);
        assert_eq!(config.notify_queue, DEFAULT_NOTIFY_QUEUE);
        assert_eq!(config.watch_debounce_secs, DEFAULT_WATCH_DEBOUNCE_SECS);
        assert_eq!(config.scan_concurrency, 3);
        assert!(config.watch_folders);
    }

    #[test]
    fn relative_paths_resolve_next_to_config() {
        let config_path = Path::new("/etc/locallib/config.yaml");
        assert_eq!(
            resolve_path(config_path, "index.redb"),
            PathBuf::from("/etc/locallib/index.redb")
        );
        assert_eq!(
            resolve_path(config_path, "/var/lib/index.redb"),
            PathBuf::from("/var/lib/index.redb")
        );
        assert_eq!(
            resolve_path(Path::new("config.yaml"), "index.redb"),
            PathBuf::from("./index.redb")
        );
    }
}
