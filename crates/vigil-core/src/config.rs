use std::path::PathBuf;

use crate::recognizer::{DEFAULT_ENCODING_CACHE_SIZE, DEFAULT_TOLERANCE};
use vigil_store::lock::DEFAULT_MAX_WAITING;

/// Engine configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of all vigil state.
    pub data_dir: PathBuf,
    /// JSON snapshot of known persons.
    pub persons_file: PathBuf,
    /// Root of the blob store holding face crops.
    pub blob_dir: PathBuf,
    /// Maximum embedding distance for a match.
    pub tolerance: f32,
    /// Known persons kept before the least recently seen is evicted (`None` = unbounded).
    pub max_persons: Option<usize>,
    /// Waiters queued on the person store lock before the holder is preempted.
    pub max_waiting: usize,
    /// Reference embeddings kept in memory.
    pub encoding_cache_size: usize,
    /// Optional TOML rules file.
    pub rules_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from `VIGIL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("VIGIL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_data_dir());

        let persons_file = std::env::var("VIGIL_PERSONS_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("persons.json"));

        let blob_dir = std::env::var("VIGIL_BLOB_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("blobs"));

        let max_persons = match env_usize("VIGIL_MAX_PERSONS", 256) {
            0 => None,
            n => Some(n),
        };

        Self {
            data_dir,
            persons_file,
            blob_dir,
            tolerance: env_f32("VIGIL_TOLERANCE", DEFAULT_TOLERANCE),
            max_persons,
            max_waiting: env_usize("VIGIL_MAX_WAITING", DEFAULT_MAX_WAITING),
            encoding_cache_size: env_usize("VIGIL_ENCODING_CACHE_SIZE", DEFAULT_ENCODING_CACHE_SIZE),
            rules_path: std::env::var("VIGIL_RULES_PATH").ok().map(PathBuf::from),
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("vigil")
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
