//! Server configuration

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Where persisted files go and how their names are derived.
#[derive(Debug, Clone)]
pub struct FilesConfig {
    /// Base directory for files persisted by `FILES_UPDATE`.
    pub base_dir: PathBuf,

    /// Prefix stored file names with the owning subject's identifier, so
    /// different subjects can own files with the same base name.
    pub unique_ids: bool,
}

impl FilesConfig {
    pub fn new(base_dir: impl Into<PathBuf>, unique_ids: bool) -> Self {
        Self {
            base_dir: base_dir.into(),
            unique_ids,
        }
    }
}

impl Default for FilesConfig {
    fn default() -> Self {
        Self::new("./data/files", true)
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listening address for WebSocket connections.
    pub bind_addr: SocketAddr,

    /// Directory holding graph snapshots for the bundled file store.
    pub data_dir: PathBuf,

    pub files: FilesConfig,
}

impl ServerConfig {
    /// Config rooted at `data_dir`, with persisted files under `data_dir/files`.
    pub fn with_data_dir(data_dir: impl AsRef<Path>) -> Self {
        let data_dir = data_dir.as_ref().to_path_buf();
        Self {
            files: FilesConfig::new(data_dir.join("files"), true),
            data_dir,
            ..Self::default()
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8765)),
            data_dir: PathBuf::from("./data"),
            files: FilesConfig::default(),
        }
    }
}
