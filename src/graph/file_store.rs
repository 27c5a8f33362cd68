//! FileStore - JSON snapshot-backed triple store
//!
//! Committed statements live in `<data_dir>/<graph>.graph.json` (expanded
//! JSON-LD). Uncommitted changes are buffered per store instance, so every
//! session sees its own pending work on top of the last snapshot it loaded.
//!
//! # Commit
//!
//! A commit re-reads the snapshot under the factory-wide commit lock, applies
//! the buffered removals and additions, and replaces the snapshot through a
//! temp file + rename. Concurrent sessions on the same graph therefore never
//! lose each other's committed statements.
//!
//! # Ephemeral graphs
//!
//! `{"ephemeral": true}` in the login payload opens an in-memory store that
//! is never written to disk and disappears with its session.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, info};

use super::jsonld;
use super::{StoreFactory, Triple, TriplePattern, TripleStore};
use crate::error::{Result, SyncError};
use crate::session::ConnectionId;

const DEFAULT_GRAPH: &str = "default";

#[derive(Debug, Deserialize)]
struct LoginRequest {
    #[serde(default = "default_graph")]
    graph: String,
    #[serde(default)]
    ephemeral: bool,
}

fn default_graph() -> String {
    DEFAULT_GRAPH.to_string()
}

pub struct FileStore {
    /// Snapshot file (None for ephemeral stores)
    path: Option<PathBuf>,
    committed: BTreeSet<Triple>,
    added: BTreeSet<Triple>,
    removed: BTreeSet<Triple>,
    commit_lock: Arc<Mutex<()>>,
}

impl FileStore {
    /// Open (or start) the snapshot at `path`.
    pub fn open(path: impl Into<PathBuf>, commit_lock: Arc<Mutex<()>>) -> Result<Self> {
        let path = path.into();
        let committed = load_snapshot(&path)?;
        Ok(Self {
            path: Some(path),
            committed,
            added: BTreeSet::new(),
            removed: BTreeSet::new(),
            commit_lock,
        })
    }

    /// In-memory store, never persisted.
    pub fn ephemeral() -> Self {
        Self {
            path: None,
            committed: BTreeSet::new(),
            added: BTreeSet::new(),
            removed: BTreeSet::new(),
            commit_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Number of buffered, uncommitted changes.
    pub fn pending_count(&self) -> usize {
        self.added.len() + self.removed.len()
    }

    pub fn is_ephemeral(&self) -> bool {
        self.path.is_none()
    }
}

fn load_snapshot(path: &Path) -> Result<BTreeSet<Triple>> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(jsonld::parse_triples(&text)?.into_iter().collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeSet::new()),
        Err(e) => Err(e.into()),
    }
}

fn write_snapshot(path: &Path, triples: &BTreeSet<Triple>) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, jsonld::to_string(triples))?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

impl TripleStore for FileStore {
    fn add(&mut self, triple: Triple) -> Result<()> {
        self.removed.remove(&triple);
        if !self.committed.contains(&triple) {
            self.added.insert(triple);
        }
        Ok(())
    }

    fn remove(&mut self, triple: &Triple) -> Result<()> {
        self.added.remove(triple);
        if self.committed.contains(triple) {
            self.removed.insert(triple.clone());
        }
        Ok(())
    }

    fn triples(&self, pattern: &TriplePattern) -> Result<Vec<Triple>> {
        Ok(self
            .committed
            .iter()
            .filter(|t| !self.removed.contains(*t))
            .chain(self.added.iter())
            .filter(|t| pattern.matches(t))
            .cloned()
            .collect())
    }

    fn commit(&mut self) -> Result<()> {
        let Some(path) = &self.path else {
            self.committed.retain(|t| !self.removed.contains(t));
            self.committed.append(&mut self.added);
            self.removed.clear();
            return Ok(());
        };

        let _guard = self.commit_lock.lock();
        let mut snapshot = load_snapshot(path)?;
        for triple in &self.removed {
            snapshot.remove(triple);
        }
        snapshot.extend(self.added.iter().cloned());
        write_snapshot(path, &snapshot)?;

        debug!(
            path = %path.display(),
            added = self.added.len(),
            removed = self.removed.len(),
            total = snapshot.len(),
            "Committed graph snapshot"
        );

        self.committed = snapshot;
        self.added.clear();
        self.removed.clear();
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.added.clear();
        self.removed.clear();
        Ok(())
    }

    /// Reload the snapshot, picking up other sessions' commits.
    fn run(&mut self) -> Result<()> {
        if let Some(path) = &self.path {
            let _guard = self.commit_lock.lock();
            self.committed = load_snapshot(path)?;
        }
        Ok(())
    }

    fn close(mut self: Box<Self>, commit_pending: bool) -> Result<()> {
        if commit_pending {
            self.commit()?;
        } else if self.pending_count() > 0 {
            debug!(discarded = self.pending_count(), "Closing store without commit");
        }
        Ok(())
    }
}

/// Opens [`FileStore`]s under one data directory.
pub struct FileStoreFactory {
    data_dir: PathBuf,
    commit_lock: Arc<Mutex<()>>,
}

impl FileStoreFactory {
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)?;
        Ok(Self {
            data_dir,
            commit_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Validate graph name
    ///
    /// Allowed characters: [a-zA-Z0-9_-]
    /// Length: 1-128 characters
    fn validate_name(name: &str) -> Result<()> {
        if name.is_empty() || name.len() > 128 {
            return Err(SyncError::InvalidLogin(
                "graph name must be 1-128 characters".to_string(),
            ));
        }

        let valid = name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');

        if !valid {
            return Err(SyncError::InvalidLogin(
                "graph name can only contain a-z, A-Z, 0-9, _, -".to_string(),
            ));
        }

        Ok(())
    }

    pub fn snapshot_path(&self, graph: &str) -> PathBuf {
        self.data_dir.join(format!("{}.graph.json", graph))
    }
}

impl StoreFactory for FileStoreFactory {
    fn open(&self, login: &str) -> Result<Box<dyn TripleStore>> {
        let request: LoginRequest = if login.trim().is_empty() {
            LoginRequest {
                graph: default_graph(),
                ephemeral: false,
            }
        } else {
            serde_json::from_str(login).map_err(|e| SyncError::InvalidLogin(e.to_string()))?
        };

        if request.ephemeral {
            info!("Opened ephemeral graph");
            return Ok(Box::new(FileStore::ephemeral()));
        }

        Self::validate_name(&request.graph)?;
        let store = FileStore::open(self.snapshot_path(&request.graph), Arc::clone(&self.commit_lock))?;
        info!(graph = %request.graph, triples = store.committed.len(), "Opened graph");
        Ok(Box::new(store))
    }

    fn disconnected(&self, connection: ConnectionId) {
        debug!(connection, "Store factory notified of disconnect");
    }
}
