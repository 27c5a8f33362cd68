//! Command handlers
//!
//! Handlers return `Result<Reply>`; the dispatcher is the only place that
//! turns an error into `ERROR: <kind>: <message>` wire text.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value;
use tokio::fs;
use tracing::{debug, info};

use super::Command;
use crate::config::FilesConfig;
use crate::error::{Result, SyncError};
use crate::graph::{jsonld, StoreFactory, TripleStore};
use crate::session::{ConnectionId, Session};
use crate::transfer::{compute_real_path, hash_file, stored_name, FileHash, FileHashList, FileRef};

/// Response text for verbs outside the vocabulary.
pub const INVALID_COMMAND: &str = "ERROR: Invalid command";

const OK: &str = "OK";

/// Most files one response can carry; `num_files` is a 2-byte header field.
pub const MAX_REPLY_FILES: usize = u16::MAX as usize;

/// Response text plus files to stream back after it.
#[derive(Debug, Default)]
pub struct Reply {
    pub text: String,
    pub files: Vec<PathBuf>,
}

impl Reply {
    pub fn ok() -> Self {
        Self::text(OK)
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            files: Vec::new(),
        }
    }

    pub fn error(err: &SyncError) -> Self {
        Self::text(err.to_wire())
    }

    /// Fail if the response header could not describe this reply.
    pub fn check_fits(&self) -> Result<()> {
        if self.files.len() > MAX_REPLY_FILES {
            return Err(SyncError::InvalidHeader(format!(
                "{} files in one response, at most {} allowed",
                self.files.len(),
                MAX_REPLY_FILES
            )));
        }
        Ok(())
    }
}

/// Everything a handler needs besides the session.
pub struct RequestContext<'a> {
    pub connection: ConnectionId,
    /// Per-request scratch directory; deleted after the response is written
    pub scratch: &'a Path,
    /// Where this request's attachments landed, inside `scratch`
    pub received_dir: &'a Path,
    /// Files received with this request: base name -> SHA-256 hex
    pub received: HashMap<String, String>,
    pub files: &'a FilesConfig,
    pub factory: &'a Arc<dyn StoreFactory>,
}

/// Run blocking store work on the blocking pool.
pub(super) async fn blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| SyncError::Store(format!("store task failed: {}", e)))
}

/// Lend the session's store to `op` on the blocking pool, then put it back.
async fn with_store<T, F>(session: &mut Session, op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&mut Box<dyn TripleStore>) -> Result<T> + Send + 'static,
{
    let mut store = session.take_store()?;
    let (store, result) = blocking(move || {
        let result = op(&mut store);
        (store, result)
    })
    .await?;
    session.restore_store(store);
    result
}

pub async fn dispatch(
    command: Command,
    payload: &str,
    session: &mut Session,
    ctx: &RequestContext<'_>,
) -> Result<Reply> {
    if command != Command::Login && !session.has_store() {
        return Err(SyncError::NoSession);
    }

    match command {
        Command::Login => {
            let factory = Arc::clone(ctx.factory);
            let login = payload.to_string();
            let store = blocking(move || factory.open(&login)).await??;
            session.set_store(store)?;
            info!(connection = ctx.connection, "Session logged in");
            Ok(Reply::ok())
        }

        Command::Add => {
            let triples = jsonld::parse_triples(payload)?;
            let count = triples.len();
            with_store(session, move |store| {
                for triple in triples {
                    store.add(triple)?;
                }
                Ok(())
            })
            .await?;
            debug!(connection = ctx.connection, count, "Staged additions");
            Ok(Reply::ok())
        }

        Command::Remove => {
            let patterns = jsonld::parse_patterns(payload)?;
            let count = with_store(session, move |store| {
                let mut count = 0;
                for pattern in patterns {
                    for triple in store.triples(&pattern)? {
                        store.remove(&triple)?;
                        count += 1;
                    }
                }
                Ok(count)
            })
            .await?;
            debug!(connection = ctx.connection, count, "Staged removals");
            Ok(Reply::ok())
        }

        Command::Triples => {
            let patterns = jsonld::parse_patterns(payload)?;
            let matches = with_store(session, move |store| {
                let mut matches = BTreeSet::new();
                for pattern in patterns {
                    matches.extend(store.triples(&pattern)?);
                }
                Ok(matches)
            })
            .await?;
            Ok(Reply::text(jsonld::to_string(&matches)))
        }

        Command::Commit => {
            with_store(session, |store| store.commit()).await?;
            Ok(Reply::ok())
        }

        Command::Rollback => {
            with_store(session, |store| store.rollback()).await?;
            Ok(Reply::ok())
        }

        Command::Run => {
            with_store(session, |store| store.run()).await?;
            Ok(Reply::ok())
        }

        Command::FilesUpdate => files_update(payload, session, ctx).await,
        Command::FilesHash => files_hash(payload, session, ctx).await,
        Command::FilesDelete => files_delete(payload, session, ctx).await,
        Command::FilesRename => files_rename(payload, session, ctx).await,
        Command::FilesFetch => files_fetch(payload, session, ctx).await,
    }
}

// ============================================================================
// File commands
// ============================================================================

fn is_not_found(err: &SyncError) -> bool {
    matches!(err, SyncError::Io(io) if io.kind() == ErrorKind::NotFound)
}

fn file_refs_from_value(doc: &Value) -> Result<Vec<FileRef>> {
    jsonld::triples_from_value(doc)?
        .iter()
        .map(FileRef::from_triple)
        .collect()
}

fn file_refs(payload: &str) -> Result<Vec<FileRef>> {
    jsonld::parse_triples(payload)?
        .iter()
        .map(FileRef::from_triple)
        .collect()
}

fn hash_list(files: Vec<FileHash>) -> Result<Reply> {
    Ok(Reply::text(serde_json::to_string(&FileHashList { files })?))
}

/// Copy into place through a temp name so readers never see a partial file.
async fn persist(src: &Path, dest: &Path, stored: &str) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }
    let part = dest.with_file_name(format!(".{}.part", stored));
    fs::copy(src, &part).await?;
    fs::rename(&part, dest).await?;
    Ok(())
}

async fn files_update(payload: &str, session: &mut Session, ctx: &RequestContext<'_>) -> Result<Reply> {
    let mut entries = Vec::new();

    for file in file_refs(payload)? {
        let digest = ctx
            .received
            .get(&file.name)
            .ok_or_else(|| SyncError::FileNotFound(format!("{} was not attached", file.name)))?;
        let stored = stored_name(&file.id, &file.name, ctx.files.unique_ids);
        let dest = compute_real_path(ctx.files, &file.id, &file.name);

        let unchanged = match hash_file(&dest).await {
            Ok(existing) => existing == *digest,
            Err(e) if is_not_found(&e) => false,
            Err(e) => return Err(e),
        };
        if unchanged {
            debug!(connection = ctx.connection, file = %stored, "Content unchanged, not rewriting");
        } else {
            persist(&ctx.received_dir.join(&file.name), &dest, &stored).await?;
            info!(connection = ctx.connection, file = %stored, sha256 = %digest, "Stored file");
        }

        session.file_hashes.insert(stored.clone(), digest.clone());
        entries.push(FileHash {
            id: file.id,
            name: file.name,
            stored,
            sha256: digest.clone(),
        });
    }

    hash_list(entries)
}

async fn files_hash(payload: &str, session: &mut Session, ctx: &RequestContext<'_>) -> Result<Reply> {
    let mut entries = Vec::new();

    for file in file_refs(payload)? {
        let stored = stored_name(&file.id, &file.name, ctx.files.unique_ids);
        let digest = match hash_file(&compute_real_path(ctx.files, &file.id, &file.name)).await {
            Ok(digest) => digest,
            Err(e) if is_not_found(&e) => {
                session.file_hashes.remove(&stored);
                continue;
            }
            Err(e) => return Err(e),
        };

        session.file_hashes.insert(stored.clone(), digest.clone());
        entries.push(FileHash {
            id: file.id,
            name: file.name,
            stored,
            sha256: digest,
        });
    }

    hash_list(entries)
}

async fn files_delete(payload: &str, session: &mut Session, ctx: &RequestContext<'_>) -> Result<Reply> {
    let mut deleted = Vec::new();

    for file in file_refs(payload)? {
        let stored = stored_name(&file.id, &file.name, ctx.files.unique_ids);
        session.file_hashes.remove(&stored);
        match fs::remove_file(compute_real_path(ctx.files, &file.id, &file.name)).await {
            Ok(()) => deleted.push(stored),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    info!(connection = ctx.connection, count = deleted.len(), "Deleted files");
    Ok(Reply::text(serde_json::json!({ "deleted": deleted }).to_string()))
}

async fn files_rename(payload: &str, session: &mut Session, ctx: &RequestContext<'_>) -> Result<Reply> {
    let doc: Value = serde_json::from_str(payload)?;
    let side = |key: &str| -> Result<Vec<FileRef>> {
        let value = doc
            .get(key)
            .ok_or_else(|| SyncError::InvalidGraph(format!("FILES_RENAME payload needs \"{}\"", key)))?;
        file_refs_from_value(value)
    };
    let from = side("from")?;
    let to = side("to")?;
    if from.len() != to.len() {
        return Err(SyncError::InvalidGraph(format!(
            "{} rename sources but {} targets",
            from.len(),
            to.len()
        )));
    }

    for (src, dst) in from.iter().zip(&to) {
        let src_stored = stored_name(&src.id, &src.name, ctx.files.unique_ids);
        let dst_stored = stored_name(&dst.id, &dst.name, ctx.files.unique_ids);
        match fs::rename(
            ctx.files.base_dir.join(&src_stored),
            ctx.files.base_dir.join(&dst_stored),
        )
        .await
        {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(SyncError::FileNotFound(src_stored));
            }
            Err(e) => return Err(e.into()),
        }

        if let Some(digest) = session.file_hashes.remove(&src_stored) {
            session.file_hashes.insert(dst_stored.clone(), digest);
        }
        info!(connection = ctx.connection, from = %src_stored, to = %dst_stored, "Renamed file");
    }

    Ok(Reply::ok())
}

/// Stage private copies of the requested files; the persisted originals are
/// never streamed directly.
async fn files_fetch(payload: &str, session: &mut Session, ctx: &RequestContext<'_>) -> Result<Reply> {
    let staging = ctx.scratch.join("fetch");
    fs::create_dir_all(&staging).await?;

    let mut seen = HashSet::new();
    let wanted: Vec<(FileRef, String)> = file_refs(payload)?
        .into_iter()
        .filter_map(|file| {
            let stored = stored_name(&file.id, &file.name, ctx.files.unique_ids);
            seen.insert(stored.clone()).then_some((file, stored))
        })
        .collect();
    if wanted.len() > MAX_REPLY_FILES {
        return Err(SyncError::InvalidHeader(format!(
            "{} files requested, at most {} fit in one response",
            wanted.len(),
            MAX_REPLY_FILES
        )));
    }

    let mut entries = Vec::new();
    let mut files = Vec::new();

    for (file, stored) in wanted {
        let staged = staging.join(&stored);
        match fs::copy(ctx.files.base_dir.join(&stored), &staged).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(SyncError::FileNotFound(stored));
            }
            Err(e) => return Err(e.into()),
        }
        let digest = hash_file(&staged).await?;

        session.file_hashes.insert(stored.clone(), digest.clone());
        entries.push(FileHash {
            id: file.id,
            name: file.name,
            stored,
            sha256: digest,
        });
        files.push(staged);
    }

    let mut reply = hash_list(entries)?;
    reply.files = files;
    Ok(reply)
}
