//! Chunked file transfer with SHA-256 fingerprints
//!
//! A file travels as one file header frame (`num_blocks`, base name)
//! followed by `num_blocks` data frames of up to 4096 bytes. Receivers hash
//! the bytes while writing them, so a file's digest is known the moment its
//! last block lands.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use futures_util::{stream, Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::config::FilesConfig;
use crate::error::{Result, SyncError};
use crate::graph::{Term, Triple};
use crate::protocol::{block_count, FileHeader};
use crate::BLOCK_SIZE;

/// Predicate used for file references built by the client.
pub const HAS_FILE: &str = "urn:graphsync:file";

/// A file owned by a graph subject.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileRef {
    /// Owning subject's identifier
    pub id: String,
    /// Base name, no directory components
    pub name: String,
}

impl FileRef {
    pub fn new(id: impl Into<String>, name: &str) -> Result<Self> {
        Ok(Self {
            id: id.into(),
            name: base_name(name)?,
        })
    }

    /// Subject owns the file named by the object's value.
    pub fn from_triple(triple: &Triple) -> Result<Self> {
        Self::new(triple.subject.clone(), triple.object.value())
    }

    pub fn to_triple(&self) -> Triple {
        Triple::new(self.id.clone(), HAS_FILE, Term::literal(self.name.clone()))
    }
}

/// One entry of a hash list response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHash {
    pub id: String,
    pub name: String,
    /// File name on the server (prefixed in unique-id mode)
    pub stored: String,
    pub sha256: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileHashList {
    pub files: Vec<FileHash>,
}

/// Strip directory components (either separator) and reject names that
/// would escape the destination directory.
pub fn base_name(name: &str) -> Result<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    if base.is_empty() || base == "." || base == ".." {
        return Err(SyncError::InvalidFileName(name.to_string()));
    }
    Ok(base.to_string())
}

/// File name used on disk for `base_name` owned by `identifier`.
///
/// In unique-id mode the name is prefixed with `(identifier)`. Characters
/// that are unsafe in a single path component, the parentheses and `%`
/// itself are percent-encoded, so distinct identifiers never share a prefix.
pub fn stored_name(identifier: &str, base_name: &str, unique_ids: bool) -> String {
    if !unique_ids {
        return base_name.to_string();
    }
    format!("({}){}", escape_identifier(identifier), base_name)
}

fn escape_identifier(identifier: &str) -> String {
    let mut escaped = String::with_capacity(identifier.len());
    for c in identifier.chars() {
        match c {
            '%' | ':' | '/' | '\\' | '(' | ')' | '*' | '?' | '"' | '<' | '>' | '|' => {
                escaped.push_str(&format!("%{:02X}", c as u32));
            }
            c if c.is_control() => escaped.push_str(&format!("%{:02X}", c as u32)),
            other => escaped.push(other),
        }
    }
    escaped
}

pub fn compute_real_path(files: &FilesConfig, identifier: &str, base_name: &str) -> PathBuf {
    files
        .base_dir
        .join(stored_name(identifier, base_name, files.unique_ids))
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Stream a file from disk through SHA-256.
pub async fn hash_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

enum SendState {
    NextFile(VecDeque<PathBuf>),
    Blocks {
        file: File,
        remaining: u64,
        rest: VecDeque<PathBuf>,
    },
}

async fn next_send(state: SendState) -> Result<Option<(Vec<u8>, SendState)>> {
    match state {
        SendState::NextFile(mut rest) => {
            let Some(path) = rest.pop_front() else {
                return Ok(None);
            };
            let name = base_name(&path.to_string_lossy())?;
            let file = File::open(&path).await?;
            let size = file.metadata().await?.len();
            let num_blocks = block_count(size, BLOCK_SIZE);
            debug!(file = %name, bytes = size, blocks = num_blocks, "Sending file");

            let header = FileHeader { num_blocks, name }.encode()?;
            let next = if size == 0 {
                SendState::NextFile(rest)
            } else {
                SendState::Blocks {
                    file,
                    remaining: size,
                    rest,
                }
            };
            Ok(Some((header, next)))
        }
        SendState::Blocks {
            mut file,
            remaining,
            rest,
        } => {
            let len = remaining.min(BLOCK_SIZE as u64);
            let mut block = vec![0u8; len as usize];
            file.read_exact(&mut block).await?;
            let remaining = remaining - len;
            let next = if remaining == 0 {
                SendState::NextFile(rest)
            } else {
                SendState::Blocks {
                    file,
                    remaining,
                    rest,
                }
            };
            Ok(Some((block, next)))
        }
    }
}

/// Frames for `paths`, in order: per file a header frame, then its blocks.
///
/// Lazy: each file is opened when its header is due and read one block at a
/// time. A zero-byte file yields only its header (`num_blocks = 0`).
pub fn send_files(paths: Vec<PathBuf>) -> impl Stream<Item = Result<Vec<u8>>> + Send {
    stream::try_unfold(SendState::NextFile(paths.into()), next_send)
}

/// Write the frames of [`send_files`] to `sink` without flushing.
pub async fn write_files<K>(sink: &mut K, paths: Vec<PathBuf>) -> Result<()>
where
    K: Sink<Vec<u8>, Error = SyncError> + Unpin,
{
    let frames = send_files(paths);
    futures_util::pin_mut!(frames);
    while let Some(frame) = frames.next().await {
        sink.feed(frame?).await?;
    }
    Ok(())
}

async fn next_frame<S>(source: &mut S) -> Result<Vec<u8>>
where
    S: Stream<Item = Result<Vec<u8>>> + Unpin,
{
    source.next().await.ok_or(SyncError::ConnectionClosed)?
}

async fn drain_blocks<S>(source: &mut S, num_blocks: u64) -> Result<()>
where
    S: Stream<Item = Result<Vec<u8>>> + Unpin,
{
    for _ in 0..num_blocks {
        next_frame(source).await?;
    }
    Ok(())
}

/// Receive one file's blocks into `path`, returning the hex digest.
async fn receive_into<S>(source: &mut S, num_blocks: u64, path: &Path) -> Result<String>
where
    S: Stream<Item = Result<Vec<u8>>> + Unpin,
{
    let mut file = match File::create(path).await {
        Ok(file) => file,
        Err(e) => {
            drain_blocks(source, num_blocks).await?;
            return Err(e.into());
        }
    };

    let mut hasher = Sha256::new();
    for index in 0..num_blocks {
        let block = next_frame(source).await?;
        hasher.update(&block);
        if let Err(e) = file.write_all(&block).await {
            drain_blocks(source, num_blocks - index - 1).await?;
            return Err(e.into());
        }
    }
    file.flush().await?;
    Ok(hex::encode(hasher.finalize()))
}

/// Receive `num_files` files into `dest_dir`.
///
/// Directory components of announced names are stripped. Each file's digest
/// is stored in `hashes` under its base name. A file with a bad or repeated
/// name, or one that cannot be written, still has its blocks consumed so the
/// stream stays aligned; the first such error is returned once every
/// announced file has been read.
pub async fn receive_files<S>(
    num_files: u64,
    source: &mut S,
    dest_dir: &Path,
    hashes: &mut HashMap<String, String>,
) -> Result<Vec<PathBuf>>
where
    S: Stream<Item = Result<Vec<u8>>> + Unpin,
{
    let mut written = Vec::new();
    let mut seen = HashSet::new();
    let mut failure: Option<SyncError> = None;

    for _ in 0..num_files {
        let header = FileHeader::decode(&next_frame(source).await?)?;

        let name = match base_name(&header.name) {
            Ok(name) if seen.insert(name.clone()) => name,
            Ok(name) => {
                drain_blocks(source, header.num_blocks).await?;
                failure.get_or_insert(SyncError::DuplicateFile(name));
                continue;
            }
            Err(e) => {
                drain_blocks(source, header.num_blocks).await?;
                failure.get_or_insert(e);
                continue;
            }
        };

        let path = dest_dir.join(&name);
        match receive_into(source, header.num_blocks, &path).await {
            Ok(digest) => {
                debug!(file = %name, blocks = header.num_blocks, sha256 = %digest, "Received file");
                hashes.insert(name, digest);
                written.push(path);
            }
            Err(e) if e.is_disconnect() => return Err(e),
            Err(e) => {
                failure.get_or_insert(e);
            }
        }
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(written),
    }
}
