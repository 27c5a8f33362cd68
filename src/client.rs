//! Client engine
//!
//! One request in flight per client: `send` writes the request frames, then
//! reads the complete response (text plus every attached file) before it
//! returns. The connection is opened on first use and reused until `close`.
//! Any failure mid-request drops the connection, since the frame stream is no
//! longer aligned; the next call connects again.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use futures_util::{SinkExt, StreamExt};
use tempfile::TempDir;
use tokio::fs;
use tracing::{debug, info};

use crate::error::{Result, SyncError};
use crate::graph::{jsonld, Triple, TriplePattern};
use crate::protocol::{join_message, split_message, RequestHeader, ResponseHeader};
use crate::server::Command;
use crate::transfer::{base_name, hash_file, receive_files, write_files, FileHash, FileHashList, FileRef};
use crate::transport::{split_websocket, FrameSink, FrameStream};
use crate::BLOCK_SIZE;

/// A file received with a response, living in the call's temp directory.
#[derive(Debug, Clone)]
pub struct ReceivedFile {
    pub name: String,
    pub path: PathBuf,
    pub sha256: String,
}

/// Everything a server sent back for one request.
#[derive(Debug, Clone)]
pub struct Response {
    pub text: String,
    pub files: Vec<ReceivedFile>,
}

impl Response {
    pub fn is_error(&self) -> bool {
        self.text.starts_with("ERROR:")
    }

    /// The text, or `Remote` if the server reported an error.
    pub fn into_text(self) -> Result<String> {
        if self.is_error() {
            return Err(SyncError::Remote(self.text));
        }
        Ok(self.text)
    }
}

/// A local file to upload, owned by graph subject `id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub id: String,
    pub path: PathBuf,
}

impl LocalFile {
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
        }
    }

    pub fn file_ref(&self) -> Result<FileRef> {
        FileRef::new(self.id.clone(), &self.path.to_string_lossy())
    }
}

struct Connection {
    sink: FrameSink,
    frames: FrameStream,
}

pub struct Client {
    url: String,
    connection: Option<Connection>,
}

impl Client {
    /// No I/O happens until the first request.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connection: None,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    async fn connection(&mut self) -> Result<&mut Connection> {
        if self.connection.is_none() {
            let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str()).await?;
            let (sink, frames) = split_websocket(ws);
            info!(url = %self.url, "Connected");
            self.connection = Some(Connection { sink, frames });
        }
        self.connection.as_mut().ok_or(SyncError::ConnectionClosed)
    }

    /// Send one command and return the response text.
    ///
    /// Response files, if any, are discarded with the call's temp directory.
    pub async fn send(&mut self, command: &str, payload: &str, files: &[PathBuf]) -> Result<String> {
        self.send_with(command, payload, files, |response| response.text).await
    }

    /// Send one command and hand the full response to `handler`.
    ///
    /// Files in the response live in a temp directory that is removed once
    /// `handler` returns; copy out anything worth keeping.
    pub async fn send_with<T, F>(
        &mut self,
        command: &str,
        payload: &str,
        files: &[PathBuf],
        handler: F,
    ) -> Result<T>
    where
        F: FnOnce(Response) -> T,
    {
        let scratch = scratch_dir()?;
        let response = self.request(command, payload, files, scratch.path()).await?;
        Ok(handler(response))
    }

    /// Validate attachments, then run one round trip. Drops the connection
    /// if the round trip fails.
    async fn request(
        &mut self,
        command: &str,
        payload: &str,
        files: &[PathBuf],
        scratch: &Path,
    ) -> Result<Response> {
        check_attachments(files).await?;
        match self.round_trip(command, payload, files, scratch).await {
            Ok(response) => Ok(response),
            Err(e) => {
                debug!(command, error = %e, "Request failed, dropping connection");
                self.connection = None;
                Err(e)
            }
        }
    }

    async fn round_trip(
        &mut self,
        command: &str,
        payload: &str,
        files: &[PathBuf],
        scratch: &Path,
    ) -> Result<Response> {
        let (num_blocks, blocks) = split_message(payload, BLOCK_SIZE);
        let header = RequestHeader {
            num_blocks,
            num_files: files.len() as u64,
            command: command.to_string(),
        }
        .encode()?;

        let conn = self.connection().await?;
        conn.sink.feed(header).await?;
        for block in blocks {
            conn.sink.feed(block).await?;
        }
        write_files(&mut conn.sink, files.to_vec()).await?;
        conn.sink.flush().await?;

        let frame = conn.frames.next().await.ok_or(SyncError::ConnectionClosed)??;
        let header = ResponseHeader::decode(&frame)?;
        let text = join_message(&mut conn.frames, header.num_blocks).await?;

        let mut hashes = HashMap::new();
        let paths = receive_files(header.num_files, &mut conn.frames, scratch, &mut hashes).await?;
        let files = paths
            .into_iter()
            .map(|path| {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let sha256 = hashes.remove(&name).unwrap_or_default();
                ReceivedFile { name, path, sha256 }
            })
            .collect();

        debug!(command, response_bytes = text.len(), "Response received");
        Ok(Response { text, files })
    }

    /// Close the connection if one is open.
    pub async fn close(&mut self) -> Result<()> {
        let Some(mut conn) = self.connection.take() else {
            return Ok(());
        };
        match conn.sink.close().await {
            Err(e) if !e.is_disconnect() => Err(e),
            _ => {
                info!(url = %self.url, "Disconnected");
                Ok(())
            }
        }
    }

    // ========================================================================
    // Typed helpers
    // ========================================================================

    async fn command(&mut self, command: Command, payload: &str) -> Result<String> {
        self.send_with(command.as_str(), payload, &[], Response::into_text)
            .await?
    }

    async fn expect_ok(&mut self, command: Command, payload: &str) -> Result<()> {
        self.command(command, payload).await.map(drop)
    }

    /// Open (or switch) the store for this connection.
    pub async fn login(&mut self, login: &str) -> Result<()> {
        self.expect_ok(Command::Login, login).await
    }

    pub async fn add(&mut self, triples: &[Triple]) -> Result<()> {
        self.expect_ok(Command::Add, &jsonld::to_string(triples)).await
    }

    /// Stage removal of every statement matching any of `patterns`.
    pub async fn remove(&mut self, patterns: &[TriplePattern]) -> Result<()> {
        self.expect_ok(Command::Remove, &jsonld::patterns_to_string(patterns))
            .await
    }

    pub async fn triples(&mut self, patterns: &[TriplePattern]) -> Result<Vec<Triple>> {
        let text = self
            .command(Command::Triples, &jsonld::patterns_to_string(patterns))
            .await?;
        jsonld::parse_triples(&text)
    }

    pub async fn commit(&mut self) -> Result<()> {
        self.expect_ok(Command::Commit, "").await
    }

    pub async fn rollback(&mut self) -> Result<()> {
        self.expect_ok(Command::Rollback, "").await
    }

    pub async fn run(&mut self) -> Result<()> {
        self.expect_ok(Command::Run, "").await
    }

    /// Server-side digests of `refs`; files missing on the server are left out.
    pub async fn files_hash(&mut self, refs: &[FileRef]) -> Result<Vec<FileHash>> {
        let text = self.command(Command::FilesHash, &refs_payload(refs)).await?;
        hash_list(&text)
    }

    /// Upload `files` and return the server's digests for them.
    pub async fn files_update(&mut self, files: &[LocalFile]) -> Result<Vec<FileHash>> {
        let refs = files.iter().map(LocalFile::file_ref).collect::<Result<Vec<_>>>()?;
        let paths: Vec<PathBuf> = files.iter().map(|f| f.path.clone()).collect();
        let text = self
            .send_with(Command::FilesUpdate.as_str(), &refs_payload(&refs), &paths, Response::into_text)
            .await??;
        hash_list(&text)
    }

    /// Delete files on the server; returns the stored names actually removed.
    pub async fn files_delete(&mut self, refs: &[FileRef]) -> Result<Vec<String>> {
        #[derive(serde::Deserialize)]
        struct Deleted {
            deleted: Vec<String>,
        }

        let text = self.command(Command::FilesDelete, &refs_payload(refs)).await?;
        Ok(serde_json::from_str::<Deleted>(&text)?.deleted)
    }

    /// Rename `from[i]` to `to[i]` on the server.
    pub async fn files_rename(&mut self, from: &[FileRef], to: &[FileRef]) -> Result<()> {
        let payload = serde_json::json!({
            "from": jsonld::to_value(&ref_triples(from)),
            "to": jsonld::to_value(&ref_triples(to)),
        });
        self.expect_ok(Command::FilesRename, &payload.to_string()).await
    }

    /// Download `refs` into `dest_dir`, returning the written paths.
    ///
    /// Files arrive under their stored names.
    pub async fn files_fetch(&mut self, refs: &[FileRef], dest_dir: &Path) -> Result<Vec<PathBuf>> {
        let scratch = scratch_dir()?;
        let response = self
            .request(Command::FilesFetch.as_str(), &refs_payload(refs), &[], scratch.path())
            .await?;
        if response.is_error() {
            return Err(SyncError::Remote(response.text));
        }

        fs::create_dir_all(dest_dir).await?;
        let mut written = Vec::with_capacity(response.files.len());
        for file in &response.files {
            let dest = dest_dir.join(&file.name);
            fs::copy(&file.path, &dest).await?;
            written.push(dest);
        }
        info!(count = written.len(), dest = %dest_dir.display(), "Fetched files");
        Ok(written)
    }

    /// Upload only the files whose content differs from the server's copy.
    ///
    /// Returns the server's digests for the uploaded files.
    pub async fn sync_files(&mut self, files: &[LocalFile]) -> Result<Vec<FileHash>> {
        let refs = files.iter().map(LocalFile::file_ref).collect::<Result<Vec<_>>>()?;
        let remote: HashMap<(String, String), String> = self
            .files_hash(&refs)
            .await?
            .into_iter()
            .map(|h| ((h.id, h.name), h.sha256))
            .collect();

        let mut changed = Vec::new();
        for (file, file_ref) in files.iter().zip(refs) {
            let local = hash_file(&file.path).await?;
            if remote.get(&(file_ref.id, file_ref.name)) != Some(&local) {
                changed.push(file.clone());
            }
        }

        debug!(total = files.len(), changed = changed.len(), "Synchronizing files");
        if changed.is_empty() {
            return Ok(Vec::new());
        }
        self.files_update(&changed).await
    }
}

fn scratch_dir() -> Result<TempDir> {
    Ok(tempfile::Builder::new().prefix("graphsync-client-").tempdir()?)
}

/// Reject attachments before anything is written, so a bad path never
/// leaves a half-sent request on the wire.
async fn check_attachments(files: &[PathBuf]) -> Result<()> {
    let mut seen = HashSet::new();
    for path in files {
        let name = base_name(&path.to_string_lossy())?;
        if !seen.insert(name.clone()) {
            return Err(SyncError::DuplicateFile(name));
        }
        if !fs::metadata(path).await?.is_file() {
            return Err(SyncError::FileNotFound(path.display().to_string()));
        }
    }
    Ok(())
}

fn ref_triples(refs: &[FileRef]) -> Vec<Triple> {
    refs.iter().map(FileRef::to_triple).collect()
}

fn refs_payload(refs: &[FileRef]) -> String {
    jsonld::to_string(&ref_triples(refs))
}

fn hash_list(text: &str) -> Result<Vec<FileHash>> {
    Ok(serde_json::from_str::<FileHashList>(text)?.files)
}
