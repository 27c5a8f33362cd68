//! WebSocket server
//!
//! One task per connection. Each task owns its session for the lifetime of
//! the connection and processes requests strictly in order:
//!
//! 1. Header frame (version checked first)
//! 2. `num_blocks` message blocks, joined into the payload
//! 3. `num_files` attached files, written under a per-request scratch directory
//! 4. Dispatch, then one response (header, blocks, files)
//!
//! A failing request produces an `ERROR:` response and the connection stays
//! open. Only a transport failure or a close from the peer ends the loop.

pub mod command;
mod handlers;

pub use command::Command;
pub use handlers::{INVALID_COMMAND, MAX_REPLY_FILES};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::config::{FilesConfig, ServerConfig};
use crate::error::{Result, SyncError};
use crate::graph::StoreFactory;
use crate::protocol::{join_message, split_message, RequestHeader, ResponseHeader};
use crate::session::{Session, SessionRegistry};
use crate::transfer::{receive_files, write_files};
use crate::transport::split_websocket;
use crate::BLOCK_SIZE;

use handlers::{Reply, RequestContext};

/// Requests slower than this are logged at warn level.
const SLOW_REQUEST_THRESHOLD_MS: u64 = 1000;

/// State shared by every connection task.
pub(crate) struct Shared {
    files: FilesConfig,
    factory: Arc<dyn StoreFactory>,
    registry: Arc<SessionRegistry>,
}

impl Shared {
    pub(crate) fn new(files: FilesConfig, factory: Arc<dyn StoreFactory>) -> Self {
        Self {
            files,
            factory,
            registry: Arc::new(SessionRegistry::new()),
        }
    }
}

pub struct Server {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl Server {
    /// Bind the listening socket and prepare the files directory.
    pub async fn bind(config: ServerConfig, factory: Arc<dyn StoreFactory>) -> Result<Self> {
        tokio::fs::create_dir_all(&config.files.base_dir).await?;
        let listener = TcpListener::bind(config.bind_addr).await?;
        info!(
            addr = %listener.local_addr()?,
            files = %config.files.base_dir.display(),
            unique_ids = config.files.unique_ids,
            "Listening"
        );
        Ok(Self {
            listener,
            shared: Arc::new(Shared::new(config.files, factory)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Live sessions, one per open connection.
    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.shared.registry)
    }

    /// Accept connections until the task is dropped.
    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                handle_connection(shared, stream, peer).await;
            });
        }
    }
}

async fn handle_connection(shared: Arc<Shared>, stream: TcpStream, peer: SocketAddr) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };
    debug!(%peer, "WebSocket handshake complete");

    let (sink, frames) = split_websocket(ws);
    serve_connection(&shared, sink, frames).await;
}

/// Run one connection's request loop, then tear its session down.
pub(crate) async fn serve_connection<K, S>(shared: &Shared, mut sink: K, mut frames: S)
where
    K: Sink<Vec<u8>, Error = SyncError> + Unpin,
    S: Stream<Item = Result<Vec<u8>>> + Unpin,
{
    let (id, handle) = shared.registry.open();
    info!(connection = id, "Client connected");

    loop {
        let frame = match frames.next().await {
            Some(Ok(frame)) => frame,
            None => {
                info!(connection = id, "Client disconnected");
                break;
            }
            Some(Err(e)) => {
                warn!(connection = id, error = %e, "Read error");
                break;
            }
        };

        let scratch = match tempfile::Builder::new().prefix("graphsync-").tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                error!(connection = id, error = %e, "Cannot create scratch directory");
                break;
            }
        };

        let start = Instant::now();
        let mut session = handle.lock().await;
        let reply = match process_request(shared, &mut session, frame, &mut frames, scratch.path()).await {
            Ok(reply) => reply,
            Err(e) if e.is_disconnect() => {
                info!(connection = id, error = %e, "Client disconnected mid-request");
                break;
            }
            Err(e) => {
                warn!(connection = id, kind = e.kind(), error = %e, "Request failed");
                Reply::error(&e)
            }
        };
        drop(session);

        if let Err(e) = write_reply(&mut sink, &reply).await {
            if e.is_disconnect() {
                info!(connection = id, error = %e, "Client disconnected before the response was written");
            } else {
                warn!(connection = id, error = %e, "Write error");
            }
            break;
        }

        let elapsed_ms = start.elapsed().as_millis() as u64;
        if elapsed_ms >= SLOW_REQUEST_THRESHOLD_MS {
            warn!(connection = id, elapsed_ms, "Slow request");
        }
        // scratch dropped here, after its files were streamed
    }

    // Cleanup: discard uncommitted changes, then forget the session
    let store = handle.lock().await.take_store().ok();
    if let Some(store) = store {
        match handlers::blocking(move || store.close(false)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) | Err(e) => warn!(connection = id, error = %e, "Failed to close store"),
        }
    }
    shared.registry.remove(id);
    shared.factory.disconnected(id);
}

async fn process_request<S>(
    shared: &Shared,
    session: &mut Session,
    frame: Vec<u8>,
    frames: &mut S,
    scratch: &Path,
) -> Result<Reply>
where
    S: Stream<Item = Result<Vec<u8>>> + Unpin,
{
    let header = RequestHeader::decode(&frame)?;
    let payload = join_message(&mut *frames, header.num_blocks).await?;

    // Attachments get their own directory so staging names cannot clash
    let received_dir = scratch.join("received");
    let mut received = HashMap::new();
    if header.num_files > 0 {
        tokio::fs::create_dir_all(&received_dir).await?;
        receive_files(header.num_files, &mut *frames, &received_dir, &mut received).await?;
    }

    let Some(command) = Command::parse(&header.command) else {
        debug!(connection = session.id, command = %header.command, "Unknown command");
        return Ok(Reply::text(INVALID_COMMAND));
    };
    debug!(
        connection = session.id,
        %command,
        payload_bytes = payload.len(),
        files = received.len(),
        "Request"
    );

    let ctx = RequestContext {
        connection: session.id,
        scratch,
        received_dir: &received_dir,
        received,
        files: &shared.files,
        factory: &shared.factory,
    };
    let reply = handlers::dispatch(command, &payload, session, &ctx).await?;
    reply.check_fits()?;
    Ok(reply)
}

/// Header, message blocks, then files; flushed once at the end.
async fn write_reply<K>(sink: &mut K, reply: &Reply) -> Result<()>
where
    K: Sink<Vec<u8>, Error = SyncError> + Unpin,
{
    let (num_blocks, blocks) = split_message(&reply.text, BLOCK_SIZE);
    let header = ResponseHeader {
        num_blocks,
        num_files: reply.files.len() as u64,
    };
    sink.feed(header.encode()?).await?;
    for block in blocks {
        sink.feed(block).await?;
    }
    write_files(sink, reply.files.clone()).await?;
    sink.flush().await
}
