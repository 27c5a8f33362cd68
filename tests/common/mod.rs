//! Shared helpers: a loopback server on an ephemeral port plus raw frame I/O.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use graphsync::protocol::{join_message, split_message, RequestHeader, ResponseHeader};
use graphsync::transport::{split_websocket, FrameSink, FrameStream};
use graphsync::{FileStoreFactory, Server, ServerConfig, SessionRegistry, StoreFactory, BLOCK_SIZE};
use tempfile::TempDir;
use tokio::task::JoinHandle;

pub struct TestServer {
    pub url: String,
    pub registry: Arc<SessionRegistry>,
    pub dir: TempDir,
    task: JoinHandle<()>,
}

impl TestServer {
    pub fn files_dir(&self) -> std::path::PathBuf {
        self.dir.path().join("files")
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub async fn start_with(dir: TempDir, factory: Arc<dyn StoreFactory>) -> TestServer {
    let mut config = ServerConfig::with_data_dir(dir.path());
    config.bind_addr = "127.0.0.1:0".parse().unwrap();

    let server = Server::bind(config, factory).await.unwrap();
    let url = format!("ws://{}", server.local_addr().unwrap());
    let registry = server.registry();
    let task = tokio::spawn(async move {
        let _ = server.run().await;
    });

    TestServer { url, registry, dir, task }
}

pub async fn start() -> TestServer {
    let dir = TempDir::new().unwrap();
    let factory = FileStoreFactory::new(dir.path()).unwrap();
    start_with(dir, Arc::new(factory)).await
}

/// Poll until `check` holds, failing after two seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

pub async fn raw_connect(url: &str) -> (FrameSink, FrameStream) {
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    split_websocket(ws)
}

/// Header plus message blocks for a request without files.
pub fn request_frames(command: &str, payload: &str, num_files: u64) -> Vec<Vec<u8>> {
    let (num_blocks, blocks) = split_message(payload, BLOCK_SIZE);
    let header = RequestHeader {
        num_blocks,
        num_files,
        command: command.to_string(),
    };
    let mut frames = vec![header.encode().unwrap()];
    frames.extend(blocks);
    frames
}

/// Write `frames`, then read one response that carries no files.
pub async fn exchange(sink: &mut FrameSink, frames: &mut FrameStream, request: Vec<Vec<u8>>) -> String {
    for frame in request {
        sink.feed(frame).await.unwrap();
    }
    sink.flush().await.unwrap();

    let header = ResponseHeader::decode(&frames.next().await.unwrap().unwrap()).unwrap();
    assert_eq!(header.num_files, 0);
    join_message(frames, header.num_blocks).await.unwrap()
}

pub fn write_file(dir: &Path, name: &str, contents: &[u8]) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}
