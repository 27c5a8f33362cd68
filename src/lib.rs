//! graphsync - remote session protocol for triple stores
//!
//! Exposes an in-process triple store to remote callers over one WebSocket
//! connection per client. Each connection gets its own session (store handle
//! plus file-hash bookkeeping); requests on a connection are processed
//! strictly one at a time.
//!
//! Protocol (every item is one WebSocket frame):
//!   Request:  [version: 2][num_blocks: 5][num_files: 2][command UTF-8]
//!             message blocks (4096 bytes each)
//!             per file: [num_blocks: 5][file name UTF-8] + data blocks
//!   Response: [version: 2][num_blocks: 5][num_files: 2]
//!             message blocks, then files as above
//!
//! All header integers are big-endian and unsigned.

pub mod client;
pub mod config;
pub mod error;
pub mod graph;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transfer;
pub mod transport;

pub use client::{Client, LocalFile, ReceivedFile, Response};
pub use config::{FilesConfig, ServerConfig};
pub use error::{Result, SyncError};
pub use graph::{FileStore, FileStoreFactory, StoreFactory, Term, Triple, TriplePattern, TripleStore};
pub use server::{Command, Server};
pub use session::{ConnectionId, Session, SessionRegistry};
pub use transfer::{FileHash, FileRef};

/// Wire protocol version. Anything else is rejected on decode.
pub const PROTOCOL_VERSION: u64 = 1;

/// Size of one message or file block in bytes.
pub const BLOCK_SIZE: usize = 4096;
