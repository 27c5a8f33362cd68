//! Error types for the sync protocol

use thiserror::Error;
use tokio_tungstenite::tungstenite;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Error, Debug)]
pub enum SyncError {
    // Framing errors
    #[error("header needs {expected} bytes, got {actual}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u64),

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("invalid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    // Transport
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("connection closed")]
    ConnectionClosed,

    // Payloads and sessions
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid graph payload: {0}")]
    InvalidGraph(String),

    #[error("invalid login: {0}")]
    InvalidLogin(String),

    #[error("no store opened for this connection, send LOGIN first")]
    NoSession,

    #[error("store error: {0}")]
    Store(String),

    // Files
    #[error("invalid file name: {0:?}")]
    InvalidFileName(String),

    #[error("file {0:?} sent twice in one request")]
    DuplicateFile(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    // Client side
    #[error("server replied: {0}")]
    Remote(String),
}

impl SyncError {
    /// Error kind carried on the wire as `ERROR: <kind>: <message>`.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::LengthMismatch { .. } => "LengthMismatch",
            SyncError::UnsupportedVersion(_) => "UnsupportedVersion",
            SyncError::InvalidHeader(_) => "InvalidHeader",
            SyncError::Utf8(_) => "Utf8Error",
            SyncError::Io(_) => "IoError",
            SyncError::WebSocket(_) => "TransportError",
            SyncError::ConnectionClosed => "ConnectionClosed",
            SyncError::Json(_) => "JsonError",
            SyncError::InvalidGraph(_) => "InvalidGraph",
            SyncError::InvalidLogin(_) => "InvalidLogin",
            SyncError::NoSession => "NoSession",
            SyncError::Store(_) => "StoreError",
            SyncError::InvalidFileName(_) => "InvalidFileName",
            SyncError::DuplicateFile(_) => "DuplicateFile",
            SyncError::FileNotFound(_) => "FileNotFound",
            SyncError::Remote(_) => "RemoteError",
        }
    }

    /// True for failures that end the connection instead of producing an
    /// error response: the frame stream can no longer be read or written.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, SyncError::ConnectionClosed | SyncError::WebSocket(_))
    }

    /// Wire text for an error response.
    pub fn to_wire(&self) -> String {
        format!("ERROR: {}: {}", self.kind(), self)
    }
}
