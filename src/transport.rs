//! WebSocket transport adapter
//!
//! Turns a WebSocket into a sink and a stream of raw frames. Every binary (or
//! text) WebSocket message carries exactly one protocol frame.

use std::future::ready;
use std::pin::Pin;

use futures_util::sink::Sink;
use futures_util::stream::BoxStream;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

use crate::error::{Result, SyncError};

/// Outgoing frames.
pub type FrameSink = Pin<Box<dyn Sink<Vec<u8>, Error = SyncError> + Send>>;

/// Incoming frames. Ends cleanly when the peer closes or drops the connection.
pub type FrameStream = BoxStream<'static, Result<Vec<u8>>>;

/// Errors that mean "the peer went away" rather than "something broke".
fn is_peer_gone(err: &tungstenite::Error) -> bool {
    use tungstenite::error::ProtocolError;

    match err {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => true,
        tungstenite::Error::Protocol(ProtocolError::ResetWithoutClosingHandshake) => true,
        tungstenite::Error::Io(io) => matches!(
            io.kind(),
            std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof
        ),
        _ => false,
    }
}

pub fn split_websocket<S>(ws: WebSocketStream<S>) -> (FrameSink, FrameStream)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();

    let sink = sink.with(|frame: Vec<u8>| ready(Ok::<_, SyncError>(Message::Binary(frame))));

    let frames = stream
        .take_while(|msg| {
            ready(match msg {
                Ok(Message::Close(_)) => false,
                Err(err) => !is_peer_gone(err),
                _ => true,
            })
        })
        .filter_map(|msg| {
            ready(match msg {
                Ok(Message::Binary(frame)) => Some(Ok(frame)),
                Ok(Message::Text(text)) => Some(Ok(text.into_bytes())),
                // Ping/pong are answered by tungstenite itself.
                Ok(_) => None,
                Err(err) => Some(Err(SyncError::from(err))),
            })
        });

    (Box::pin(sink), frames.boxed())
}
