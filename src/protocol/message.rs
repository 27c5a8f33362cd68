//! Splitting text payloads into blocks and joining them back

use futures_util::{Stream, StreamExt};

use crate::error::{Result, SyncError};

/// Number of blocks needed for `len` bytes.
pub fn block_count(len: u64, block_size: usize) -> u64 {
    len.div_ceil(block_size as u64)
}

/// Chunk the UTF-8 bytes of `text` left to right. The last block may be short;
/// empty text yields no blocks.
///
/// # Panics
/// If `block_size` is zero.
pub fn split_message(text: &str, block_size: usize) -> (u64, Vec<Vec<u8>>) {
    let blocks: Vec<Vec<u8>> = text
        .as_bytes()
        .chunks(block_size)
        .map(<[u8]>::to_vec)
        .collect();
    (blocks.len() as u64, blocks)
}

/// Read exactly `num_blocks` frames from `source` and decode them as one string.
///
/// Reading exactly that many keeps the stream aligned for the file headers
/// that may follow. A stream that ends early is `ConnectionClosed`.
pub async fn join_message<S>(source: &mut S, num_blocks: u64) -> Result<String>
where
    S: Stream<Item = Result<Vec<u8>>> + Unpin,
{
    let mut bytes = Vec::new();
    for _ in 0..num_blocks {
        let block = source.next().await.ok_or(SyncError::ConnectionClosed)??;
        bytes.extend_from_slice(&block);
    }
    Ok(String::from_utf8(bytes)?)
}
