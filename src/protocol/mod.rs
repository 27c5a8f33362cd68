//! Framing codec
//!
//! Pure functions: fixed-width big-endian headers and fixed-size message
//! blocks. One encoded header or block is exactly one transport frame.

pub mod header;
pub mod message;

pub use header::{
    decode_header, encode_header, DecodedHeader, FileHeader, HeaderValue, RequestHeader,
    ResponseHeader, FILE_FIELDS, REQUEST_FIELDS, RESPONSE_FIELDS,
};
pub use message::{block_count, join_message, split_message};
