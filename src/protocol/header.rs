//! Fixed-width binary headers
//!
//! A header is a run of big-endian unsigned integers of known byte widths,
//! optionally followed by a UTF-8 string that fills the rest of the frame.
//! The trailing string has no length prefix: its length is whatever remains.

use crate::error::{Result, SyncError};
use crate::PROTOCOL_VERSION;

/// `[version: 2][num_blocks: 5][num_files: 2]` + command name.
pub const REQUEST_FIELDS: [usize; 3] = [2, 5, 2];

/// `[version: 2][num_blocks: 5][num_files: 2]`, nothing trailing.
pub const RESPONSE_FIELDS: [usize; 3] = [2, 5, 2];

/// `[num_blocks: 5]` + file name.
pub const FILE_FIELDS: [usize; 1] = [5];

/// One value to encode into a header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Int(u64),
    Text(String),
}

impl From<u64> for HeaderValue {
    fn from(value: u64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::Text(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::Text(value)
    }
}

/// Integers read from a header plus the trailing string, if any bytes remained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedHeader {
    pub fields: Vec<u64>,
    pub trailing: Option<String>,
}

fn check_width(width: usize) -> Result<()> {
    if width == 0 || width > 8 {
        return Err(SyncError::InvalidHeader(format!(
            "field width {} outside 1..=8 bytes",
            width
        )));
    }
    Ok(())
}

fn read_uint(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

/// Decode `widths.len()` big-endian integers, then the rest as UTF-8.
///
/// Fails with `LengthMismatch` when `bytes` is shorter than the sum of widths.
pub fn decode_header(bytes: &[u8], widths: &[usize]) -> Result<DecodedHeader> {
    let expected: usize = widths.iter().sum();
    if bytes.len() < expected {
        return Err(SyncError::LengthMismatch {
            expected,
            actual: bytes.len(),
        });
    }

    let mut fields = Vec::with_capacity(widths.len());
    let mut offset = 0;
    for &width in widths {
        check_width(width)?;
        fields.push(read_uint(&bytes[offset..offset + width]));
        offset += width;
    }

    let trailing = if offset < bytes.len() {
        Some(String::from_utf8(bytes[offset..].to_vec())?)
    } else {
        None
    };

    Ok(DecodedHeader { fields, trailing })
}

/// Inverse of [`decode_header`].
///
/// One integer per width is required; a single extra value is allowed and
/// must be text. An empty trailing string encodes to nothing, so it decodes
/// back as `None`.
pub fn encode_header(values: &[HeaderValue], widths: &[usize]) -> Result<Vec<u8>> {
    if values.len() > widths.len() + 1 {
        return Err(SyncError::InvalidHeader(format!(
            "{} values for {} fields",
            values.len(),
            widths.len()
        )));
    }
    if values.len() < widths.len() {
        return Err(SyncError::InvalidHeader(format!(
            "missing values: {} given, {} fields",
            values.len(),
            widths.len()
        )));
    }

    let mut out = Vec::with_capacity(widths.iter().sum::<usize>());
    for (index, (value, &width)) in values.iter().zip(widths).enumerate() {
        check_width(width)?;
        let HeaderValue::Int(n) = value else {
            return Err(SyncError::InvalidHeader(format!(
                "field {} expects an integer",
                index
            )));
        };
        if width < 8 && (*n >> (8 * width)) != 0 {
            return Err(SyncError::InvalidHeader(format!(
                "value {} does not fit in {} bytes",
                n, width
            )));
        }
        out.extend_from_slice(&n.to_be_bytes()[8 - width..]);
    }

    match values.get(widths.len()) {
        Some(HeaderValue::Text(text)) => out.extend_from_slice(text.as_bytes()),
        Some(HeaderValue::Int(_)) => {
            return Err(SyncError::InvalidHeader(
                "trailing value must be a string".to_string(),
            ));
        }
        None => {}
    }

    Ok(out)
}

/// Reject anything but the current version before looking at the rest.
fn check_version(frame: &[u8]) -> Result<()> {
    let width = REQUEST_FIELDS[0];
    if frame.len() < width {
        return Err(SyncError::LengthMismatch {
            expected: width,
            actual: frame.len(),
        });
    }
    let version = read_uint(&frame[..width]);
    if version != PROTOCOL_VERSION {
        return Err(SyncError::UnsupportedVersion(version));
    }
    Ok(())
}

/// First frame of every request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    pub num_blocks: u64,
    pub num_files: u64,
    pub command: String,
}

impl RequestHeader {
    pub fn encode(&self) -> Result<Vec<u8>> {
        encode_header(
            &[
                PROTOCOL_VERSION.into(),
                self.num_blocks.into(),
                self.num_files.into(),
                self.command.as_str().into(),
            ],
            &REQUEST_FIELDS,
        )
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        check_version(frame)?;
        let header = decode_header(frame, &REQUEST_FIELDS)?;
        Ok(Self {
            num_blocks: header.fields[1],
            num_files: header.fields[2],
            command: header.trailing.unwrap_or_default(),
        })
    }
}

/// First frame of every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    pub num_blocks: u64,
    pub num_files: u64,
}

impl ResponseHeader {
    pub fn encode(&self) -> Result<Vec<u8>> {
        encode_header(
            &[
                PROTOCOL_VERSION.into(),
                self.num_blocks.into(),
                self.num_files.into(),
            ],
            &RESPONSE_FIELDS,
        )
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        check_version(frame)?;
        let header = decode_header(frame, &RESPONSE_FIELDS)?;
        if header.trailing.is_some() {
            return Err(SyncError::InvalidHeader(
                "unexpected trailing bytes in response header".to_string(),
            ));
        }
        Ok(Self {
            num_blocks: header.fields[1],
            num_files: header.fields[2],
        })
    }
}

/// Announces one file and the number of data blocks that follow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub num_blocks: u64,
    pub name: String,
}

impl FileHeader {
    pub fn encode(&self) -> Result<Vec<u8>> {
        encode_header(
            &[self.num_blocks.into(), self.name.as_str().into()],
            &FILE_FIELDS,
        )
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        let header = decode_header(frame, &FILE_FIELDS)?;
        match header.trailing {
            Some(name) => Ok(Self {
                num_blocks: header.fields[0],
                name,
            }),
            None => Err(SyncError::InvalidFileName(String::new())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_request_header_layout() {
        let header = RequestHeader {
            num_blocks: 3,
            num_files: 1,
            command: "ADD".to_string(),
        };
        let bytes = header.encode().unwrap();
        assert_eq!(bytes, vec![0, 1, 0, 0, 0, 0, 3, 0, 1, b'A', b'D', b'D']);
        assert_eq!(RequestHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn test_decode_short_buffer_is_length_mismatch() {
        let err = decode_header(&[0, 1, 0], &REQUEST_FIELDS).unwrap_err();
        match err {
            SyncError::LengthMismatch { expected, actual } => {
                assert_eq!(expected, 9);
                assert_eq!(actual, 3);
            }
            other => panic!("Expected LengthMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_version_two_rejected_before_payload() {
        // Trailing bytes are not valid UTF-8; the version check must fire first.
        let mut frame = vec![0, 2, 0, 0, 0, 0, 1, 0, 0];
        frame.extend_from_slice(&[0xff, 0xfe]);
        match RequestHeader::decode(&frame) {
            Err(SyncError::UnsupportedVersion(2)) => {}
            other => panic!("Expected UnsupportedVersion(2), got {:?}", other),
        }
        match ResponseHeader::decode(&frame[..9]) {
            Err(SyncError::UnsupportedVersion(2)) => {}
            other => panic!("Expected UnsupportedVersion(2), got {:?}", other),
        }
    }

    #[test]
    fn test_encode_rejects_text_in_integer_field() {
        let err = encode_header(&["x".into(), 1u64.into()], &[2, 5]).unwrap_err();
        assert!(matches!(err, SyncError::InvalidHeader(_)));
    }

    #[test]
    fn test_encode_rejects_too_many_values() {
        let values: Vec<HeaderValue> = vec![1u64.into(), "a".into(), "b".into()];
        assert!(matches!(
            encode_header(&values, &[2]),
            Err(SyncError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_encode_rejects_overflowing_value() {
        assert!(matches!(
            encode_header(&[65536u64.into()], &[2]),
            Err(SyncError::InvalidHeader(_))
        ));
        assert!(encode_header(&[65535u64.into()], &[2]).is_ok());
    }

    #[test]
    fn test_file_header_requires_name() {
        let bytes = encode_header(&[0u64.into()], &FILE_FIELDS).unwrap();
        assert!(matches!(
            FileHeader::decode(&bytes),
            Err(SyncError::InvalidFileName(_))
        ));
    }

    fn widths_and_values() -> impl Strategy<Value = (Vec<usize>, Vec<u64>)> {
        prop::collection::vec(1usize..=8, 0..6).prop_flat_map(|widths| {
            let values: Vec<_> = widths
                .iter()
                .map(|&w| {
                    if w == 8 {
                        any::<u64>().boxed()
                    } else {
                        (0u64..(1u64 << (8 * w))).boxed()
                    }
                })
                .collect();
            (Just(widths), values)
        })
    }

    proptest! {
        #[test]
        fn prop_header_round_trip(
            (widths, ints) in widths_and_values(),
            trailing in prop::option::of("\\PC{1,40}"),
        ) {
            let mut values: Vec<HeaderValue> = ints.iter().map(|&n| n.into()).collect();
            if let Some(text) = &trailing {
                values.push(text.as_str().into());
            }
            let bytes = encode_header(&values, &widths).unwrap();
            let decoded = decode_header(&bytes, &widths).unwrap();
            prop_assert_eq!(decoded.fields, ints);
            prop_assert_eq!(decoded.trailing, trailing);
        }
    }
}
