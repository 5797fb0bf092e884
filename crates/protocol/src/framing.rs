//! Content-Length framing for the worker byte stream.
//!
//! Each message is preceded by a text header block:
//!
//! ```text
//! Content-Length: <decimal byte count>\r\n
//! \r\n
//! <exactly that many body bytes>
//! ```
//!
//! There is no trailing separator after the body; the declared length is
//! authoritative. Header-field matching is case-insensitive and tolerates
//! missing or extra whitespace around the colon, and unrecognized header
//! fields are skipped. The decoder is incremental: feed it a growing
//! [`BytesMut`] and it returns `Ok(None)` until a complete frame is
//! buffered, consuming nothing in the meantime.

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

const FIELD_NAME: &[u8] = b"Content-Length: ";
const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Longest header block the decoder will scan before giving up. A peer that
/// streams this much without a blank line is not speaking the protocol.
const MAX_HEADER_BYTES: usize = 4 * 1024;

/// Default upper bound on a declared body length. Screenshots and page
/// archives ride inside JSON strings, so frames run large; anything past
/// this is treated as stream corruption rather than data.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Errors produced while parsing the frame header.
///
/// Any of these means the byte stream is no longer trustworthy at the
/// current position; callers should discard buffered input (or tear the
/// connection down) rather than retry the same bytes.
#[derive(Debug, Clone, Error)]
pub enum FramingError {
    /// The header block terminated without a `Content-Length` field.
    #[error("frame header has no Content-Length field: {header:?}")]
    MissingLength { header: String },

    /// The `Content-Length` value is not a non-negative decimal integer.
    #[error("unparseable Content-Length value {value:?}")]
    BadLength { value: String },

    /// The declared body length exceeds the configured maximum.
    #[error("declared body length {len} exceeds limit of {max} bytes")]
    Oversized { len: usize, max: usize },

    /// No header terminator within [`MAX_HEADER_BYTES`] of buffered input.
    #[error("no header terminator within {limit} bytes")]
    HeaderTooLong { limit: usize },

    /// The header block is not valid UTF-8.
    #[error("frame header is not valid UTF-8")]
    HeaderNotUtf8,
}

/// Append one framed message to `dst`.
pub fn encode_frame(body: &[u8], dst: &mut BytesMut) {
    let len_digits = body.len().to_string();
    dst.reserve(FIELD_NAME.len() + len_digits.len() + HEADER_TERMINATOR.len() + body.len());
    dst.extend_from_slice(FIELD_NAME);
    dst.extend_from_slice(len_digits.as_bytes());
    dst.extend_from_slice(HEADER_TERMINATOR);
    dst.extend_from_slice(body);
}

/// Try to extract one complete frame body from the front of `src`.
///
/// Returns `Ok(None)` when the buffer does not yet hold a full frame; the
/// buffered bytes are left in place so the caller can read more and retry.
/// On success the frame's bytes (header included) are consumed from `src`
/// and the body is returned; any following frame stays in the buffer.
pub fn decode_frame(src: &mut BytesMut, max_body: usize) -> Result<Option<Bytes>, FramingError> {
    let Some(header_end) = find_header_end(src) else {
        if src.len() > MAX_HEADER_BYTES {
            return Err(FramingError::HeaderTooLong {
                limit: MAX_HEADER_BYTES,
            });
        }
        return Ok(None);
    };

    let body_len = parse_content_length(&src[..header_end])?;
    if body_len > max_body {
        return Err(FramingError::Oversized {
            len: body_len,
            max: max_body,
        });
    }

    let body_start = header_end + HEADER_TERMINATOR.len();
    if src.len() < body_start + body_len {
        // Make sure the next read can pull the remainder in one go.
        src.reserve(body_start + body_len - src.len());
        return Ok(None);
    }

    src.advance(body_start);
    Ok(Some(src.split_to(body_len).freeze()))
}

/// Index of the first `\r\n\r\n` in `src`, if any.
fn find_header_end(src: &[u8]) -> Option<usize> {
    src.windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
}

/// Pull the declared body length out of a header block.
///
/// Lines without a colon are skipped, field names are matched
/// case-insensitively, and whitespace around both the name and the value
/// is ignored.
fn parse_content_length(header: &[u8]) -> Result<usize, FramingError> {
    let text = std::str::from_utf8(header).map_err(|_| FramingError::HeaderNotUtf8)?;
    for line in text.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            let value = value.trim();
            return value
                .parse::<usize>()
                .map_err(|_| FramingError::BadLength {
                    value: value.to_string(),
                });
        }
    }
    Err(FramingError::MissingLength {
        header: text.to_string(),
    })
}
