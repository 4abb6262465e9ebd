//! Echo protocol parser.

use bytes::Bytes;
use thiserror::Error;

/// Largest frame accepted.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Longest length line accepted while waiting for `\r\n`.
const MAX_HEADER_LEN: usize = 32;

/// Parsed echo request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Echo(Bytes),
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid length")]
    InvalidLength,
    #[error("value too large")]
    TooLarge,
}

/// Parse one frame from the front of `input`.
///
/// Returns `Ok(None)` until the header and all `length` data bytes are
/// present. On success also returns the number of bytes consumed.
pub fn parse(input: &[u8]) -> Result<Option<(Request, usize)>, ParseError> {
    let Some(line_end) = input.windows(2).position(|w| w == b"\r\n") else {
        if input.len() > MAX_HEADER_LEN {
            return Err(ParseError::InvalidLength);
        }
        return Ok(None);
    };

    let line = &input[..line_end];
    let header_len = line_end + 2;

    if line.eq_ignore_ascii_case(b"QUIT") {
        return Ok(Some((Request::Quit, header_len)));
    }

    let length: usize = std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(ParseError::InvalidLength)?;
    if length > MAX_FRAME_SIZE {
        return Err(ParseError::TooLarge);
    }

    let frame_end = header_len + length;
    if input.len() < frame_end {
        return Ok(None);
    }
    let data = Bytes::copy_from_slice(&input[header_len..frame_end]);
    Ok(Some((Request::Echo(data), frame_end)))
}
