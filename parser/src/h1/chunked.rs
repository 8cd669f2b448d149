// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Chunked transfer decoding
//! [IETF RFC 9112 Section 7.1](https://www.rfc-editor.org/rfc/rfc9112#section-7.1)

use memchr::memchr;

use super::{is_token_byte, ParseError};
use crate::cursor::{Cursor, Line};

/// Longest accepted chunk-size token. 16 hex digits already covers the full
/// usize range.
const MAX_SIZE_DIGITS: usize = 16;

/// A fully decoded chunked body.
#[derive(Debug, PartialEq, Eq)]
pub struct Decoded {
    /// Concatenated chunk payloads with framing removed.
    pub body: Vec<u8>,
    /// Raw trailer fields, in wire order.
    pub trailers: Vec<(String, String)>,
    /// Bytes of `buf` the framing occupied, trailers included.
    pub consumed: usize,
}

/// Decodes a chunked body from the start of `buf`.
///
/// Returns `Ok(None)` while the terminating `0 CRLF CRLF` has not been
/// buffered yet; the decode is restartable and carries no state between
/// calls.
pub fn decode(buf: &[u8]) -> Result<Option<Decoded>, ParseError> {
    let mut cursor = Cursor::new(buf);
    let mut body = Vec::new();

    loop {
        let size = match cursor.take_line() {
            Line::Complete(line) => parse_chunk_size(line)?,
            Line::Partial => return Ok(None),
            Line::Bad => return Err(ParseError::Chunk),
        };

        if size == 0 {
            break;
        }

        match cursor.take(size) {
            Some(bytes) => body.extend_from_slice(bytes),
            None => return Ok(None),
        }

        match cursor.take(2) {
            Some(b"\r\n") => {}
            Some(_) => return Err(ParseError::Chunk),
            None => return Ok(None),
        }
    }

    let mut trailers = Vec::new();
    loop {
        match cursor.take_line() {
            Line::Complete(line) if line.is_empty() => break,
            Line::Complete(line) => trailers.push(parse_trailer(line)?),
            Line::Partial => return Ok(None),
            Line::Bad => return Err(ParseError::Chunk),
        }
    }

    Ok(Some(Decoded {
        body,
        trailers,
        consumed: cursor.pos(),
    }))
}

/// Hex chunk size, with any `;ext=…` chunk extension discarded.
fn parse_chunk_size(line: &[u8]) -> Result<usize, ParseError> {
    let digits = match memchr(b';', line) {
        Some(i) => &line[..i],
        None => line,
    };
    let digits = trim(digits);

    if digits.is_empty() || digits.len() > MAX_SIZE_DIGITS {
        return Err(ParseError::Chunk);
    }

    let digits = std::str::from_utf8(digits).map_err(|_| ParseError::Chunk)?;
    usize::from_str_radix(digits, 16).map_err(|_| ParseError::Chunk)
}

fn parse_trailer(line: &[u8]) -> Result<(String, String), ParseError> {
    let colon = memchr(b':', line).ok_or(ParseError::Chunk)?;
    let name = &line[..colon];
    if name.is_empty() || !name.iter().copied().all(is_token_byte) {
        return Err(ParseError::Chunk);
    }

    let value = trim(&line[colon + 1..]);
    Ok((
        String::from_utf8_lossy(name).into_owned(),
        String::from_utf8_lossy(value).into_owned(),
    ))
}

fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|&b| b != b' ' && b != b'\t')
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|&b| b != b' ' && b != b'\t')
        .map_or(start, |i| i + 1);
    &bytes[start..end]
}
