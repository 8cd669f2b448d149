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

//! HTTP/1.1 Request
//! IETF RFC 9112

use std::collections::BTreeMap;

use memchr::memchr;

use super::content::{self, Content};
use super::query::{self, QueryMap};
use super::{is_token_byte, ParseError};
use crate::headers::HeaderMap;
use crate::{Method, Version};

/// Headers whose duplication makes body framing ambiguous. Each may appear
/// at most once; `Content-Length` and `Transfer-Encoding` are additionally
/// mutually exclusive.
const SINGLETON_HEADERS: [&str; 3] = ["Content-Length", "Transfer-Encoding", "Host"];

/// How the bytes following the header block are framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    /// No body follows.
    None,
    /// Exactly this many body bytes follow.
    ContentLength(usize),
    /// Chunked transfer encoding, terminated by a zero-size chunk.
    Chunked,
}

/// Validated request line and header block, produced once the end-of-headers
/// sentinel has been buffered.
#[derive(Debug)]
pub struct Head {
    /// Request method, emitted uppercase.
    pub method: Method,
    /// Opaque request target.
    pub target: String,
    /// Protocol version.
    pub version: Version,
    /// Canonicalized header fields.
    pub headers: HeaderMap,
    framing: BodyFraming,
}

impl Head {
    /// Parses a complete header block: the bytes up to, and excluding, the
    /// `CRLF CRLF` sentinel.
    ///
    /// # Example
    /// ```
    /// # use parser::h1::ParseError;
    /// # use parser::h1::request::Head;
    /// # use parser::{Method, Version};
    /// # fn main() -> Result<(), ParseError> {
    /// let head = Head::parse(b"GET / HTTP/1.1\r\nHost: localhost")?;
    /// assert_eq!(Method::Get, head.method);
    /// assert_eq!("/", head.target);
    /// assert_eq!(Version::H1_1, head.version);
    /// # Ok(())
    /// # }
    /// ```
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        let lines = split_lines(block)?;
        let (method, target, version) = parse_request_line(lines[0])?;
        let headers = parse_header_fields(&lines[1..])?;

        check_singletons(&headers)?;
        let framing = determine_framing(&headers)?;

        Ok(Head {
            method,
            target,
            version,
            headers,
            framing,
        })
    }

    /// The body framing the header block announced.
    pub fn framing(&self) -> BodyFraming {
        self.framing
    }

    /// Whether the client permits connection reuse after this exchange.
    /// HTTP/1.1 defaults to keep-alive, HTTP/1.0 to close.
    pub fn keep_alive(&self) -> bool {
        keep_alive_from(self.version, &self.headers)
    }

    /// Folds chunked-trailer fields into the header map, re-applying the
    /// same canonicalization and duplicate-rejection rules the header block
    /// itself is subject to.
    pub fn absorb_trailers(
        &mut self,
        trailers: Vec<(String, String)>,
    ) -> Result<(), ParseError> {
        for (name, value) in trailers {
            self.headers.append(&name, value);
        }
        check_singletons(&self.headers)
    }
}

/// Fully assembled request record handed to the user callback.
#[derive(Debug)]
pub struct Request {
    /// Request method, uppercase.
    pub method: Method,
    /// Opaque request target.
    pub target: String,
    /// Protocol version.
    pub version: Version,
    /// Canonicalized header fields, trailers included.
    pub headers: HeaderMap,
    /// Raw body bytes, chunked framing already removed.
    pub body: Vec<u8>,
    /// Query parameters decoded from the target.
    pub query: QueryMap,
    /// Cookies gathered across all `Cookie` headers.
    pub cookies: BTreeMap<String, String>,
    /// Structured body content, when the media type is recognized.
    pub content: Content,
}

impl Request {
    /// Enriches a parsed head and its body bytes into the final record.
    ///
    /// Query parameters, cookies and body content are each decoded
    /// independently; only a malformed multipart payload is an error here.
    pub fn assemble(head: Head, body: Vec<u8>) -> Result<Self, ParseError> {
        let query = match head.target.split_once('?') {
            Some((_, raw)) => query::parse(raw),
            None => QueryMap::new(),
        };
        let cookies = content::parse_cookies(&head.headers);
        let content = content::parse(&head.headers, &body)?;

        Ok(Request {
            method: head.method,
            target: head.target,
            version: head.version,
            headers: head.headers,
            body,
            query,
            cookies,
            content,
        })
    }

    /// Whether the client permits connection reuse after this exchange.
    pub fn keep_alive(&self) -> bool {
        keep_alive_from(self.version, &self.headers)
    }
}

fn keep_alive_from(version: Version, headers: &HeaderMap) -> bool {
    for value in headers.get_all("Connection") {
        let value = value.to_ascii_lowercase();
        if value.contains("close") {
            return false;
        }
        if value.contains("keep-alive") {
            return true;
        }
    }

    version == Version::H1_1
}

/// Splits the header block on exact CRLF boundaries. The final segment is
/// the last header line (the block carries no trailing CRLF).
fn split_lines(block: &[u8]) -> Result<Vec<&[u8]>, ParseError> {
    let mut lines = Vec::new();
    let mut rest = block;

    loop {
        match memchr(b'\n', rest) {
            Some(i) => {
                if i == 0 || rest[i - 1] != b'\r' {
                    return Err(ParseError::NewLine);
                }
                lines.push(&rest[..i - 1]);
                rest = &rest[i + 1..];
            }
            None => {
                lines.push(rest);
                return Ok(lines);
            }
        }
    }
}

/// Exactly three space-separated tokens: method, request-target, protocol.
fn parse_request_line(line: &[u8]) -> Result<(Method, String, Version), ParseError> {
    let mut tokens = line.split(|&b| b == b' ');

    let (Some(method), Some(target), Some(version), None) = (
        tokens.next(),
        tokens.next(),
        tokens.next(),
        tokens.next(),
    ) else {
        return Err(ParseError::RequestLine);
    };

    if method.is_empty() || target.is_empty() || version.is_empty() {
        return Err(ParseError::RequestLine);
    }

    let method = Method::from_token(method).ok_or(ParseError::Method)?;
    let target = parse_target(target)?;
    let version = parse_version(version)?;

    Ok((method, target, version))
}

fn parse_target(token: &[u8]) -> Result<String, ParseError> {
    if token.iter().any(|&b| !(0x21..=0x7e).contains(&b)) {
        return Err(ParseError::Target);
    }

    // printable ASCII only, checked above
    String::from_utf8(token.to_vec()).map_err(|_| ParseError::Target)
}

/// `HTTP/<major>.<minor>`, restricted to 1.0 and 1.1.
fn parse_version(token: &[u8]) -> Result<Version, ParseError> {
    let digits = token
        .strip_prefix(b"HTTP/")
        .ok_or(ParseError::Version)?;

    match digits {
        [major, b'.', minor] if major.is_ascii_digit() && minor.is_ascii_digit() => {
            match (major, minor) {
                (b'1', b'0') => Ok(Version::H1_0),
                (b'1', b'1') => Ok(Version::H1_1),
                _ => Err(ParseError::Version),
            }
        }
        _ => Err(ParseError::Version),
    }
}

fn parse_header_fields(lines: &[&[u8]]) -> Result<HeaderMap, ParseError> {
    let mut headers = HeaderMap::new();

    for &line in lines {
        if line.first().is_some_and(|&b| b == b' ' || b == b'\t') {
            // continuation line, folded onto the previous value
            let fragment = trim_value(line);
            if !headers.unfold_onto_last(&lossy(fragment)) {
                return Err(ParseError::HeaderName);
            }
            continue;
        }

        let colon = memchr(b':', line).ok_or(ParseError::HeaderName)?;
        let name = &line[..colon];
        if name.is_empty() || !name.iter().copied().all(is_token_byte) {
            return Err(ParseError::HeaderName);
        }

        let value = trim_value(&line[colon + 1..]);
        // name is pure tchar, always valid UTF-8
        let name = std::str::from_utf8(name).map_err(|_| ParseError::HeaderName)?;
        headers.append(name, lossy(value));
    }

    Ok(headers)
}

fn trim_value(bytes: &[u8]) -> &[u8] {
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

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn check_singletons(headers: &HeaderMap) -> Result<(), ParseError> {
    for name in SINGLETON_HEADERS {
        if headers.value_count(name) > 1 {
            return Err(ParseError::AmbiguousHeader(name));
        }
    }
    Ok(())
}

fn determine_framing(headers: &HeaderMap) -> Result<BodyFraming, ParseError> {
    let encodings = headers.get_all("Transfer-Encoding");

    if !encodings.is_empty() && headers.contains("Content-Length") {
        return Err(ParseError::ConflictingFraming);
    }

    if encodings
        .iter()
        .any(|v| v.to_ascii_lowercase().contains("chunked"))
    {
        return Ok(BodyFraming::Chunked);
    }

    match headers.get("Content-Length") {
        Some(value) => {
            let value = value.trim();
            if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
                return Err(ParseError::ContentLength);
            }
            let length: usize = value.parse().map_err(|_| ParseError::ContentLength)?;
            Ok(BodyFraming::ContentLength(length))
        }
        None => Ok(BodyFraming::None),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::h1::query::Value;

    fn head(block: &[u8]) -> Head {
        Head::parse(block).unwrap()
    }

    #[test]
    fn parses_minimal_request() {
        let head = head(b"GET / HTTP/1.1\r\nHost: localhost");
        assert_eq!(Method::Get, head.method);
        assert_eq!("/", head.target);
        assert_eq!(Version::H1_1, head.version);
        assert_eq!(Some("localhost"), head.headers.get("Host"));
        assert_eq!(BodyFraming::None, head.framing());
    }

    #[test]
    fn method_is_emitted_uppercase() {
        let head = head(b"post / HTTP/1.1\r\nHost: a");
        assert_eq!("POST", head.method.as_str());
    }

    #[test]
    fn header_names_are_canonicalized() {
        let head = head(b"GET / HTTP/1.1\r\ncontent-length: 5\r\nx-forwarded-for: 1.2.3.4");
        assert_eq!(BodyFraming::ContentLength(5), head.framing());

        let names: Vec<&str> = head.headers.iter().map(|(n, _)| n).collect();
        assert_eq!(vec!["Content-Length", "X-Forwarded-For"], names);
    }

    #[test]
    fn continuation_lines_fold_with_single_space() {
        let head = head(b"GET / HTTP/1.1\r\nUser-Agent: curl\r\n (x86_64)\r\n\tlinux");
        assert_eq!(Some("curl (x86_64) linux"), head.headers.get("User-Agent"));
    }

    #[test]
    fn continuation_without_header_is_rejected() {
        assert_eq!(
            Some(ParseError::HeaderName),
            Head::parse(b"GET / HTTP/1.1\r\n folded").err(),
        );
    }

    #[test]
    fn request_line_must_have_three_tokens() {
        #[rustfmt::skip]
        let cases: [(&[u8], ParseError); 8] = [
            (b"", ParseError::RequestLine),
            (b"GET /", ParseError::RequestLine),
            (b"GET / HTTP/1.1 extra", ParseError::RequestLine),
            (b"GET  / HTTP/1.1", ParseError::RequestLine),
            (b"YEET / HTTP/1.1", ParseError::Method),
            (b"GET /\x01 HTTP/1.1", ParseError::Target),
            (b"GET / HTTP/2.0", ParseError::Version),
            (b"GET / http/1.1", ParseError::Version),
        ];

        for (line, expected) in cases {
            assert_eq!(Some(expected), Head::parse(line).err(), "line: {line:?}");
        }
    }

    #[test]
    fn version_shape_is_strict() {
        assert!(Head::parse(b"GET / HTTP/1.1").is_ok());
        assert!(Head::parse(b"GET / HTTP/1.0").is_ok());

        #[rustfmt::skip]
        let bad: [&[u8]; 4] = [
            b"GET / HTTP/1.",
            b"GET / HTTP/1.10",
            b"GET / HTTP1.1",
            b"GET / HTTP/1.2",
        ];
        for line in bad {
            assert_eq!(Some(ParseError::Version), Head::parse(line).err());
        }
    }

    #[test]
    fn bare_lf_is_rejected() {
        assert_eq!(
            Some(ParseError::NewLine),
            Head::parse(b"GET / HTTP/1.1\nHost: a").err(),
        );
    }

    #[test]
    fn duplicate_framing_headers_are_rejected() {
        #[rustfmt::skip]
        let cases: [(&[u8], ParseError); 4] = [
            (
                b"POST / HTTP/1.1\r\nContent-Length: 10\r\nContent-Length: 20",
                ParseError::AmbiguousHeader("Content-Length"),
            ),
            (
                b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\nTransfer-Encoding: chunked",
                ParseError::AmbiguousHeader("Transfer-Encoding"),
            ),
            (
                b"GET / HTTP/1.1\r\nHost: a\r\nHost: b",
                ParseError::AmbiguousHeader("Host"),
            ),
            (
                b"POST / HTTP/1.1\r\nContent-Length: 5\r\nTransfer-Encoding: chunked",
                ParseError::ConflictingFraming,
            ),
        ];

        for (block, expected) in cases {
            assert_eq!(Some(expected), Head::parse(block).err());
        }
    }

    #[test]
    fn repeated_values_stay_legal_for_other_headers() {
        let head = head(b"GET / HTTP/1.1\r\nCookie: s=1\r\nCookie: u=x\r\nAccept: a\r\nAccept: b");
        assert_eq!(2, head.headers.value_count("Cookie"));
        assert_eq!(2, head.headers.value_count("Accept"));
    }

    #[test]
    fn content_length_must_be_a_non_negative_integer() {
        #[rustfmt::skip]
        let bad: [&[u8]; 5] = [
            b"POST / HTTP/1.1\r\nContent-Length: abc",
            b"POST / HTTP/1.1\r\nContent-Length: -1",
            b"POST / HTTP/1.1\r\nContent-Length: +5",
            b"POST / HTTP/1.1\r\nContent-Length: 1.5",
            b"POST / HTTP/1.1\r\nContent-Length: 99999999999999999999999999",
        ];

        for block in bad {
            assert_eq!(Some(ParseError::ContentLength), Head::parse(block).err());
        }

        assert_eq!(
            BodyFraming::ContentLength(0),
            head(b"POST / HTTP/1.1\r\nContent-Length: 0").framing()
        );
    }

    #[test]
    fn chunked_is_a_case_insensitive_substring_match() {
        let head = head(b"POST / HTTP/1.1\r\nTransfer-Encoding: gzip, Chunked");
        assert_eq!(BodyFraming::Chunked, head.framing());

        // transfer encodings without chunked frame no body
        let head = Head::parse(b"POST / HTTP/1.1\r\nTransfer-Encoding: gzip").unwrap();
        assert_eq!(BodyFraming::None, head.framing());
    }

    #[test]
    fn keep_alive_follows_version_defaults() {
        assert!(head(b"GET / HTTP/1.1\r\nHost: a").keep_alive());
        assert!(!head(b"GET / HTTP/1.0\r\nHost: a").keep_alive());
        assert!(!head(b"GET / HTTP/1.1\r\nConnection: close").keep_alive());
        assert!(head(b"GET / HTTP/1.0\r\nConnection: keep-alive").keep_alive());
        assert!(!head(b"GET / HTTP/1.1\r\nConnection: Close, Upgrade").keep_alive());
    }

    #[test]
    fn trailers_fold_in_under_duplicate_rules() {
        let mut h = head(b"POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked");
        h.absorb_trailers(vec![("x-checksum".to_string(), "ab12".to_string())])
            .unwrap();
        assert_eq!(Some("ab12"), h.headers.get("X-Checksum"));

        let mut h = head(b"POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked");
        assert_eq!(
            Err(ParseError::AmbiguousHeader("Host")),
            h.absorb_trailers(vec![("Host".to_string(), "b".to_string())]),
        );
    }

    #[test]
    fn assemble_decodes_query_and_cookies() {
        let head = head(
            b"GET /search?q=rust%20lang&tag[]=a&tag[]=b&page=1&page=2 HTTP/1.1\r\n\
              Host: localhost\r\nCookie: s=1\r\nCookie: u=x",
        );
        let request = Request::assemble(head, Vec::new()).unwrap();

        assert_eq!(
            Some(&Value::Single("rust lang".to_string())),
            request.query.get("q")
        );
        assert_eq!(
            Some(&Value::Single("2".to_string())),
            request.query.get("page"),
        );
        assert_eq!(
            Some(&Value::Array(vec!["a".to_string(), "b".to_string()])),
            request.query.get("tag"),
        );

        assert_eq!(Some(&"1".to_string()), request.cookies.get("s"));
        assert_eq!(Some(&"x".to_string()), request.cookies.get("u"));
    }

    #[test]
    fn assemble_keeps_raw_body() {
        let head = head(b"POST /upload HTTP/1.1\r\nHost: a\r\nContent-Length: 4");
        let request = Request::assemble(head, b"\x00\x01\x02\x03".to_vec()).unwrap();
        assert_eq!(b"\x00\x01\x02\x03".to_vec(), request.body);
        assert!(matches!(request.content, Content::None));
    }
}
