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

//! Response model and wire serialization.

use core::fmt;
use std::io::{self, Read, Write};

use crate::headers::HeaderMap;
use crate::Version;

/// Body payload of a response.
pub enum Body {
    /// No body bytes.
    Empty,
    /// Fully buffered bytes of known size.
    Bytes(Vec<u8>),
    /// Lazily produced bytes of unknown total size; drained by the chunked
    /// writer.
    Producer(Box<dyn Read + Send>),
}

impl Body {
    /// Known size of the body, when it has one.
    pub fn len(&self) -> Option<usize> {
        match self {
            Body::Empty => Some(0),
            Body::Bytes(bytes) => Some(bytes.len()),
            Body::Producer(_) => None,
        }
    }

    /// Whether the body is known to be empty.
    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Empty"),
            Body::Bytes(bytes) => f.write_fmt(format_args!("Bytes({})", bytes.len())),
            Body::Producer(_) => f.write_str("Producer"),
        }
    }
}

/// Serialization knobs for [`Response::write_to`].
#[derive(Debug, Clone, Copy)]
pub struct WriteOptions {
    /// Chunk payload size for the chunked mode.
    pub chunk_size: usize,
    /// Batching threshold for the size-buffered mode, and the body-size
    /// boundary above which it is selected.
    pub buffer_size: usize,
    /// Serialize headers only, as for a HEAD request. Computed framing
    /// headers are kept.
    pub head_only: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        WriteOptions {
            chunk_size: 8 * 1024,
            buffer_size: 8 * 1024,
            head_only: false,
        }
    }
}

/// Response record
#[derive(Debug)]
pub struct Response {
    status: u16,
    reason: Option<String>,
    headers: HeaderMap,
    body: Body,
}

impl Response {
    /// Creates a response with the given status code and an empty body.
    pub fn new(status: u16) -> Self {
        Response {
            status,
            reason: None,
            headers: HeaderMap::new(),
            body: Body::Empty,
        }
    }

    /// Overrides the reason phrase looked up from the status table.
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Appends a header value.
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Sets a fully buffered body.
    pub fn body(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.body = Body::Bytes(bytes.into());
        self
    }

    /// Sets a lazily produced body of unknown size.
    pub fn streaming(mut self, producer: Box<dyn Read + Send>) -> Self {
        self.body = Body::Producer(producer);
        self
    }

    /// The status code.
    pub fn status(&self) -> u16 {
        self.status
    }

    /// The effective reason phrase: the override when set, otherwise the
    /// fixed table.
    pub fn reason_phrase(&self) -> &str {
        match &self.reason {
            Some(reason) => reason,
            None => reason_phrase(self.status),
        }
    }

    /// The response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable access to the response headers.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Serializes the response, choosing a mode by body shape: unknown size
    /// goes chunked, large known bodies are size-buffered, everything else
    /// is emitted whole.
    pub fn write_to<W: Write>(
        &mut self,
        sink: &mut W,
        version: Version,
        opts: &WriteOptions,
    ) -> io::Result<()> {
        match &self.body {
            Body::Producer(_) => self.write_chunked(sink, version, opts),
            Body::Bytes(bytes) if bytes.len() > opts.buffer_size => {
                self.write_size_buffered(sink, version, opts)
            }
            _ => self.write_buffered(sink, version, opts),
        }
    }

    /// Buffered-whole mode: everything in one serialization pass.
    pub fn write_buffered<W: Write>(
        &mut self,
        sink: &mut W,
        version: Version,
        opts: &WriteOptions,
    ) -> io::Result<()> {
        self.ensure_content_length();
        self.write_head(sink, version)?;

        if !opts.head_only {
            if let Body::Bytes(bytes) = &self.body {
                sink.write_all(bytes)?;
            }
        }
        sink.flush()
    }

    /// Chunked mode: `Transfer-Encoding: chunked` framing around a body
    /// producer, `opts.chunk_size` bytes per chunk.
    pub fn write_chunked<W: Write>(
        &mut self,
        sink: &mut W,
        version: Version,
        opts: &WriteOptions,
    ) -> io::Result<()> {
        self.headers.remove("Content-Length");
        self.headers.set("Transfer-Encoding", "chunked");
        self.write_head(sink, version)?;

        if opts.head_only {
            return sink.flush();
        }

        match &mut self.body {
            Body::Empty => {}
            Body::Bytes(bytes) => {
                for chunk in bytes.chunks(opts.chunk_size.max(1)) {
                    write_chunk(sink, chunk)?;
                }
            }
            Body::Producer(producer) => {
                let mut chunk = vec![0u8; opts.chunk_size.max(1)];
                loop {
                    let n = producer.read(&mut chunk)?;
                    if n == 0 {
                        break;
                    }
                    write_chunk(sink, &chunk[..n])?;
                }
            }
        }

        sink.write_all(b"0\r\n\r\n")?;
        sink.flush()
    }

    /// Size-buffered mode: the buffered-whole byte stream, but staged into
    /// `opts.buffer_size` batches before each wire write.
    pub fn write_size_buffered<W: Write>(
        &mut self,
        sink: &mut W,
        version: Version,
        opts: &WriteOptions,
    ) -> io::Result<()> {
        let mut batch = BatchWriter::new(sink, opts.buffer_size.max(1));
        self.write_buffered(&mut batch, version, opts)
    }

    fn write_head<W: Write>(&self, sink: &mut W, version: Version) -> io::Result<()> {
        write!(sink, "{} {} {}\r\n", version, self.status, self.reason_phrase())?;

        for (name, values) in self.headers.iter() {
            for value in values {
                write!(sink, "{name}: {value}\r\n")?;
            }
        }

        sink.write_all(b"\r\n")
    }

    /// Fills in `Content-Length` for bodies of known size, unless framing
    /// headers were set explicitly. Statuses that forbid content keep none.
    fn ensure_content_length(&mut self) {
        if matches!(self.status, 100..=199 | 204 | 304) {
            return;
        }
        if self.headers.contains("Content-Length") || self.headers.contains("Transfer-Encoding") {
            return;
        }
        if let Some(len) = self.body.len() {
            self.headers.set("Content-Length", len.to_string());
        }
    }
}

fn write_chunk<W: Write>(sink: &mut W, chunk: &[u8]) -> io::Result<()> {
    write!(sink, "{:x}\r\n", chunk.len())?;
    sink.write_all(chunk)?;
    sink.write_all(b"\r\n")
}

/// Accumulates up to `capacity` bytes before each write to the underlying
/// sink; residual bytes are pushed out on flush.
struct BatchWriter<'a, W: Write> {
    inner: &'a mut W,
    staged: Vec<u8>,
    capacity: usize,
}

impl<'a, W: Write> BatchWriter<'a, W> {
    fn new(inner: &'a mut W, capacity: usize) -> Self {
        BatchWriter {
            inner,
            staged: Vec::with_capacity(capacity),
            capacity,
        }
    }

    fn drain(&mut self) -> io::Result<()> {
        if !self.staged.is_empty() {
            self.inner.write_all(&self.staged)?;
            self.staged.clear();
        }
        Ok(())
    }
}

impl<W: Write> Write for BatchWriter<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.staged.extend_from_slice(buf);
        if self.staged.len() >= self.capacity {
            self.drain()?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.drain()?;
        self.inner.flush()
    }
}

/// Default reason phrase for a status code
/// [RFC 9110 Section 15](https://www.rfc-editor.org/rfc/rfc9110#section-15).
/// Unknown codes map to `"Unknown"`.
pub fn reason_phrase(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        203 => "Non-Authoritative Information",
        204 => "No Content",
        205 => "Reset Content",
        206 => "Partial Content",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Content Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        416 => "Range Not Satisfiable",
        417 => "Expectation Failed",
        421 => "Misdirected Request",
        422 => "Unprocessable Content",
        426 => "Upgrade Required",
        428 => "Precondition Required",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}
