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

//! Consuming cursor over a request buffer.

use memchr::memchr;

/// Outcome of extracting a CRLF-terminated line.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Line<'a> {
    /// A full line, CRLF stripped.
    Complete(&'a [u8]),
    /// No line terminator buffered yet.
    Partial,
    /// A bare LF without the preceding CR.
    Bad,
}

#[derive(Debug, Clone)]
pub(crate) struct Cursor<'a> {
    inner: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(slice: &'a [u8]) -> Self {
        Cursor { inner: slice, pos: 0 }
    }

    /// Bytes consumed so far.
    #[inline]
    pub(crate) fn pos(&self) -> usize {
        self.pos
    }

    #[inline]
    pub(crate) fn rest(&self) -> &'a [u8] {
        &self.inner[self.pos..]
    }

    /// Consumes exactly `n` bytes, or leaves the cursor untouched when fewer
    /// are buffered.
    pub(crate) fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.inner.len() - self.pos < n {
            return None;
        }

        let slice = &self.inner[self.pos..self.pos + n];
        self.pos += n;
        Some(slice)
    }

    /// Consumes up to and including the next CRLF, returning the line without
    /// its terminator.
    pub(crate) fn take_line(&mut self) -> Line<'a> {
        let rest = self.rest();
        match memchr(b'\n', rest) {
            Some(0) => Line::Bad,
            Some(i) if rest[i - 1] != b'\r' => Line::Bad,
            Some(i) => {
                let line = &rest[..i - 1];
                self.pos += i + 1;
                Line::Complete(line)
            }
            None => Line::Partial,
        }
    }
}
