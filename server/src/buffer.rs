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

//! Connection receive/send buffer.

use std::io::{self, Write};

/// A growable byte buffer with amortized front consumption.
///
/// Bytes are appended at the tail and consumed from the head; consumed space
/// is reclaimed once it outweighs the live region, keeping long-lived
/// keep-alive connections from accumulating dead capacity.
#[derive(Debug, Default)]
pub struct Buffer {
    data: Vec<u8>,
    start: usize,
}

impl Buffer {
    /// Live bytes available for reading.
    pub fn len(&self) -> usize {
        self.data.len() - self.start
    }

    /// Whether any live bytes remain.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The live region.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.start..]
    }

    /// Appends bytes at the tail.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Marks `n` bytes consumed from the head.
    pub fn consume(&mut self, n: usize) {
        self.start = (self.start + n).min(self.data.len());
        self.compact();
    }

    /// Drops all content and reclaims the consumed prefix.
    pub fn clear(&mut self) {
        self.data.clear();
        self.start = 0;
    }

    fn compact(&mut self) {
        if self.start == self.data.len() {
            self.clear();
        } else if self.start > self.len() {
            // consumed prefix dominates, shift the live region down
            self.data.copy_within(self.start.., 0);
            self.data.truncate(self.data.len() - self.start);
            self.start = 0;
        }
    }
}

impl Write for Buffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.extend(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
