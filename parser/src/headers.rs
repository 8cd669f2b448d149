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

//! Canonicalized multi-value header map.

const EMPTY: &[String] = &[];

/// Header fields keyed by canonical name, each holding its values in
/// insertion order.
///
/// Names are canonicalized to hyphen-separated title case on insertion
/// (`content-length` becomes `Content-Length`); lookups are
/// case-insensitive. Name order is preserved for serialization, value order
/// within a name is significant (`Set-Cookie`, `Cookie`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, Vec<String>)>,
}

impl HeaderMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Canonicalizes a header name: every hyphen-separated segment gets an
    /// uppercase first letter and lowercase remainder.
    pub fn canonical(name: &str) -> String {
        let mut out = String::with_capacity(name.len());
        let mut start_of_segment = true;

        for c in name.chars() {
            if c == '-' {
                start_of_segment = true;
                out.push(c);
            } else if start_of_segment {
                out.push(c.to_ascii_uppercase());
                start_of_segment = false;
            } else {
                out.push(c.to_ascii_lowercase());
            }
        }

        out
    }

    /// Appends a value under `name`, creating the entry if absent.
    pub fn append(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.entry_mut(name) {
            Some(values) => values.push(value),
            None => self.entries.push((Self::canonical(name), vec![value])),
        }
    }

    /// Replaces all values under `name` with a single value.
    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.entry_mut(name) {
            Some(values) => {
                values.clear();
                values.push(value);
            }
            None => self.entries.push((Self::canonical(name), vec![value])),
        }
    }

    /// Removes every value under `name`.
    pub fn remove(&mut self, name: &str) {
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    /// The first value under `name`, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entry(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// All values under `name`, in insertion order.
    pub fn get_all(&self, name: &str) -> &[String] {
        self.entry(name).map_or(EMPTY, Vec::as_slice)
    }

    /// Whether at least one value exists under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.entry(name).is_some()
    }

    /// The number of values stored under `name`.
    pub fn value_count(&self, name: &str) -> usize {
        self.entry(name).map_or(0, Vec::len)
    }

    /// Appends a continuation fragment to the most recently inserted value
    /// with a single interior space. Returns false when the map is empty.
    pub fn unfold_onto_last(&mut self, fragment: &str) -> bool {
        let Some(value) = self
            .entries
            .last_mut()
            .and_then(|(_, values)| values.last_mut())
        else {
            return false;
        };

        if !fragment.is_empty() {
            value.push(' ');
            value.push_str(fragment);
        }
        true
    }

    /// Iterates over `(canonical name, values)` pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> + '_ {
        self.entries
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    /// Number of distinct header names.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map holds no fields.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn entry(&self, name: &str) -> Option<&Vec<String>> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, values)| values)
    }

    fn entry_mut(&mut self, name: &str) -> Option<&mut Vec<String>> {
        self.entries
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, values)| values)
    }
}
