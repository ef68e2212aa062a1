/*
 * Copyright (C) 2025 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::chunk::Span;
use arrayvec::ArrayVec;

pub const HEADERS_MAX: usize = 128;

// stored names are already folded to lower case in the parse buffer
fn name_matches(stored: &[u8], name: &[u8]) -> bool {
    stored.len() == name.len()
        && stored
            .iter()
            .zip(name.iter())
            .all(|(a, b)| *a == b.to_ascii_lowercase())
}

/// Insertion-ordered header multimap. Names and values are windows into the
/// request parse buffer; the buffer is passed to lookups rather than held.
pub struct MimeHeaders {
    entries: ArrayVec<(Span, Span), HEADERS_MAX>,
}

impl MimeHeaders {
    pub fn new() -> Self {
        Self {
            entries: ArrayVec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn recycle(&mut self) {
        self.entries.clear();
    }

    /// False when the header table is full.
    pub fn add(&mut self, name: Span, value: Span) -> bool {
        self.entries.try_push((name, value)).is_ok()
    }

    /// First value for `name` in insertion order, compared case-insensitively.
    pub fn get<'b>(&self, buf: &'b [u8], name: &[u8]) -> Option<&'b [u8]> {
        self.entries
            .iter()
            .find(|(n, _)| name_matches(n.slice(buf), name))
            .map(|(_, v)| v.slice(buf))
    }

    pub fn contains(&self, buf: &[u8], name: &[u8]) -> bool {
        self.get(buf, name).is_some()
    }

    pub fn values<'a>(
        &'a self,
        buf: &'a [u8],
        name: &'a [u8],
    ) -> impl Iterator<Item = &'a [u8]> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| name_matches(n.slice(buf), name))
            .map(move |(_, v)| v.slice(buf))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Span, Span)> + '_ {
        self.entries.iter().copied()
    }
}
