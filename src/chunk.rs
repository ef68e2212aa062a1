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

use std::cmp;
use std::io;
use std::io::{Read, Write};

// largest allocation a chunk will grow to when no limit is set
pub const ARRAY_MAX_SIZE: usize = (i32::MAX - 8) as usize;

fn overflow_error() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "buffer overflow, no sink")
}

/// A window into an external byte region, addressed by index so the region
/// and the view can live in the same struct without a self-reference.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        assert!(start <= end);

        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn slice<'a>(&self, buf: &'a [u8]) -> &'a [u8] {
        &buf[self.start..self.end]
    }
}

/// Growable byte region with a read/write window. Data lives in
/// `[start..end)`. `limit` caps growth; refill sources and flush sinks are
/// passed to the operations that need them rather than stored, so a chunk
/// never owns or cycles with its channel.
pub struct ByteChunk {
    buf: Vec<u8>,
    start: usize,
    end: usize,
    limit: Option<usize>,
}

impl ByteChunk {
    pub fn new(initial: usize) -> Self {
        Self {
            buf: vec![0; initial],
            start: 0,
            end: 0,
            limit: None,
        }
    }

    pub fn with_limit(initial: usize, limit: usize) -> Self {
        assert!(initial <= limit);

        Self {
            buf: vec![0; initial],
            start: 0,
            end: 0,
            limit: Some(limit),
        }
    }

    pub fn set_limit(&mut self, limit: Option<usize>) {
        self.limit = limit;
    }

    fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(ARRAY_MAX_SIZE)
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn data(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    pub fn recycle(&mut self) {
        self.start = 0;
        self.end = 0;
    }

    /// Grow the backing storage so `count` more bytes fit, doubling up to the
    /// limit. Does nothing once the storage is already at the limit.
    pub fn make_space(&mut self, count: usize) {
        let limit = self.effective_limit();

        let desired = cmp::min(self.end.saturating_add(count), limit);

        if desired <= self.buf.len() {
            return;
        }

        let new_size = cmp::min(cmp::max(self.buf.len() * 2, desired), limit);

        let mut new_buf = vec![0; new_size];
        new_buf[..self.end].copy_from_slice(&self.buf[..self.end]);

        self.buf = new_buf;
    }

    pub fn append_byte(&mut self, b: u8, sink: Option<&mut dyn Write>) -> Result<(), io::Error> {
        self.make_space(1);

        if self.end >= self.effective_limit() {
            match sink {
                Some(sink) => self.flush(sink)?,
                None => return Err(overflow_error()),
            }
        }

        self.buf[self.end] = b;
        self.end += 1;

        Ok(())
    }

    pub fn append(&mut self, src: &[u8], mut sink: Option<&mut dyn Write>) -> Result<(), io::Error> {
        let limit = self.effective_limit();

        // an empty chunk receiving an exact-limit write goes straight to the
        // sink, skipping the copy
        if src.len() == limit && self.end == self.start {
            if let Some(sink) = sink.as_mut() {
                sink.write_all(src)?;
                return Ok(());
            }
        }

        self.make_space(src.len());

        if src.len() <= limit - self.end {
            self.buf[self.end..self.end + src.len()].copy_from_slice(src);
            self.end += src.len();
            return Ok(());
        }

        // won't fit: top up to the limit, flush, then stream whole buffers
        // until the remainder fits
        let avail = limit - self.end;
        self.buf[self.end..self.end + avail].copy_from_slice(&src[..avail]);
        self.end += avail;

        let sink = match sink {
            Some(sink) => sink,
            None => return Err(overflow_error()),
        };

        self.flush(sink)?;

        let mut remain = src.len() - avail;

        while remain > limit - self.end {
            let n = limit - self.end;
            sink.write_all(&src[src.len() - remain..src.len() - remain + n])?;
            remain -= n;
        }

        self.buf[self.end..self.end + remain].copy_from_slice(&src[src.len() - remain..]);
        self.end += remain;

        Ok(())
    }

    /// Pull up to `dest.len()` bytes out of the window, refilling from
    /// `source` when the window is empty. `None` means end of stream.
    pub fn substract(
        &mut self,
        dest: &mut [u8],
        source: Option<&mut dyn Read>,
    ) -> Result<Option<usize>, io::Error> {
        if self.end == self.start {
            let source = match source {
                Some(source) => source,
                None => return Ok(None),
            };

            let n = source.read(&mut self.buf)?;

            if n == 0 {
                return Ok(None);
            }

            self.start = 0;
            self.end = n;
        }

        let n = cmp::min(dest.len(), self.len());
        dest[..n].copy_from_slice(&self.buf[self.start..self.start + n]);
        self.start += n;

        Ok(Some(n))
    }

    /// Push `[start..end)` to the sink and reset the write position.
    pub fn flush(&mut self, sink: &mut dyn Write) -> Result<(), io::Error> {
        sink.write_all(&self.buf[self.start..self.end])?;
        self.end = self.start;

        Ok(())
    }

    pub fn find_byte(&self, b: u8) -> Option<usize> {
        self.data().iter().position(|&x| x == b)
    }

    pub fn starts_with(&self, prefix: &[u8]) -> bool {
        self.data().starts_with(prefix)
    }

    pub fn equals_ignore_case_ascii(&self, other: &[u8]) -> bool {
        self.data().eq_ignore_ascii_case(other)
    }
}

// formatting convenience for sink-less appends; overflow surfaces as an
// io error
impl Write for ByteChunk {
    fn write(&mut self, buf: &[u8]) -> Result<usize, io::Error> {
        self.append(buf, None)?;

        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), io::Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MyWriter {
        data: Vec<u8>,
    }

    impl MyWriter {
        fn new() -> Self {
            Self { data: Vec::new() }
        }
    }

    impl Write for MyWriter {
        fn write(&mut self, buf: &[u8]) -> Result<usize, io::Error> {
            self.data.extend_from_slice(buf);

            Ok(buf.len())
        }

        fn flush(&mut self) -> Result<(), io::Error> {
            Ok(())
        }
    }

    #[test]
    fn test_append_within_limit() {
        let mut c = ByteChunk::with_limit(4, 8);

        c.append(b"hel", None).unwrap();
        c.append(b"lo", None).unwrap();

        assert_eq!(c.data(), b"hello");
        assert_eq!(c.len(), 5);
    }

    #[test]
    fn test_append_grows_by_doubling() {
        let mut c = ByteChunk::with_limit(2, 64);

        c.append(b"abcdef", None).unwrap();

        assert_eq!(c.data(), b"abcdef");
    }

    #[test]
    fn test_append_exact_limit_writes_direct() {
        let mut w = MyWriter::new();
        let mut c = ByteChunk::with_limit(8, 8);

        c.append(b"12345678", Some(&mut w)).unwrap();

        assert_eq!(w.data, b"12345678");
        assert!(c.is_empty());
    }

    #[test]
    fn test_append_spills_to_sink() {
        let mut w = MyWriter::new();
        let mut c = ByteChunk::with_limit(4, 4);

        c.append(b"ab", None).unwrap();
        c.append(b"cdefghijk", Some(&mut w)).unwrap();

        // filled to the limit, flushed, streamed one full buffer, kept the tail
        assert_eq!(w.data, b"abcdefgh");
        assert_eq!(c.data(), b"ijk");
    }

    #[test]
    fn test_append_overflow_without_sink() {
        let mut c = ByteChunk::with_limit(4, 4);

        c.append(b"abcd", None).unwrap();
        assert!(c.append(b"e", None).is_err());
        assert!(c.append_byte(b'e', None).is_err());
    }

    #[test]
    fn test_append_byte_flushes_at_limit() {
        let mut w = MyWriter::new();
        let mut c = ByteChunk::with_limit(2, 2);

        c.append_byte(b'a', None).unwrap();
        c.append_byte(b'b', None).unwrap();
        c.append_byte(b'c', Some(&mut w)).unwrap();

        assert_eq!(w.data, b"ab");
        assert_eq!(c.data(), b"c");
    }

    #[test]
    fn test_substract() {
        let mut c = ByteChunk::new(8);

        c.append(b"hello", None).unwrap();

        let mut dest = [0; 3];
        let n = c.substract(&mut dest, None).unwrap().unwrap();
        assert_eq!(&dest[..n], b"hel");

        let n = c.substract(&mut dest, None).unwrap().unwrap();
        assert_eq!(&dest[..n], b"lo");

        assert_eq!(c.substract(&mut dest, None).unwrap(), None);
    }

    #[test]
    fn test_substract_refills_from_source() {
        let mut c = ByteChunk::new(4);
        let mut src = io::Cursor::new(b"abcdef".to_vec());

        let mut dest = [0; 8];

        let n = c
            .substract(&mut dest, Some(&mut src))
            .unwrap()
            .unwrap();
        assert_eq!(&dest[..n], b"abcd");

        let n = c
            .substract(&mut dest, Some(&mut src))
            .unwrap()
            .unwrap();
        assert_eq!(&dest[..n], b"ef");

        assert_eq!(c.substract(&mut dest, Some(&mut src)).unwrap(), None);
    }

    #[test]
    fn test_flush_resets_end() {
        let mut w = MyWriter::new();
        let mut c = ByteChunk::new(8);

        c.append(b"data", None).unwrap();
        c.flush(&mut w).unwrap();

        assert_eq!(w.data, b"data");
        assert!(c.is_empty());
    }

    #[test]
    fn test_search_helpers() {
        let mut c = ByteChunk::new(16);
        c.append(b"Content-Length", None).unwrap();

        assert_eq!(c.find_byte(b'-'), Some(7));
        assert_eq!(c.find_byte(b'!'), None);
        assert!(c.starts_with(b"Content"));
        assert!(!c.starts_with(b"content"));
        assert!(c.equals_ignore_case_ascii(b"content-length"));
        assert!(!c.equals_ignore_case_ascii(b"content-type"));
    }

    #[test]
    fn test_recycle() {
        let mut c = ByteChunk::new(8);
        c.append(b"x", None).unwrap();
        c.recycle();

        assert!(c.is_empty());
        assert_eq!(c.data(), b"");
    }

    #[test]
    fn test_span() {
        let buf = b"GET /a HTTP/1.1";
        let s = Span::new(4, 6);

        assert_eq!(s.len(), 2);
        assert_eq!(s.slice(buf), b"/a");
        assert!(Span::default().is_empty());
    }
}
