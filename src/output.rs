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

use crate::chunk::ByteChunk;
use crate::filters::{chain_write, OutputFilter};
use arrayvec::ArrayVec;
use std::io;
use std::io::Write;

pub const DEFAULT_HEADER_BUFFER_SIZE: usize = 8192;

// a configured socket buffer at or below this size stays disabled
pub const SOCKET_BUFFER_MIN: usize = 500;

// the raw socket sink under the output filter stack, optionally coalescing
// small writes before they hit the stream
struct SocketSink<'a> {
    socket_buf: &'a mut Option<ByteChunk>,
    stream: &'a mut dyn Write,
}

impl Write for SocketSink<'_> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, io::Error> {
        match self.socket_buf {
            Some(chunk) => chunk.append(buf, Some(&mut *self.stream))?,
            None => self.stream.write_all(buf)?,
        }

        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), io::Error> {
        if let Some(chunk) = self.socket_buf {
            chunk.flush(&mut *self.stream)?;
        }

        self.stream.flush()
    }
}

/// Response-side buffering: a header buffer the status line and headers are
/// formatted into, an optional socket buffer coalescing small writes, and a
/// per-request response buffer that holds body bytes while the response is
/// uncommitted so `Content-Length` can be derived on close.
pub struct OutputBuffer {
    header_buf: ByteChunk,
    socket_buf: Option<ByteChunk>,
    app_buf: ByteChunk,
    app_buf_limit: usize,
    filters: ArrayVec<OutputFilter, 4>,
    committed: bool,
    finished: bool,
    body_bytes: u64,
}

impl OutputBuffer {
    pub fn new(header_size: usize, socket_buffer_size: usize) -> Self {
        let socket_buf = if socket_buffer_size > SOCKET_BUFFER_MIN {
            Some(ByteChunk::with_limit(socket_buffer_size, socket_buffer_size))
        } else {
            None
        };

        Self {
            header_buf: ByteChunk::with_limit(header_size, header_size),
            socket_buf,
            app_buf: ByteChunk::with_limit(header_size, header_size),
            app_buf_limit: header_size,
            filters: ArrayVec::new(),
            committed: false,
            finished: false,
            body_bytes: 0,
        }
    }

    pub fn committed(&self) -> bool {
        self.committed
    }

    pub fn finished(&self) -> bool {
        self.finished
    }

    pub fn buffered_len(&self) -> usize {
        self.app_buf.len()
    }

    pub fn body_bytes(&self) -> u64 {
        self.body_bytes
    }

    /// Whether `n` more bytes fit in the response buffer without forcing a
    /// commit.
    pub fn buffer_fits(&self, n: usize) -> bool {
        self.app_buf.len() + n <= self.app_buf_limit
    }

    pub fn buffer_body(&mut self, data: &[u8]) -> Result<(), io::Error> {
        self.app_buf.append(data, None)?;
        self.body_bytes += data.len() as u64;

        Ok(())
    }

    pub fn write_status(&mut self, status: u16, reason: &str) -> Result<(), io::Error> {
        write!(self.header_buf, "HTTP/1.1 {} {}\r\n", status, reason)
    }

    pub fn write_header(&mut self, name: &str, value: &str) -> Result<(), io::Error> {
        write!(self.header_buf, "{}: {}\r\n", name, value)
    }

    pub fn end_headers(&mut self) -> Result<(), io::Error> {
        self.header_buf.append(b"\r\n", None)
    }

    pub fn add_active_filter(&mut self, filter: OutputFilter) {
        self.filters.push(filter);
    }

    /// Send the formatted headers to the socket. Past this point headers can
    /// no longer be changed.
    pub fn commit(&mut self, stream: &mut dyn Write) -> Result<(), io::Error> {
        {
            let Self {
                header_buf,
                socket_buf,
                ..
            } = self;

            let mut sink = SocketSink { socket_buf, stream };

            header_buf.flush(&mut sink)?;
        }

        self.committed = true;

        Ok(())
    }

    /// Write body bytes through the active output filters.
    pub fn write_body(&mut self, data: &[u8], stream: &mut dyn Write) -> Result<(), io::Error> {
        {
            let Self {
                filters,
                socket_buf,
                ..
            } = self;

            let mut sink = SocketSink { socket_buf, stream };

            chain_write(filters, &mut sink, data)?;
        }

        self.body_bytes += data.len() as u64;

        Ok(())
    }

    /// Push the response buffer's content through the filters. Called at
    /// commit time; after this the response buffer is empty.
    pub fn flush_app_buf(&mut self, stream: &mut dyn Write) -> Result<(), io::Error> {
        {
            let Self {
                app_buf,
                filters,
                socket_buf,
                ..
            } = self;

            let mut sink = SocketSink { socket_buf, stream };

            chain_write(filters, &mut sink, app_buf.data())?;
        }

        self.app_buf.recycle();

        Ok(())
    }

    /// Unwind the active filters in reverse activation order, writing any
    /// trailer bytes, then flush everything to the stream.
    pub fn end_body(&mut self, stream: &mut dyn Write) -> Result<(), io::Error> {
        {
            let Self {
                filters,
                socket_buf,
                ..
            } = self;

            let mut sink = SocketSink { socket_buf, stream };

            for i in (0..filters.len()).rev() {
                let (below, rest) = filters.split_at_mut(i);
                rest[0].end(below, &mut sink)?;
            }

            sink.flush()?;
        }

        self.filters.clear();
        self.finished = true;

        Ok(())
    }

    pub fn flush(&mut self, stream: &mut dyn Write) -> Result<(), io::Error> {
        let Self { socket_buf, .. } = self;

        let mut sink = SocketSink { socket_buf, stream };

        sink.flush()
    }

    pub fn recycle(&mut self) {
        self.header_buf.recycle();
        self.app_buf.recycle();

        if let Some(chunk) = &mut self.socket_buf {
            chunk.recycle();
        }

        self.filters.clear();
        self.committed = false;
        self.finished = false;
        self.body_bytes = 0;
    }
}
