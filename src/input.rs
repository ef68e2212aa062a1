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
use crate::filters::{chain_read, InputFilter};
use crate::http::*;
use crate::net::SocketChannel;
use arrayvec::ArrayVec;
use log::debug;
use std::cmp;
use std::mem;
use std::time::Instant;

pub const DEFAULT_BUFFER_SIZE: usize = 8192;

// once headers leave less than this much room, the body gets a fresh buffer
// and the old one is retained for the header views until recycle
const BODY_SWAP_THRESHOLD: usize = 4500;

/// Fixed-size parse buffer. `pos` is the next unread byte, `last_valid` one
/// past the last filled byte, `end` the end of the header region once header
/// parsing completes. The request line and headers are parsed in place; all
/// request views are windows into this buffer.
pub struct ParseBuffer {
    buf: Vec<u8>,
    header_buf: Option<Vec<u8>>,
    pos: usize,
    last_valid: usize,
    end: usize,
    parsing_header: bool,
    request_line_started: bool,
    reject_illegal_header_name: bool,
}

impl ParseBuffer {
    pub fn new(size: usize, reject_illegal_header_name: bool) -> Self {
        Self {
            buf: vec![0; size],
            header_buf: None,
            pos: 0,
            last_valid: 0,
            end: 0,
            parsing_header: true,
            request_line_started: false,
            reject_illegal_header_name,
        }
    }

    /// The buffer the header/URI views index into. After the body-transition
    /// swap this is the retained original allocation.
    pub fn header_bytes(&self) -> &[u8] {
        self.header_buf.as_deref().unwrap_or(&self.buf)
    }

    /// The buffer body-read spans index into. Only valid until the next fill.
    pub fn body_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn request_line_started(&self) -> bool {
        self.request_line_started
    }

    fn fill(&mut self, ch: &mut dyn SocketChannel) -> Result<bool, HttpError> {
        let n;

        if self.parsing_header {
            if self.last_valid == self.buf.len() {
                return Err(HttpError::RequestHeaderTooLarge);
            }

            n = ch.read(&mut self.buf[self.last_valid..])?;

            if n > 0 {
                self.last_valid = self.pos + n;
            }
        } else {
            if self.buf.len() - self.end < BODY_SWAP_THRESHOLD {
                let fresh = vec![0; self.buf.len()];
                let old = mem::replace(&mut self.buf, fresh);

                if self.header_buf.is_none() {
                    self.header_buf = Some(old);
                }

                self.end = 0;
            }

            self.pos = self.end;
            self.last_valid = self.pos;

            n = ch.read(&mut self.buf[self.pos..])?;

            if n > 0 {
                self.last_valid = self.pos + n;
            }
        }

        Ok(n > 0)
    }

    fn fill_required(&mut self, ch: &mut dyn SocketChannel) -> Result<(), HttpError> {
        if !self.fill(ch)? {
            return Err(HttpError::UnexpectedEof);
        }

        Ok(())
    }

    /// Parse the request line into `req`. Method, URI, query and protocol
    /// become windows into the parse buffer; nothing is copied.
    pub fn parse_request_line(
        &mut self,
        req: &mut Request,
        ch: &mut dyn SocketChannel,
    ) -> Result<(), HttpError> {
        // skip blank lines left over from the previous exchange
        let mut c;

        loop {
            if self.pos >= self.last_valid {
                self.fill_required(ch)?;
            }

            if req.start_time.is_none() {
                req.start_time = Some(Instant::now());
            }

            c = self.buf[self.pos];
            self.pos += 1;

            if c != CR && c != LF {
                break;
            }
        }

        self.pos -= 1;
        self.request_line_started = true;

        // method: token bytes up to SP/HT
        let start = self.pos;

        loop {
            if self.pos >= self.last_valid {
                self.fill_required(ch)?;
            }

            let b = self.buf[self.pos];

            if b == SP || b == HT {
                req.method = Span::new(start, self.pos);
                self.pos += 1;
                break;
            }

            if !is_token(b) {
                return Err(HttpError::InvalidMethod);
            }

            self.pos += 1;
        }

        self.skip_spaces(ch)?;

        // request target. a CR/LF terminator here is an HTTP/0.9 line
        let start = self.pos;
        let end;
        let mut question_pos = None;
        let mut http09 = false;

        loop {
            if self.pos >= self.last_valid {
                self.fill_required(ch)?;
            }

            let b = self.buf[self.pos];

            if b == SP || b == HT {
                end = self.pos;
                self.pos += 1;
                break;
            } else if b == CR || b == LF {
                end = self.pos;
                http09 = true;
                self.pos += 1;
                break;
            } else if b == QUESTION && question_pos.is_none() {
                question_pos = Some(self.pos);
            } else if question_pos.is_some() {
                if !is_query_relaxed(b) {
                    return Err(HttpError::InvalidRequestTarget);
                }
            } else if !is_request_target_relaxed(b) {
                return Err(HttpError::InvalidRequestTarget);
            }

            self.pos += 1;
        }

        req.unparsed_uri = Span::new(start, end);

        if let Some(q) = question_pos {
            req.query = Some(Span::new(q + 1, end));
            req.uri = Span::new(start, q);
        } else {
            req.query = None;
            req.uri = Span::new(start, end);
        }

        if http09 {
            req.protocol = Span::default();
            return Ok(());
        }

        self.skip_spaces(ch)?;

        // protocol: HTTP/x.y, terminated by CRLF or a lone LF
        let start = self.pos;
        let mut end = 0;

        loop {
            if self.pos >= self.last_valid {
                self.fill_required(ch)?;
            }

            let b = self.buf[self.pos];

            if b == CR {
                end = self.pos;
            } else if b == LF {
                if end == 0 {
                    end = self.pos;
                }

                self.pos += 1;
                break;
            } else if !is_http_protocol(b) {
                return Err(HttpError::InvalidHttpProtocol);
            }

            self.pos += 1;
        }

        if end > start {
            req.protocol = Span::new(start, end);
        } else {
            req.protocol = Span::default();
        }

        Ok(())
    }

    fn skip_spaces(&mut self, ch: &mut dyn SocketChannel) -> Result<(), HttpError> {
        loop {
            if self.pos >= self.last_valid {
                self.fill_required(ch)?;
            }

            let b = self.buf[self.pos];

            if b == SP || b == HT {
                self.pos += 1;
            } else {
                return Ok(());
            }
        }
    }

    /// Parse headers until the blank line, folding names to lower case in
    /// place and compacting values over obsolete line folds.
    pub fn parse_headers(
        &mut self,
        req: &mut Request,
        ch: &mut dyn SocketChannel,
    ) -> Result<(), HttpError> {
        while self.parse_header(req, ch)? {}

        self.parsing_header = false;
        self.end = self.pos;

        Ok(())
    }

    /// Called instead of parse_headers for HTTP/0.9 requests, which have none.
    pub fn end_header_phase(&mut self) {
        self.parsing_header = false;
        self.end = self.pos;
    }

    fn parse_header(
        &mut self,
        req: &mut Request,
        ch: &mut dyn SocketChannel,
    ) -> Result<bool, HttpError> {
        // blank line means end of headers
        loop {
            if self.pos >= self.last_valid {
                self.fill_required(ch)?;
            }

            let c = self.buf[self.pos];

            if c == CR {
                self.pos += 1;
            } else if c == LF {
                self.pos += 1;
                return Ok(false);
            } else {
                break;
            }
        }

        // header name, folded to lower case as it is scanned
        let start = self.pos;
        let name;

        loop {
            if self.pos >= self.last_valid {
                self.fill_required(ch)?;
            }

            let b = self.buf[self.pos];

            if b == COLON {
                name = Span::new(start, self.pos);
                self.pos += 1;
                break;
            }

            if !is_token(b) {
                self.skip_line(start, ch)?;
                return Ok(true);
            }

            if b.is_ascii_uppercase() {
                self.buf[self.pos] = b.to_ascii_lowercase();
            }

            self.pos += 1;
        }

        // header value. reads may outrun writes because spaces are compacted
        // and CR/LF stripped, so the value is rewritten at real_pos
        let vstart = self.pos;
        let mut real_pos = self.pos;
        let mut eol = false;
        let mut valid_line = true;

        while valid_line {
            // leading whitespace of each value line is dropped
            loop {
                if self.pos >= self.last_valid {
                    self.fill_required(ch)?;
                }

                let b = self.buf[self.pos];

                if b == SP || b == HT {
                    self.pos += 1;
                } else {
                    break;
                }
            }

            let mut last_significant = real_pos;

            while !eol {
                if self.pos >= self.last_valid {
                    self.fill_required(ch)?;
                }

                let b = self.buf[self.pos];

                if b == CR {
                    // skip
                } else if b == LF {
                    eol = true;
                } else if b == SP {
                    self.buf[real_pos] = b;
                    real_pos += 1;
                } else {
                    self.buf[real_pos] = b;
                    real_pos += 1;
                    last_significant = real_pos;
                }

                self.pos += 1;
            }

            real_pos = last_significant;

            // a SP/HT on the next line is an obsolete fold: merge with one SP
            if self.pos >= self.last_valid {
                self.fill_required(ch)?;
            }

            let b = self.buf[self.pos];

            if b != SP && b != HT {
                valid_line = false;
            } else {
                eol = false;
                self.buf[real_pos] = SP;
                real_pos += 1;
            }
        }

        let value = Span::new(vstart, real_pos);

        if !req.headers.add(name, value) {
            return Err(HttpError::RequestHeaderTooLarge);
        }

        Ok(true)
    }

    // consume an illegal header line through its LF so parsing can continue
    fn skip_line(&mut self, start: usize, ch: &mut dyn SocketChannel) -> Result<(), HttpError> {
        let mut last_real = if self.pos > start + 1 {
            self.pos - 1
        } else {
            start
        };

        loop {
            if self.pos >= self.last_valid {
                self.fill_required(ch)?;
            }

            let b = self.buf[self.pos];
            self.pos += 1;

            if b == CR {
                // skip
            } else if b == LF {
                break;
            } else {
                last_real = self.pos - 1;
            }
        }

        if self.reject_illegal_header_name {
            return Err(HttpError::InvalidHeaderName);
        }

        debug!(
            "dropped illegal header: {:?}",
            String::from_utf8_lossy(&self.buf[start..last_real + 1])
        );

        Ok(())
    }

    /// Raw body read: expose up to `max` unread bytes as a window and advance
    /// `pos` past them in one shot. `None` means end of stream.
    pub fn raw_read(
        &mut self,
        ch: &mut dyn SocketChannel,
        max: usize,
    ) -> Result<Option<Span>, HttpError> {
        if self.pos >= self.last_valid {
            if !self.fill(ch)? {
                return Ok(None);
            }
        }

        let len = cmp::min(self.last_valid - self.pos, max);
        let span = Span::new(self.pos, self.pos + len);
        self.pos += len;

        Ok(Some(span))
    }

    /// Hand back raw bytes a filter pulled but did not consume; they belong
    /// to the next request on the connection.
    pub fn rewind(&mut self, span: Span) {
        debug_assert!(span.end == self.pos);
        debug_assert!(span.start <= self.pos);

        self.pos = span.start;
    }

    /// Reset for the next request on the same connection, carrying any
    /// pipelined bytes to the front of the buffer.
    pub fn next_request(&mut self) {
        if self.pos < self.last_valid {
            let len = self.last_valid - self.pos;
            self.buf.copy_within(self.pos..self.last_valid, 0);
            self.pos = 0;
            self.last_valid = len;
        } else {
            self.pos = 0;
            self.last_valid = 0;
        }

        self.header_buf = None;
        self.end = 0;
        self.parsing_header = true;
        self.request_line_started = false;
    }

    pub fn recycle(&mut self) {
        self.header_buf = None;
        self.pos = 0;
        self.last_valid = 0;
        self.end = 0;
        self.parsing_header = true;
        self.request_line_started = false;
    }
}

/// Parse buffer plus the per-request stack of body-decoding filters.
pub struct InputBuffer {
    pub(crate) core: ParseBuffer,
    active_filters: ArrayVec<InputFilter, 4>,
}

impl InputBuffer {
    pub fn new(size: usize, reject_illegal_header_name: bool) -> Self {
        Self {
            core: ParseBuffer::new(size, reject_illegal_header_name),
            active_filters: ArrayVec::new(),
        }
    }

    pub fn parse_request_line(
        &mut self,
        req: &mut Request,
        ch: &mut dyn SocketChannel,
    ) -> Result<(), HttpError> {
        self.core.parse_request_line(req, ch)
    }

    pub fn parse_headers(
        &mut self,
        req: &mut Request,
        ch: &mut dyn SocketChannel,
    ) -> Result<(), HttpError> {
        self.core.parse_headers(req, ch)
    }

    pub fn add_active_filter(&mut self, filter: InputFilter) {
        self.active_filters.push(filter);
    }

    /// Decoded body bytes as a window into the parse buffer, valid until the
    /// next read. `None` is end of body.
    pub fn read_body(&mut self, ch: &mut dyn SocketChannel) -> Result<Option<Span>, HttpError> {
        let Self {
            core,
            active_filters,
        } = self;

        chain_read(active_filters, core, ch, usize::MAX)
    }

    /// Unwind the active filters in reverse activation order, draining any
    /// unread body so the connection lands on the next request boundary.
    pub fn end_request(&mut self, ch: &mut dyn SocketChannel) -> Result<(), HttpError> {
        let Self {
            core,
            active_filters,
        } = self;

        for i in (0..active_filters.len()).rev() {
            let (below, rest) = active_filters.split_at_mut(i);
            rest[0].end(below, core, ch)?;
        }

        active_filters.clear();

        Ok(())
    }

    pub fn view(&self, span: Span) -> &[u8] {
        span.slice(self.core.header_bytes())
    }

    pub fn next_request(&mut self) {
        self.core.next_request();
        self.active_filters.clear();
    }

    pub fn recycle(&mut self) {
        self.core.recycle();
        self.active_filters.clear();
    }
}
