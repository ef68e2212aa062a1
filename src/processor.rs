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
use crate::config::Config;
use crate::endpoint::{ProtocolHandler, SocketState, SocketStatus, SocketWrapper};
use crate::filters::{InputFilter, OutputFilter};
use crate::http::*;
use crate::input::InputBuffer;
use crate::net::SocketChannel;
use crate::output::OutputBuffer;
use log::debug;
use std::cmp;
use std::collections::HashMap;
use std::io;
use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

/// The application collaborator. The engine parses the request and finalizes
/// the response framing; everything in between belongs to the adapter.
pub trait Adapter: Send + Sync {
    fn service(&self, exchange: &mut Exchange<'_>) -> Result<(), io::Error>;
}

// lets a SocketChannel stand in where only a Write sink is needed
struct ChannelWriter<'a>(&'a mut dyn SocketChannel);

impl Write for ChannelWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, io::Error> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> Result<(), io::Error> {
        self.0.flush()
    }
}

enum Framing {
    NoBody,
    Length(i64),
    Chunked,
    CloseDelimited,
}

// Select body framing, format the header block, install the output filters
// and send the headers. Shared by the in-flight commit (first byte forced out
// by the application) and the close path.
#[allow(clippy::too_many_arguments)]
fn prepare_and_commit(
    output: &mut OutputBuffer,
    response: &mut Response,
    http11: bool,
    http09: bool,
    is_head: bool,
    accepts_gzip: bool,
    allow_compression: bool,
    keep_alive: &mut bool,
    ch: &mut dyn SocketChannel,
) -> Result<(), io::Error> {
    if http09 {
        // no status line or headers on the wire for an HTTP/0.9 exchange
        output.add_active_filter(OutputFilter::identity(-1));
        *keep_alive = false;
        output.commit(&mut ChannelWriter(&mut *ch))?;
        response.committed = true;
        output.flush_app_buf(&mut ChannelWriter(&mut *ch))?;

        return Ok(());
    }

    let status = response.status;
    let no_body = matches!(status, 204 | 205 | 304) || (100..200).contains(&status);

    let framing = if no_body {
        Framing::NoBody
    } else if response.content_length >= 0 {
        Framing::Length(response.content_length)
    } else if http11 {
        Framing::Chunked
    } else {
        Framing::CloseDelimited
    };

    if matches!(framing, Framing::CloseDelimited) {
        *keep_alive = false;
    }

    let gzip = allow_compression
        && accepts_gzip
        && !no_body
        && !is_head
        && response.content_length < 0;

    output.write_status(status, response.reason())?;

    for (name, value) in response.headers() {
        // framing and connection management belong to the engine
        if name.eq_ignore_ascii_case("Content-Length")
            || name.eq_ignore_ascii_case("Transfer-Encoding")
            || name.eq_ignore_ascii_case("Connection")
            || (gzip && name.eq_ignore_ascii_case("Content-Encoding"))
        {
            continue;
        }

        output.write_header(name, value)?;
    }

    if let Some(ct) = response.content_type.clone() {
        output.write_header("Content-Type", &ct)?;
    }

    if gzip {
        output.write_header("Content-Encoding", "gzip")?;
    }

    match framing {
        Framing::NoBody => {}
        Framing::Length(n) => {
            output.write_header("Content-Length", &n.to_string())?;
        }
        Framing::Chunked => {
            output.write_header("Transfer-Encoding", "chunked")?;
        }
        Framing::CloseDelimited => {}
    }

    if !*keep_alive {
        output.write_header("Connection", "close")?;
    } else if !http11 {
        output.write_header("Connection", "keep-alive")?;
    }

    output.end_headers()?;

    match framing {
        Framing::NoBody => output.add_active_filter(OutputFilter::void()),
        Framing::Length(n) => output.add_active_filter(OutputFilter::identity(n)),
        Framing::Chunked => output.add_active_filter(OutputFilter::chunked()),
        Framing::CloseDelimited => output.add_active_filter(OutputFilter::identity(-1)),
    }

    if gzip {
        output.add_active_filter(OutputFilter::gzip());
    }

    output.commit(&mut ChannelWriter(&mut *ch))?;
    response.committed = true;
    output.flush_app_buf(&mut ChannelWriter(&mut *ch))?;

    Ok(())
}

/// What the adapter sees for one request/response exchange: the parsed
/// request views, the decoded body read path, and the buffered response
/// write path.
pub struct Exchange<'a> {
    request: &'a Request,
    input: &'a mut InputBuffer,
    response: &'a mut Response,
    output: &'a mut OutputBuffer,
    ch: &'a mut dyn SocketChannel,
    http11: bool,
    http09: bool,
    allow_compression: bool,
    keep_alive: &'a mut bool,
    expect_100: &'a mut bool,
    pending: Span,
}

impl Exchange<'_> {
    pub fn method(&self) -> &[u8] {
        self.input.view(self.request.method)
    }

    pub fn uri(&self) -> &[u8] {
        self.input.view(self.request.uri)
    }

    pub fn unparsed_uri(&self) -> &[u8] {
        self.input.view(self.request.unparsed_uri)
    }

    pub fn query(&self) -> Option<&[u8]> {
        self.request.query.map(|q| self.input.view(q))
    }

    pub fn protocol(&self) -> &[u8] {
        self.input.view(self.request.protocol)
    }

    pub fn header(&self, name: &[u8]) -> Option<&[u8]> {
        self.request.headers.get(self.input.core.header_bytes(), name)
    }

    pub fn content_length(&self) -> i64 {
        self.request.content_length
    }

    pub fn remote_addr(&self) -> Option<std::net::SocketAddr> {
        self.request.remote_addr
    }

    /// Read decoded body bytes. Returns 0 at end of body.
    pub fn read_body(&mut self, dest: &mut [u8]) -> Result<usize, io::Error> {
        if dest.is_empty() {
            return Ok(0);
        }

        if *self.expect_100 {
            self.ch.write_all(b"HTTP/1.1 100 Continue\r\n\r\n")?;
            self.ch.flush()?;
            *self.expect_100 = false;
        }

        if self.pending.is_empty() {
            match self.input.read_body(&mut *self.ch)? {
                Some(span) => self.pending = span,
                None => return Ok(0),
            }
        }

        let n = cmp::min(dest.len(), self.pending.len());
        let start = self.pending.start;

        dest[..n].copy_from_slice(&self.input.core.body_bytes()[start..start + n]);
        self.pending.start += n;

        Ok(n)
    }

    pub fn set_status(&mut self, status: u16) {
        self.response.status = status;
    }

    pub fn set_message(&mut self, message: &str) {
        self.response.message = Some(message.to_string());
    }

    pub fn set_content_type(&mut self, content_type: &str) {
        self.response.content_type = Some(content_type.to_string());
    }

    pub fn set_content_length(&mut self, len: i64) {
        self.response.content_length = len;
    }

    pub fn add_header(&mut self, name: &str, value: &str) {
        self.response.add_header(name, value);
    }

    pub fn set_header(&mut self, name: &str, value: &str) {
        self.response.set_header(name, value);
    }

    pub fn committed(&self) -> bool {
        self.output.committed()
    }

    fn commit_response(&mut self) -> Result<(), io::Error> {
        let is_head = self.method() == b"HEAD";

        let accepts_gzip = self
            .header(b"accept-encoding")
            .map(|v| header_contains_param(v, b"gzip"))
            .unwrap_or(false);

        prepare_and_commit(
            &mut *self.output,
            &mut *self.response,
            self.http11,
            self.http09,
            is_head,
            accepts_gzip,
            self.allow_compression,
            &mut *self.keep_alive,
            &mut *self.ch,
        )
    }

    /// Write body bytes. Small writes are buffered until commit so the
    /// response can close with an exact `Content-Length`.
    pub fn write(&mut self, data: &[u8]) -> Result<(), io::Error> {
        if self.output.committed() {
            return self.output.write_body(data, &mut ChannelWriter(&mut *self.ch));
        }

        if self.output.buffer_fits(data.len()) {
            return self.output.buffer_body(data);
        }

        self.commit_response()?;
        self.output.write_body(data, &mut ChannelWriter(&mut *self.ch))
    }

    /// Force the response out: commits if necessary and drains the buffers
    /// to the socket.
    pub fn flush(&mut self) -> Result<(), io::Error> {
        if !self.output.committed() {
            self.commit_response()?;
        }

        self.output.flush(&mut ChannelWriter(&mut *self.ch))
    }
}

/// Per-connection HTTP/1.1 state machine. One call to `process` drives one
/// request/response exchange; `Open` hands the connection back to the
/// endpoint for the next one.
pub struct Http11Processor {
    input: InputBuffer,
    output: OutputBuffer,
    request: Request,
    response: Response,
    http11: bool,
    http09: bool,
    keep_alive: bool,
    error: bool,
    expect_100: bool,
    request_count: i32,
    max_keep_alive_requests: i32,
    connection_timeout: Duration,
    keep_alive_timeout: Duration,
    allow_compression: bool,
}

impl Http11Processor {
    pub fn new(config: &Config) -> Self {
        Self {
            input: InputBuffer::new(
                config.max_http_header_size,
                config.reject_illegal_header_name,
            ),
            output: OutputBuffer::new(config.max_http_header_size, config.socket_buffer),
            request: Request::new(),
            response: Response::new(),
            http11: true,
            http09: false,
            keep_alive: true,
            error: false,
            expect_100: false,
            request_count: 0,
            max_keep_alive_requests: config.max_keep_alive_requests,
            connection_timeout: config.connection_timeout(),
            keep_alive_timeout: config.keep_alive_timeout(),
            allow_compression: config.allow_compression,
        }
    }

    pub fn process(
        &mut self,
        ch: &mut dyn SocketChannel,
        status: SocketStatus,
        adapter: &dyn Adapter,
    ) -> SocketState {
        if !matches!(status, SocketStatus::OpenRead) {
            // timeout/disconnect dispatch: the exchange is over
            return SocketState::Closed;
        }

        self.http11 = true;
        self.http09 = false;
        self.keep_alive = true;
        self.error = false;
        self.expect_100 = false;

        self.request_count += 1;

        if self.max_keep_alive_requests == 1
            || (self.max_keep_alive_requests > 0
                && self.request_count >= self.max_keep_alive_requests)
        {
            self.keep_alive = false;
        }

        // the keep-alive timeout only governs the gap between requests
        let line_timeout = if self.request_count > 1 {
            self.keep_alive_timeout
        } else {
            self.connection_timeout
        };

        let _ = ch.set_read_timeout(Some(line_timeout));

        match self.input.parse_request_line(&mut self.request, ch) {
            Ok(()) => {}
            Err(HttpError::UnexpectedEof) | Err(HttpError::SocketTimeout)
                if !self.input.core.request_line_started() =>
            {
                // idle keep-alive connection went away; not an error
                return SocketState::Closed;
            }
            Err(HttpError::UnexpectedEof) | Err(HttpError::SocketTimeout) => {
                debug!("connection lost mid request line");
                return SocketState::Closed;
            }
            Err(HttpError::RequestHeaderTooLarge) => return self.early_error(414, ch),
            Err(HttpError::InvalidMethod)
            | Err(HttpError::InvalidRequestTarget)
            | Err(HttpError::InvalidHttpProtocol) => return self.early_error(400, ch),
            Err(e) => {
                debug!("request line error: {}", e);
                return SocketState::Closed;
            }
        }

        let _ = ch.set_read_timeout(Some(self.connection_timeout));

        {
            let protocol = self.input.view(self.request.protocol);

            if protocol.is_empty() {
                self.http09 = true;
                self.http11 = false;
                self.keep_alive = false;
            } else if protocol == b"HTTP/1.1" {
                self.http11 = true;
            } else if protocol == b"HTTP/1.0" {
                self.http11 = false;
            } else {
                return self.early_error(505, ch);
            }
        }

        if self.http09 {
            self.input.core.end_header_phase();
        } else {
            match self.input.parse_headers(&mut self.request, ch) {
                Ok(()) => {}
                Err(HttpError::RequestHeaderTooLarge) => return self.early_error(431, ch),
                Err(HttpError::InvalidHeaderName) => return self.early_error(400, ch),
                Err(e) => {
                    debug!("header parse error: {}", e);
                    return SocketState::Closed;
                }
            }
        }

        self.request.remote_addr = ch.peer_addr();

        if let Err(status) = self.prepare_request() {
            return self.early_error(status, ch);
        }

        let http11 = self.http11;
        let http09 = self.http09;
        let allow_compression = self.allow_compression;

        let served = {
            let Self {
                input,
                output,
                request,
                response,
                keep_alive,
                expect_100,
                ..
            } = self;

            let mut exchange = Exchange {
                request,
                input,
                response,
                output,
                ch: &mut *ch,
                http11,
                http09,
                allow_compression,
                keep_alive,
                expect_100,
                pending: Span::default(),
            };

            adapter.service(&mut exchange)
        };

        match served {
            Ok(()) => {
                if let Err(e) = self.finish_response(ch) {
                    debug!("response finish failed: {}", e);
                    self.response.write_error = Some(e);
                    self.error = true;
                }
            }
            Err(e) => {
                if self.output.committed() {
                    debug!("adapter failed after commit: {}", e);
                    self.response.write_error = Some(e);
                    self.error = true;
                } else {
                    debug!("adapter failed: {}", e);
                    return self.early_error(500, ch);
                }
            }
        }

        if !self.error && !self.http09 {
            if let Err(e) = self.input.end_request(ch) {
                debug!("input drain failed: {}", e);
                self.error = true;
            }
        }

        if self.error || !self.keep_alive {
            return SocketState::Closed;
        }

        self.input.next_request();
        self.request.recycle();
        self.response.recycle();
        self.output.recycle();

        SocketState::Open
    }

    // Resolve Host/Content-Length/Transfer-Encoding/Expect/Connection and
    // install the matching input filter. An Err is the status to fail with.
    fn prepare_request(&mut self) -> Result<(), u16> {
        let mut chunked = false;
        let mut content_length = None;

        if !self.http09 {
            let buf = self.input.core.header_bytes();
            let headers = &self.request.headers;

            if let Some(value) = headers.get(buf, b"transfer-encoding") {
                if !self.http11 || !value.eq_ignore_ascii_case(b"chunked") {
                    return Err(501);
                }

                chunked = true;
            }

            if !chunked {
                if let Some(value) = headers.get(buf, b"content-length") {
                    match parse_content_length(value) {
                        Some(len) => content_length = Some(len),
                        None => return Err(400),
                    }
                }
            }

            let mut close = false;
            let mut keep_alive_token = false;

            for value in headers.values(buf, b"connection") {
                if header_contains_param(value, b"close") {
                    close = true;
                }

                if header_contains_param(value, b"keep-alive") {
                    keep_alive_token = true;
                }
            }

            let persistent = if self.http11 {
                !close
            } else {
                keep_alive_token && !close
            };

            if !persistent {
                self.keep_alive = false;
            }

            if self.http11 {
                if let Some(value) = headers.get(buf, b"expect") {
                    if header_contains_param(value, b"100-continue") {
                        self.expect_100 = true;
                    }
                }

                if !headers.contains(buf, b"host") {
                    return Err(400);
                }
            }
        }

        if chunked {
            self.request.content_length = -1;
            self.input.add_active_filter(InputFilter::chunked());
        } else if let Some(len) = content_length {
            self.request.content_length = len;
            self.input.add_active_filter(InputFilter::identity(len as u64));
        } else {
            self.input.add_active_filter(InputFilter::void());
        }

        // a request with no body has nothing to acknowledge
        if self.request.content_length < 0 && !chunked {
            self.expect_100 = false;
        }

        Ok(())
    }

    fn finish_response(&mut self, ch: &mut dyn SocketChannel) -> Result<(), io::Error> {
        if !self.output.committed() {
            let is_head = self.input.view(self.request.method) == b"HEAD";

            if self.response.content_length == -1 && !is_head && !self.http09 {
                self.response.content_length = self.output.buffered_len() as i64;
            }

            let accepts_gzip = self
                .request
                .headers
                .get(self.input.core.header_bytes(), b"accept-encoding")
                .map(|v| header_contains_param(v, b"gzip"))
                .unwrap_or(false);

            prepare_and_commit(
                &mut self.output,
                &mut self.response,
                self.http11,
                self.http09,
                is_head,
                accepts_gzip,
                self.allow_compression,
                &mut self.keep_alive,
                ch,
            )?;
        }

        self.output.end_body(&mut ChannelWriter(&mut *ch))
    }

    // best-effort error response before closing; nothing is sent if the
    // response already hit the wire
    fn early_error(&mut self, status: u16, ch: &mut dyn SocketChannel) -> SocketState {
        self.error = true;

        if !self.output.committed() {
            self.response.recycle();
            self.response.status = status;

            let _ = self.output.write_status(status, default_reason(status));
            let _ = self.output.write_header("Content-Length", "0");
            let _ = self.output.write_header("Connection", "close");
            let _ = self.output.end_headers();
            let _ = self.output.commit(&mut ChannelWriter(&mut *ch));
            let _ = self.output.flush(&mut ChannelWriter(&mut *ch));
        }

        SocketState::Closed
    }
}

/// Bridges the endpoint to per-connection processors: each wrapper id maps to
/// a processor that survives across keep-alive exchanges.
pub struct Http11Handler<A> {
    adapter: A,
    config: Config,
    processors: Mutex<HashMap<u64, Box<Http11Processor>>>,
}

impl<A: Adapter> Http11Handler<A> {
    pub fn new(adapter: A, config: Config) -> Self {
        Self {
            adapter,
            config,
            processors: Mutex::new(HashMap::new()),
        }
    }
}

impl<A: Adapter> ProtocolHandler for Http11Handler<A> {
    fn process(&self, socket: &SocketWrapper, status: SocketStatus) -> SocketState {
        let mut processor = self
            .processors
            .lock()
            .unwrap()
            .remove(&socket.id())
            .unwrap_or_else(|| Box::new(Http11Processor::new(&self.config)));

        let mut ch = socket.channel();

        let state = processor.process(&mut ch, status, &self.adapter);

        match state {
            SocketState::Closed => {}
            _ => {
                self.processors
                    .lock()
                    .unwrap()
                    .insert(socket.id(), processor);
            }
        }

        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    struct MemoryChannel {
        input: Vec<u8>,
        pos: usize,
        output: Vec<u8>,
    }

    impl MemoryChannel {
        fn new(input: &[u8]) -> Self {
            Self {
                input: input.to_vec(),
                pos: 0,
                output: Vec::new(),
            }
        }
    }

    impl Read for MemoryChannel {
        fn read(&mut self, buf: &mut [u8]) -> Result<usize, io::Error> {
            let n = cmp::min(buf.len(), self.input.len() - self.pos);
            buf[..n].copy_from_slice(&self.input[self.pos..self.pos + n]);
            self.pos += n;

            Ok(n)
        }
    }

    impl Write for MemoryChannel {
        fn write(&mut self, buf: &[u8]) -> Result<usize, io::Error> {
            self.output.extend_from_slice(buf);

            Ok(buf.len())
        }

        fn flush(&mut self) -> Result<(), io::Error> {
            Ok(())
        }
    }

    impl SocketChannel for MemoryChannel {}

    struct HelloAdapter;

    impl Adapter for HelloAdapter {
        fn service(&self, ex: &mut Exchange<'_>) -> Result<(), io::Error> {
            ex.write(b"hi")
        }
    }

    struct EchoAdapter;

    impl Adapter for EchoAdapter {
        fn service(&self, ex: &mut Exchange<'_>) -> Result<(), io::Error> {
            let mut body = Vec::new();
            let mut buf = [0; 256];

            loop {
                let n = ex.read_body(&mut buf)?;

                if n == 0 {
                    break;
                }

                body.extend_from_slice(&buf[..n]);
            }

            ex.write(&body)
        }
    }

    // reads the body, then responds after an explicit flush so the response
    // goes out chunked
    struct StreamingAdapter;

    impl Adapter for StreamingAdapter {
        fn service(&self, ex: &mut Exchange<'_>) -> Result<(), io::Error> {
            let mut buf = [0; 256];
            while ex.read_body(&mut buf)? > 0 {}

            ex.flush()?;
            ex.write(b"hi there")
        }
    }

    struct FailingAdapter;

    impl Adapter for FailingAdapter {
        fn service(&self, _ex: &mut Exchange<'_>) -> Result<(), io::Error> {
            Err(io::Error::new(io::ErrorKind::Other, "boom"))
        }
    }

    fn config() -> Config {
        Config::default()
    }

    fn run(input: &[u8], adapter: &dyn Adapter) -> (SocketState, Vec<u8>) {
        let mut processor = Http11Processor::new(&config());
        let mut ch = MemoryChannel::new(input);

        let state = processor.process(&mut ch, SocketStatus::OpenRead, adapter);

        (state, ch.output)
    }

    fn response_text(out: &[u8]) -> String {
        String::from_utf8_lossy(out).into_owned()
    }

    #[test]
    fn test_simple_request_auto_content_length() {
        let (state, out) = run(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n", &HelloAdapter);

        let text = response_text(&out);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{}", text);
        assert!(text.contains("Content-Length: 2\r\n"), "{}", text);
        assert!(text.ends_with("\r\n\r\nhi"), "{}", text);

        // keep-alive by default on 1.1
        assert_eq!(state, SocketState::Open);
        assert!(!text.contains("Connection: close"));
    }

    #[test]
    fn test_chunked_request_and_streamed_response() {
        let input =
            b"POST /p HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n";
        let (state, out) = run(input, &StreamingAdapter);

        let text = response_text(&out);
        assert!(text.contains("Transfer-Encoding: chunked\r\n"), "{}", text);
        assert!(
            text.ends_with("\r\n\r\n8\r\nhi there\r\n0\r\n\r\n"),
            "{}",
            text
        );
        assert_eq!(state, SocketState::Open);
    }

    #[test]
    fn test_content_length_echo() {
        let input = b"POST /p HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello";
        let (state, out) = run(input, &EchoAdapter);

        let text = response_text(&out);
        assert!(text.contains("Content-Length: 5\r\n"), "{}", text);
        assert!(text.ends_with("\r\n\r\nhello"), "{}", text);
        assert_eq!(state, SocketState::Open);
    }

    #[test]
    fn test_pipelined_requests_in_order() {
        let input = b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b HTTP/1.1\r\nHost: x\r\n\r\n";

        struct UriAdapter;

        impl Adapter for UriAdapter {
            fn service(&self, ex: &mut Exchange<'_>) -> Result<(), io::Error> {
                let uri = ex.uri().to_vec();
                ex.write(&uri)
            }
        }

        let mut processor = Http11Processor::new(&config());
        let mut ch = MemoryChannel::new(input);

        let state = processor.process(&mut ch, SocketStatus::OpenRead, &UriAdapter);
        assert_eq!(state, SocketState::Open);

        let state = processor.process(&mut ch, SocketStatus::OpenRead, &UriAdapter);
        assert_eq!(state, SocketState::Open);

        let text = response_text(&ch.output);
        let first = text.find("\r\n\r\n/a").unwrap();
        let second = text.find("\r\n\r\n/b").unwrap();
        assert!(first < second, "{}", text);

        // nothing left: the third call sees a clean close
        let state = processor.process(&mut ch, SocketStatus::OpenRead, &UriAdapter);
        assert_eq!(state, SocketState::Closed);
    }

    #[test]
    fn test_http09_no_status_line() {
        let (state, out) = run(b"GET /\r\n", &HelloAdapter);

        assert_eq!(out, b"hi");
        assert_eq!(state, SocketState::Closed);
    }

    #[test]
    fn test_http10_without_content_length_closes() {
        struct NoLengthAdapter;

        impl Adapter for NoLengthAdapter {
            fn service(&self, ex: &mut Exchange<'_>) -> Result<(), io::Error> {
                // force a commit while the length is still unknown
                ex.flush()?;
                ex.write(b"data")
            }
        }

        let (state, out) = run(b"GET / HTTP/1.0\r\n\r\n", &NoLengthAdapter);

        let text = response_text(&out);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{}", text);
        assert!(text.contains("Connection: close\r\n"), "{}", text);
        assert!(!text.contains("Transfer-Encoding"), "{}", text);
        assert!(text.ends_with("\r\n\r\ndata"), "{}", text);
        assert_eq!(state, SocketState::Closed);
    }

    #[test]
    fn test_http10_keep_alive_token() {
        let input = b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n";
        let (state, out) = run(input, &HelloAdapter);

        let text = response_text(&out);
        assert!(text.contains("Connection: keep-alive\r\n"), "{}", text);
        assert_eq!(state, SocketState::Open);
    }

    #[test]
    fn test_connection_close_honored() {
        let input = b"GET / HTTP/1.1\r\nHost: x\r\nConnection: close\r\n\r\n";
        let (state, out) = run(input, &HelloAdapter);

        let text = response_text(&out);
        assert!(text.contains("Connection: close\r\n"), "{}", text);
        assert_eq!(state, SocketState::Closed);
    }

    #[test]
    fn test_missing_host_is_bad_request() {
        let (state, out) = run(b"GET / HTTP/1.1\r\n\r\n", &HelloAdapter);

        let text = response_text(&out);
        assert!(text.starts_with("HTTP/1.1 400 "), "{}", text);
        assert_eq!(state, SocketState::Closed);
    }

    #[test]
    fn test_invalid_method_is_bad_request() {
        let (state, out) = run(b"GE(T / HTTP/1.1\r\nHost: x\r\n\r\n", &HelloAdapter);

        let text = response_text(&out);
        assert!(text.starts_with("HTTP/1.1 400 "), "{}", text);
        assert_eq!(state, SocketState::Closed);
    }

    #[test]
    fn test_unsupported_transfer_encoding() {
        let input = b"POST / HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: gzip\r\n\r\n";
        let (state, out) = run(input, &HelloAdapter);

        let text = response_text(&out);
        assert!(text.starts_with("HTTP/1.1 501 "), "{}", text);
        assert_eq!(state, SocketState::Closed);
    }

    #[test]
    fn test_unsupported_protocol_version() {
        let (state, out) = run(b"GET / HTTP/2.0\r\nHost: x\r\n\r\n", &HelloAdapter);

        let text = response_text(&out);
        assert!(text.starts_with("HTTP/1.1 505 "), "{}", text);
        assert_eq!(state, SocketState::Closed);
    }

    #[test]
    fn test_oversized_headers_get_431() {
        let mut input = b"GET / HTTP/1.1\r\nHost: x\r\nbig: ".to_vec();
        input.extend_from_slice(&[b'v'; 9000]);
        input.extend_from_slice(b"\r\n\r\n");

        let (state, out) = run(&input, &HelloAdapter);

        let text = response_text(&out);
        assert!(text.starts_with("HTTP/1.1 431 "), "{}", text);
        assert_eq!(state, SocketState::Closed);
    }

    #[test]
    fn test_oversized_request_line_gets_414() {
        let mut input = b"GET /".to_vec();
        input.extend_from_slice(&[b'a'; 9000]);
        input.extend_from_slice(b" HTTP/1.1\r\nHost: x\r\n\r\n");

        let (state, out) = run(&input, &HelloAdapter);

        let text = response_text(&out);
        assert!(text.starts_with("HTTP/1.1 414 "), "{}", text);
        assert_eq!(state, SocketState::Closed);
    }

    #[test]
    fn test_idle_eof_closes_silently() {
        let (state, out) = run(b"", &HelloAdapter);

        assert_eq!(state, SocketState::Closed);
        assert!(out.is_empty());
    }

    #[test]
    fn test_timeout_status_closes() {
        let mut processor = Http11Processor::new(&config());
        let mut ch = MemoryChannel::new(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");

        let state = processor.process(&mut ch, SocketStatus::Timeout, &HelloAdapter);
        assert_eq!(state, SocketState::Closed);
        assert!(ch.output.is_empty());
    }

    #[test]
    fn test_expect_100_continue_acked_on_read() {
        let input = b"POST / HTTP/1.1\r\nHost: x\r\nExpect: 100-continue\r\nContent-Length: 5\r\n\r\nhello";
        let (state, out) = run(input, &EchoAdapter);

        let text = response_text(&out);
        assert!(
            text.starts_with("HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\n"),
            "{}",
            text
        );
        assert!(text.ends_with("hello"), "{}", text);
        assert_eq!(state, SocketState::Open);
    }

    #[test]
    fn test_unread_body_drained_for_keep_alive() {
        // the adapter ignores the body; the engine must still reach the
        // second request
        let input =
            b"POST /a HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhelloGET /b HTTP/1.1\r\nHost: x\r\n\r\n";

        let mut processor = Http11Processor::new(&config());
        let mut ch = MemoryChannel::new(input);

        assert_eq!(
            processor.process(&mut ch, SocketStatus::OpenRead, &HelloAdapter),
            SocketState::Open
        );
        assert_eq!(
            processor.process(&mut ch, SocketStatus::OpenRead, &HelloAdapter),
            SocketState::Open
        );

        let text = response_text(&ch.output);
        assert_eq!(text.matches("HTTP/1.1 200 OK").count(), 2, "{}", text);
    }

    #[test]
    fn test_adapter_error_maps_to_500() {
        let (state, out) = run(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n", &FailingAdapter);

        let text = response_text(&out);
        assert!(text.starts_with("HTTP/1.1 500 "), "{}", text);
        assert_eq!(state, SocketState::Closed);
    }

    #[test]
    fn test_max_keep_alive_requests() {
        let mut config = config();
        config.max_keep_alive_requests = 2;

        let input = b"GET / HTTP/1.1\r\nHost: x\r\n\r\nGET / HTTP/1.1\r\nHost: x\r\n\r\n";

        let mut processor = Http11Processor::new(&config);
        let mut ch = MemoryChannel::new(input);

        assert_eq!(
            processor.process(&mut ch, SocketStatus::OpenRead, &HelloAdapter),
            SocketState::Open
        );
        assert_eq!(
            processor.process(&mut ch, SocketStatus::OpenRead, &HelloAdapter),
            SocketState::Closed
        );

        let text = response_text(&ch.output);
        assert!(text.contains("Connection: close"), "{}", text);
    }

    #[test]
    fn test_no_body_status_gets_void_filter() {
        struct NoContentAdapter;

        impl Adapter for NoContentAdapter {
            fn service(&self, ex: &mut Exchange<'_>) -> Result<(), io::Error> {
                ex.set_status(204);
                ex.write(b"should vanish")
            }
        }

        let (state, out) = run(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n", &NoContentAdapter);

        let text = response_text(&out);
        assert!(text.starts_with("HTTP/1.1 204 "), "{}", text);
        assert!(!text.contains("Content-Length"), "{}", text);
        assert!(!text.contains("vanish"), "{}", text);
        assert!(text.ends_with("\r\n\r\n"), "{}", text);
        assert_eq!(state, SocketState::Open);
    }

    #[test]
    fn test_head_skips_auto_content_length() {
        struct EmptyAdapter;

        impl Adapter for EmptyAdapter {
            fn service(&self, _ex: &mut Exchange<'_>) -> Result<(), io::Error> {
                Ok(())
            }
        }

        let (_, out) = run(b"HEAD / HTTP/1.1\r\nHost: x\r\n\r\n", &EmptyAdapter);

        let text = response_text(&out);
        assert!(!text.contains("Content-Length"), "{}", text);
    }

    #[test]
    fn test_gzip_response_when_enabled() {
        use flate2::read::GzDecoder;

        let mut config = config();
        config.allow_compression = true;

        let input = b"GET / HTTP/1.1\r\nHost: x\r\nAccept-Encoding: gzip\r\n\r\n";

        struct BigAdapter;

        impl Adapter for BigAdapter {
            fn service(&self, ex: &mut Exchange<'_>) -> Result<(), io::Error> {
                ex.flush()?;
                ex.write(&b"abc".repeat(1000))
            }
        }

        let mut processor = Http11Processor::new(&config);
        let mut ch = MemoryChannel::new(input);

        processor.process(&mut ch, SocketStatus::OpenRead, &BigAdapter);

        let text = response_text(&ch.output);
        assert!(text.contains("Content-Encoding: gzip\r\n"), "{}", text);
        assert!(text.contains("Transfer-Encoding: chunked\r\n"), "{}", text);

        // un-frame and gunzip
        let body_start = ch.output.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        let mut gz = Vec::new();
        let mut rest = &ch.output[body_start..];

        loop {
            let line_end = rest.windows(2).position(|w| w == b"\r\n").unwrap();
            let size =
                usize::from_str_radix(std::str::from_utf8(&rest[..line_end]).unwrap(), 16).unwrap();

            if size == 0 {
                break;
            }

            gz.extend_from_slice(&rest[line_end + 2..line_end + 2 + size]);
            rest = &rest[line_end + 2 + size + 2..];
        }

        let mut unzipped = Vec::new();
        GzDecoder::new(&gz[..]).read_to_end(&mut unzipped).unwrap();

        assert_eq!(unzipped, b"abc".repeat(1000));
    }
}
