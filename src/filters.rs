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
use crate::http::HttpError;
use crate::input::ParseBuffer;
use crate::net::SocketChannel;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::cmp;
use std::io;
use std::io::Write;
use std::mem;

// an unread body is drained at end of request to reach the next request
// boundary, but not without bound
const MAX_SWALLOW_SIZE: u64 = 2 * 1024 * 1024;

const CHUNK_SIZE_MAX: usize = 0xffff;

/// Body transfer decoders. The topmost active filter's `do_read` pulls raw
/// windows from the filters below it, the bottom of the chain being the parse
/// buffer itself. Returned spans index the parse buffer and are valid until
/// the next read.
pub enum InputFilter {
    Identity { remaining: u64 },
    Chunked(ChunkedDecoder),
    Void,
}

impl InputFilter {
    pub fn identity(content_length: u64) -> Self {
        Self::Identity {
            remaining: content_length,
        }
    }

    pub fn chunked() -> Self {
        Self::Chunked(ChunkedDecoder::new())
    }

    pub fn void() -> Self {
        Self::Void
    }

    pub fn do_read(
        &mut self,
        below: &mut [InputFilter],
        core: &mut ParseBuffer,
        ch: &mut dyn SocketChannel,
        max: usize,
    ) -> Result<Option<Span>, HttpError> {
        match self {
            Self::Identity { remaining } => {
                if *remaining == 0 {
                    return Ok(None);
                }

                let cap = cmp::min(*remaining, max as u64) as usize;

                match chain_read(below, core, ch, cap)? {
                    Some(span) => {
                        *remaining -= span.len() as u64;
                        Ok(Some(span))
                    }
                    None => Err(HttpError::UnexpectedEof),
                }
            }
            Self::Chunked(dec) => dec.do_read(below, core, ch),
            Self::Void => Ok(None),
        }
    }

    /// Drain whatever the request body still holds so the connection lands on
    /// the next request boundary.
    pub fn end(
        &mut self,
        below: &mut [InputFilter],
        core: &mut ParseBuffer,
        ch: &mut dyn SocketChannel,
    ) -> Result<(), HttpError> {
        let mut swallowed: u64 = 0;

        while let Some(span) = self.do_read(below, core, ch, usize::MAX)? {
            swallowed += span.len() as u64;

            if swallowed > MAX_SWALLOW_SIZE {
                return Err(HttpError::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "unread body too large to swallow",
                )));
            }
        }

        Ok(())
    }
}

/// Read through the filter stack; an empty stack reads raw bytes.
pub fn chain_read(
    stack: &mut [InputFilter],
    core: &mut ParseBuffer,
    ch: &mut dyn SocketChannel,
    max: usize,
) -> Result<Option<Span>, HttpError> {
    match stack.split_last_mut() {
        Some((top, below)) => top.do_read(below, core, ch, max),
        None => core.raw_read(ch, max),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ChunkState {
    Size,
    SizeWs,
    Extension,
    SizeLf,
    Data,
    DataCr,
    DataLf,
    TrailerCheck,
    TrailerLine,
    EndLf,
    End,
}

pub struct ChunkedDecoder {
    state: ChunkState,
    remaining: u64,
    window: Span,
}

impl ChunkedDecoder {
    fn new() -> Self {
        Self {
            state: ChunkState::Size,
            remaining: 0,
            window: Span::default(),
        }
    }

    fn do_read(
        &mut self,
        below: &mut [InputFilter],
        core: &mut ParseBuffer,
        ch: &mut dyn SocketChannel,
    ) -> Result<Option<Span>, HttpError> {
        loop {
            if self.state == ChunkState::End {
                // raw bytes past the terminator belong to the next request
                if !self.window.is_empty() {
                    core.rewind(self.window);
                }

                self.window = Span::default();

                return Ok(None);
            }

            if self.state == ChunkState::Data {
                if self.window.is_empty() {
                    self.pull(below, core, ch)?;
                }

                let take = cmp::min(self.remaining, self.window.len() as u64) as usize;
                let out = Span::new(self.window.start, self.window.start + take);

                self.window.start += take;
                self.remaining -= take as u64;

                if self.remaining == 0 {
                    self.state = ChunkState::DataCr;
                }

                return Ok(Some(out));
            }

            if self.window.is_empty() {
                self.pull(below, core, ch)?;
            }

            let b = core.body_bytes()[self.window.start];
            self.window.start += 1;

            self.step(b)?;
        }
    }

    fn pull(
        &mut self,
        below: &mut [InputFilter],
        core: &mut ParseBuffer,
        ch: &mut dyn SocketChannel,
    ) -> Result<(), HttpError> {
        match chain_read(below, core, ch, usize::MAX)? {
            Some(span) => {
                self.window = span;
                Ok(())
            }
            None => Err(HttpError::UnexpectedEof),
        }
    }

    fn after_size(&self) -> ChunkState {
        if self.remaining == 0 {
            ChunkState::TrailerCheck
        } else {
            ChunkState::Data
        }
    }

    fn step(&mut self, b: u8) -> Result<(), HttpError> {
        self.state = match self.state {
            ChunkState::Size => match b {
                b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F' => {
                    let digit = match b {
                        b'0'..=b'9' => b - b'0',
                        b'a'..=b'f' => b - b'a' + 10,
                        _ => b - b'A' + 10,
                    };

                    self.remaining = self
                        .remaining
                        .checked_mul(16)
                        .and_then(|v| v.checked_add(digit as u64))
                        .ok_or(HttpError::MalformedChunk)?;

                    ChunkState::Size
                }
                b' ' | b'\t' => ChunkState::SizeWs,
                b';' => ChunkState::Extension,
                b'\r' => ChunkState::SizeLf,
                b'\n' => self.after_size(),
                _ => return Err(HttpError::MalformedChunk),
            },
            ChunkState::SizeWs => match b {
                b' ' | b'\t' => ChunkState::SizeWs,
                b';' => ChunkState::Extension,
                b'\r' => ChunkState::SizeLf,
                b'\n' => self.after_size(),
                _ => return Err(HttpError::MalformedChunk),
            },
            ChunkState::Extension => match b {
                b'\r' => ChunkState::SizeLf,
                // a bare LF inside an extension is trouble for implementations
                // that never look for the CR
                b'\n' => return Err(HttpError::MalformedChunk),
                _ => ChunkState::Extension,
            },
            ChunkState::SizeLf => match b {
                b'\n' => self.after_size(),
                _ => return Err(HttpError::MalformedChunk),
            },
            ChunkState::Data => unreachable!(),
            ChunkState::DataCr => match b {
                b'\r' => ChunkState::DataLf,
                b'\n' => ChunkState::Size,
                _ => return Err(HttpError::MalformedChunk),
            },
            ChunkState::DataLf => match b {
                b'\n' => ChunkState::Size,
                _ => return Err(HttpError::MalformedChunk),
            },
            ChunkState::TrailerCheck => match b {
                b'\r' => ChunkState::EndLf,
                b'\n' => ChunkState::End,
                _ => ChunkState::TrailerLine,
            },
            ChunkState::TrailerLine => match b {
                b'\n' => ChunkState::TrailerCheck,
                _ => ChunkState::TrailerLine,
            },
            ChunkState::EndLf => match b {
                b'\n' => ChunkState::End,
                _ => return Err(HttpError::MalformedChunk),
            },
            ChunkState::End => unreachable!(),
        };

        Ok(())
    }
}

/// Body transfer encoders, stacked above the raw socket sink. `do_write`
/// passes encoded bytes down the chain; `end` writes any trailer bytes.
pub enum OutputFilter {
    Identity { remaining: i64 },
    Chunked,
    Void,
    Gzip(GzipWriter),
}

pub struct GzipWriter {
    enc: Option<GzEncoder<Vec<u8>>>,
}

impl OutputFilter {
    pub fn identity(content_length: i64) -> Self {
        Self::Identity {
            remaining: content_length,
        }
    }

    pub fn chunked() -> Self {
        Self::Chunked
    }

    pub fn void() -> Self {
        Self::Void
    }

    pub fn gzip() -> Self {
        Self::Gzip(GzipWriter {
            enc: Some(GzEncoder::new(Vec::new(), Compression::default())),
        })
    }

    pub fn do_write(
        &mut self,
        below: &mut [OutputFilter],
        sink: &mut dyn Write,
        data: &[u8],
    ) -> Result<(), io::Error> {
        match self {
            Self::Identity { remaining } => {
                if *remaining < 0 {
                    return chain_write(below, sink, data);
                }

                // bytes past the declared length are dropped
                let n = cmp::min(*remaining, data.len() as i64);
                *remaining -= n;

                chain_write(below, sink, &data[..n as usize])
            }
            Self::Chunked => {
                for piece in data.chunks(CHUNK_SIZE_MAX) {
                    let mut header = [0; 8];

                    let header_len = {
                        let mut c = io::Cursor::new(&mut header[..]);
                        write!(&mut c, "{:x}\r\n", piece.len()).unwrap();

                        c.position() as usize
                    };

                    chain_write(below, sink, &header[..header_len])?;
                    chain_write(below, sink, piece)?;
                    chain_write(below, sink, b"\r\n")?;
                }

                Ok(())
            }
            Self::Void => Ok(()),
            Self::Gzip(gz) => {
                let enc = match gz.enc.as_mut() {
                    Some(enc) => enc,
                    None => return Err(io::Error::new(io::ErrorKind::Other, "encoder finished")),
                };

                enc.write_all(data)?;

                let out = mem::take(enc.get_mut());

                if !out.is_empty() {
                    chain_write(below, sink, &out)?;
                }

                Ok(())
            }
        }
    }

    pub fn end(&mut self, below: &mut [OutputFilter], sink: &mut dyn Write) -> Result<(), io::Error> {
        match self {
            Self::Identity { .. } => Ok(()),
            Self::Chunked => chain_write(below, sink, b"0\r\n\r\n"),
            Self::Void => Ok(()),
            Self::Gzip(gz) => {
                if let Some(enc) = gz.enc.take() {
                    let out = enc.finish()?;

                    if !out.is_empty() {
                        chain_write(below, sink, &out)?;
                    }
                }

                Ok(())
            }
        }
    }
}

/// Write through the filter stack; an empty stack writes raw bytes.
pub fn chain_write(
    stack: &mut [OutputFilter],
    sink: &mut dyn Write,
    data: &[u8],
) -> Result<(), io::Error> {
    match stack.split_last_mut() {
        Some((top, below)) => top.do_write(below, sink, data),
        None => sink.write_all(data),
    }
}
