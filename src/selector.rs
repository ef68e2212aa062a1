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

use crate::net::SocketChannel;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use std::io;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

/// One poll registration reused across waits, giving blocking-with-deadline
/// semantics over a non-blocking socket.
pub struct BlockingPoller {
    poll: Poll,
    events: Events,
}

impl BlockingPoller {
    pub fn new() -> Result<Self, io::Error> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(4),
        })
    }

    /// Park until `fd` is ready for `interest` or the timeout passes. False
    /// means the deadline was hit.
    pub fn wait(
        &mut self,
        fd: RawFd,
        interest: Interest,
        timeout: Option<Duration>,
    ) -> Result<bool, io::Error> {
        self.poll
            .registry()
            .register(&mut SourceFd(&fd), Token(0), interest)?;

        let deadline = timeout.map(|t| Instant::now() + t);

        let result = loop {
            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();

                    if now >= deadline {
                        break Ok(false);
                    }

                    Some(deadline - now)
                }
                None => None,
            };

            match self.poll.poll(&mut self.events, remaining) {
                Ok(()) => {
                    if !self.events.is_empty() {
                        break Ok(true);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => break Err(e),
            }
        };

        // always unregister so the next wait can register again
        let deregistered = self.poll.registry().deregister(&mut SourceFd(&fd));

        let ready = result?;
        deregistered?;

        Ok(ready)
    }
}

fn timeout_error() -> io::Error {
    io::Error::new(io::ErrorKind::WouldBlock, "poll deadline passed")
}

/// Blocking-read adapter over a socket in non-blocking mode: a read or write
/// that would block parks on the poller with the configured deadline instead.
/// Transparent to the parser and buffers, which only see a `SocketChannel`.
pub struct SelectorChannel<'a> {
    stream: &'a TcpStream,
    poller: &'a mut BlockingPoller,
    timeout: Option<Duration>,
}

impl<'a> SelectorChannel<'a> {
    pub fn new(
        stream: &'a TcpStream,
        poller: &'a mut BlockingPoller,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            stream,
            poller,
            timeout,
        }
    }
}

impl Read for SelectorChannel<'_> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, io::Error> {
        loop {
            match (&mut &*self.stream).read(buf) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let ready = self.poller.wait(
                        self.stream.as_raw_fd(),
                        Interest::READABLE,
                        self.timeout,
                    )?;

                    if !ready {
                        return Err(timeout_error());
                    }
                }
                other => return other,
            }
        }
    }
}

impl Write for SelectorChannel<'_> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, io::Error> {
        loop {
            match (&mut &*self.stream).write(buf) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    let ready = self.poller.wait(
                        self.stream.as_raw_fd(),
                        Interest::WRITABLE,
                        self.timeout,
                    )?;

                    if !ready {
                        return Err(timeout_error());
                    }
                }
                other => return other,
            }
        }
    }

    fn flush(&mut self) -> Result<(), io::Error> {
        (&mut &*self.stream).flush()
    }
}

impl SocketChannel for SelectorChannel<'_> {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<(), io::Error> {
        self.timeout = timeout;

        Ok(())
    }
}
