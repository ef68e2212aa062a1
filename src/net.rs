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

use log::error;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

/// The byte transport a connection is driven over. Implemented by plain
/// blocking sockets, the selector-assisted wrapper, and in-memory test
/// channels.
pub trait SocketChannel: Read + Write {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<(), io::Error> {
        let _ = timeout;

        Ok(())
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

impl SocketChannel for TcpStream {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<(), io::Error> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }
}

pub fn listen(addr: SocketAddr, backlog: i32) -> Result<TcpListener, io::Error> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

pub struct SocketOpts {
    pub tcp_no_delay: bool,
    pub so_linger: Option<Duration>,
    pub read_timeout: Duration,
}

pub fn set_socket_opts(stream: &TcpStream, opts: &SocketOpts) -> Result<(), io::Error> {
    stream.set_nodelay(opts.tcp_no_delay)?;
    stream.set_read_timeout(Some(opts.read_timeout))?;

    let sock = SockRef::from(stream);

    if let Err(e) = sock.set_keepalive(true) {
        error!("set keepalive failed: {:?}", e);
    }

    sock.set_linger(opts.so_linger)?;

    Ok(())
}
