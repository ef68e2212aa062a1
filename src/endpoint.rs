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

use crate::config::Config;
use crate::counter::LimitLatch;
use crate::net::{self, SocketChannel, SocketOpts};
use crate::selector::{BlockingPoller, SelectorChannel};
use log::{debug, error, warn};
use slab::Slab;
use std::io;
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

/// Why the endpoint is dispatching a socket to the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketStatus {
    OpenRead,
    Timeout,
    Disconnect,
}

/// What the handler wants done with the socket afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Open,
    Closed,
    Long,
    Upgraded,
}

/// The seam between the endpoint and a protocol implementation, so other
/// transports can drive the same processors.
pub trait ProtocolHandler: Send + Sync {
    fn process(&self, socket: &SocketWrapper, status: SocketStatus) -> SocketState;
}

/// Transport-level handshake hook run once per connection before any
/// protocol processing (TLS would live here). A failure closes the socket
/// silently.
pub type HandshakeFn = Box<dyn Fn(&TcpStream) -> Result<(), io::Error> + Send + Sync>;

struct SelectorState {
    poller: BlockingPoller,
    timeout: Option<Duration>,
}

/// Per-connection state owned by the endpoint: the socket itself, liveness
/// bookkeeping for the sweeper, and the monitor serializing processing.
pub struct SocketWrapper {
    stream: TcpStream,
    id: u64,
    peer: SocketAddr,
    monitor: Mutex<()>,
    last_access: Mutex<Instant>,
    async_timeout_ms: AtomicI64,
    handshake_done: AtomicBool,
    selector: Option<Mutex<SelectorState>>,
}

impl SocketWrapper {
    fn new(
        stream: TcpStream,
        id: u64,
        peer: SocketAddr,
        selector_reads: bool,
    ) -> Result<Self, io::Error> {
        let selector = if selector_reads {
            stream.set_nonblocking(true)?;

            Some(Mutex::new(SelectorState {
                poller: BlockingPoller::new()?,
                timeout: None,
            }))
        } else {
            None
        };

        Ok(Self {
            stream,
            id,
            peer,
            monitor: Mutex::new(()),
            last_access: Mutex::new(Instant::now()),
            async_timeout_ms: AtomicI64::new(-1),
            handshake_done: AtomicBool::new(false),
            selector,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn touch(&self) {
        *self.last_access.lock().unwrap() = Instant::now();
    }

    pub fn last_access(&self) -> Instant {
        *self.last_access.lock().unwrap()
    }

    /// Arm the async timeout the sweeper enforces while this connection is
    /// parked in the waiting set.
    pub fn set_async_timeout(&self, ms: i64) {
        self.async_timeout_ms.store(ms, Ordering::SeqCst);
    }

    pub fn channel(&self) -> WrapperChannel<'_> {
        WrapperChannel { wrapper: self }
    }

    fn close(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// The `SocketChannel` a processor drives a wrapped socket through, reading
/// either directly (SO_TIMEOUT) or via the poll-parked path.
pub struct WrapperChannel<'a> {
    wrapper: &'a SocketWrapper,
}

impl Read for WrapperChannel<'_> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, io::Error> {
        match &self.wrapper.selector {
            None => (&mut &self.wrapper.stream).read(buf),
            Some(state) => {
                let mut state = state.lock().unwrap();
                let timeout = state.timeout;

                SelectorChannel::new(&self.wrapper.stream, &mut state.poller, timeout).read(buf)
            }
        }
    }
}

impl Write for WrapperChannel<'_> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, io::Error> {
        match &self.wrapper.selector {
            None => (&mut &self.wrapper.stream).write(buf),
            Some(state) => {
                let mut state = state.lock().unwrap();
                let timeout = state.timeout;

                SelectorChannel::new(&self.wrapper.stream, &mut state.poller, timeout).write(buf)
            }
        }
    }

    fn flush(&mut self) -> Result<(), io::Error> {
        (&mut &self.wrapper.stream).flush()
    }
}

impl SocketChannel for WrapperChannel<'_> {
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<(), io::Error> {
        match &self.wrapper.selector {
            None => self.wrapper.stream.set_read_timeout(timeout),
            Some(state) => {
                state.lock().unwrap().timeout = timeout;

                Ok(())
            }
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.wrapper.peer)
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size worker pool fed through a bounded queue; a full queue rejects
/// the submission rather than blocking the acceptor.
struct WorkerPool {
    sender: Mutex<Option<SyncSender<Job>>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl WorkerPool {
    fn new(threads: usize, queue: usize, name: &str) -> Self {
        let (sender, receiver) = mpsc::sync_channel::<Job>(queue);
        let receiver = Arc::new(Mutex::new(receiver));

        let mut handles = Vec::with_capacity(threads);

        for i in 0..threads {
            let receiver = Arc::clone(&receiver);

            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, i))
                .spawn(move || loop {
                    let job = receiver.lock().unwrap().recv();

                    match job {
                        Ok(job) => job(),
                        Err(_) => break,
                    }
                })
                .expect("failed to spawn worker thread");

            handles.push(handle);
        }

        Self {
            sender: Mutex::new(Some(sender)),
            threads: Mutex::new(handles),
        }
    }

    fn try_execute(&self, job: Job) -> Result<(), TrySendError<Job>> {
        match &*self.sender.lock().unwrap() {
            Some(sender) => sender.try_send(job),
            None => Err(TrySendError::Disconnected(job)),
        }
    }

    fn shutdown(&self) {
        self.sender.lock().unwrap().take();

        let mut threads = self.threads.lock().unwrap();

        for t in threads.drain(..) {
            let _ = t.join();
        }
    }
}

struct Inner {
    config: Config,
    handler: Box<dyn ProtocolHandler>,
    handshake: Option<HandshakeFn>,
    running: AtomicBool,
    paused: AtomicBool,
    latch: LimitLatch,
    pool: WorkerPool,
    waiting: Mutex<Slab<Arc<SocketWrapper>>>,
    next_id: AtomicU64,
}

impl Inner {
    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn close_socket(&self, wrapper: &SocketWrapper) {
        wrapper.close();
        self.latch.count_down();
    }
}

fn submit(inner: &Arc<Inner>, wrapper: Arc<SocketWrapper>, status: SocketStatus) -> bool {
    let inner2 = Arc::clone(inner);
    let wrapper2 = Arc::clone(&wrapper);

    let job: Job = Box::new(move || process_socket(inner2, wrapper2, status));

    match inner.pool.try_execute(job) {
        Ok(()) => true,
        Err(_) => {
            warn!("worker pool rejected connection from {}", wrapper.peer_addr());
            wrapper.close();

            false
        }
    }
}

fn process_socket(inner: Arc<Inner>, wrapper: Arc<SocketWrapper>, status: SocketStatus) {
    // one worker at a time per connection; async timeout dispatch and
    // keep-alive resubmission serialize here
    let _guard = wrapper.monitor.lock().unwrap();

    if let Some(handshake) = &inner.handshake {
        if !wrapper.handshake_done.swap(true, Ordering::SeqCst)
            && handshake(&wrapper.stream).is_err()
        {
            inner.close_socket(&wrapper);
            return;
        }
    }

    let state = inner.handler.process(&wrapper, status);

    match state {
        SocketState::Closed => inner.close_socket(&wrapper),
        SocketState::Open | SocketState::Upgraded => {
            wrapper.touch();

            let resubmitted = submit(&inner, Arc::clone(&wrapper), SocketStatus::OpenRead);

            if !resubmitted {
                inner.close_socket(&wrapper);
            }
        }
        SocketState::Long => {
            wrapper.touch();
            inner.waiting.lock().unwrap().insert(Arc::clone(&wrapper));
        }
    }
}

fn acceptor_run(inner: Arc<Inner>, listener: TcpListener) {
    while inner.running() {
        if inner.paused.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(50));
            continue;
        }

        inner.latch.count_up_or_await();

        if !inner.running() {
            inner.latch.count_down();
            break;
        }

        match listener.accept() {
            Ok((stream, peer)) => {
                let opts = SocketOpts {
                    tcp_no_delay: inner.config.tcp_no_delay,
                    so_linger: inner.config.so_linger(),
                    read_timeout: inner.config.connection_timeout(),
                };

                let usable = inner.running()
                    && !inner.paused.load(Ordering::SeqCst)
                    && match net::set_socket_opts(&stream, &opts) {
                        Ok(()) => true,
                        Err(e) => {
                            error!("failed to set socket options: {:?}", e);
                            false
                        }
                    };

                if !usable {
                    inner.latch.count_down();
                    continue;
                }

                let id = inner.next_id.fetch_add(1, Ordering::SeqCst);

                match SocketWrapper::new(stream, id, peer, inner.config.selector_reads) {
                    Ok(wrapper) => {
                        debug!("accepted connection from {}", peer);

                        if !submit(&inner, Arc::new(wrapper), SocketStatus::OpenRead) {
                            inner.latch.count_down();
                        }
                    }
                    Err(e) => {
                        error!("failed to wrap socket: {:?}", e);
                        inner.latch.count_down();
                    }
                }
            }
            Err(e) => {
                inner.latch.count_down();

                if inner.running() {
                    error!("accept error: {:?}", e);
                    thread::sleep(Duration::from_millis(10));
                }
            }
        }
    }

    debug!("acceptor stopped");
}

fn sweeper_run(inner: Arc<Inner>) {
    let mut since_sweep = Duration::ZERO;

    while inner.running() {
        thread::sleep(SHUTDOWN_POLL);
        since_sweep += SHUTDOWN_POLL;

        if since_sweep < SWEEP_INTERVAL {
            continue;
        }

        since_sweep = Duration::ZERO;

        let now = Instant::now();

        let expired: Vec<(usize, Arc<SocketWrapper>)> = {
            let waiting = inner.waiting.lock().unwrap();

            waiting
                .iter()
                .filter_map(|(key, wrapper)| {
                    let timeout = wrapper.async_timeout_ms.load(Ordering::SeqCst);

                    if timeout >= 0
                        && now.duration_since(wrapper.last_access())
                            > Duration::from_millis(timeout as u64)
                    {
                        Some((key, Arc::clone(wrapper)))
                    } else {
                        None
                    }
                })
                .collect()
        };

        for (key, wrapper) in expired {
            wrapper.set_async_timeout(-1);
            let _ = inner.waiting.lock().unwrap().try_remove(key);

            debug!("async timeout for {}", wrapper.peer_addr());

            let resubmitted = submit(&inner, Arc::clone(&wrapper), SocketStatus::Timeout);

            if !resubmitted {
                inner.close_socket(&wrapper);
            }
        }
    }

    debug!("async timeout sweeper stopped");
}

/// Blocking connection endpoint: binds a listener, accepts under the
/// connection-limit latch, hands sockets to the worker pool and drives
/// keep-alive continuations and async timeouts.
pub struct Endpoint {
    inner: Arc<Inner>,
    local_addr: SocketAddr,
    acceptors: Vec<thread::JoinHandle<()>>,
    sweeper: Option<thread::JoinHandle<()>>,
}

impl Endpoint {
    pub fn start(config: Config, handler: Box<dyn ProtocolHandler>) -> Result<Self, io::Error> {
        Self::start_with_handshake(config, handler, None)
    }

    pub fn start_with_handshake(
        config: Config,
        handler: Box<dyn ProtocolHandler>,
        handshake: Option<HandshakeFn>,
    ) -> Result<Self, io::Error> {
        let host = config.address.clone().unwrap_or_else(|| "0.0.0.0".to_string());

        let addr: SocketAddr = format!("{}:{}", host, config.port)
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad bind address"))?;

        let listener = net::listen(addr, config.backlog)?;
        let local_addr = listener.local_addr()?;

        let max_connections = config.effective_max_connections();
        let pool = WorkerPool::new(config.max_threads, max_connections + 1, "http-worker");
        let acceptor_count = config.acceptor_thread_count.max(1);

        let inner = Arc::new(Inner {
            config,
            handler,
            handshake,
            running: AtomicBool::new(true),
            paused: AtomicBool::new(false),
            latch: LimitLatch::new(max_connections),
            pool,
            waiting: Mutex::new(Slab::new()),
            next_id: AtomicU64::new(1),
        });

        let mut acceptors = Vec::with_capacity(acceptor_count);

        for i in 0..acceptor_count {
            let inner = Arc::clone(&inner);
            let listener = listener.try_clone()?;

            let handle = thread::Builder::new()
                .name(format!("acceptor-{}", i))
                .spawn(move || acceptor_run(inner, listener))?;

            acceptors.push(handle);
        }

        let sweeper = {
            let inner = Arc::clone(&inner);

            thread::Builder::new()
                .name("async-timeout".to_string())
                .spawn(move || sweeper_run(inner))?
        };

        debug!("endpoint listening on {}", local_addr);

        Ok(Self {
            inner,
            local_addr,
            acceptors,
            sweeper: Some(sweeper),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.inner.latch.count()
    }

    pub fn pause(&self) {
        self.inner.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.inner.paused.store(false, Ordering::SeqCst);
    }

    /// Stop accepting, wake anything blocked, and wind down the threads.
    /// Idempotent; also run on drop.
    pub fn stop(&mut self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        self.inner.paused.store(false, Ordering::SeqCst);
        self.inner.latch.release_all();

        // a throwaway connection per acceptor unblocks accept()
        for _ in 0..self.acceptors.len() {
            let _ = TcpStream::connect(self.local_addr);
        }

        for t in self.acceptors.drain(..) {
            let _ = t.join();
        }

        let waiting: Vec<Arc<SocketWrapper>> = {
            let mut waiting = self.inner.waiting.lock().unwrap();
            waiting.drain().collect()
        };

        for wrapper in waiting {
            self.inner.close_socket(&wrapper);
        }

        self.inner.pool.shutdown();

        if let Some(t) = self.sweeper.take() {
            let _ = t.join();
        }
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{Adapter, Exchange, Http11Handler};
    use std::sync::atomic::AtomicUsize;

    fn test_config() -> Config {
        Config {
            port: 0,
            max_threads: 2,
            max_connections: 0,
            connection_timeout_ms: 5_000,
            ..Config::default()
        }
    }

    struct OkAdapter;

    impl Adapter for OkAdapter {
        fn service(&self, ex: &mut Exchange<'_>) -> Result<(), io::Error> {
            ex.set_content_type("text/plain");
            ex.write(b"ok")
        }
    }

    // read exactly one response (headers plus Content-Length body), carrying
    // any over-read bytes in `pending` for the next call
    fn read_one_response(stream: &mut TcpStream, pending: &mut Vec<u8>) -> String {
        let mut buf = [0; 1024];

        let header_end = loop {
            if let Some(pos) = pending.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }

            let n = stream.read(&mut buf).unwrap();
            assert!(n > 0, "connection closed mid response");
            pending.extend_from_slice(&buf[..n]);
        };

        let headers = String::from_utf8_lossy(&pending[..header_end]).into_owned();

        let content_length: usize = headers
            .lines()
            .find_map(|l| l.strip_prefix("Content-Length: "))
            .map(|v| v.parse().unwrap())
            .unwrap_or(0);

        while pending.len() < header_end + content_length {
            let n = stream.read(&mut buf).unwrap();
            assert!(n > 0, "connection closed mid body");
            pending.extend_from_slice(&buf[..n]);
        }

        let response: Vec<u8> = pending.drain(..header_end + content_length).collect();

        String::from_utf8_lossy(&response).into_owned()
    }

    fn read_response(stream: &mut TcpStream) -> String {
        read_one_response(stream, &mut Vec::new())
    }

    fn wait_for(mut cond: impl FnMut() -> bool, what: &str) {
        for _ in 0..100 {
            if cond() {
                return;
            }

            thread::sleep(Duration::from_millis(50));
        }

        panic!("timed out waiting for {}", what);
    }

    #[test]
    fn test_serves_requests_with_keep_alive() {
        let handler = Http11Handler::new(OkAdapter, test_config());
        let mut endpoint = Endpoint::start(test_config(), Box::new(handler)).unwrap();

        let mut client = TcpStream::connect(endpoint.local_addr()).unwrap();

        client
            .write_all(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();

        let response = read_response(&mut client);
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{}", response);
        assert!(response.contains("Content-Type: text/plain"), "{}", response);
        assert!(response.ends_with("ok"), "{}", response);

        // same connection again
        client
            .write_all(b"GET /b HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();

        let response = read_response(&mut client);
        assert!(response.ends_with("ok"), "{}", response);

        drop(client);

        // the worker notices the close and releases the connection slot
        wait_for(|| endpoint.connection_count() == 0, "latch release");

        endpoint.stop();
    }

    #[test]
    fn test_pipelined_requests_one_write() {
        let handler = Http11Handler::new(OkAdapter, test_config());
        let mut endpoint = Endpoint::start(test_config(), Box::new(handler)).unwrap();

        let mut client = TcpStream::connect(endpoint.local_addr()).unwrap();

        client
            .write_all(
                b"GET /1 HTTP/1.1\r\nHost: x\r\n\r\nGET /2 HTTP/1.1\r\nHost: x\r\n\r\n",
            )
            .unwrap();

        let mut pending = Vec::new();
        let first = read_one_response(&mut client, &mut pending);
        let second = read_one_response(&mut client, &mut pending);

        assert!(first.ends_with("ok"), "{}", first);
        assert!(second.ends_with("ok"), "{}", second);

        drop(client);
        wait_for(|| endpoint.connection_count() == 0, "latch release");

        endpoint.stop();
    }

    #[test]
    fn test_connection_limit_queues_accepts() {
        let config = Config {
            max_connections: 1,
            max_threads: 1,
            connection_timeout_ms: 5_000,
            ..test_config()
        };

        let handler = Http11Handler::new(OkAdapter, config.clone());
        let mut endpoint = Endpoint::start(config, Box::new(handler)).unwrap();

        // holds the only connection slot without sending anything
        let first = TcpStream::connect(endpoint.local_addr()).unwrap();
        wait_for(|| endpoint.connection_count() == 1, "first connection");

        // sits in the backlog until the slot frees up
        let mut second = TcpStream::connect(endpoint.local_addr()).unwrap();
        second
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();

        drop(first);

        let response = read_response(&mut second);
        assert!(response.ends_with("ok"), "{}", response);

        drop(second);
        wait_for(|| endpoint.connection_count() == 0, "latch release");

        endpoint.stop();
    }

    #[test]
    fn test_long_state_swept_on_timeout() {
        struct ParkingHandler {
            timeouts: AtomicUsize,
        }

        impl ProtocolHandler for ParkingHandler {
            fn process(&self, socket: &SocketWrapper, status: SocketStatus) -> SocketState {
                match status {
                    SocketStatus::OpenRead => {
                        socket.set_async_timeout(200);
                        SocketState::Long
                    }
                    _ => {
                        self.timeouts.fetch_add(1, Ordering::SeqCst);
                        SocketState::Closed
                    }
                }
            }
        }

        let handler = Arc::new(ParkingHandler {
            timeouts: AtomicUsize::new(0),
        });

        struct Shared(Arc<ParkingHandler>);

        impl ProtocolHandler for Shared {
            fn process(&self, socket: &SocketWrapper, status: SocketStatus) -> SocketState {
                self.0.process(socket, status)
            }
        }

        let mut endpoint =
            Endpoint::start(test_config(), Box::new(Shared(Arc::clone(&handler)))).unwrap();

        let mut client = TcpStream::connect(endpoint.local_addr()).unwrap();
        client.write_all(b"x").unwrap();

        // the sweeper fires the timeout dispatch and the handler closes
        wait_for(
            || handler.timeouts.load(Ordering::SeqCst) == 1,
            "timeout dispatch",
        );
        wait_for(|| endpoint.connection_count() == 0, "latch release");

        let mut buf = [0; 16];
        assert_eq!(client.read(&mut buf).unwrap(), 0);

        endpoint.stop();
    }

    #[test]
    fn test_handshake_failure_closes_silently() {
        let handler = Http11Handler::new(OkAdapter, test_config());

        let handshake: HandshakeFn =
            Box::new(|_| Err(io::Error::new(io::ErrorKind::Other, "no")));

        let mut endpoint =
            Endpoint::start_with_handshake(test_config(), Box::new(handler), Some(handshake))
                .unwrap();

        let mut client = TcpStream::connect(endpoint.local_addr()).unwrap();
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();

        let mut buf = [0; 16];
        assert_eq!(client.read(&mut buf).unwrap(), 0);

        wait_for(|| endpoint.connection_count() == 0, "latch release");

        endpoint.stop();
    }

    #[test]
    fn test_selector_reads_serve_requests() {
        let config = Config {
            selector_reads: true,
            ..test_config()
        };

        let handler = Http11Handler::new(OkAdapter, config.clone());
        let mut endpoint = Endpoint::start(config, Box::new(handler)).unwrap();

        let mut client = TcpStream::connect(endpoint.local_addr()).unwrap();

        client
            .write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .unwrap();

        let response = read_response(&mut client);
        assert!(response.ends_with("ok"), "{}", response);

        drop(client);
        wait_for(|| endpoint.connection_count() == 0, "latch release");

        endpoint.stop();
    }

    #[test]
    fn test_stop_is_prompt_and_idempotent() {
        let handler = Http11Handler::new(OkAdapter, test_config());
        let mut endpoint = Endpoint::start(test_config(), Box::new(handler)).unwrap();

        let started = Instant::now();
        endpoint.stop();
        endpoint.stop();

        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
