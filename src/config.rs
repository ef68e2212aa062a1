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

use config::{ConfigError, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// TCP port to bind.
    pub port: u16,

    /// Bind address; all interfaces when unset.
    pub address: Option<String>,

    /// Connection cap; 0 means "same as max_threads".
    pub max_connections: usize,

    /// Worker pool maximum.
    pub max_threads: usize,

    pub acceptor_thread_count: usize,

    /// Socket read timeout in milliseconds.
    pub connection_timeout_ms: u64,

    /// Idle timeout between keep-alive requests; connection_timeout_ms
    /// when unset.
    pub keep_alive_timeout_ms: Option<u64>,

    /// Requests allowed per connection; 1 disables keep-alive, 0 removes
    /// the limit.
    pub max_keep_alive_requests: i32,

    /// Parse buffer size; the request line plus headers must fit.
    pub max_http_header_size: usize,

    /// Output coalescing buffer; 500 or less disables it.
    pub socket_buffer: usize,

    pub reject_illegal_header_name: bool,

    pub backlog: i32,

    pub tcp_no_delay: bool,

    /// SO_LINGER in seconds; negative leaves it off.
    pub so_linger_sec: i64,

    /// Gzip response bodies for clients that accept it.
    pub allow_compression: bool,

    /// Drive reads through a poll registration instead of SO_TIMEOUT.
    pub selector_reads: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            address: None,
            max_connections: 0,
            max_threads: 200,
            acceptor_thread_count: 1,
            connection_timeout_ms: 60_000,
            keep_alive_timeout_ms: None,
            max_keep_alive_requests: 100,
            max_http_header_size: 8192,
            socket_buffer: 0,
            reject_illegal_header_name: false,
            backlog: 100,
            tcp_no_delay: true,
            so_linger_sec: -1,
            allow_compression: false,
            selector_reads: false,
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        config::Config::builder()
            .add_source(File::from(path))
            .build()?
            .try_deserialize()
    }

    pub fn effective_max_connections(&self) -> usize {
        if self.max_connections == 0 {
            self.max_threads
        } else {
            self.max_connections
        }
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_millis(
            self.keep_alive_timeout_ms
                .unwrap_or(self.connection_timeout_ms),
        )
    }

    pub fn so_linger(&self) -> Option<Duration> {
        if self.so_linger_sec < 0 {
            None
        } else {
            Some(Duration::from_secs(self.so_linger_sec as u64))
        }
    }
}
