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

use clap::{Arg, Command};
use log::{error, info, LevelFilter};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::error::Error;
use std::io;
use std::path::PathBuf;
use std::process;
use stoker::config::Config;
use stoker::endpoint::Endpoint;
use stoker::log::get_simple_logger;
use stoker::processor::{Adapter, Exchange, Http11Handler};

// safety value
const THREADS_MAX: usize = 1024;

// demo application: GET answers with a greeting, anything with a body gets
// it echoed back
struct EchoAdapter;

impl Adapter for EchoAdapter {
    fn service(&self, ex: &mut Exchange<'_>) -> Result<(), io::Error> {
        ex.set_content_type("text/plain");

        let mut body = Vec::new();
        let mut buf = [0; 4096];

        loop {
            let n = ex.read_body(&mut buf)?;

            if n == 0 {
                break;
            }

            body.extend_from_slice(&buf[..n]);
        }

        if body.is_empty() {
            ex.write(b"hello\n")
        } else {
            ex.write(&body)
        }
    }
}

fn process_args_and_run() -> Result<(), Box<dyn Error>> {
    let matches = Command::new("stoker")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Blocking HTTP/1.1 server engine")
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .help("Config file to load"),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .value_name("PORT")
                .help("Port to listen on"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("N")
                .default_value("2")
                .help("Log level (0 = error only, 4 = trace)"),
        )
        .get_matches();

    let level = match matches
        .get_one::<String>("log-level")
        .unwrap()
        .parse::<u8>()?
    {
        0 => LevelFilter::Error,
        1 => LevelFilter::Warn,
        2 => LevelFilter::Info,
        3 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    log::set_logger(get_simple_logger())?;
    log::set_max_level(level);

    let mut config = match matches.get_one::<String>("config") {
        Some(path) => Config::from_file(&PathBuf::from(path))?,
        None => Config::default(),
    };

    if let Some(port) = matches.get_one::<String>("port") {
        config.port = port.parse()?;
    }

    if config.max_threads == 0 || config.max_threads > THREADS_MAX {
        return Err(format!("max_threads must be between 1 and {}", THREADS_MAX).into());
    }

    let handler = Http11Handler::new(EchoAdapter, config.clone());
    let mut endpoint = Endpoint::start(config, Box::new(handler))?;

    info!("listening on {}", endpoint.local_addr());

    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    signals.forever().next();

    info!("stopping");
    endpoint.stop();

    Ok(())
}

fn main() {
    if let Err(e) = process_args_and_run() {
        error!("{}", e);
        process::exit(1);
    }
}
