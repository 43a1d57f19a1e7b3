//  Copyright 2024 ferrocache contributors
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

//! Thread-per-connection TCP dispatcher. Grounded on
//! `examples/original_source/src/network/blocking/ServerImpl.cpp`: an acceptor thread spawns one
//! worker thread per connection, a global worker-count cap replies `SERVER_ERROR` instead of
//! accepting past it, and `SIGPIPE` is masked so a client closing its read side doesn't kill the
//! process.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use ferrocache_memory::FlatCombinedStore;
use ferrocache_protocol::{ParsedLine, Storage};

use crate::error::{Result, ServerError};
use crate::reply::{format_error, format_reply};

/// Thread-per-connection dispatcher over a [`FlatCombinedStore`].
pub struct BlockingServer {
    storage: Arc<FlatCombinedStore>,
    max_workers: usize,
    running: Arc<AtomicBool>,
    active_workers: Arc<AtomicUsize>,
    accept_thread: Option<JoinHandle<()>>,
}

impl BlockingServer {
    pub fn new(storage: Arc<FlatCombinedStore>, max_workers: usize) -> Self {
        Self {
            storage,
            max_workers,
            running: Arc::new(AtomicBool::new(false)),
            active_workers: Arc::new(AtomicUsize::new(0)),
            accept_thread: None,
        }
    }

    /// Bind `addr` and start the acceptor thread. Returns once the listener is bound; connection
    /// handling happens on background threads.
    pub fn start(&mut self, addr: impl ToSocketAddrs) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(ServerError::AlreadyRunning);
        }
        crate::mask_sigpipe()?;

        let listener = TcpListener::bind(addr)?;
        let storage = self.storage.clone();
        let running = self.running.clone();
        let active_workers = self.active_workers.clone();
        let max_workers = self.max_workers;

        self.accept_thread = Some(std::thread::spawn(move || {
            run_acceptor(listener, storage, running, active_workers, max_workers);
        }));
        Ok(())
    }

    /// Signal the acceptor and all connection threads to stop. Does not wait for them; call
    /// [`BlockingServer::join`] afterward.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Block until the acceptor thread has exited (e.g. after [`BlockingServer::stop`] unblocks
    /// its `accept()` call by virtue of the listener being dropped on another thread, or the
    /// process shutting down).
    pub fn join(&mut self) {
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }
}

fn run_acceptor(
    listener: TcpListener,
    storage: Arc<FlatCombinedStore>,
    running: Arc<AtomicBool>,
    active_workers: Arc<AtomicUsize>,
    max_workers: usize,
) {
    while running.load(Ordering::Acquire) {
        let (mut stream, _addr) = match listener.accept() {
            Ok(pair) => pair,
            Err(e) => {
                if running.load(Ordering::Acquire) {
                    tracing::warn!(error = %e, "accept failed");
                }
                continue;
            }
        };

        if active_workers.load(Ordering::Acquire) >= max_workers {
            let _ = stream.write_all(b"SERVER_ERROR Max limit of workers was achieved\r\n");
            continue;
        }

        active_workers.fetch_add(1, Ordering::AcqRel);
        let storage = storage.clone();
        let running = running.clone();
        let active_workers = active_workers.clone();
        std::thread::spawn(move || {
            run_connection(stream, storage.as_ref(), &running);
            storage.detach();
            active_workers.fetch_sub(1, Ordering::AcqRel);
        });
    }
}

fn run_connection(stream: TcpStream, storage: &dyn Storage, running: &AtomicBool) {
    let mut writer = match stream.try_clone() {
        Ok(w) => w,
        Err(e) => {
            tracing::warn!(error = %e, "failed to clone connection for writing");
            return;
        }
    };
    let mut reader = BufReader::new(stream);
    let mut line = String::new();

    while running.load(Ordering::Acquire) {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(error = %e, "connection read failed");
                break;
            }
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            continue;
        }

        match ferrocache_protocol::parse_line(trimmed) {
            Ok(ParsedLine::Complete(cmd)) => {
                let reply = ferrocache_protocol::execute(&cmd, storage);
                if !cmd.noreply() && writer.write_all(&format_reply(&reply)).is_err() {
                    break;
                }
            }
            Ok(ParsedLine::NeedsPayload(pending)) => {
                let mut payload = vec![0u8; pending.payload_len() + 2];
                if reader.read_exact(&mut payload).is_err() {
                    break;
                }
                payload.truncate(pending.payload_len());
                match pending.finish(payload) {
                    Ok(cmd) => {
                        let noreply = cmd.noreply();
                        let reply = ferrocache_protocol::execute(&cmd, storage);
                        if !noreply && writer.write_all(&format_reply(&reply)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        if writer.write_all(&format_error(&e)).is_err() {
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                if writer.write_all(&format_error(&e)).is_err() {
                    break;
                }
            }
        }
    }
}
