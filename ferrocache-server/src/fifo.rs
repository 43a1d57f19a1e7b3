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

//! Named-pipe bridge dispatcher. Grounded on `examples/original_source/src/pipes/FIFOServer.h`
//! and `src/pipes/core/FIFO.cpp`: a reading FIFO and a writing FIFO, one background thread that
//! `select()`s the reading end with a timeout so it notices shutdown promptly, and `writev`-based
//! replies that tolerate a reader that hasn't opened the pipe yet (`EPIPE`) or a full pipe
//! (`EAGAIN`/`EWOULDBLOCK`).
//!
//! Both ends are opened read-write even though only one direction is ever used on each: opening
//! a FIFO for read-only blocks until a writer opens it (and vice versa), which this server has no
//! other-end process to guarantee ahead of time. Opening O_RDWR sidesteps that blocking-open
//! hazard, mirroring the original's own `FIFO::Create(..., is_blocking)` control over this.

use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use ferrocache_memory::FlatCombinedStore;
use ferrocache_protocol::{ParsedLine, Storage};

use crate::error::{Result, ServerError};
use crate::reply::{format_error, format_reply};

/// How long `select()` blocks waiting for the reading FIFO to become readable before looping
/// back around to recheck the running flag. Mirrors `FIFOServer::_reading_timeout` (5 seconds).
const READING_TIMEOUT_SECS: i64 = 5;

/// Bridges a pair of named pipes to the same command dispatch logic the TCP servers use.
pub struct FifoServer {
    storage: Arc<FlatCombinedStore>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl FifoServer {
    pub fn new(storage: Arc<FlatCombinedStore>) -> Self {
        Self {
            storage,
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    /// Create (if absent) and open `reading_path`/`writing_path` as named pipes, then start the
    /// background read/dispatch/write loop.
    pub fn start(&mut self, reading_path: impl AsRef<Path>, writing_path: impl AsRef<Path>) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(ServerError::AlreadyRunning);
        }

        let reading_path = reading_path.as_ref().to_path_buf();
        let writing_path = writing_path.as_ref().to_path_buf();
        ensure_fifo(&reading_path)?;
        ensure_fifo(&writing_path)?;

        let reading = open_fifo(&reading_path)?;
        let writing = open_fifo(&writing_path)?;

        let storage = self.storage.clone();
        let running = self.running.clone();
        self.thread = Some(std::thread::spawn(move || {
            run_bridge(reading, writing, storage.as_ref(), &running);
        }));
        Ok(())
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

fn ensure_fifo(path: &Path) -> Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| ServerError::Syscall("mkfifo", io::Error::from(io::ErrorKind::InvalidInput)))?;
    let ret = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
    if ret != 0 {
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::AlreadyExists {
            return Err(ServerError::Syscall("mkfifo", err));
        }
    }
    Ok(())
}

fn open_fifo(path: &Path) -> Result<File> {
    // O_RDWR, not O_RDONLY/O_WRONLY: opening either half of a FIFO in its single-direction mode
    // blocks until a peer opens the other half. This process has no peer process to guarantee,
    // so both ends are opened bidirectionally and used one-way.
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(ServerError::Io)
}

fn run_bridge(mut reading: File, writing: File, storage: &dyn Storage, running: &AtomicBool) {
    let reading_fd = reading.as_raw_fd();
    let writing_fd = writing.as_raw_fd();
    let mut buf: Vec<u8> = Vec::new();
    let mut scratch = [0u8; 4096];

    while running.load(Ordering::Acquire) {
        match select_readable(reading_fd, READING_TIMEOUT_SECS) {
            Ok(false) => continue, // timed out; recheck `running`
            Ok(true) => {}
            Err(e) => {
                tracing::warn!(error = %e, "select on reading fifo failed");
                break;
            }
        }

        match reading.read(&mut scratch) {
            Ok(0) => continue, // O_RDWR fifos never see EOF; nothing new this pass
            Ok(n) => buf.extend_from_slice(&scratch[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!(error = %e, "read from reading fifo failed");
                break;
            }
        }

        dispatch_complete_lines(&mut buf, storage, writing_fd);
    }
}

/// Parse and execute every complete line currently buffered, writing each reply to the writing
/// FIFO. A storage verb whose payload hasn't fully arrived yet is left in `buf` for the next
/// read.
fn dispatch_complete_lines(buf: &mut Vec<u8>, storage: &dyn Storage, writing_fd: RawFd) {
    loop {
        let Some(pos) = buf.iter().position(|&b| b == b'\n') else {
            return;
        };
        let line: Vec<u8> = buf.drain(..=pos).collect();
        let trimmed = trim_crlf(&line);
        if trimmed.is_empty() {
            continue;
        }
        let Ok(text) = std::str::from_utf8(trimmed) else {
            let _ = write_reply(writing_fd, b"ERROR\r\n");
            continue;
        };

        match ferrocache_protocol::parse_line(text) {
            Ok(ParsedLine::Complete(cmd)) => {
                let reply = ferrocache_protocol::execute(&cmd, storage);
                if !cmd.noreply() {
                    let _ = write_reply(writing_fd, &format_reply(&reply));
                }
            }
            Ok(ParsedLine::NeedsPayload(pending)) => {
                let need = pending.payload_len() + 2;
                if buf.len() < need {
                    // Payload hasn't fully arrived; put the header line back and wait for more.
                    let mut restored = line;
                    restored.extend_from_slice(buf);
                    *buf = restored;
                    return;
                }
                let mut payload: Vec<u8> = buf.drain(..need).collect();
                payload.truncate(pending.payload_len());
                match pending.finish(payload) {
                    Ok(cmd) => {
                        let noreply = cmd.noreply();
                        let reply = ferrocache_protocol::execute(&cmd, storage);
                        if !noreply {
                            let _ = write_reply(writing_fd, &format_reply(&reply));
                        }
                    }
                    Err(e) => {
                        let _ = write_reply(writing_fd, &format_error(&e));
                    }
                }
            }
            Err(e) => {
                let _ = write_reply(writing_fd, &format_error(&e));
            }
        }
    }
}

fn trim_crlf(line: &[u8]) -> &[u8] {
    let mut end = line.len();
    while end > 0 && (line[end - 1] == b'\n' || line[end - 1] == b'\r') {
        end -= 1;
    }
    &line[..end]
}

/// `select()` on a single fd with a whole-second timeout, matching `FIFO::Read`'s use of
/// `select(2)` ahead of the actual `read(2)` (rather than a non-blocking read loop).
fn select_readable(fd: RawFd, timeout_secs: i64) -> Result<bool> {
    unsafe {
        let mut set: libc::fd_set = std::mem::zeroed();
        libc::FD_ZERO(&mut set);
        libc::FD_SET(fd, &mut set);
        let mut tv = libc::timeval {
            tv_sec: timeout_secs,
            tv_usec: 0,
        };
        let ret = libc::select(
            fd + 1,
            &mut set,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            &mut tv,
        );
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(ServerError::Syscall("select", err));
        }
        Ok(ret > 0)
    }
}

/// `writev`-based write of one reply. A full pipe (`EAGAIN`/`EWOULDBLOCK`) retries after an OS
/// yield; a pipe with no readers (`EPIPE`) is logged and dropped rather than treated as fatal,
/// matching `FIFO::Write`'s `FIFOWrittenInformation` state distinction.
fn write_reply(fd: RawFd, data: &[u8]) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    let iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };
    loop {
        let ret = unsafe { libc::writev(fd, &iov, 1) };
        if ret >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK => {
                std::thread::yield_now();
            }
            Some(code) if code == libc::EINTR => continue,
            Some(code) if code == libc::EPIPE => {
                tracing::debug!("writing fifo has no readers; dropping reply");
                return Ok(());
            }
            _ => return Err(ServerError::Syscall("writev", err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trim_crlf_strips_trailing_newline_variants() {
        assert_eq!(trim_crlf(b"get a\r\n"), b"get a");
        assert_eq!(trim_crlf(b"get a\n"), b"get a");
        assert_eq!(trim_crlf(b"get a"), b"get a");
    }

    #[test]
    fn dispatch_complete_lines_executes_a_get_and_leaves_partial_lines_buffered() {
        let store = FlatCombinedStore::new(100);
        store.put(b"a", b"1").unwrap();

        // `dispatch_complete_lines` only needs a `Storage`, not a real fifo fd; pass a fd that
        // is never actually written to by giving every reply command `noreply` semantics isn't
        // possible for `get`, so this test only exercises the no-payload-yet buffering path,
        // which never calls `write_reply` at all.
        let mut buf = b"set k 0 0 5\r\nhel".to_vec();
        dispatch_complete_lines(&mut buf, &store, -1);
        assert_eq!(buf, b"set k 0 0 5\r\nhel".to_vec());
        assert_eq!(store.get(b"k").unwrap(), None);
    }
}
