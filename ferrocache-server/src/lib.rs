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

//! I/O dispatchers that sit in front of a [`ferrocache_memory::FlatCombinedStore`] and speak the
//! memcached-style text protocol parsed by `ferrocache-protocol` (§1, §6). Three collaborators,
//! three ways of driving the same five-operation storage contract:
//!
//! - [`blocking::BlockingServer`]: one OS thread per TCP connection.
//! - [`nonblocking::NonBlockingServer`] (Linux only): one epoll instance per worker thread,
//!   connections multiplexed as `ferrocache-coroutine` tasks on that thread.
//! - [`fifo::FifoServer`]: a pair of named pipes bridged to the same dispatch logic, for clients
//!   that would rather write a FIFO than open a socket.
//!
//! None of this module's code ever reaches into the store directly — it only calls
//! `ferrocache_protocol::{parse_line, execute}` against the `Storage` trait, matching §1's
//! framing of every dispatcher as a thin, external collaborator.

pub mod blocking;
pub mod error;
pub mod fifo;
#[cfg(target_os = "linux")]
pub mod nonblocking;
mod reply;

pub use blocking::BlockingServer;
pub use error::{Result, ServerError};
pub use fifo::FifoServer;
#[cfg(target_os = "linux")]
pub use nonblocking::NonBlockingServer;

/// Ignore `SIGPIPE` so a client closing its read side mid-write doesn't kill the process.
/// Shared by every dispatcher that writes to a socket; grounded on `ServerImpl`'s own
/// `signal(SIGPIPE, SIG_IGN)` call in `Run()`.
#[cfg(target_os = "linux")]
pub(crate) fn mask_sigpipe() -> Result<()> {
    let ret = unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };
    if ret == libc::SIG_ERR {
        return Err(ServerError::Syscall("signal", std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn mask_sigpipe() -> Result<()> {
    Ok(())
}
