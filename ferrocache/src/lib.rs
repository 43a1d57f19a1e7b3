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

//! `ferrocache`: an in-memory, LRU-evicting key/value cache server in the style of the text
//! memcached protocol.
//!
//! This crate is a one-dependency facade over the workspace's members, mirroring the teacher
//! workspace's own top-level `foyer` crate: applications that just want "the cache" depend on
//! `ferrocache` rather than wiring `ferrocache-memory`, `ferrocache-coroutine`,
//! `ferrocache-protocol`, and `ferrocache-server` together themselves. `ferrocache-cli` is the
//! one consumer in this repository; it is also the intended shape for anyone embedding the
//! store in their own binary.
//!
//! The three subsystems that matter (§2 of the design docs) are re-exported at the crate root:
//! the bounded [`LruStore`] and the [`FlatCombiner`]/[`FlatCombinedStore`] that makes it safe to
//! share across threads, and the [`Engine`] that multiplexes coroutine tasks onto one OS thread
//! for the non-blocking dispatcher. Everything past that — TCP acceptors, FIFO bridging, command
//! parsing — is an external collaborator against the five-operation [`Storage`] contract, per
//! `ferrocache-protocol`/`ferrocache-server`.

pub use ferrocache_coroutine::{Engine, TaskHandle};
pub use ferrocache_memory::{FlatCombinedStore, FlatCombiner, LruStore, Op, OpResult};
pub use ferrocache_protocol::{execute, parse_line, Command, ParsedLine, Reply, Storage, ValueEntry};
pub use ferrocache_server::{BlockingServer, FifoServer};
#[cfg(target_os = "linux")]
pub use ferrocache_server::NonBlockingServer;

pub use ferrocache_common::error::CombineError;
