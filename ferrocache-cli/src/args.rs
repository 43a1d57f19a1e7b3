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

use bytesize::ByteSize;
use clap::{Parser, ValueEnum};

use ferrocache_memory::combiner::{DEFAULT_BATCH_SIZE, DEFAULT_SAVING_TIME};

/// Which dispatcher front-ends the store (§6). All three speak the same memcached-style text
/// protocol against the same `FlatCombinedStore`; they differ only in how client sessions are
/// scheduled onto OS threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Dispatcher {
    /// One OS thread per TCP connection.
    Blocking,
    /// Epoll-driven worker threads, connections multiplexed as coroutine tasks (Linux only).
    Nonblocking,
    /// A pair of named pipes instead of a socket.
    Fifo,
}

/// `ferrocache`: an in-memory, LRU-evicting key/value cache server.
#[derive(Debug, Parser)]
#[command(name = "ferrocache", version, about)]
pub struct Args {
    /// Maximum total size of keys plus values the store will hold, e.g. `64MiB`, `512KB`.
    #[arg(long, default_value = "64MB")]
    pub capacity: ByteSize,

    /// Which dispatcher to run.
    #[arg(long, value_enum, default_value_t = Dispatcher::Blocking)]
    pub dispatcher: Dispatcher,

    /// Address to listen on, for the `blocking`/`nonblocking` dispatchers.
    #[arg(long, default_value = "127.0.0.1:11211")]
    pub listen: String,

    /// Cap on concurrently handled connections (`blocking`: worker threads;
    /// `nonblocking`: epoll worker threads).
    #[arg(long, default_value_t = 128)]
    pub workers: usize,

    /// Path to the FIFO clients write commands into, for `--dispatcher fifo`.
    #[arg(long, default_value = "/tmp/ferrocache.in")]
    pub fifo_read: String,

    /// Path to the FIFO the server writes replies into, for `--dispatcher fifo`.
    #[arg(long, default_value = "/tmp/ferrocache.out")]
    pub fifo_write: String,

    /// Maximum number of ready slots one flat-combiner pass applies before sorting and invoking
    /// the store (§4.2's batch size `Q`).
    #[arg(long, default_value_t = DEFAULT_BATCH_SIZE)]
    pub combiner_batch_size: usize,

    /// Epochs a flat-combiner slot may sit idle in the queue before a combine pass reaps it.
    #[arg(long, default_value_t = DEFAULT_SAVING_TIME)]
    pub combiner_saving_time: u64,
}
