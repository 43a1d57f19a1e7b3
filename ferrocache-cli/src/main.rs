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

//! Binary entry point: parses [`args::Args`], builds a [`FlatCombinedStore`], wires up whichever
//! dispatcher was requested, and blocks until `SIGINT`/`SIGTERM`-style shutdown (`Ctrl-C`).

mod args;

use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use ferrocache_memory::FlatCombinedStore;
use ferrocache_server::BlockingServer;

use args::{Args, Dispatcher};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    ferrocache_common::tracing_setup::init();
    let args = Args::parse();

    let storage = Arc::new(FlatCombinedStore::with_params(
        args.capacity.0,
        args.combiner_batch_size,
        args.combiner_saving_time,
    ));

    match args.dispatcher {
        Dispatcher::Blocking => run_blocking(&args, storage).await,
        Dispatcher::Nonblocking => run_nonblocking(&args, storage).await,
        Dispatcher::Fifo => run_fifo(&args, storage).await,
    }
}

async fn run_blocking(args: &Args, storage: Arc<FlatCombinedStore>) -> anyhow::Result<()> {
    let mut server = BlockingServer::new(storage, args.workers);
    server
        .start(&args.listen)
        .with_context(|| format!("binding blocking dispatcher to {}", args.listen))?;
    tracing::info!(addr = %args.listen, workers = args.workers, "blocking dispatcher listening");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutting down");
    server.stop();
    tokio::task::spawn_blocking(move || server.join()).await?;
    Ok(())
}

#[cfg(target_os = "linux")]
async fn run_nonblocking(args: &Args, storage: Arc<FlatCombinedStore>) -> anyhow::Result<()> {
    let mut server = ferrocache_server::NonBlockingServer::new(storage, args.workers);
    server
        .start(&args.listen)
        .with_context(|| format!("binding non-blocking dispatcher to {}", args.listen))?;
    tracing::info!(addr = %args.listen, workers = args.workers, "non-blocking dispatcher listening");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutting down");
    server.stop();
    tokio::task::spawn_blocking(move || server.join()).await?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn run_nonblocking(_args: &Args, _storage: Arc<FlatCombinedStore>) -> anyhow::Result<()> {
    bail!("the non-blocking (epoll) dispatcher is only available on Linux");
}

async fn run_fifo(args: &Args, storage: Arc<FlatCombinedStore>) -> anyhow::Result<()> {
    let mut server = ferrocache_server::FifoServer::new(storage);
    server
        .start(&args.fifo_read, &args.fifo_write)
        .with_context(|| format!("opening fifos {} / {}", args.fifo_read, args.fifo_write))?;
    tracing::info!(
        read = %args.fifo_read,
        write = %args.fifo_write,
        "fifo dispatcher bridged"
    );

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutting down");
    server.stop();
    tokio::task::spawn_blocking(move || server.join()).await?;
    Ok(())
}
