#![forbid(unsafe_code)]

//! `marionette-runner`: reference worker process.
//!
//! Connects to the socket named in `MARIONETTE_IPC_NAME`, reads its bootstrap
//! document from the last argument, and serves the worker protocol over an
//! in-memory engine until the supervisor disconnects or a termination signal
//! arrives.

use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use marionette::config::{BootstrapArgs, IPC_NAME_ENV};
use marionette::lifecycle::signals::wait_for_termination;
use marionette::registry::ActionRegistry;
use marionette::runner::engine::MemoryEngine;
use marionette::runner;
use marionette::{AppError, Result};

fn main() -> Result<()> {
    init_tracing()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run())
}

async fn run() -> Result<()> {
    let bootstrap = BootstrapArgs::from_args(std::env::args())?;
    let name = std::env::var(IPC_NAME_ENV)
        .map_err(|_| AppError::Config(format!("{IPC_NAME_ENV} is not set")))?;

    let channel = runner::connect(&name).await?;
    runner::install_panic_hook(channel.clone());
    info!(display = ?bootstrap.display, dock = bootstrap.dock, "runner connected");

    let engine = Arc::new(MemoryEngine::from_bootstrap(&bootstrap));
    let registry = Arc::new(ActionRegistry::with_builtins());

    tokio::select! {
        result = runner::serve(channel.clone(), engine, registry) => result?,
        code = wait_for_termination() => {
            info!(code, "runner stopping on signal");
            channel.close();
        }
    }

    Ok(())
}

fn init_tracing() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))
}
