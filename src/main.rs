#![forbid(unsafe_code)]

//! `marionette`: drives a worker through a queue of navigations.

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use marionette::{AppError, Instance, InstanceOptions, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "marionette", about = "Supervise a rendering worker", version, long_about = None)]
struct Cli {
    /// Path to a TOML file with instance options.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Run the worker against the shared virtual display.
    #[arg(long)]
    shared_display: bool,

    /// Override the worker executable.
    #[arg(long)]
    worker: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Visit each URL in order and print where the page ended up.
    Visit {
        /// URLs to visit.
        #[arg(required = true)]
        urls: Vec<String>,
    },
    /// Start a worker and print the versions it reports.
    Versions,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let mut options = match args.config {
        Some(ref path) => InstanceOptions::load_from_path(path)?,
        None => InstanceOptions::default(),
    };
    if args.shared_display {
        options.shared_display = Some(true);
    }
    if let Some(worker) = args.worker {
        options.worker_path = Some(worker);
    }

    let mut instance = Instance::new(options);
    info!(instance = instance.id(), "instance created");

    match &args.command {
        Command::Visit { urls } => {
            for url in urls {
                instance.goto(url, BTreeMap::new());
            }
            instance.queue_action("url", Vec::new());
        }
        Command::Versions => {}
    }

    let result = instance.end().run().await;
    match result {
        Ok(value) => {
            match args.command {
                Command::Visit { .. } => println!("{}", value.as_str().unwrap_or_default()),
                Command::Versions => println!("{}", instance.engine_versions()),
            }
            Ok(())
        }
        Err(err) => {
            error!(%err, "run failed");
            Err(err)
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
