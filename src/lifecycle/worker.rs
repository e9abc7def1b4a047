//! Worker process spawning and supervision.
//!
//! The supervisor listens on a fresh local socket, launches the worker with
//! the socket name in its environment, and attaches the control channel to
//! the first accepted connection. A monitor task owns the child for its whole
//! life and publishes the exit on a watch channel, so any number of
//! observers can await it.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced, ListenerOptions};
use tokio::process::Command;
use tokio::sync::{oneshot, watch};
use tracing::{info, warn};

use crate::channel::Attach;
use crate::config::{BootstrapArgs, DISPLAY_ENV, IPC_NAME_ENV};
use crate::lifecycle::display::display_binding;
use crate::lifecycle::output::pipe_lines;
use crate::lifecycle::{describe_exit, terminate_child, ProcessExit};
use crate::{AppError, Result};

/// Everything needed to launch one worker.
#[derive(Debug, Clone)]
pub struct WorkerSpawn {
    /// Worker executable.
    pub program: PathBuf,
    /// Optional entry script passed before the bootstrap argument.
    pub entry: Option<PathBuf>,
    /// Bootstrap document passed as the last argument.
    pub bootstrap: BootstrapArgs,
    /// Shared display index, when running against one.
    pub display: Option<u32>,
    /// How long to wait for the worker to connect back.
    pub connect_timeout: Duration,
}

/// Handle to a running worker process.
#[derive(Debug)]
pub struct WorkerProcess {
    pid: Option<u32>,
    ipc_name: String,
    kill_tx: Option<oneshot::Sender<()>>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
}

/// Unique local socket name for one worker.
fn ipc_name() -> String {
    format!(
        "marionette-{}-{}",
        std::process::id(),
        uuid::Uuid::new_v4().simple()
    )
}

/// Launch the worker described by `launch` and attach `attach` to its
/// control connection.
///
/// # Errors
///
/// - `AppError::Spawn` if the socket cannot be created or the executable
///   cannot be launched.
/// - `AppError::Worker` if the worker exits or fails to connect within
///   `launch.connect_timeout`.
pub async fn spawn_worker(launch: &WorkerSpawn, attach: Attach) -> Result<WorkerProcess> {
    let name = ipc_name();
    let listener_name = name
        .clone()
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| AppError::Spawn(format!("invalid ipc socket name '{name}': {err}")))?;
    let listener = ListenerOptions::new()
        .name(listener_name)
        .create_tokio()
        .map_err(|err| AppError::Spawn(format!("failed to create ipc listener: {err}")))?;

    let mut cmd = Command::new(&launch.program);
    if let Some(ref entry) = launch.entry {
        cmd.arg(entry);
    }
    cmd.arg(launch.bootstrap.to_arg()?)
        .env(IPC_NAME_ENV, &name)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(index) = launch.display {
        cmd.env(DISPLAY_ENV, display_binding(index));
    }

    let mut child = cmd.spawn().map_err(|err| {
        let hint = match err.kind() {
            ErrorKind::NotFound => "command not found",
            ErrorKind::PermissionDenied => "permission denied",
            _ => "spawn failed",
        };
        AppError::Spawn(format!(
            "failed to start worker {}: {hint}: {err}",
            launch.program.display()
        ))
    })?;
    let pid = child.id();

    if let Some(stdout) = child.stdout.take() {
        pipe_lines("worker", "stdout", stdout);
    }
    if let Some(stderr) = child.stderr.take() {
        pipe_lines("worker", "stderr", stderr);
    }

    info!(pid, program = %launch.program.display(), ipc_name = %name, "worker started");

    let (kill_tx, kill_rx) = oneshot::channel::<()>();
    let (exit_tx, exit_rx) = watch::channel(None);

    tokio::spawn(async move {
        let exit = tokio::select! {
            status = child.wait() => {
                let code = match status {
                    Ok(status) => status.code(),
                    Err(err) => {
                        warn!(pid, %err, "failed to wait for worker");
                        None
                    }
                };
                ProcessExit { code, at: Instant::now() }
            }
            // Fires on an explicit kill and when the handle is dropped.
            _ = kill_rx => terminate_child("worker", &mut child).await,
        };
        let _ = exit_tx.send(Some(exit));
    });

    let mut process = WorkerProcess {
        pid,
        ipc_name: name,
        kill_tx: Some(kill_tx),
        exit_rx,
    };

    let mut exit_watch = process.exit_rx.clone();
    let accepted = tokio::select! {
        accepted = tokio::time::timeout(launch.connect_timeout, listener.accept()) => accepted,
        code = async {
            exit_watch
                .wait_for(Option::is_some)
                .await
                .ok()
                .and_then(|exit| exit.and_then(|e| e.code))
        } => {
            return Err(AppError::Worker(format!(
                "worker exited before connecting (code {code:?}): {}",
                describe_exit(code)
            )));
        }
    };

    let stream = match accepted {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            process.terminate().await;
            return Err(AppError::Spawn(format!("failed to accept worker connection: {err}")));
        }
        Err(_elapsed) => {
            process.terminate().await;
            return Err(AppError::Worker(format!(
                "worker did not connect within {}ms",
                launch.connect_timeout.as_millis()
            )));
        }
    };

    let (reader, writer) = stream.split();
    attach.attach(reader, writer);
    Ok(process)
}

impl WorkerProcess {
    /// OS process id, if known.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Local socket name the worker connected on.
    #[must_use]
    pub fn ipc_name(&self) -> &str {
        &self.ipc_name
    }

    /// Whether the process is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    /// The exit, once observed.
    #[must_use]
    pub fn exited(&self) -> Option<ProcessExit> {
        *self.exit_rx.borrow()
    }

    /// A receiver that observes the exit.
    #[must_use]
    pub fn exit_watch(&self) -> watch::Receiver<Option<ProcessExit>> {
        self.exit_rx.clone()
    }

    /// Stop the worker and wait for it to exit. Idempotent.
    pub async fn terminate(&mut self) -> Option<ProcessExit> {
        if let Some(tx) = self.kill_tx.take() {
            let _ = tx.send(());
        }
        let mut rx = self.exit_rx.clone();
        let exit = match rx.wait_for(Option::is_some).await {
            Ok(exit) => *exit,
            Err(_) => None,
        };
        exit
    }
}
