//! Process lifecycle management.
//!
//! Owns everything that touches OS processes:
//! - `display`: display-index allocation from lock files.
//! - `auxiliary`: the shared, reference-counted display server and message
//!   bus pair.
//! - `worker`: spawning one worker per instance and wiring its control
//!   socket.
//! - `output`: line-buffered log sinks for child stdout/stderr.
//! - `signals`: per-instance cleanup run on termination signals.

pub mod auxiliary;
pub mod display;
pub mod output;
pub mod signals;
pub mod worker;

use std::time::{Duration, Instant};

use tokio::process::Child;
use tracing::warn;

/// Grace period between a polite termination signal and a forced kill.
pub const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// How a supervised child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, absent when the process was killed by a signal.
    pub code: Option<i32>,
    /// When the exit was observed.
    pub at: Instant,
}

impl ProcessExit {
    /// Human-readable hint for the exit code.
    #[must_use]
    pub fn describe(&self) -> &'static str {
        describe_exit(self.code)
    }
}

/// Map well-known exit codes to a diagnostic hint. Informational only.
#[must_use]
pub fn describe_exit(code: Option<i32>) -> &'static str {
    match code {
        Some(0) => "success",
        Some(1) => "general error - a display server may be required",
        Some(126) => "permission problem or command is not an executable",
        Some(127) => "command not found - the worker may not be installed correctly",
        Some(_) => "unexpected exit code",
        None => "terminated by signal",
    }
}

/// Ask `child` to stop with SIGTERM, escalating to a kill after
/// [`TERMINATE_GRACE`].
pub(crate) async fn terminate_child(name: &str, child: &mut Child) -> ProcessExit {
    send_terminate(name, child);

    let status = match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(err)) => {
            warn!(process = name, %err, "error waiting for child process");
            None
        }
        Err(_elapsed) => {
            warn!(
                process = name,
                "child process did not exit within grace period, forcing kill"
            );
            if let Err(err) = child.kill().await {
                warn!(process = name, %err, "failed to force-kill child process");
            }
            child.wait().await.ok()
        }
    };

    ProcessExit {
        code: status.and_then(|s| s.code()),
        at: Instant::now(),
    }
}

#[cfg(unix)]
fn send_terminate(name: &str, child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) else {
        // Already reaped.
        return;
    };
    if let Err(err) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        warn!(process = name, pid, %err, "failed to send SIGTERM");
    }
}

#[cfg(not(unix))]
fn send_terminate(name: &str, child: &mut Child) {
    if let Err(err) = child.start_kill() {
        warn!(process = name, %err, "failed to kill child process");
    }
}
