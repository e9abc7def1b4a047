//! Shared display server and message bus.
//!
//! Every instance running in shared-display mode acquires a handle on the
//! process-wide [`AuxiliaryGroup`]. The first acquisition allocates a display
//! index and starts the display server followed by the message bus bound to
//! it. The last release stops the display server first, then the bus, and
//! clears the index. Intermediate acquisitions and releases only adjust the
//! handle count.
//!
//! The group state sits behind an async mutex held across the spawn, so two
//! concurrent first acquisitions never start two display servers.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::DISPLAY_ENV;
use crate::lifecycle::display::{
    allocate_display_index, default_framebuffer_args, display_binding, DEFAULT_LOCK_DIR,
};
use crate::lifecycle::output::pipe_lines;
use crate::lifecycle::{terminate_child, ProcessExit};
use crate::{AppError, Result};

/// Static settings for the auxiliary pair.
#[derive(Debug, Clone)]
pub struct AuxiliaryConfig {
    /// Display server executable.
    pub display_program: String,
    /// Message bus executable.
    pub bus_program: String,
    /// Message bus arguments.
    pub bus_args: Vec<String>,
    /// Directory scanned for `.X<N>-lock` files.
    pub lock_dir: PathBuf,
    /// Pause after each spawn so the process can bind its sockets.
    pub settle_delay: Duration,
}

impl Default for AuxiliaryConfig {
    fn default() -> Self {
        Self {
            display_program: "Xvfb".to_owned(),
            bus_program: "dbus-daemon".to_owned(),
            bus_args: vec![
                "--nofork".to_owned(),
                "--session".to_owned(),
                "--print-address".to_owned(),
            ],
            lock_dir: PathBuf::from(DEFAULT_LOCK_DIR),
            settle_delay: Duration::from_millis(350),
        }
    }
}

/// A running auxiliary process.
#[derive(Debug)]
struct AuxProcess {
    name: &'static str,
    child: Child,
}

impl AuxProcess {
    fn spawn(
        name: &'static str,
        program: &str,
        args: &[String],
        display: Option<&str>,
    ) -> Result<Self> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(display) = display {
            cmd.env(DISPLAY_ENV, display);
        }

        let mut child = cmd
            .spawn()
            .map_err(|err| AppError::Auxiliary(format!("failed to start {name} ({program}): {err}")))?;

        if let Some(stdout) = child.stdout.take() {
            pipe_lines(name, "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            pipe_lines(name, "stderr", stderr);
        }

        info!(process = name, program, pid = child.id(), "auxiliary process started");
        Ok(Self { name, child })
    }

    async fn stop(mut self) -> ProcessExit {
        let exit = terminate_child(self.name, &mut self.child).await;
        info!(process = self.name, code = ?exit.code, "auxiliary process stopped");
        exit
    }
}

/// Exit information for both auxiliary processes after the last release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuxShutdown {
    /// Display server exit, absent if it was not running.
    pub display: Option<ProcessExit>,
    /// Message bus exit, absent if it was not running.
    pub bus: Option<ProcessExit>,
}

/// Outcome of [`AuxiliaryGroup::release`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Other holders remain; the processes keep running.
    Retained {
        /// Handles still outstanding.
        handles: usize,
    },
    /// That was the last handle; both processes were stopped.
    Stopped(AuxShutdown),
}

#[derive(Debug, Default)]
struct GroupState {
    handles: usize,
    display_index: Option<u32>,
    display: Option<AuxProcess>,
    bus: Option<AuxProcess>,
}

/// Reference-counted owner of the display server and message bus.
#[derive(Debug)]
pub struct AuxiliaryGroup {
    config: AuxiliaryConfig,
    state: Mutex<GroupState>,
}

static GLOBAL: OnceLock<Arc<AuxiliaryGroup>> = OnceLock::new();

impl AuxiliaryGroup {
    /// Create an independent group. Most callers want [`global`](Self::global).
    #[must_use]
    pub fn new(config: AuxiliaryConfig) -> Self {
        Self {
            config,
            state: Mutex::new(GroupState::default()),
        }
    }

    /// The process-wide group with default settings.
    #[must_use]
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::new(AuxiliaryConfig::default()))))
    }

    /// Take a handle on the group, starting both processes if this is the
    /// first one. Returns the display index in use.
    ///
    /// `framebuffer_args` replaces the default display-server arguments.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Auxiliary` if either process fails to start. The
    /// handle count is unchanged on failure.
    pub async fn acquire(&self, framebuffer_args: Option<&[String]>) -> Result<u32> {
        let mut state = self.state.lock().await;

        if state.handles > 0 {
            if let Some(index) = state.display_index {
                state.handles += 1;
                debug!(handles = state.handles, display = index, "auxiliary group shared");
                return Ok(index);
            }
        }

        let index = match state.display_index {
            Some(index) => index,
            None => allocate_display_index(&self.config.lock_dir).await?,
        };
        let binding = display_binding(index);
        let args = framebuffer_args.map_or_else(|| default_framebuffer_args(index), <[String]>::to_vec);

        let display = AuxProcess::spawn("display", &self.config.display_program, &args, None)?;
        tokio::time::sleep(self.config.settle_delay).await;

        let bus = match AuxProcess::spawn(
            "bus",
            &self.config.bus_program,
            &self.config.bus_args,
            Some(&binding),
        ) {
            Ok(bus) => bus,
            Err(err) => {
                display.stop().await;
                return Err(err);
            }
        };
        tokio::time::sleep(self.config.settle_delay).await;

        state.display_index = Some(index);
        state.display = Some(display);
        state.bus = Some(bus);
        state.handles = 1;

        info!(display = index, "auxiliary group started");
        Ok(index)
    }

    /// Give back one handle, stopping both processes when it was the last.
    ///
    /// Releasing with no outstanding handles is a no-op reported as
    /// `Retained { handles: 0 }`.
    pub async fn release(&self) -> Release {
        let mut state = self.state.lock().await;

        if state.handles == 0 {
            warn!("auxiliary group released with no outstanding handles");
            return Release::Retained { handles: 0 };
        }

        state.handles -= 1;
        if state.handles > 0 {
            debug!(handles = state.handles, "auxiliary group retained");
            return Release::Retained {
                handles: state.handles,
            };
        }

        // Display server stops before the bus.
        let display = match state.display.take() {
            Some(process) => Some(process.stop().await),
            None => None,
        };
        let bus = match state.bus.take() {
            Some(process) => Some(process.stop().await),
            None => None,
        };
        let index = state.display_index.take();

        info!(display = ?index, "auxiliary group stopped");
        Release::Stopped(AuxShutdown { display, bus })
    }

    /// Outstanding handle count.
    pub async fn handles(&self) -> usize {
        self.state.lock().await.handles
    }

    /// Display index while the group is running.
    pub async fn display_index(&self) -> Option<u32> {
        self.state.lock().await.display_index
    }
}

impl Release {
    /// Whether this release stopped the processes.
    #[must_use]
    pub fn stopped(&self) -> bool {
        matches!(self, Self::Stopped(_))
    }

}
