//! Instance options, environment toggles, and worker bootstrap arguments.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{AppError, Result};

/// Environment flag that enables shared-display mode (display server + bus).
pub const USE_XVFB_ENV: &str = "MARIONETTE_USE_XVFB";

/// Environment variable carrying the control socket name to the worker.
pub const IPC_NAME_ENV: &str = "MARIONETTE_IPC_NAME";

/// Environment variable binding a process to an X display.
pub const DISPLAY_ENV: &str = "DISPLAY";

/// File name of the reference worker binary.
pub const RUNNER_BIN: &str = "marionette-runner";

fn default_wait_timeout_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

/// Options for a single supervised instance.
///
/// Everything except the supervisor-only knobs is forwarded to the worker in
/// the `browser-initialize` call, mirroring how the engine receives its
/// window options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct InstanceOptions {
    /// Advisory timeout used by actions that wait on the page.
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,
    /// Override path to the worker executable.
    #[serde(default)]
    pub worker_path: Option<PathBuf>,
    /// Entry script passed as the first worker argument, when the worker is
    /// a host runtime rather than a self-contained binary.
    #[serde(default)]
    pub runner_entry: Option<PathBuf>,
    /// Named application paths forwarded to the worker.
    #[serde(default)]
    pub paths: BTreeMap<String, String>,
    /// Command-line switches forwarded to the worker.
    #[serde(default)]
    pub switches: BTreeMap<String, String>,
    /// Whether the worker keeps its dock icon visible.
    #[serde(default)]
    pub dock: bool,
    /// Replacement argument list for the display server.
    #[serde(default)]
    pub virtual_framebuffer_arguments: Option<Vec<String>>,
    /// Explicit shared-display toggle; falls back to [`USE_XVFB_ENV`].
    #[serde(default)]
    pub shared_display: Option<bool>,
    /// Exit the supervisor process after an uncaught worker exception.
    #[serde(default = "default_true")]
    pub exit_on_worker_fault: bool,
    /// Free-form session options handed to the engine on initialisation.
    #[serde(default)]
    pub browser: Map<String, Value>,
}

impl Default for InstanceOptions {
    fn default() -> Self {
        Self {
            wait_timeout_ms: default_wait_timeout_ms(),
            worker_path: None,
            runner_entry: None,
            paths: BTreeMap::new(),
            switches: BTreeMap::new(),
            dock: false,
            virtual_framebuffer_arguments: None,
            shared_display: None,
            exit_on_worker_fault: true,
            browser: Map::new(),
        }
    }
}

impl InstanceOptions {
    /// Load and validate options from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse options from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let options: Self = toml::from_str(raw)?;
        options.validate()?;
        Ok(options)
    }

    /// Advisory wait timeout as a [`Duration`].
    #[must_use]
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    /// Whether this instance runs against the shared display server.
    #[must_use]
    pub fn shared_display_enabled(&self) -> bool {
        self.shared_display.unwrap_or_else(|| env_flag(USE_XVFB_ENV))
    }

    /// Resolve the worker executable.
    ///
    /// Uses `worker_path` when set, then a `marionette-runner` binary next to
    /// the current executable, then a bare name resolved through `PATH`.
    #[must_use]
    pub fn resolve_worker_path(&self) -> PathBuf {
        if let Some(ref path) = self.worker_path {
            return path.clone();
        }

        let file_name = format!("{RUNNER_BIN}{}", env::consts::EXE_SUFFIX);
        env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(&file_name)))
            .filter(|candidate| candidate.is_file())
            .unwrap_or_else(|| PathBuf::from(file_name))
    }

    /// Build the JSON bootstrap argument passed on the worker command line.
    #[must_use]
    pub fn bootstrap_args(&self, display: Option<u32>) -> BootstrapArgs {
        BootstrapArgs {
            paths: self.paths.clone(),
            switches: self.switches.clone(),
            dock: self.dock,
            display: display.map(|index| format!(":{index}")),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.wait_timeout_ms == 0 {
            return Err(AppError::Config(
                "wait_timeout_ms must be greater than zero".into(),
            ));
        }

        if self
            .virtual_framebuffer_arguments
            .as_ref()
            .is_some_and(Vec::is_empty)
        {
            return Err(AppError::Config(
                "virtual_framebuffer_arguments must not be empty when set".into(),
            ));
        }

        Ok(())
    }
}

/// Arguments handed to the worker as a single JSON command-line element.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct BootstrapArgs {
    /// Named application paths to apply before the engine starts.
    #[serde(default)]
    pub paths: BTreeMap<String, String>,
    /// Engine command-line switches.
    #[serde(default)]
    pub switches: BTreeMap<String, String>,
    /// Keep the dock icon visible.
    #[serde(default)]
    pub dock: bool,
    /// Display binding (`:N`) when running against the shared display.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

impl BootstrapArgs {
    /// Encode as the single JSON argument placed on the worker command line.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if serialisation fails.
    pub fn to_arg(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|err| AppError::Config(format!("cannot encode bootstrap argument: {err}")))
    }

    /// Decode from a process argument list; the JSON document is the last
    /// element. A missing argument yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the last argument is not valid JSON.
    pub fn from_args<I>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        match args.into_iter().skip(1).last() {
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|err| AppError::Config(format!("invalid bootstrap argument: {err}"))),
            None => Ok(Self::default()),
        }
    }
}

/// Read a boolean environment flag. `1`, `true`, `yes`, and `on` are truthy.
#[must_use]
pub fn env_flag(name: &str) -> bool {
    env::var(name).is_ok_and(|value| {
        matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}
