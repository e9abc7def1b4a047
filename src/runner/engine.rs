//! Rendering-engine seam and the in-memory reference engine.
//!
//! The runner only talks to the page through [`Engine`]. [`MemoryEngine`]
//! models a single page with a committed URL and a loading flag, and emits
//! the same lifecycle notifications a real engine would, which is enough to
//! drive the whole supervisor stack without a browser.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use crate::channel::lock;
use crate::config::BootstrapArgs;
use crate::{AppError, Result};

/// Page lifecycle events passed through to the supervisor verbatim.
pub const PAGE_EVENTS: &[&str] = &[
    "did-start-loading",
    "did-stop-loading",
    "did-finish-load",
    "did-fail-load",
    "did-fail-provisional-load",
    "did-frame-finish-load",
    "did-get-response-details",
    "did-get-redirect-request",
    "dom-ready",
    "page-favicon-updated",
    "new-window",
    "will-navigate",
    "crashed",
    "plugin-crashed",
    "destroyed",
];

/// Switch controlling the simulated navigation latency of [`MemoryEngine`].
pub const NAVIGATION_DELAY_SWITCH: &str = "navigation-delay-ms";

/// URL schemes [`MemoryEngine`] can navigate to.
const SUPPORTED_SCHEMES: &[&str] = &["http", "https", "file", "about", "data"];

/// A notification emitted by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct PageEvent {
    /// Event name, one of [`PAGE_EVENTS`].
    pub name: String,
    /// Event arguments.
    pub args: Vec<Value>,
}

/// The page driven by the runner.
pub trait Engine: Send + Sync {
    /// Version information reported in the `ready` event.
    fn versions(&self) -> Value;

    /// Apply session options received in `browser-initialize`.
    ///
    /// # Errors
    ///
    /// Returns an error if the options are unusable.
    fn initialize(&self, options: &Value) -> Result<()>;

    /// Last committed URL.
    fn url(&self) -> String;

    /// Whether a navigation is in progress.
    fn is_loading(&self) -> bool;

    /// Start navigating to `url` without waiting for it to finish.
    ///
    /// # Errors
    ///
    /// Returns an error if the navigation cannot start.
    fn begin_navigation(&self, url: &str, headers: &Map<String, Value>) -> Result<()>;

    /// Resolve once no navigation is in progress.
    ///
    /// # Errors
    ///
    /// Returns an error if the most recent navigation failed.
    fn wait_for_load(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Subscribe to lifecycle notifications.
    fn events(&self) -> broadcast::Receiver<PageEvent>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct LoadState {
    generation: u64,
    loading: bool,
    failure: Option<String>,
}

struct Inner {
    url: Mutex<String>,
    options: Mutex<Value>,
    load: watch::Sender<LoadState>,
    events: broadcast::Sender<PageEvent>,
    navigation_delay: Duration,
    paths: BTreeMap<String, String>,
}

impl Inner {
    fn emit(&self, name: &str, args: Vec<Value>) {
        // No subscribers is fine.
        let _ = self.events.send(PageEvent {
            name: name.to_owned(),
            args,
        });
    }
}

/// In-process page model.
#[derive(Clone)]
pub struct MemoryEngine {
    inner: Arc<Inner>,
}

impl fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryEngine")
            .field("url", &self.url())
            .field("loading", &self.is_loading())
            .finish_non_exhaustive()
    }
}

impl MemoryEngine {
    /// Create an engine at `about:blank` with the given navigation latency.
    #[must_use]
    pub fn new(navigation_delay: Duration) -> Self {
        Self::with_paths(navigation_delay, BTreeMap::new())
    }

    fn with_paths(navigation_delay: Duration, paths: BTreeMap<String, String>) -> Self {
        let (load, _) = watch::channel(LoadState::default());
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                url: Mutex::new("about:blank".to_owned()),
                options: Mutex::new(Value::Null),
                load,
                events,
                navigation_delay,
                paths,
            }),
        }
    }

    /// Create an engine configured from the worker bootstrap arguments.
    ///
    /// The `navigation-delay-ms` switch sets the navigation latency; a
    /// missing or unparsable value means zero.
    #[must_use]
    pub fn from_bootstrap(args: &BootstrapArgs) -> Self {
        let delay = args
            .switches
            .get(NAVIGATION_DELAY_SWITCH)
            .and_then(|raw| raw.parse::<u64>().ok())
            .map_or(Duration::ZERO, Duration::from_millis);
        for (name, path) in &args.paths {
            debug!(name, path, "application path set");
        }
        Self::with_paths(delay, args.paths.clone())
    }

    /// Application path registered under `name`.
    #[must_use]
    pub fn path(&self, name: &str) -> Option<&str> {
        self.inner.paths.get(name).map(String::as_str)
    }

    /// Options received in the last `browser-initialize`.
    #[must_use]
    pub fn options(&self) -> Value {
        lock(&self.inner.options).clone()
    }

    fn fail(&self, generation: u64, url: &str, reason: &str) -> AppError {
        self.inner.load.send_modify(|state| {
            if state.generation == generation {
                state.loading = false;
                state.failure = Some(reason.to_owned());
            }
        });
        self.inner
            .emit("did-fail-load", vec![json!(-300), json!(reason), json!(url)]);
        self.inner.emit("did-stop-loading", Vec::new());
        AppError::Remote(format!("navigation to '{url}' failed: {reason}"))
    }
}

fn scheme_supported(url: &str) -> bool {
    url.split_once(':')
        .is_some_and(|(scheme, _)| SUPPORTED_SCHEMES.contains(&scheme.to_ascii_lowercase().as_str()))
}

impl Engine for MemoryEngine {
    fn versions(&self) -> Value {
        json!({
            "marionette": env!("CARGO_PKG_VERSION"),
            "engine": "memory",
        })
    }

    fn initialize(&self, options: &Value) -> Result<()> {
        if !(options.is_object() || options.is_null()) {
            return Err(AppError::Config(
                "engine options must be an object".into(),
            ));
        }
        *lock(&self.inner.options) = options.clone();
        info!("engine initialized");
        Ok(())
    }

    fn url(&self) -> String {
        lock(&self.inner.url).clone()
    }

    fn is_loading(&self) -> bool {
        self.inner.load.borrow().loading
    }

    fn begin_navigation(&self, url: &str, headers: &Map<String, Value>) -> Result<()> {
        let mut generation = 0;
        self.inner.load.send_modify(|state| {
            state.generation += 1;
            state.loading = true;
            state.failure = None;
            generation = state.generation;
        });
        self.inner.emit("did-start-loading", Vec::new());

        if !scheme_supported(url) {
            return Err(self.fail(generation, url, "ERR_INVALID_URL"));
        }

        debug!(url, headers = headers.len(), generation, "navigation started");

        let inner = Arc::clone(&self.inner);
        let url = url.to_owned();
        tokio::spawn(async move {
            tokio::time::sleep(inner.navigation_delay).await;
            if inner.load.borrow().generation != generation {
                // Superseded by a newer navigation.
                return;
            }
            *lock(&inner.url) = url.clone();
            inner.emit("dom-ready", Vec::new());
            inner.emit("did-finish-load", Vec::new());
            inner.load.send_modify(|state| {
                if state.generation == generation {
                    state.loading = false;
                }
            });
            inner.emit("did-stop-loading", Vec::new());
            debug!(url, generation, "navigation finished");
        });

        Ok(())
    }

    fn wait_for_load(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut rx = self.inner.load.subscribe();
            let failure = rx
                .wait_for(|state| !state.loading)
                .await
                .map_err(|_| AppError::Remote("engine shut down".into()))?
                .failure
                .clone();
            match failure {
                Some(reason) => Err(AppError::Remote(format!("navigation failed: {reason}"))),
                None => Ok(()),
            }
        })
    }

    fn events(&self) -> broadcast::Receiver<PageEvent> {
        self.inner.events.subscribe()
    }
}
