//! Termination-signal cleanup.
//!
//! Each live instance registers a cleanup closure. On SIGINT, SIGTERM,
//! SIGQUIT or SIGHUP the listener runs every registered cleanup, then exits
//! with `128 + signal number`. A fatal worker fault takes the same
//! [`shutdown`](CleanupRegistry::shutdown) path with code 1. An instance
//! that ends normally drops its [`CleanupGuard`], which deregisters it.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::channel::lock;

/// Boxed future returned by a cleanup closure.
pub type CleanupFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Cleanup run when the process receives a termination signal.
pub type Cleanup = Arc<dyn Fn() -> CleanupFuture + Send + Sync>;

/// Called with the exit code once every cleanup has run.
pub type ExitHook = Arc<dyn Fn(i32) + Send + Sync>;

/// Set of cleanups to run on termination.
pub struct CleanupRegistry {
    entries: Mutex<BTreeMap<u64, Cleanup>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
    exit: ExitHook,
}

impl Default for CleanupRegistry {
    fn default() -> Self {
        Self::with_exit(exit_process)
    }
}

fn exit_process(code: i32) {
    std::process::exit(code);
}

impl fmt::Debug for CleanupRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupRegistry")
            .field("entries", &self.len())
            .finish_non_exhaustive()
    }
}

static GLOBAL: OnceLock<Arc<CleanupRegistry>> = OnceLock::new();

impl CleanupRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry that calls `exit` instead of exiting the
    /// process after [`shutdown`](Self::shutdown).
    #[must_use]
    pub fn with_exit<F>(exit: F) -> Self
    where
        F: Fn(i32) + Send + Sync + 'static,
    {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            listener: Mutex::new(None),
            next_id: AtomicU64::new(0),
            exit: Arc::new(exit),
        }
    }

    /// The process-wide registry.
    #[must_use]
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(Self::new())))
    }

    /// Add a cleanup; it stays registered until the guard is dropped.
    #[must_use = "dropping the guard deregisters the cleanup"]
    pub fn register(self: &Arc<Self>, cleanup: Cleanup) -> CleanupGuard {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        lock(&self.entries).insert(id, cleanup);
        CleanupGuard {
            registry: Arc::downgrade(self),
            id,
        }
    }

    /// Number of registered cleanups.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run and remove every registered cleanup concurrently.
    pub async fn run_all(&self) {
        let cleanups: Vec<Cleanup> = std::mem::take(&mut *lock(&self.entries))
            .into_values()
            .collect();
        if cleanups.is_empty() {
            return;
        }
        info!(count = cleanups.len(), "running instance cleanups");
        join_all(cleanups.iter().map(|cleanup| cleanup())).await;
    }

    /// Run every registered cleanup, then exit with `code`.
    pub async fn shutdown(&self, code: i32) {
        self.run_all().await;
        info!(code, "exiting after cleanup");
        (self.exit)(code);
    }

    /// Start the signal listener unless one is already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn ensure_listener(self: &Arc<Self>) {
        let mut listener = lock(&self.listener);
        if listener.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let registry = Arc::clone(self);
        *listener = Some(tokio::spawn(async move {
            let code = wait_for_termination().await;
            info!(code, "termination signal received");
            registry.shutdown(code).await;
        }));
    }

    fn remove(&self, id: u64) {
        lock(&self.entries).remove(&id);
    }
}

/// Deregisters its cleanup on drop.
#[derive(Debug)]
pub struct CleanupGuard {
    registry: Weak<CleanupRegistry>,
    id: u64,
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}

/// Wait for a termination signal and return the conventional exit code
/// (`128 + signal number`).
#[cfg(unix)]
pub async fn wait_for_termination() -> i32 {
    use nix::sys::signal::Signal;
    use tokio::signal::unix::{signal, SignalKind};

    let kinds = [
        (SignalKind::interrupt(), Signal::SIGINT),
        (SignalKind::terminate(), Signal::SIGTERM),
        (SignalKind::quit(), Signal::SIGQUIT),
        (SignalKind::hangup(), Signal::SIGHUP),
    ];

    let mut waits = Vec::with_capacity(kinds.len());
    for (kind, sig) in kinds {
        match signal(kind) {
            Ok(mut stream) => waits.push(Box::pin(async move {
                stream.recv().await;
                sig
            })),
            Err(err) => warn!(signal = ?sig, %err, "failed to register signal handler"),
        }
    }

    if waits.is_empty() {
        std::future::pending::<()>().await;
    }

    let (sig, _, _) = futures_util::future::select_all(waits).await;
    128 + sig as i32
}

/// Wait for a termination signal and return the conventional exit code.
#[cfg(not(unix))]
pub async fn wait_for_termination() -> i32 {
    match tokio::signal::ctrl_c().await {
        Ok(()) => 130,
        Err(err) => {
            warn!(%err, "ctrl-c signal handler failed");
            std::future::pending::<i32>().await
        }
    }
}
