//! User-facing instance handle.
//!
//! An [`Instance`] owns one action queue and one control channel. Building
//! it enqueues the bootstrap actions ahead of anything the caller adds:
//!
//! 1. acquire the shared display server and bus (shared-display mode only);
//! 2. spawn the worker, wait for `ready`, and forward the session options;
//! 3. install the worker half of every registry action.
//!
//! [`Instance::run`] drains the queue. After [`Instance::end`], the next run
//! tears the session down once the queue has drained, before returning.
//! Teardown runs at most once however it is triggered: `end`, an unexpected
//! worker exit, a worker fault, a termination signal, or dropping the handle.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tokio::sync::{watch, OnceCell};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::channel::{lock, ControlChannel, Incoming};
use crate::config::InstanceOptions;
use crate::lifecycle::auxiliary::{AuxiliaryGroup, Release};
use crate::lifecycle::signals::{Cleanup, CleanupFuture, CleanupGuard, CleanupRegistry};
use crate::lifecycle::worker::{spawn_worker, WorkerProcess, WorkerSpawn};
use crate::lifecycle::{describe_exit, ProcessExit};
use crate::queue::{ActionQueue, QueuedAction};
use crate::registry::{ActionRegistry, ParentAction};
use crate::runner::engine::PAGE_EVENTS;
use crate::runner::{BROWSER_INITIALIZE, INSTALL_ACTION, READY, UNCAUGHT_EXCEPTION};
use crate::{AppError, Result};

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// The worker has not completed its handshake.
    Initial,
    /// The worker is initialised and accepting actions.
    Ready,
}

/// Per-instance state shared with background tasks and action contexts.
struct Session {
    id: String,
    options: InstanceOptions,
    shared_display: bool,
    auxiliary: Arc<AuxiliaryGroup>,
    cleanup: Arc<CleanupRegistry>,
    holds_display: AtomicBool,
    display_index: Mutex<Option<u32>>,
    channel: Mutex<Option<ControlChannel>>,
    worker: tokio::sync::Mutex<Option<WorkerProcess>>,
    ready: AtomicBool,
    engine_versions: Mutex<Value>,
    fault: Mutex<Option<String>>,
    running: AtomicBool,
    ending: AtomicBool,
    ended: AtomicBool,
    teardown: OnceCell<()>,
    cleanup_guard: Mutex<Option<CleanupGuard>>,
}

impl Session {
    fn channel(&self) -> Option<ControlChannel> {
        lock(&self.channel).clone()
    }

    fn fault(&self) -> Option<String> {
        lock(&self.fault).clone()
    }

    fn record_fault(&self, message: String) {
        lock(&self.fault).get_or_insert(message);
    }

    /// Tear the session down. Concurrent and repeated calls share one run.
    async fn end_session(&self) {
        self.teardown
            .get_or_init(|| async {
                self.teardown_once()
                    .instrument(info_span!("teardown", instance = %self.id))
                    .await;
            })
            .await;
    }

    async fn teardown_once(&self) {
        self.ended.store(true, Ordering::SeqCst);

        let channel = lock(&self.channel).take();
        if let Some(ref channel) = channel {
            channel.remove_all_listeners();
        }

        let worker = self.worker.lock().await.take();
        if let Some(mut worker) = worker {
            match worker.terminate().await {
                Some(exit) => info!(
                    pid = worker.pid(),
                    code = ?exit.code,
                    hint = exit.describe(),
                    "worker exited"
                ),
                None => warn!(pid = worker.pid(), "worker exit status unknown"),
            }
        }

        if let Some(channel) = channel {
            channel.close();
        }

        if self.holds_display.swap(false, Ordering::SeqCst) {
            match self.auxiliary.release().await {
                Release::Retained { handles } => {
                    debug!(handles, "auxiliary processes still in use");
                }
                Release::Stopped(_) => debug!("auxiliary processes stopped"),
            }
            *lock(&self.display_index) = None;
        }

        lock(&self.cleanup_guard).take();
        info!("instance ended");
    }

    /// Route worker events to the log and wire fault handling.
    fn install_forwarders(self: &Arc<Self>, channel: &ControlChannel) {
        let id = self.id.clone();
        channel.on("log", move |incoming| {
            debug!(instance = %id, args = ?incoming.args, "worker log");
        });

        let id = self.id.clone();
        channel.on("page", move |incoming| {
            debug!(instance = %id, args = ?incoming.args, "page event");
        });

        for &event in PAGE_EVENTS {
            let id = self.id.clone();
            channel.on(event, move |incoming| {
                debug!(instance = %id, event = %incoming.event, args = ?incoming.args, "engine event");
            });
        }

        let weak = Arc::downgrade(self);
        channel.on(UNCAUGHT_EXCEPTION, move |incoming| {
            let Some(session) = weak.upgrade() else {
                return;
            };
            let stack = incoming
                .args
                .first()
                .map(|arg| arg.as_str().map_or_else(|| arg.to_string(), str::to_owned))
                .unwrap_or_default();
            error!(instance = %session.id, %stack, "uncaught exception in worker");
            session.record_fault(format!("uncaught exception in worker: {stack}"));

            let exit_process = session.options.exit_on_worker_fault;
            tokio::spawn(async move {
                session.end_session().await;
                if exit_process {
                    session.cleanup.shutdown(1).await;
                }
            });
        });
    }

    /// End the session if the worker exits while nobody asked it to.
    fn monitor_worker(self: &Arc<Self>, mut exit: watch::Receiver<Option<ProcessExit>>) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let code = exit
                .wait_for(Option::is_some)
                .await
                .ok()
                .and_then(|exit| exit.and_then(|e| e.code));

            let Some(session) = weak.upgrade() else {
                return;
            };
            if session.ending.load(Ordering::SeqCst) || session.ended.load(Ordering::SeqCst) {
                return;
            }

            warn!(instance = %session.id, ?code, hint = describe_exit(code), "worker exited unexpectedly");
            session.record_fault(format!(
                "worker exited unexpectedly (code {code:?}): {}",
                describe_exit(code)
            ));
            session.end_session().await;
        });
    }
}

/// What a queued action can reach while it runs.
#[derive(Clone)]
pub struct ActionContext {
    session: Arc<Session>,
}

impl fmt::Debug for ActionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionContext")
            .field("instance", &self.session.id)
            .finish_non_exhaustive()
    }
}

impl ActionContext {
    /// Owning instance id.
    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.session.id
    }

    /// Instance options.
    #[must_use]
    pub fn options(&self) -> &InstanceOptions {
        &self.session.options
    }

    /// Advisory wait timeout for actions that attach their own timer.
    #[must_use]
    pub fn wait_timeout(&self) -> std::time::Duration {
        self.session.options.wait_timeout()
    }

    /// The control channel, while a worker is connected.
    #[must_use]
    pub fn channel(&self) -> Option<ControlChannel> {
        self.session.channel()
    }

    /// Call a worker method.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Channel` when no worker is connected, or whatever
    /// [`ControlChannel::call`] returns.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        let channel = self.channel().ok_or_else(|| {
            AppError::Channel(format!("no worker connected, cannot call '{method}'"))
        })?;
        channel.call(method, args).await
    }

    /// Emit an event to the worker. Dropped silently when none is connected.
    pub fn emit(&self, event: &str, args: Vec<Value>) {
        if let Some(channel) = self.channel() {
            channel.emit(event, args);
        }
    }

    /// Subscribe to a worker event.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Channel` when no worker is connected.
    pub fn on<F>(&self, event: &str, handler: F) -> Result<()>
    where
        F: Fn(&Incoming) + Send + Sync + 'static,
    {
        let channel = self.channel().ok_or_else(|| {
            AppError::Channel(format!("no worker connected, cannot listen for '{event}'"))
        })?;
        channel.on(event, handler);
        Ok(())
    }
}

enum Transport {
    Spawn,
    Channel(ControlChannel),
    Detached,
}

/// Configures and builds an [`Instance`].
pub struct InstanceBuilder {
    options: InstanceOptions,
    registry: Option<Arc<ActionRegistry>>,
    auxiliary: Option<Arc<AuxiliaryGroup>>,
    cleanup: Option<Arc<CleanupRegistry>>,
    transport: Transport,
}

impl fmt::Debug for InstanceBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceBuilder")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl InstanceBuilder {
    /// Use `registry` instead of the builtin actions.
    #[must_use]
    pub fn registry(mut self, registry: Arc<ActionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Use `group` instead of the process-wide auxiliary group.
    #[must_use]
    pub fn auxiliary(mut self, group: Arc<AuxiliaryGroup>) -> Self {
        self.auxiliary = Some(group);
        self
    }

    /// Use `registry` instead of the process-wide cleanup registry.
    #[must_use]
    pub fn cleanup(mut self, registry: Arc<CleanupRegistry>) -> Self {
        self.cleanup = Some(registry);
        self
    }

    /// Drive an already-connected worker instead of spawning one.
    ///
    /// No display is acquired and no handshake is performed.
    #[must_use]
    pub fn channel(mut self, channel: ControlChannel) -> Self {
        self.transport = Transport::Channel(channel);
        self
    }

    /// Run without any worker; actions that call it fail.
    #[must_use]
    pub fn detached(mut self) -> Self {
        self.transport = Transport::Detached;
        self
    }

    /// Create the instance and enqueue its bootstrap actions.
    #[must_use]
    pub fn build(self) -> Instance {
        let registry = self
            .registry
            .unwrap_or_else(|| Arc::new(ActionRegistry::with_builtins()));
        let cleanup = self.cleanup.unwrap_or_else(CleanupRegistry::global);
        let spawns_worker = matches!(self.transport, Transport::Spawn);
        let detached = matches!(self.transport, Transport::Detached);
        let shared_display = spawns_worker && self.options.shared_display_enabled();

        let session = Arc::new(Session {
            id: uuid::Uuid::new_v4().simple().to_string(),
            shared_display,
            auxiliary: self.auxiliary.unwrap_or_else(AuxiliaryGroup::global),
            cleanup: Arc::clone(&cleanup),
            options: self.options,
            holds_display: AtomicBool::new(false),
            display_index: Mutex::new(None),
            channel: Mutex::new(None),
            worker: tokio::sync::Mutex::new(None),
            ready: AtomicBool::new(false),
            engine_versions: Mutex::new(Value::Null),
            fault: Mutex::new(None),
            running: AtomicBool::new(false),
            ending: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            teardown: OnceCell::new(),
            cleanup_guard: Mutex::new(None),
        });

        let weak = Arc::downgrade(&session);
        let on_signal: Cleanup = Arc::new(move || -> CleanupFuture {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(session) = weak.upgrade() {
                    session.end_session().await;
                }
            })
        });
        *lock(&session.cleanup_guard) = Some(cleanup.register(on_signal));

        let mut queue = ActionQueue::new();
        match self.transport {
            Transport::Spawn => {
                if shared_display {
                    queue.enqueue(QueuedAction::new(
                        "start-display",
                        ParentAction::new(start_display),
                        Vec::new(),
                    ));
                }
                queue.enqueue(QueuedAction::new(
                    "start-worker",
                    ParentAction::new(start_worker),
                    Vec::new(),
                ));
            }
            Transport::Channel(channel) => {
                session.install_forwarders(&channel);
                *lock(&session.channel) = Some(channel);
                session.ready.store(true, Ordering::SeqCst);
            }
            Transport::Detached => {}
        }

        if !detached {
            for name in registry.child_names() {
                queue.enqueue(QueuedAction::new(
                    format!("install:{name}"),
                    ParentAction::new(install_action),
                    vec![Value::String(name)],
                ));
            }
        }

        info!(instance = %session.id, shared_display, "instance created");

        Instance {
            session,
            registry,
            queue,
            headers: BTreeMap::new(),
        }
    }
}

async fn start_display(ctx: ActionContext, _args: Vec<Value>) -> Result<Value> {
    let session = &ctx.session;
    let index = session
        .auxiliary
        .acquire(session.options.virtual_framebuffer_arguments.as_deref())
        .await?;
    session.holds_display.store(true, Ordering::SeqCst);
    if session.ended.load(Ordering::SeqCst) {
        // Teardown ran during `acquire`; whoever clears the flag releases.
        if session.holds_display.swap(false, Ordering::SeqCst) {
            session.auxiliary.release().await;
        }
        return Err(AppError::Ended(format!(
            "instance {} ended while starting the display",
            session.id
        )));
    }
    *lock(&session.display_index) = Some(index);
    info!(instance = %session.id, display = index, "shared display acquired");
    Ok(Value::from(index))
}

async fn start_worker(ctx: ActionContext, _args: Vec<Value>) -> Result<Value> {
    let session = Arc::clone(&ctx.session);
    let (channel, attach) = ControlChannel::unattached(format!("instance:{}", session.id));
    session.install_forwarders(&channel);
    let ready = channel.once(READY);

    let display = *lock(&session.display_index);
    let launch = WorkerSpawn {
        program: session.options.resolve_worker_path(),
        entry: session.options.runner_entry.clone(),
        bootstrap: session.options.bootstrap_args(display),
        display,
        connect_timeout: session.options.wait_timeout(),
    };
    let worker = spawn_worker(&launch, attach).await?;
    let exit = worker.exit_watch();
    let pid = worker.pid();
    *session.worker.lock().await = Some(worker);
    *lock(&session.channel) = Some(channel.clone());
    session.monitor_worker(exit);

    let versions = ready
        .await
        .map_err(|err| AppError::Worker(format!("worker failed before ready: {err}")))?;
    *lock(&session.engine_versions) = versions.into_iter().next().unwrap_or(Value::Null);

    let options = serde_json::to_value(&session.options)
        .map_err(|err| AppError::Config(format!("cannot encode instance options: {err}")))?;
    channel.call(BROWSER_INITIALIZE, vec![options]).await?;
    session.ready.store(true, Ordering::SeqCst);

    info!(instance = %session.id, ?pid, "worker ready");
    Ok(Value::Null)
}

async fn install_action(ctx: ActionContext, args: Vec<Value>) -> Result<Value> {
    ctx.call(INSTALL_ACTION, args).await
}

/// Handle to one supervised worker session.
///
/// Queueing methods never fail; problems surface from [`run`](Self::run).
pub struct Instance {
    session: Arc<Session>,
    registry: Arc<ActionRegistry>,
    queue: ActionQueue,
    headers: BTreeMap<String, String>,
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.session.id)
            .field("state", &self.state())
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl Instance {
    /// Start configuring an instance.
    #[must_use]
    pub fn builder(options: InstanceOptions) -> InstanceBuilder {
        InstanceBuilder {
            options,
            registry: None,
            auxiliary: None,
            cleanup: None,
            transport: Transport::Spawn,
        }
    }

    /// An instance with the builtin actions and process-wide shared state.
    #[must_use]
    pub fn new(options: InstanceOptions) -> Self {
        Self::builder(options).build()
    }

    /// Unique instance id used in logs.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.session.id
    }

    /// Handshake progress.
    #[must_use]
    pub fn state(&self) -> InstanceState {
        if self.session.ready.load(Ordering::SeqCst) {
            InstanceState::Ready
        } else {
            InstanceState::Initial
        }
    }

    /// Whether the queue is draining.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.session.running.load(Ordering::SeqCst)
    }

    /// Whether [`end`](Self::end) was requested.
    #[must_use]
    pub fn is_ending(&self) -> bool {
        self.session.ending.load(Ordering::SeqCst)
    }

    /// Whether teardown has run.
    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.session.ended.load(Ordering::SeqCst)
    }

    /// Whether this instance opted into the shared display.
    #[must_use]
    pub fn uses_shared_display(&self) -> bool {
        self.session.shared_display
    }

    /// Versions reported by the worker on `ready`.
    #[must_use]
    pub fn engine_versions(&self) -> Value {
        lock(&self.session.engine_versions).clone()
    }

    /// Shared display index while one is held.
    #[must_use]
    pub fn display_index(&self) -> Option<u32> {
        *lock(&self.session.display_index)
    }

    /// Worker process id while one is running.
    pub async fn worker_pid(&self) -> Option<u32> {
        self.session
            .worker
            .lock()
            .await
            .as_ref()
            .and_then(WorkerProcess::pid)
    }

    /// Context handed to queued actions.
    #[must_use]
    pub fn context(&self) -> ActionContext {
        ActionContext {
            session: Arc::clone(&self.session),
        }
    }

    /// Names of the actions waiting to run.
    #[must_use]
    pub fn queued(&self) -> Vec<String> {
        self.queue.names()
    }

    /// Set one default request header.
    pub fn header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Replace all default request headers.
    pub fn set_headers(&mut self, headers: BTreeMap<String, String>) -> &mut Self {
        self.headers = headers;
        self
    }

    /// Default request headers.
    #[must_use]
    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    /// Queue a navigation. Per-call `headers` override the defaults.
    pub fn goto(&mut self, url: &str, headers: BTreeMap<String, String>) -> &mut Self {
        let mut merged = self.headers.clone();
        merged.extend(headers);
        let headers: Map<String, Value> = merged
            .into_iter()
            .map(|(name, value)| (name, Value::String(value)))
            .collect();
        self.queue_action("goto", vec![Value::String(url.to_owned()), Value::Object(headers)])
    }

    /// Queue a registered action by name; `namespace.member` reaches grouped
    /// families. An unknown name queues an action that fails with
    /// `AppError::NotFound`.
    pub fn queue_action(&mut self, name: &str, args: Vec<Value>) -> &mut Self {
        let action = self.registry.resolve(name).cloned().unwrap_or_else(|| {
            let message = format!("no action named '{name}'");
            ParentAction::new(move |_, _| {
                let message = message.clone();
                async move { Err(AppError::NotFound(message)) }
            })
        });
        self.queue.enqueue(QueuedAction::new(name, action, args));
        self
    }

    /// Queue an ad-hoc action that is not in the registry.
    pub fn queue_with(&mut self, name: &str, action: ParentAction, args: Vec<Value>) -> &mut Self {
        self.queue.enqueue(QueuedAction::new(name, action, args));
        self
    }

    /// Queueing handle for a grouped action family.
    pub fn namespace(&mut self, name: &str) -> Namespace<'_> {
        Namespace {
            name: name.to_owned(),
            instance: self,
        }
    }

    /// Queue a subscription to a worker event.
    pub fn on<F>(&mut self, event: &str, handler: F) -> &mut Self
    where
        F: Fn(&Incoming) + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let event_name = event.to_owned();
        let action = ParentAction::new(move |ctx: ActionContext, _args| {
            let handler = Arc::clone(&handler);
            let event_name = event_name.clone();
            async move {
                ctx.on(&event_name, move |incoming| handler(incoming))?;
                Ok(Value::Null)
            }
        });
        self.queue_with(&format!("on:{event}"), action, Vec::new())
    }

    /// Apply `plugin` to this instance.
    pub fn use_plugin<F>(&mut self, plugin: F) -> &mut Self
    where
        F: FnOnce(&mut Self),
    {
        plugin(self);
        self
    }

    /// Tear the session down after the next [`run`](Self::run) drains.
    pub fn end(&mut self) -> &mut Self {
        self.session.ending.store(true, Ordering::SeqCst);
        self
    }

    /// Drain the queue and return the last action's result.
    ///
    /// If [`end`](Self::end) was requested, teardown completes before this
    /// returns, whatever the outcome.
    ///
    /// # Errors
    ///
    /// - The first failing action's error; later actions do not run.
    /// - `AppError::Worker` if the worker faulted or exited mid-call.
    /// - `AppError::Ended` if actions were queued after teardown, or
    ///   `AppError::Worker` when that teardown followed a worker fault.
    pub async fn run(&mut self) -> Result<Value> {
        let session = Arc::clone(&self.session);
        session.cleanup.ensure_listener();

        if session.ended.load(Ordering::SeqCst) {
            let dropped = self.queue.names();
            self.queue.clear();
            if dropped.is_empty() {
                return Ok(Value::Null);
            }
            let dropped = dropped.join(", ");
            return Err(match session.fault() {
                Some(fault) => AppError::Worker(format!("{fault}; dropped {dropped}")),
                None => AppError::Ended(format!(
                    "instance {} already ended, dropped {dropped}",
                    session.id
                )),
            });
        }

        session.running.store(true, Ordering::SeqCst);
        let ctx = self.context();
        let mut result = self
            .queue
            .drain(&ctx)
            .instrument(info_span!("run", instance = %session.id))
            .await;
        session.running.store(false, Ordering::SeqCst);

        if let Err(AppError::Channel(_)) = result {
            if let Some(fault) = session.fault() {
                result = Err(AppError::Worker(fault));
            }
        }

        if session.ending.load(Ordering::SeqCst) {
            session.end_session().await;
        }

        result
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        if self.session.ended.load(Ordering::SeqCst) {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let session = Arc::clone(&self.session);
        handle.spawn(async move {
            session.end_session().await;
        });
    }
}

/// Queueing handle for one grouped action family.
pub struct Namespace<'a> {
    name: String,
    instance: &'a mut Instance,
}

impl fmt::Debug for Namespace<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Namespace").field("name", &self.name).finish()
    }
}

impl<'a> Namespace<'a> {
    /// Queue `member` of this family.
    pub fn queue(&mut self, member: &str, args: Vec<Value>) -> &mut Self {
        self.instance
            .queue_action(&format!("{}.{member}", self.name), args);
        self
    }

    /// Members registered under this family.
    #[must_use]
    pub fn members(&self) -> Vec<String> {
        self.instance.registry.members(&self.name)
    }

    /// Return to the instance.
    pub fn done(self) -> &'a mut Instance {
        self.instance
    }
}
