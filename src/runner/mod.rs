//! Worker-side endpoint.
//!
//! The runner connects back to the supervisor's local socket, answers the
//! protocol calls every worker understands, and installs registry actions on
//! demand:
//!
//! - `browser-initialize(options)` applies session options to the engine.
//! - `continue()` replies once no navigation is in progress.
//! - `action(name)` installs the worker half of a registered action under
//!   `name`, after which the supervisor can call it directly.
//!
//! Engine lifecycle notifications are forwarded verbatim, and `ready` is
//! emitted once everything is wired.

pub mod engine;

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use interprocess::local_socket::{
    tokio::{prelude::*, Stream},
    GenericNamespaced,
};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::channel::{ControlChannel, Incoming};
use crate::registry::ActionRegistry;
use crate::runner::engine::Engine;
use crate::{AppError, Result};

/// Protocol method applying session options.
pub const BROWSER_INITIALIZE: &str = "browser-initialize";
/// Protocol method installing a registry action.
pub const INSTALL_ACTION: &str = "action";
/// Event carrying the engine versions once the runner is wired.
pub const READY: &str = "ready";
/// Event carrying a worker-side panic.
pub const UNCAUGHT_EXCEPTION: &str = "uncaughtException";

/// What a worker-side action can reach.
#[derive(Clone)]
pub struct WorkerContext {
    channel: ControlChannel,
    engine: Arc<dyn Engine>,
}

impl fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerContext")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

impl WorkerContext {
    /// Bundle a channel and an engine.
    #[must_use]
    pub fn new(channel: ControlChannel, engine: Arc<dyn Engine>) -> Self {
        Self { channel, engine }
    }

    /// Channel to the supervisor.
    #[must_use]
    pub fn channel(&self) -> &ControlChannel {
        &self.channel
    }

    /// The page engine.
    #[must_use]
    pub fn engine(&self) -> Arc<dyn Engine> {
        Arc::clone(&self.engine)
    }

    /// Emit a `log` event to the supervisor.
    pub fn log(&self, message: impl Into<String>) {
        self.channel.emit("log", vec![Value::String(message.into())]);
    }
}

/// Connect to the supervisor's control socket.
///
/// # Errors
///
/// Returns `AppError::Channel` if the name is invalid or nothing listens on it.
pub async fn connect(name: &str) -> Result<ControlChannel> {
    let socket_name = name
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| AppError::Channel(format!("invalid ipc socket name '{name}': {err}")))?;
    let stream = Stream::connect(socket_name)
        .await
        .map_err(|err| AppError::Channel(format!("failed to connect to supervisor: {err}")))?;
    let (reader, writer) = stream.split();
    Ok(ControlChannel::spawn("runner", reader, writer))
}

/// Report panics to the supervisor as `uncaughtException`, then run the
/// previously installed hook.
pub fn install_panic_hook(channel: ControlChannel) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        channel.emit(UNCAUGHT_EXCEPTION, vec![Value::String(info.to_string())]);
        previous(info);
    }));
}

/// Run `work` and, when the peer expects it, reply with its outcome.
fn respond<F>(channel: &ControlChannel, incoming: &Incoming, work: F)
where
    F: Future<Output = Result<Value>> + Send + 'static,
{
    let channel = channel.clone();
    let event = incoming.event.clone();
    let call_id = incoming.call_id;
    tokio::spawn(async move {
        let result = work.await;
        match call_id {
            Some(id) => channel.reply(&event, id, result),
            None => {
                if let Err(err) = result {
                    warn!(event, %err, "worker action failed without a caller");
                }
            }
        }
    });
}

fn install(ctx: &WorkerContext, registry: &ActionRegistry, name: &str) -> Result<()> {
    let action = registry
        .child(name)
        .cloned()
        .ok_or_else(|| AppError::NotFound(format!("no worker action named '{name}'")))?;

    if ctx.channel.listener_count(name) > 0 {
        debug!(name, "worker action already installed");
        return Ok(());
    }

    let handler_ctx = ctx.clone();
    ctx.channel.on(name, move |incoming| {
        let fut = action.invoke(handler_ctx.clone(), incoming.args.clone());
        respond(&handler_ctx.channel, incoming, fut);
    });
    debug!(name, "worker action installed");
    Ok(())
}

/// Serve the worker protocol on `channel` until it closes.
///
/// # Errors
///
/// Returns `AppError::Channel` if the channel is already closed.
pub async fn serve(
    channel: ControlChannel,
    engine: Arc<dyn Engine>,
    registry: Arc<ActionRegistry>,
) -> Result<()> {
    if channel.is_closed() {
        return Err(AppError::Channel("supervisor channel closed before serving".into()));
    }

    let ctx = WorkerContext::new(channel, engine);

    let init_ctx = ctx.clone();
    ctx.channel.on(BROWSER_INITIALIZE, move |incoming| {
        let options = incoming.args.first().cloned().unwrap_or(Value::Null);
        let engine = init_ctx.engine();
        respond(&init_ctx.channel, incoming, async move {
            engine.initialize(&options)?;
            Ok(Value::Null)
        });
    });

    let continue_ctx = ctx.clone();
    ctx.channel.on(crate::queue::CONTINUE, move |incoming| {
        let ctx = continue_ctx.clone();
        respond(&continue_ctx.channel, incoming, async move {
            let engine = ctx.engine();
            if engine.is_loading() {
                ctx.log("navigating...");
                if let Err(err) = engine.wait_for_load().await {
                    debug!(%err, "navigation settled with an error");
                }
                ctx.log(format!("navigated to: {}", engine.url()));
            }
            Ok(Value::Null)
        });
    });

    let install_ctx = ctx.clone();
    ctx.channel.on(INSTALL_ACTION, move |incoming| {
        let result = incoming
            .args
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::Config("action name is required".into()))
            .and_then(|name| install(&install_ctx, &registry, name))
            .map(|()| Value::Null);
        respond(&install_ctx.channel, incoming, async move { result });
    });

    let mut events = ctx.engine.events();
    let forward = ctx.channel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = forward.closed() => break,
                event = events.recv() => match event {
                    Ok(event) => forward.emit(&event.name, event.args),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "page events dropped");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
    });

    ctx.channel.emit(READY, vec![ctx.engine.versions()]);
    info!("runner ready");

    ctx.channel.closed().await;
    info!("supervisor disconnected");
    Ok(())
}
