//! Bidirectional control channel between supervisor and worker.
//!
//! Both peers run the same [`ControlChannel`] over a duplex byte stream:
//!
//! - [`emit`](ControlChannel::emit) queues a fire-and-forget event.
//! - [`call`](ControlChannel::call) sends a request tagged with a fresh
//!   correlation id and resolves when the matching reply arrives.
//! - [`on`](ControlChannel::on) registers a persistent handler for
//!   unsolicited events (logs, page notifications, worker faults) or, on the
//!   worker side, for incoming requests answered through
//!   [`reply`](ControlChannel::reply).
//! - [`wait_for`](ControlChannel::wait_for) resolves on the next occurrence
//!   of an event.
//!
//! No timeout is enforced here. A call only fails early when the transport
//! closes, at which point every pending call and wait is failed with
//! [`AppError::Channel`].
//!
//! Submodules:
//! - `codec`: line framing with a maximum line length.
//! - `message`: the JSON wire envelope.
//! - `reader` / `writer`: the background stream tasks.

pub mod codec;
pub mod message;
mod reader;
mod writer;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::channel::message::Message;
use crate::{AppError, Result};

/// An event delivered to a handler registered with [`ControlChannel::on`].
#[derive(Debug, Clone, PartialEq)]
pub struct Incoming {
    /// Event or method name.
    pub event: String,
    /// Positional arguments as sent by the peer.
    pub args: Vec<Value>,
    /// Present when the peer expects a reply.
    pub call_id: Option<u64>,
}

/// Persistent event handler.
pub type Handler = Arc<dyn Fn(&Incoming) + Send + Sync>;

type Waiter = oneshot::Sender<Result<Vec<Value>>>;

struct PendingCall {
    method: String,
    tx: oneshot::Sender<Result<Value>>,
}

/// State shared between channel handles and the reader/writer tasks.
pub(crate) struct Shared {
    pub(crate) label: String,
    handlers: Mutex<HashMap<String, Vec<Handler>>>,
    waiters: Mutex<HashMap<String, Vec<Waiter>>>,
    pending: Mutex<HashMap<u64, PendingCall>>,
    closed: AtomicBool,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn new(label: String) -> Self {
        Self {
            label,
            handlers: Mutex::new(HashMap::new()),
            waiters: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Route one inbound message: replies resolve their pending call, other
    /// messages wake waiters and then run persistent handlers.
    pub(crate) fn deliver(&self, message: Message) {
        if let Some(id) = message.reply_to {
            let pending = lock(&self.pending).remove(&id);
            match pending {
                Some(call) => {
                    trace!(channel = %self.label, method = %call.method, call_id = id, "reply received");
                    let _ = call.tx.send(message.into_reply_result());
                }
                None => {
                    warn!(channel = %self.label, event = %message.event, call_id = id, "reply without pending call");
                }
            }
            return;
        }

        let waiters = lock(&self.waiters).remove(&message.event);
        let handlers = lock(&self.handlers)
            .get(&message.event)
            .cloned()
            .unwrap_or_default();

        if waiters.is_none() && handlers.is_empty() {
            trace!(channel = %self.label, event = %message.event, "no listener for event");
        }

        for waiter in waiters.into_iter().flatten() {
            let _ = waiter.send(Ok(message.args.clone()));
        }

        let incoming = Incoming {
            event: message.event,
            args: message.args,
            call_id: message.call_id,
        };
        for handler in &handlers {
            handler(&incoming);
        }
    }

    /// Mark the channel closed and fail everything still waiting on it.
    pub(crate) fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(channel = %self.label, reason, "control channel closed");

        let pending: Vec<PendingCall> = lock(&self.pending).drain().map(|(_, c)| c).collect();
        for call in pending {
            let _ = call.tx.send(Err(AppError::Channel(format!(
                "{reason} while waiting for '{}'",
                call.method
            ))));
        }

        let waiters: Vec<Waiter> = lock(&self.waiters)
            .drain()
            .flat_map(|(_, list)| list)
            .collect();
        for waiter in waiters {
            let _ = waiter.send(Err(AppError::Channel(reason.to_owned())));
        }
    }
}

/// Cloneable handle to one end of a control channel.
#[derive(Clone)]
pub struct ControlChannel {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<Message>,
    next_id: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlChannel")
            .field("label", &self.shared.label)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl ControlChannel {
    /// Start the reader and writer tasks over the given stream halves.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<R, W>(label: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (channel, attach) = Self::unattached(label);
        attach.attach(reader, writer);
        channel
    }

    /// Create a channel whose transport is supplied later.
    ///
    /// Handlers and one-shot waits registered before [`Attach::attach`] are
    /// guaranteed to see the peer's first message. Emitted messages are
    /// queued until the writer starts.
    pub fn unattached(label: impl Into<String>) -> (Self, Attach) {
        let shared = Arc::new(Shared::new(label.into()));
        let cancel = CancellationToken::new();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let attach = Attach {
            shared: Arc::clone(&shared),
            outbound_rx,
            cancel: cancel.clone(),
        };
        let channel = Self {
            shared,
            outbound,
            next_id: Arc::new(AtomicU64::new(1)),
            cancel,
        };
        (channel, attach)
    }

    /// Diagnostic label used in log fields.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.shared.label
    }

    /// Whether the transport has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Send an event without waiting for acknowledgement.
    ///
    /// Never fails at the call site; a closed transport is only logged.
    pub fn emit(&self, event: &str, args: Vec<Value>) {
        self.send(Message::event(event, args));
    }

    /// Send `method` and wait for the correlated reply.
    ///
    /// # Errors
    ///
    /// - [`AppError::Remote`] when the peer replies with an error.
    /// - [`AppError::Channel`] when the channel is or becomes closed before
    ///   the reply arrives.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        if self.is_closed() {
            return Err(AppError::Channel(format!(
                "channel closed, cannot call '{method}'"
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pending).insert(
            id,
            PendingCall {
                method: method.to_owned(),
                tx,
            },
        );

        // The reader may have closed between the check above and the insert.
        if self.is_closed() {
            lock(&self.shared.pending).remove(&id);
            return Err(AppError::Channel(format!(
                "channel closed, cannot call '{method}'"
            )));
        }

        trace!(channel = %self.shared.label, method, call_id = id, "call sent");
        self.send(Message::request(method, args, id));

        rx.await.map_err(|_| {
            AppError::Channel(format!("call '{method}' abandoned before a reply arrived"))
        })?
    }

    /// Answer a request previously delivered with `call_id`.
    pub fn reply(&self, event: &str, call_id: u64, result: Result<Value>) {
        self.send(Message::reply(event, call_id, result));
    }

    /// Register a persistent handler for `event`.
    pub fn on<F>(&self, event: &str, handler: F)
    where
        F: Fn(&Incoming) + Send + Sync + 'static,
    {
        lock(&self.shared.handlers)
            .entry(event.to_owned())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Remove every handler registered for `event`.
    pub fn off(&self, event: &str) {
        lock(&self.shared.handlers).remove(event);
    }

    /// Number of persistent handlers registered for `event`.
    #[must_use]
    pub fn listener_count(&self, event: &str) -> usize {
        lock(&self.shared.handlers).get(event).map_or(0, Vec::len)
    }

    /// Drop every persistent handler and one-shot wait.
    ///
    /// Pending calls are left alone; they fail when the transport closes.
    pub fn remove_all_listeners(&self) {
        lock(&self.shared.handlers).clear();
        lock(&self.shared.waiters).clear();
    }

    /// Resolve with the arguments of the next `event`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Channel`] if the channel closes first.
    pub async fn wait_for(&self, event: &str) -> Result<Vec<Value>> {
        self.once(event).await
    }

    /// Register a one-shot wait for `event` immediately and return a future
    /// resolving with its arguments.
    ///
    /// Unlike [`wait_for`](Self::wait_for), registration happens at the call
    /// site rather than on first poll.
    pub fn once(&self, event: &str) -> impl Future<Output = Result<Vec<Value>>> + Send + 'static {
        let event = event.to_owned();
        let (tx, rx) = oneshot::channel();

        let registered = !self.is_closed() && {
            lock(&self.shared.waiters)
                .entry(event.clone())
                .or_default()
                .push(tx);
            // `close` flips the flag before draining, so a waiter inserted
            // after the drain is caught here.
            !self.is_closed()
        };

        async move {
            if !registered {
                return Err(AppError::Channel(format!(
                    "channel closed, cannot wait for '{event}'"
                )));
            }
            rx.await
                .map_err(|_| AppError::Channel(format!("wait for '{event}' abandoned")))?
        }
    }

    /// Resolve once the transport has closed, locally or by the peer.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }

    /// Stop the background tasks and fail everything still pending.
    pub fn close(&self) {
        self.shared.close("channel closed locally");
        self.cancel.cancel();
    }

    fn send(&self, message: Message) {
        let event = message.event.clone();
        if self.outbound.send(message).is_err() {
            debug!(channel = %self.shared.label, event, "writer gone, message dropped");
        }
    }
}

/// Transport half of an [`unattached`](ControlChannel::unattached) channel.
pub struct Attach {
    shared: Arc<Shared>,
    outbound_rx: mpsc::UnboundedReceiver<Message>,
    cancel: CancellationToken,
}

impl fmt::Debug for Attach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attach")
            .field("label", &self.shared.label)
            .finish_non_exhaustive()
    }
}

impl Attach {
    /// Start the reader and writer tasks. Must be called from within a
    /// tokio runtime.
    pub fn attach<R, W>(self, reader: R, writer: W)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        tokio::spawn(writer::run_writer(
            Arc::clone(&self.shared),
            writer,
            self.outbound_rx,
            self.cancel.clone(),
        ));
        tokio::spawn(reader::run_reader(self.shared, reader, self.cancel));
    }
}
