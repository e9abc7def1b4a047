//! Sequential action queue.
//!
//! Actions run strictly in enqueue order, one at a time. After each
//! successful action, if more remain, the queue asks the worker to
//! `continue` and only advances once it answers, so a navigation started by
//! one action has settled before the next one runs. The first error stops the
//! drain; the remaining actions are discarded.

use std::collections::VecDeque;

use serde_json::Value;
use tracing::{debug, debug_span, Instrument};

use crate::instance::ActionContext;
use crate::registry::ParentAction;
use crate::Result;

/// Worker method used for the inter-action handshake.
pub const CONTINUE: &str = "continue";

/// One pending unit of work.
#[derive(Debug, Clone)]
pub struct QueuedAction {
    /// Name used in logs.
    pub name: String,
    /// Implementation.
    pub action: ParentAction,
    /// Captured arguments.
    pub args: Vec<Value>,
}

impl QueuedAction {
    /// Bundle an action with its arguments.
    #[must_use]
    pub fn new(name: impl Into<String>, action: ParentAction, args: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            action,
            args,
        }
    }
}

/// FIFO of [`QueuedAction`]s.
#[derive(Debug, Default)]
pub struct ActionQueue {
    items: VecDeque<QueuedAction>,
}

impl ActionQueue {
    /// An empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an action. Never fails.
    pub fn enqueue(&mut self, item: QueuedAction) {
        self.items.push_back(item);
    }

    /// Number of pending actions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Names of pending actions, front first.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.items.iter().map(|item| item.name.clone()).collect()
    }

    /// Discard every pending action.
    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Run every pending action in order and return the last result.
    ///
    /// An empty queue yields `Ok(Value::Null)`. Actions enqueued while the
    /// drain is in progress wait for the next drain.
    ///
    /// # Errors
    ///
    /// Returns the first action error, or a failure of the continue
    /// handshake. Actions after the failing one never run.
    pub async fn drain(&mut self, ctx: &ActionContext) -> Result<Value> {
        let mut pending = std::mem::take(&mut self.items);
        let mut last = Value::Null;

        while let Some(item) = pending.pop_front() {
            let span = debug_span!("action", instance = %ctx.instance_id(), name = %item.name);
            debug!(parent: &span, remaining = pending.len(), "action started");

            last = item
                .action
                .invoke(ctx.clone(), item.args)
                .instrument(span.clone())
                .await?;

            if pending.is_empty() {
                break;
            }

            match ctx.channel() {
                Some(channel) if !channel.is_closed() => {
                    channel.call(CONTINUE, Vec::new()).instrument(span).await?;
                }
                _ => debug!(parent: &span, "no worker connected, continuing without handshake"),
            }
        }

        Ok(last)
    }
}
