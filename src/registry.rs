//! Action registry.
//!
//! Maps operation names to a supervisor-side [`ParentAction`], which runs
//! inside the action queue, and an optional worker-side [`ChildAction`],
//! which the runner installs under the same name (or `name.member` for
//! grouped families) when the supervisor sends the `action` bootstrap call.
//!
//! The table is resolved when an [`Instance`](crate::Instance) is built; it
//! is never mutated afterwards.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::instance::ActionContext;
use crate::runner::WorkerContext;
use crate::{AppError, Result};

/// Boxed future produced by an action.
pub type ActionFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;

/// Supervisor-side implementation of a queued operation.
#[derive(Clone)]
pub struct ParentAction(Arc<dyn Fn(ActionContext, Vec<Value>) -> ActionFuture + Send + Sync>);

impl ParentAction {
    /// Wrap an async function.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(ActionContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self(Arc::new(move |ctx, args| Box::pin(f(ctx, args))))
    }

    /// Run the action.
    pub fn invoke(&self, ctx: ActionContext, args: Vec<Value>) -> ActionFuture {
        (self.0)(ctx, args)
    }
}

impl fmt::Debug for ParentAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ParentAction")
    }
}

/// Worker-side implementation, invoked when the supervisor calls it by name.
#[derive(Clone)]
pub struct ChildAction(Arc<dyn Fn(WorkerContext, Vec<Value>) -> ActionFuture + Send + Sync>);

impl ChildAction {
    /// Wrap an async function.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(WorkerContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self(Arc::new(move |ctx, args| Box::pin(f(ctx, args))))
    }

    /// Run the action.
    pub fn invoke(&self, ctx: WorkerContext, args: Vec<Value>) -> ActionFuture {
        (self.0)(ctx, args)
    }
}

impl fmt::Debug for ChildAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChildAction")
    }
}

/// Supervisor half of a registration: one action or a named family.
#[derive(Debug, Clone)]
pub enum Parent {
    /// Queued directly under the registered name.
    Single(ParentAction),
    /// Exposed as a namespace whose members are each queueable.
    Group(BTreeMap<String, ParentAction>),
}

/// Worker half of a registration, shaped like its [`Parent`].
#[derive(Debug, Clone)]
pub enum Child {
    /// Installed under the registered name.
    Single(ChildAction),
    /// Installed as `name.member` for each member.
    Group(BTreeMap<String, ChildAction>),
}

/// Name to implementation table.
#[derive(Debug, Clone, Default)]
pub struct ActionRegistry {
    parents: BTreeMap<String, Parent>,
    children: BTreeMap<String, ChildAction>,
}

impl ActionRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-populated with `goto`, `url` and `navigate`.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for (name, parent, child) in builtins() {
            // Builtin names are distinct, so registration cannot collide.
            let _ = registry.register(name, parent, Some(child));
        }
        registry
    }

    /// Add an operation.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `name` is empty, contains a `.`, is
    /// already registered, or if a grouped worker half names a member the
    /// supervisor half does not have.
    pub fn register(&mut self, name: &str, parent: Parent, child: Option<Child>) -> Result<()> {
        if name.is_empty() || name.contains('.') {
            return Err(AppError::Config(format!("invalid action name '{name}'")));
        }
        if self.parents.contains_key(name) {
            return Err(AppError::Config(format!("action '{name}' already registered")));
        }

        match (&parent, child) {
            (_, None) => {}
            (Parent::Single(_), Some(Child::Single(action))) => {
                self.children.insert(name.to_owned(), action);
            }
            (Parent::Group(members), Some(Child::Group(actions))) => {
                if let Some(stray) = actions.keys().find(|member| !members.contains_key(*member)) {
                    return Err(AppError::Config(format!(
                        "worker action '{name}.{stray}' has no supervisor counterpart"
                    )));
                }
                for (member, action) in actions {
                    self.children.insert(format!("{name}.{member}"), action);
                }
            }
            _ => {
                return Err(AppError::Config(format!(
                    "action '{name}' mixes single and grouped halves"
                )))
            }
        }

        self.parents.insert(name.to_owned(), parent);
        Ok(())
    }

    /// Resolve `name` or `namespace.member` to a queueable action.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<&ParentAction> {
        match name.split_once('.') {
            Some((namespace, member)) => self.resolve_member(namespace, member),
            None => match self.parents.get(name)? {
                Parent::Single(action) => Some(action),
                Parent::Group(_) => None,
            },
        }
    }

    /// Resolve one member of a grouped family.
    #[must_use]
    pub fn resolve_member(&self, namespace: &str, member: &str) -> Option<&ParentAction> {
        match self.parents.get(namespace)? {
            Parent::Group(members) => members.get(member),
            Parent::Single(_) => None,
        }
    }

    /// Whether `name` was registered as a grouped family.
    #[must_use]
    pub fn is_namespace(&self, name: &str) -> bool {
        matches!(self.parents.get(name), Some(Parent::Group(_)))
    }

    /// Member names of a grouped family.
    #[must_use]
    pub fn members(&self, namespace: &str) -> Vec<String> {
        match self.parents.get(namespace) {
            Some(Parent::Group(members)) => members.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Registered top-level names.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.parents.keys().cloned().collect()
    }

    /// Every worker-side name, grouped members flattened as `name.member`.
    #[must_use]
    pub fn child_names(&self) -> Vec<String> {
        self.children.keys().cloned().collect()
    }

    /// Worker-side implementation installed under `name`.
    #[must_use]
    pub fn child(&self, name: &str) -> Option<&ChildAction> {
        self.children.get(name)
    }
}

/// Forward a queued action to the worker action of the same name.
#[must_use]
pub fn remote(name: &'static str) -> ParentAction {
    ParentAction::new(move |ctx: ActionContext, args| async move { ctx.call(name, args).await })
}

fn builtins() -> Vec<(&'static str, Parent, Child)> {
    vec![
        ("goto", Parent::Single(remote("goto")), Child::Single(ChildAction::new(goto))),
        (
            "url",
            Parent::Single(remote("url")),
            Child::Single(ChildAction::new(|ctx: WorkerContext, _args| async move {
                Ok(Value::String(ctx.engine().url()))
            })),
        ),
        (
            "navigate",
            Parent::Single(remote("navigate")),
            Child::Single(ChildAction::new(|ctx: WorkerContext, args: Vec<Value>| async move {
                let url = target_url(&args)?;
                ctx.engine().begin_navigation(&url, &headers_arg(&args))?;
                Ok(Value::Null)
            })),
        ),
    ]
}

fn target_url(args: &[Value]) -> Result<String> {
    args.first()
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| AppError::Config("a url argument is required".into()))
}

fn headers_arg(args: &[Value]) -> Map<String, Value> {
    args.get(1)
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

async fn goto(ctx: WorkerContext, args: Vec<Value>) -> Result<Value> {
    let url = target_url(&args)?;
    let engine = ctx.engine();

    if engine.url() == url && !engine.is_loading() {
        return Ok(Value::String(url));
    }

    engine.begin_navigation(&url, &headers_arg(&args))?;
    engine.wait_for_load().await?;
    Ok(Value::String(engine.url()))
}
