//! Error types shared across the supervisor, the control channel, and the runner.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// File-system or I/O operation failure.
    Io(String),
    /// A worker or auxiliary process could not be launched.
    Spawn(String),
    /// Control channel framing, transport, or correlation failure.
    Channel(String),
    /// Error reported by the worker in reply to a call.
    Remote(String),
    /// Worker fault: uncaught exception or unexpected exit.
    Worker(String),
    /// Display server or message bus failure.
    Auxiliary(String),
    /// Requested action or entity does not exist.
    NotFound(String),
    /// The instance has already been torn down.
    Ended(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
            Self::Spawn(msg) => write!(f, "spawn: {msg}"),
            Self::Channel(msg) => write!(f, "channel: {msg}"),
            Self::Remote(msg) => write!(f, "remote: {msg}"),
            Self::Worker(msg) => write!(f, "worker: {msg}"),
            Self::Auxiliary(msg) => write!(f, "auxiliary: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Ended(msg) => write!(f, "ended: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Channel(format!("malformed json: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
