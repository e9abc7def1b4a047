#![forbid(unsafe_code)]

//! Supervisor for a long-lived rendering worker.
//!
//! An [`Instance`] drives one worker process through a sequential action
//! queue over a bidirectional control channel, optionally sharing a
//! reference-counted virtual display server and session bus with other
//! instances in the same process.

pub mod channel;
pub mod config;
pub mod errors;
pub mod instance;
pub mod lifecycle;
pub mod queue;
pub mod registry;
pub mod runner;

pub use config::InstanceOptions;
pub use errors::{AppError, Result};
pub use instance::{Instance, InstanceState};
