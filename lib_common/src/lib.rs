//! Shared building blocks for the phat display bridge.
//!
//! Modules are feature-gated so each binary pulls in only what it uses:
//! `core` (default), `connections` (MQTT) and `loggers`. `full` enables all.

#[cfg(feature = "core")]
pub mod core;

#[cfg(feature = "connections")]
pub mod connections;

#[cfg(feature = "loggers")]
pub mod loggers;

#[cfg(feature = "loggers")]
pub use loggers::loggerlocal::{init_logging, rotate_logs, LoggerError};
