//! Core library for the run-command VM extension handler
//!
//! This crate contains settings resolution, the sequence and process guards,
//! status reporting, command execution and the dispatcher that ties them
//! together for each invocation from the host agent.

pub mod config;
pub mod dispatch;
pub mod download;
pub mod errors;
pub mod exec;
pub mod handler_env;
pub mod io;
pub mod logging;
pub mod process;
pub mod redaction;
pub mod sequence;
pub mod settings;
pub mod status;

/// Get the version of the core library
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
