//! Core library for the crashcap crash-capture supervisor.
//!
//! A [`Supervisor`] launches a target under a [`DebugEngine`], watches it for
//! crashes, assertion failures, and hangs, and on the first one captures a
//! state report, every thread's stack, and an optional dump before
//! terminating it. The CLI front end lives in the `crashcap` crate.

pub mod capture;
pub mod command_line;
pub mod config;
pub mod engine;
pub mod errors;
pub mod event;
pub mod exception;
pub mod module_hook;
#[cfg(target_os = "linux")]
pub mod ptrace;
pub mod supervisor;
pub mod watchdog;

#[cfg(test)]
mod testing;

pub use command_line::CommandLine;
pub use config::SupervisorConfig;
pub use engine::{DebugEngine, DumpFormat, DumpRequest};
pub use errors::{CrashcapError, CrashcapResult};
pub use supervisor::{Supervisor, SupervisorState};

/// Exposes the crate version for CLI reporting.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
