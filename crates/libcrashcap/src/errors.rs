//! Error taxonomy for the supervisor core.

use nix::errno;
use std::ffi::NulError;
use thiserror::Error;

/// Unified result type across the supervisor core.
pub type CrashcapResult<T> = Result<T, CrashcapError>;

/// Error cases
#[derive(Debug, Error)]
pub enum CrashcapError {
    /// An engine operation reported a failure status.
    #[error("{operation} failed (status {status:#010x})")]
    Engine {
        operation: &'static str,
        status: u32,
    },

    #[error("command line length exceeds {limit} characters")]
    CommandLineTooLong { limit: usize },

    #[error("no command line given")]
    EmptyCommandLine,

    #[error("unbalanced quote in command line")]
    UnbalancedQuote,

    #[error("no target process")]
    NoTarget,

    #[error("unknown module: {0}")]
    UnknownModule(String),

    #[error("cannot resolve breakpoint expression: {0}")]
    BadExpression(String),

    #[error("unknown breakpoint #{0}")]
    UnknownBreakpoint(u32),

    #[error("unsupported on this platform: {0}")]
    Unsupported(&'static str),

    #[error("system call failed: {0}")]
    SysCall(#[from] errno::Errno),

    #[error("C string error: {0}")]
    CStringError(#[from] NulError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object file error: {0}")]
    Object(#[from] object::Error),

    #[error("DWARF error: {0}")]
    Dwarf(#[from] gimli::Error),
}

impl CrashcapError {
    /// Numeric status reported alongside fatal diagnostics.
    ///
    /// Engine failures carry their own status; system call and I/O failures
    /// report the underlying errno; everything else reports `1`.
    pub fn status(&self) -> u32 {
        match self {
            CrashcapError::Engine { status, .. } => *status,
            CrashcapError::SysCall(errno) => *errno as i32 as u32,
            CrashcapError::Io(err) => err.raw_os_error().map_or(1, |code| code as u32),
            _ => 1,
        }
    }
}
