//! Debugger events delivered one at a time by [`DebugEngine::wait_for_event`].
//!
//! [`DebugEngine::wait_for_event`]: crate::engine::DebugEngine::wait_for_event

use std::fmt;

use crate::exception::ExceptionCode;

/// Identifier the engine hands out for every registered breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BreakpointId(pub u32);

impl fmt::Display for BreakpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A single debugger event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Exception {
        code: ExceptionCode,
        /// Reported before the target's own handler had a chance to run.
        first_chance: bool,
    },
    Breakpoint(BreakpointId),
    ProcessCreated(u32),
    ProcessExited(i32),
    ModuleLoaded {
        name: String,
        base: u64,
    },
    /// The wait elapsed without anything happening.
    Timeout,
}

/// How a stopped target is resumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    /// Let the engine pick the continuation for the pending event.
    Default,
    /// Mark the pending event handled and resume.
    Handled,
}
