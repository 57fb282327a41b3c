//! The debug-engine facade the supervisor drives.
//!
//! The supervisor never inspects memory or registers itself. Everything it
//! needs from the platform goes through [`DebugEngine`], which keeps the state
//! machine testable against a scripted engine and lets a platform backend
//! (see [`crate::ptrace`]) do the actual tracing.

use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use log::debug;

use crate::errors::CrashcapResult;
use crate::event::{BreakpointId, Continuation, Event};

bitflags! {
    /// Severity classes of engine output.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OutputMask: u32 {
        const NORMAL = 1 << 0;
        const ERROR = 1 << 1;
        const WARNING = 1 << 2;
        const VERBOSE = 1 << 3;
        /// Output produced on behalf of the target itself.
        const DEBUGGEE = 1 << 4;
    }
}

/// Destination for engine text output.
pub type OutputSink = Box<dyn FnMut(OutputMask, &str) + Send>;

/// Dump flavour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DumpFormat {
    /// Threads, modules, and stack memory only.
    #[default]
    Minimal,
    /// Every readable private mapping as well.
    Full,
}

/// Where, and whether, to write a dump on capture.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DumpRequest {
    /// `None` means report only, no file written.
    pub path: Option<PathBuf>,
    pub format: DumpFormat,
}

/// Asynchronous break-in, callable from any thread.
pub trait Interrupter: Send + Sync {
    /// Ask the engine to stop the target so the main loop receives a
    /// [`ExceptionCode::ControlBreak`](crate::exception::ExceptionCode::ControlBreak).
    fn interrupt(&self) -> CrashcapResult<()>;
}

/// Operations the supervisor needs from a debugging engine.
///
/// All methods except [`Interrupter::interrupt`] are called from the
/// supervisor's thread only.
pub trait DebugEngine {
    /// Route engine text output to `sink`.
    fn set_output_sink(&mut self, sink: OutputSink) -> CrashcapResult<()>;

    /// Override the symbol search path.
    fn set_symbol_path(&mut self, path: &str) -> CrashcapResult<()>;

    /// Launch `command_line` under the engine's control, returning its pid.
    fn launch(&mut self, command_line: &str) -> CrashcapResult<u32>;

    /// Block for at most `timeout` waiting for the next event.
    ///
    /// Returns `Ok(None)` once there is no target left to wait on, and
    /// [`Event::Timeout`] when the wait elapsed.
    fn wait_for_event(&mut self, timeout: Duration) -> CrashcapResult<Option<Event>>;

    /// Resume the target after the last event.
    fn resume(&mut self, continuation: Continuation) -> CrashcapResult<()>;

    /// A handle the watchdog can use to break into the target.
    fn interrupter(&self) -> Arc<dyn Interrupter>;

    /// Break into the target from the supervisor's own thread.
    fn interrupt(&self) -> CrashcapResult<()> {
        self.interrupter().interrupt()
    }

    /// Resolve `name` in `module`. `Ok(None)` when the module has no such symbol.
    fn resolve_symbol(&mut self, module: &str, name: &str) -> CrashcapResult<Option<u64>>;

    /// Register an enabled breakpoint at a `module!symbol` expression.
    fn add_breakpoint(&mut self, expression: &str) -> CrashcapResult<BreakpointId>;

    fn set_breakpoint_enabled(&mut self, id: BreakpointId, enabled: bool) -> CrashcapResult<()>;

    /// Symbol, code, registers, and source line of the stopped thread.
    fn report_current_state(&mut self) -> CrashcapResult<()>;

    /// Stack trace of every thread, at most `max_frames` frames each.
    fn report_all_stacks(&mut self, max_frames: usize) -> CrashcapResult<()>;

    fn write_dump(&mut self, path: &Path, format: DumpFormat) -> CrashcapResult<()>;

    /// Force the target to stop for good, returning the status it ended with.
    fn terminate(&mut self) -> CrashcapResult<i32>;

    /// Drop every resource held for the target. Must tolerate repeated calls.
    fn release(&mut self);
}

/// Scoped ownership of an engine: released exactly once, explicitly or on drop.
#[derive(Debug)]
pub struct EngineSession<E: DebugEngine> {
    engine: E,
    released: bool,
}

impl<E: DebugEngine> EngineSession<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            released: false,
        }
    }

    /// Release the engine. Later calls are no-ops.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        debug!("releasing debug engine");
        self.engine.release();
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl<E: DebugEngine> Deref for EngineSession<E> {
    type Target = E;

    fn deref(&self) -> &E {
        &self.engine
    }
}

impl<E: DebugEngine> DerefMut for EngineSession<E> {
    fn deref_mut(&mut self) -> &mut E {
        &mut self.engine
    }
}

impl<E: DebugEngine> Drop for EngineSession<E> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedEngine;

    #[test]
    fn session_releases_once() {
        let engine = ScriptedEngine::new(Vec::new());
        let journal = engine.journal();
        let mut session = EngineSession::new(engine);
        session.release();
        session.release();
        drop(session);
        assert_eq!(journal.lock().unwrap().releases, 1);
    }

    #[test]
    fn session_releases_on_drop() {
        let engine = ScriptedEngine::new(Vec::new());
        let journal = engine.journal();
        {
            let session = EngineSession::new(engine);
            assert!(!session.is_released());
        }
        assert_eq!(journal.lock().unwrap().releases, 1);
    }
}
