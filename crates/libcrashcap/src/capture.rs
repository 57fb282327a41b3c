//! The diagnostic capture sequence run once a target has failed.

use std::fmt;
use std::path::PathBuf;

use log::{info, warn};

use crate::engine::{DebugEngine, DumpRequest};
use crate::exception::ExceptionCode;
use crate::watchdog::HangSymptom;

/// Default cap on frames per thread.
pub const DEFAULT_STACK_FRAMES: usize = 50;

/// What caused the capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureTrigger {
    Exception {
        code: ExceptionCode,
        first_chance: bool,
    },
    Breakpoint {
        expression: String,
    },
    Hang(HangSymptom),
}

impl fmt::Display for CaptureTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureTrigger::Exception { code, first_chance } => write!(
                f,
                "uncaught exception - code {code} ({} chance)",
                if *first_chance { "first" } else { "second" }
            ),
            CaptureTrigger::Breakpoint { expression } => write!(f, "abort breakpoint hit at {expression}"),
            CaptureTrigger::Hang(HangSymptom::Timeout { elapsed }) => {
                write!(f, "timeout after {}s", elapsed.as_secs())
            }
            CaptureTrigger::Hang(HangSymptom::ModalDialog) => f.write_str("modal dialog blocking the process"),
        }
    }
}

/// Which capture steps succeeded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureReport {
    pub state_reported: bool,
    pub stacks_reported: bool,
    /// Set when a dump file was written.
    pub dump: Option<PathBuf>,
}

/// Drives the engine through the report and dump steps.
#[derive(Debug, Clone)]
pub struct CaptureOrchestrator {
    dump: DumpRequest,
    stack_frames: usize,
    verbose: bool,
}

impl CaptureOrchestrator {
    pub fn new(dump: DumpRequest, stack_frames: usize, verbose: bool) -> Self {
        Self {
            dump,
            stack_frames,
            verbose,
        }
    }

    /// Run every step; failures are logged and the remaining steps still run.
    pub fn capture<E: DebugEngine + ?Sized>(&self, engine: &mut E, trigger: &CaptureTrigger) -> CaptureReport {
        warn!("{trigger}");
        let mut report = CaptureReport::default();

        match engine.report_current_state() {
            Ok(()) => report.state_reported = true,
            Err(err) => warn!("failed to output current state ({:#010x})", err.status()),
        }

        match engine.report_all_stacks(self.stack_frames) {
            Ok(()) => report.stacks_reported = true,
            Err(err) => warn!("failed to output a stack trace ({:#010x})", err.status()),
        }

        if let Some(path) = &self.dump.path {
            match engine.write_dump(path, self.dump.format) {
                Ok(()) => {
                    if self.verbose {
                        info!("{} created", path.display());
                    }
                    report.dump = Some(path.clone());
                }
                Err(err) => warn!("failed to create dump file ({:#010x})", err.status()),
            }
        }

        report
    }
}
