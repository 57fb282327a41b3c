//! Run configuration handed to the [`Supervisor`](crate::supervisor::Supervisor).

use crate::capture::DEFAULT_STACK_FRAMES;
use crate::engine::DumpRequest;
use crate::exception::ClassifierPolicy;
use crate::module_hook::DEFAULT_ABORT_SYMBOLS;
use crate::watchdog::WatchdogPolicy;

/// Everything the supervisor needs to know about a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Show all engine output, not just the target's.
    pub verbose: bool,
    pub symbol_path: Option<String>,
    pub dump: DumpRequest,
    pub watchdog: WatchdogPolicy,
    pub classifier: ClassifierPolicy,
    /// Capture after this many first-chance illegal instructions.
    pub illegal_instruction_threshold: Option<u32>,
    /// Install the module-load abort breakpoints.
    pub abort_breakpoints: bool,
    pub abort_symbols: Vec<String>,
    pub stack_frames: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            symbol_path: None,
            dump: DumpRequest::default(),
            watchdog: WatchdogPolicy::default(),
            classifier: ClassifierPolicy::default(),
            illegal_instruction_threshold: None,
            abort_breakpoints: true,
            abort_symbols: DEFAULT_ABORT_SYMBOLS.iter().map(|s| s.to_string()).collect(),
            stack_frames: DEFAULT_STACK_FRAMES,
        }
    }
}
