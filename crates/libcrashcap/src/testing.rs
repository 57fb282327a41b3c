//! A scripted [`DebugEngine`] for exercising the supervisor without a target.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::engine::{DebugEngine, DumpFormat, Interrupter, OutputMask, OutputSink};
use crate::errors::{CrashcapError, CrashcapResult};
use crate::event::{BreakpointId, Continuation, Event};
use crate::exception::ExceptionCode;

/// Everything the engine was asked to do.
#[derive(Debug, Default)]
pub(crate) struct Journal {
    pub launched: Option<String>,
    pub symbol_path: Option<String>,
    pub resumes: Vec<Continuation>,
    pub breakpoints: Vec<(BreakpointId, String, bool)>,
    pub toggles: usize,
    pub reports: Vec<String>,
    pub dumps: Vec<(PathBuf, DumpFormat)>,
    pub interrupts: usize,
    pub terminations: usize,
    pub releases: usize,
}

struct ScriptedInterrupter {
    requested: AtomicBool,
    journal: Arc<Mutex<Journal>>,
}

impl Interrupter for ScriptedInterrupter {
    fn interrupt(&self) -> CrashcapResult<()> {
        self.journal.lock().unwrap().interrupts += 1;
        self.requested.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Plays back a fixed list of events.
///
/// Once the script runs out the engine reports no target, or, when built with
/// [`ScriptedEngine::hanging`], keeps timing out until interrupted.
pub(crate) struct ScriptedEngine {
    script: VecDeque<Event>,
    journal: Arc<Mutex<Journal>>,
    interrupter: Arc<ScriptedInterrupter>,
    symbols: HashMap<(String, String), u64>,
    failing: HashSet<&'static str>,
    hanging: bool,
    sink: Option<OutputSink>,
    next_breakpoint: u32,
    wait_budget: usize,
    report_delay: Duration,
}

impl ScriptedEngine {
    pub fn new(script: Vec<Event>) -> Self {
        let journal = Arc::new(Mutex::new(Journal::default()));
        Self {
            script: script.into(),
            interrupter: Arc::new(ScriptedInterrupter {
                requested: AtomicBool::new(false),
                journal: journal.clone(),
            }),
            journal,
            symbols: HashMap::new(),
            failing: HashSet::new(),
            hanging: false,
            sink: None,
            next_breakpoint: 1,
            wait_budget: 10_000,
            report_delay: Duration::ZERO,
        }
    }

    pub fn with_symbol(mut self, module: &str, name: &str, address: u64) -> Self {
        self.symbols.insert((module.to_string(), name.to_string()), address);
        self
    }

    /// Make `operation` fail every time it is called.
    pub fn failing(mut self, operation: &'static str) -> Self {
        self.failing.insert(operation);
        self
    }

    pub fn hanging(mut self) -> Self {
        self.hanging = true;
        self
    }

    /// Make every state report take `delay`.
    pub fn slow_reports(mut self, delay: Duration) -> Self {
        self.report_delay = delay;
        self
    }

    pub fn journal(&self) -> Arc<Mutex<Journal>> {
        self.journal.clone()
    }

    /// Events not yet delivered.
    pub fn remaining(&self) -> usize {
        self.script.len()
    }

    fn check(&self, operation: &'static str) -> CrashcapResult<()> {
        if self.failing.contains(operation) {
            return Err(CrashcapError::Engine {
                operation,
                status: 0x8000_4005,
            });
        }
        Ok(())
    }

    fn emit(&mut self, text: &str) {
        if let Some(sink) = self.sink.as_mut() {
            sink(OutputMask::NORMAL, text);
        }
    }
}

impl DebugEngine for ScriptedEngine {
    fn set_output_sink(&mut self, sink: OutputSink) -> CrashcapResult<()> {
        self.check("set_output_sink")?;
        self.sink = Some(sink);
        Ok(())
    }

    fn set_symbol_path(&mut self, path: &str) -> CrashcapResult<()> {
        self.check("set_symbol_path")?;
        self.journal.lock().unwrap().symbol_path = Some(path.to_string());
        Ok(())
    }

    fn launch(&mut self, command_line: &str) -> CrashcapResult<u32> {
        self.check("launch")?;
        self.journal.lock().unwrap().launched = Some(command_line.to_string());
        Ok(4242)
    }

    fn wait_for_event(&mut self, timeout: Duration) -> CrashcapResult<Option<Event>> {
        self.check("wait_for_event")?;
        if self.interrupter.requested.swap(false, Ordering::SeqCst) {
            return Ok(Some(Event::Exception {
                code: ExceptionCode::ControlBreak,
                first_chance: true,
            }));
        }
        if let Some(event) = self.script.pop_front() {
            return Ok(Some(event));
        }
        if !self.hanging {
            return Ok(None);
        }

        self.wait_budget = self
            .wait_budget
            .checked_sub(1)
            .ok_or(CrashcapError::Unsupported("scripted engine waited too long"))?;
        thread::sleep(timeout);
        Ok(Some(Event::Timeout))
    }

    fn resume(&mut self, continuation: Continuation) -> CrashcapResult<()> {
        self.check("resume")?;
        self.journal.lock().unwrap().resumes.push(continuation);
        Ok(())
    }

    fn interrupter(&self) -> Arc<dyn Interrupter> {
        self.interrupter.clone()
    }

    fn resolve_symbol(&mut self, module: &str, name: &str) -> CrashcapResult<Option<u64>> {
        self.check("resolve_symbol")?;
        Ok(self.symbols.get(&(module.to_string(), name.to_string())).copied())
    }

    fn add_breakpoint(&mut self, expression: &str) -> CrashcapResult<BreakpointId> {
        self.check("add_breakpoint")?;
        let id = BreakpointId(self.next_breakpoint);
        self.next_breakpoint += 1;
        self.journal
            .lock()
            .unwrap()
            .breakpoints
            .push((id, expression.to_string(), true));
        Ok(id)
    }

    fn set_breakpoint_enabled(&mut self, id: BreakpointId, enabled: bool) -> CrashcapResult<()> {
        self.check("set_breakpoint_enabled")?;
        let mut journal = self.journal.lock().unwrap();
        let entry = journal
            .breakpoints
            .iter_mut()
            .find(|(bp, _, _)| *bp == id)
            .ok_or(CrashcapError::UnknownBreakpoint(id.0))?;
        entry.2 = enabled;
        journal.toggles += 1;
        Ok(())
    }

    fn report_current_state(&mut self) -> CrashcapResult<()> {
        self.check("report_current_state")?;
        thread::sleep(self.report_delay);
        self.emit("state\n");
        self.journal.lock().unwrap().reports.push("state".into());
        Ok(())
    }

    fn report_all_stacks(&mut self, max_frames: usize) -> CrashcapResult<()> {
        self.check("report_all_stacks")?;
        self.emit("stacks\n");
        self.journal
            .lock()
            .unwrap()
            .reports
            .push(format!("stacks:{max_frames}"));
        Ok(())
    }

    fn write_dump(&mut self, path: &Path, format: DumpFormat) -> CrashcapResult<()> {
        self.check("write_dump")?;
        self.journal.lock().unwrap().dumps.push((path.to_path_buf(), format));
        Ok(())
    }

    fn terminate(&mut self) -> CrashcapResult<i32> {
        self.journal.lock().unwrap().terminations += 1;
        self.check("terminate")?;
        Ok(137)
    }

    fn release(&mut self) {
        self.journal.lock().unwrap().releases += 1;
    }
}
