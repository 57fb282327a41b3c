//! The supervisor state machine: launch, dispatch, capture, terminate.
//!
//! A [`Supervisor`] owns one [`EngineSession`] for its whole life. It launches
//! the target, pumps events out of the engine with the watchdog period as the
//! wait granularity, and on the first capture condition runs the
//! [`CaptureOrchestrator`] and terminates the target. Whatever path the run
//! takes, [`Supervisor::cleanup`] stops the watchdog and releases the engine
//! exactly once.

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use log::{debug, error, info, warn};

use crate::capture::{CaptureOrchestrator, CaptureReport, CaptureTrigger};
use crate::config::SupervisorConfig;
use crate::engine::{DebugEngine, EngineSession, OutputMask, OutputSink};
use crate::errors::{CrashcapError, CrashcapResult};
use crate::event::{Continuation, Event};
use crate::exception::{Classification, ExceptionCode, classify};
use crate::module_hook::ModuleLoadHook;
use crate::watchdog::{DialogDetector, NoDialogDetector, Watchdog, WatchdogHandle, WatchdogState};

/// Exit code for failures before or outside the target's own result.
pub const SETUP_FAILURE_EXIT_CODE: i32 = 1;

/// Exit code after a capture when the engine has no status of its own.
pub const CAPTURE_EXIT_CODE: i32 = 3;

/// Lifecycle of a supervised run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Launching,
    Running,
    /// The watchdog asked the engine to break in; waiting for the stop.
    Interrupting,
    Capturing,
    Terminating,
    Exited,
}

/// The trigger and outcome of the run's capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Captured {
    pub trigger: CaptureTrigger,
    pub report: CaptureReport,
}

enum Flow {
    Continue,
    Done(i32),
}

/// Drives one target from launch to exit code.
pub struct Supervisor<E: DebugEngine> {
    session: EngineSession<E>,
    config: SupervisorConfig,
    state: SupervisorState,
    hook: ModuleLoadHook,
    orchestrator: CaptureOrchestrator,
    watchdog_state: Arc<WatchdogState>,
    watchdog: Option<WatchdogHandle>,
    dialog_detector: Arc<dyn DialogDetector>,
    visible_output: Arc<AtomicU32>,
    exit_code: Option<i32>,
    illegal_instructions: u32,
    captured: Option<Captured>,
}

impl<E: DebugEngine> Supervisor<E> {
    pub fn new(engine: E, config: SupervisorConfig) -> Self {
        let visible = if config.verbose {
            OutputMask::all()
        } else {
            OutputMask::DEBUGGEE | OutputMask::ERROR | OutputMask::WARNING
        };

        Self {
            session: EngineSession::new(engine),
            hook: ModuleLoadHook::new(config.abort_symbols.iter().cloned()),
            orchestrator: CaptureOrchestrator::new(config.dump.clone(), config.stack_frames, config.verbose),
            state: SupervisorState::Idle,
            watchdog_state: WatchdogState::new(),
            watchdog: None,
            dialog_detector: Arc::new(NoDialogDetector),
            visible_output: Arc::new(AtomicU32::new(visible.bits())),
            exit_code: None,
            illegal_instructions: 0,
            captured: None,
            config,
        }
    }

    /// Use `detector` to look for modal dialogs owned by the target.
    pub fn with_dialog_detector(mut self, detector: Arc<dyn DialogDetector>) -> Self {
        self.dialog_detector = detector;
        self
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    pub fn captured(&self) -> Option<&Captured> {
        self.captured.as_ref()
    }

    pub fn hook(&self) -> &ModuleLoadHook {
        &self.hook
    }

    pub fn engine(&self) -> &E {
        &self.session
    }

    /// Run `command_line` to completion and return the exit code to propagate.
    pub fn start(&mut self, command_line: &str) -> i32 {
        if self.state != SupervisorState::Idle {
            error!("supervisor has already been started");
            return SETUP_FAILURE_EXIT_CODE;
        }

        self.state = SupervisorState::Launching;
        let code = match self.setup(command_line) {
            Ok(()) => self.run(),
            Err(_) => {
                self.state = SupervisorState::Terminating;
                self.exit_code = Some(SETUP_FAILURE_EXIT_CODE);
                SETUP_FAILURE_EXIT_CODE
            }
        };
        self.cleanup();
        code
    }

    /// Stop the watchdog and release the engine. Safe to call repeatedly.
    pub fn cleanup(&mut self) {
        // Dropping the handle joins the watchdog thread.
        self.watchdog.take();
        self.session.release();
        self.state = SupervisorState::Exited;
    }

    fn setup(&mut self, command_line: &str) -> CrashcapResult<()> {
        let sink = stderr_sink(self.visible_output.clone());
        self.session
            .set_output_sink(sink)
            .inspect_err(|err| fatal("redirect debugger output", err))?;

        if let Some(path) = &self.config.symbol_path {
            if let Err(err) = self.session.set_symbol_path(path) {
                warn!("failed to set symbol path ({:#010x})", err.status());
            }
        }

        let pid = self
            .session
            .launch(command_line)
            .inspect_err(|err| fatal("create the process", err))?;
        info!("launched process {pid}: {command_line}");

        self.watchdog_state.reset();
        let watchdog = Watchdog::new(
            self.config.watchdog,
            pid,
            self.watchdog_state.clone(),
            self.dialog_detector.clone(),
            self.session.interrupter(),
        );
        self.watchdog = Some(watchdog.spawn().map_err(|err| {
            let err = CrashcapError::from(err);
            fatal("start the watchdog", &err);
            err
        })?);

        self.state = SupervisorState::Running;
        Ok(())
    }

    fn run(&mut self) -> i32 {
        let period = self.config.watchdog.poll_period;
        loop {
            if self.state == SupervisorState::Running && self.watchdog_state.is_suppressed() {
                debug!("watchdog interrupt pending");
                self.state = SupervisorState::Interrupting;
            }

            let event = match self.session.wait_for_event(period) {
                Ok(Some(event)) => event,
                Ok(None) => {
                    debug!("no target left to wait on");
                    self.state = SupervisorState::Exited;
                    return *self.exit_code.get_or_insert(0);
                }
                Err(err) => {
                    error!("unexpected error ({:#010x}): {err}", err.status());
                    return self.abort_run();
                }
            };

            match self.dispatch(event) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Done(code)) => return code,
                Err(err) => {
                    error!("failed to proceed ({:#010x}): {err}", err.status());
                    return self.abort_run();
                }
            }
        }
    }

    fn dispatch(&mut self, event: Event) -> CrashcapResult<Flow> {
        match event {
            Event::Timeout => {}
            Event::ProcessExited(code) => {
                info!("process exited with code {code}");
                self.exit_code = Some(code);
                self.state = SupervisorState::Exited;
                return Ok(Flow::Done(code));
            }
            Event::ProcessCreated(pid) => {
                debug!("process {pid} created");
                self.session.resume(Continuation::Default)?;
            }
            Event::ModuleLoaded { name, base } => {
                debug!("module {name} loaded at {base:#x}");
                if self.config.abort_breakpoints {
                    self.hook.on_module_loaded(&mut *self.session, &name);
                }
                self.session.resume(Continuation::Default)?;
            }
            Event::Breakpoint(id) => {
                let expression = self.hook.owns(id).map(|bp| bp.expression.clone());
                if let Some(expression) = expression {
                    return Ok(Flow::Done(self.capture(CaptureTrigger::Breakpoint { expression })));
                }
                warn!("ignoring unexpected breakpoint {id}");
                self.session.resume(Continuation::Default)?;
            }
            Event::Exception { code, first_chance } => {
                if code == ExceptionCode::ControlBreak {
                    if let Some(symptom) = self.watchdog_state.symptom() {
                        return Ok(Flow::Done(self.capture(CaptureTrigger::Hang(symptom))));
                    }
                }

                match self.classify_exception(code, first_chance) {
                    Classification::Ignore => self.session.resume(Continuation::Default)?,
                    Classification::ContinueHandled => self.session.resume(Continuation::Handled)?,
                    Classification::Capture => {
                        let trigger = CaptureTrigger::Exception { code, first_chance };
                        return Ok(Flow::Done(self.capture(trigger)));
                    }
                }
            }
        }
        Ok(Flow::Continue)
    }

    fn classify_exception(&mut self, code: ExceptionCode, first_chance: bool) -> Classification {
        let classification = classify(code, first_chance, &self.config.classifier);
        if classification != Classification::ContinueHandled
            || !first_chance
            || code != ExceptionCode::IllegalInstruction
        {
            return classification;
        }

        self.illegal_instructions += 1;
        match self.config.illegal_instruction_threshold {
            Some(limit) if self.illegal_instructions >= limit => {
                debug!("illegal instruction #{} reached the capture threshold", self.illegal_instructions);
                Classification::Capture
            }
            _ => classification,
        }
    }

    fn capture(&mut self, trigger: CaptureTrigger) -> i32 {
        self.state = SupervisorState::Capturing;
        if self.watchdog_state.claim() {
            debug!("watchdog disarmed for the capture");
        }
        self.watchdog.take();
        self.visible_output.store(OutputMask::all().bits(), Ordering::SeqCst);

        let report = self.orchestrator.capture(&mut *self.session, &trigger);
        self.captured = Some(Captured { trigger, report });

        self.state = SupervisorState::Terminating;
        let code = match self.session.terminate() {
            Ok(0) => CAPTURE_EXIT_CODE,
            Ok(code) => code,
            Err(err) => {
                warn!("failed to terminate the process ({:#010x})", err.status());
                CAPTURE_EXIT_CODE
            }
        };
        self.exit_code = Some(code);
        code
    }

    fn abort_run(&mut self) -> i32 {
        self.state = SupervisorState::Terminating;
        if let Err(err) = self.session.terminate() {
            debug!("terminate after failure: {err}");
        }
        self.exit_code = Some(SETUP_FAILURE_EXIT_CODE);
        SETUP_FAILURE_EXIT_CODE
    }
}

impl<E: DebugEngine> Drop for Supervisor<E> {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn fatal(operation: &str, err: &CrashcapError) {
    error!("failed to {operation} ({:#010x}): {err}", err.status());
}

fn stderr_sink(visible: Arc<AtomicU32>) -> OutputSink {
    Box::new(move |mask: OutputMask, text: &str| {
        if mask.bits() & visible.load(Ordering::SeqCst) != 0 {
            let _ = std::io::stderr().write_all(text.as_bytes());
        }
    })
}
