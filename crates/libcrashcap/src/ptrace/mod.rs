//! Linux backend for [`DebugEngine`] built on `ptrace(2)`.
//!
//! Signals stand in for exceptions: a signal stop is reported as first
//! chance when the stopped thread will run a handler for it, and as second
//! chance when delivering it would take the default action. Module loads
//! are discovered from `/proc/<pid>/maps`, once at exec and again every
//! time the dynamic loader calls its debugger hook.

mod breakpoint;
mod disasm;
mod dump;
mod maps;
mod process;
mod registers;
mod report;
mod signals;
mod symbols;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::ffi::c_void;
use std::fmt::Write as _;
use std::mem;
use std::path::Path;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use nix::errno::Errno;
use nix::libc;
use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

use self::breakpoint::BreakpointTable;
use self::process::ProcessHandle;
use self::signals::Fault;
use self::symbols::{ModuleTable, SymbolPath};
use crate::command_line;
use crate::engine::{DebugEngine, DumpFormat, Interrupter, OutputMask, OutputSink};
use crate::errors::{CrashcapError, CrashcapResult};
use crate::event::{BreakpointId, Continuation, Event};
use crate::exception::ExceptionCode;

/// How long a wait sleeps between polls of the target.
const WAIT_SLICE: Duration = Duration::from_millis(10);

/// The dynamic loader calls this after every change to the link map.
const RENDEZVOUS_SYMBOL: &str = "_dl_debug_state";

const EVENT_FORK: i32 = ptrace::Event::PTRACE_EVENT_FORK as i32;
const EVENT_VFORK: i32 = ptrace::Event::PTRACE_EVENT_VFORK as i32;
const EVENT_VFORK_DONE: i32 = ptrace::Event::PTRACE_EVENT_VFORK_DONE as i32;
const EVENT_CLONE: i32 = ptrace::Event::PTRACE_EVENT_CLONE as i32;
const EVENT_EXEC: i32 = ptrace::Event::PTRACE_EVENT_EXEC as i32;
const EVENT_STOP: i32 = ptrace::Event::PTRACE_EVENT_STOP as i32;

/// Breaks into the target by sending it `SIGSTOP`.
#[derive(Debug, Default)]
pub struct PtraceInterrupter {
    pid: AtomicI32,
    requested: AtomicBool,
}

impl PtraceInterrupter {
    fn attach(&self, pid: Pid) {
        self.requested.store(false, Ordering::SeqCst);
        self.pid.store(pid.as_raw(), Ordering::SeqCst);
    }

    fn detach(&self) {
        self.pid.store(0, Ordering::SeqCst);
        self.requested.store(false, Ordering::SeqCst);
    }

    /// Consume a pending request, if any.
    fn take_request(&self) -> bool {
        self.requested.swap(false, Ordering::SeqCst)
    }
}

impl Interrupter for PtraceInterrupter {
    fn interrupt(&self) -> CrashcapResult<()> {
        let pid = self.pid.load(Ordering::SeqCst);
        if pid == 0 {
            return Err(CrashcapError::NoTarget);
        }
        self.requested.store(true, Ordering::SeqCst);
        if let Err(err) = signal::kill(Pid::from_raw(pid), Signal::SIGSTOP) {
            self.requested.store(false, Ordering::SeqCst);
            return Err(err.into());
        }
        Ok(())
    }
}

/// The thread the last event stopped, and what resuming it owes the target.
#[derive(Debug, Clone, Copy)]
struct Stop {
    tid: Pid,
    /// Signal to deliver on resume.
    signal: Option<Signal>,
    /// Breakpoint address to step over on resume.
    breakpoint: Option<u64>,
}

impl Stop {
    fn quiet(tid: Pid) -> Self {
        Self {
            tid,
            signal: None,
            breakpoint: None,
        }
    }
}

/// Debugs a single child process through `ptrace`.
pub struct PtraceEngine {
    process: Option<ProcessHandle>,
    interrupter: Arc<PtraceInterrupter>,
    sink: Option<OutputSink>,
    modules: ModuleTable,
    breakpoints: BreakpointTable,
    rendezvous_armed: bool,
    created: bool,
    stop: Option<Stop>,
    /// Events from the current stop not handed out yet.
    queued: VecDeque<Event>,
    /// Statuses collected while waiting on a specific thread.
    deferred: VecDeque<WaitStatus>,
    /// Threads stopped for a report, resumed with the current thread.
    parked: BTreeSet<Pid>,
    /// First stops of new threads and forked children whose clone or fork
    /// event has not arrived yet.
    unclaimed: BTreeMap<Pid, WaitStatus>,
}

impl Default for PtraceEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PtraceEngine {
    pub fn new() -> Self {
        Self {
            process: None,
            interrupter: Arc::new(PtraceInterrupter::default()),
            sink: None,
            modules: ModuleTable::default(),
            breakpoints: BreakpointTable::default(),
            rendezvous_armed: false,
            created: false,
            stop: None,
            queued: VecDeque::new(),
            deferred: VecDeque::new(),
            parked: BTreeSet::new(),
            unclaimed: BTreeMap::new(),
        }
    }

    fn process(&self) -> CrashcapResult<&ProcessHandle> {
        self.process.as_ref().ok_or(CrashcapError::NoTarget)
    }

    fn emit(&mut self, mask: OutputMask, text: &str) {
        if let Some(sink) = self.sink.as_mut() {
            sink(mask, text);
        }
    }

    fn forget_target(&mut self) {
        self.interrupter.detach();
        self.process = None;
        self.stop = None;
        self.queued.clear();
        self.deferred.clear();
        self.parked.clear();
        self.unclaimed.clear();
        self.modules.clear();
        self.breakpoints.clear();
        self.rendezvous_armed = false;
    }

    fn on_status(&mut self, status: WaitStatus) -> CrashcapResult<Option<Event>> {
        let pid = self.process()?.pid();
        trace!("{status:?}");
        match status {
            WaitStatus::Exited(tid, code) if tid == pid => {
                self.forget_target();
                Ok(Some(Event::ProcessExited(code)))
            }
            WaitStatus::Signaled(tid, signal, _) if tid == pid => {
                self.forget_target();
                Ok(Some(Event::ProcessExited(128 + signal as i32)))
            }
            WaitStatus::Exited(tid, _) | WaitStatus::Signaled(tid, _, _) => {
                if let Some(process) = self.process.as_mut() {
                    process.remove_thread(tid);
                }
                self.parked.remove(&tid);
                Ok(None)
            }
            WaitStatus::PtraceEvent(tid, _, _) | WaitStatus::Stopped(tid, _) if !self.knows(tid) => {
                trace!("holding first stop of {tid}");
                self.unclaimed.insert(tid, status);
                Ok(None)
            }
            WaitStatus::PtraceEvent(tid, signal, event) => self.on_ptrace_event(tid, signal, event),
            WaitStatus::Stopped(tid, signal) => self.on_signal(tid, signal),
            _ => Ok(None),
        }
    }

    fn knows(&self, tid: Pid) -> bool {
        self.process.as_ref().is_some_and(|process| process.has_thread(tid))
    }

    fn on_ptrace_event(&mut self, tid: Pid, signal: Signal, event: i32) -> CrashcapResult<Option<Event>> {
        match event {
            EVENT_EXEC => return self.on_exec(tid),
            EVENT_CLONE => {
                let child = Pid::from_raw(ptrace::getevent(tid)? as i32);
                trace!("thread {child} cloned from {tid}");
                if let Some(process) = self.process.as_mut() {
                    process.add_thread(child);
                }
                if let Some(status) = self.unclaimed.remove(&child) {
                    self.deferred.push_back(status);
                }
            }
            EVENT_FORK | EVENT_VFORK => {
                let child = Pid::from_raw(ptrace::getevent(tid)? as i32);
                self.release_fork(child)?;
            }
            EVENT_VFORK_DONE => {
                // The traps were lifted from the memory the vfork child shared.
                self.breakpoints.rearm(self.process()?)?;
            }
            EVENT_STOP if is_group_stop(signal) => {
                trace!("thread {tid} in group-stop ({signal})");
                return listen(tid).map(|()| None);
            }
            _ => {}
        }
        continue_thread(tid, None)?;
        Ok(None)
    }

    /// Lift our traps out of a forked child and let it run untraced.
    fn release_fork(&mut self, child: Pid) -> CrashcapResult<()> {
        let status = match self.unclaimed.remove(&child) {
            Some(status) => status,
            None => match first_stop(child)? {
                Some(status) => status,
                None => return Ok(()),
            },
        };

        for (address, saved) in self.breakpoints.originals() {
            if let Err(err) = process::poke(child, address, &[saved]) {
                debug!("cannot restore {address:#x} in child {child}: {err}");
            }
        }

        let signal = match status {
            WaitStatus::Stopped(_, signal) => Some(signal),
            _ => None,
        };
        debug!("detaching forked child {child}");
        match ptrace::detach(child, signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn on_exec(&mut self, tid: Pid) -> CrashcapResult<Option<Event>> {
        let process = self.process.as_mut().ok_or(CrashcapError::NoTarget)?;
        process.reset_threads();
        let pid = process.pid();
        debug!("process {pid} replaced its image");

        self.breakpoints.clear();
        self.modules.clear();
        self.parked.clear();
        self.rendezvous_armed = false;
        self.stop = Some(Stop::quiet(tid));

        if !self.created {
            self.created = true;
            self.queued.push_back(Event::ProcessCreated(pid.as_raw() as u32));
        }
        self.scan_modules()?;
        Ok(self.queued.pop_front())
    }

    /// Queue a load event for every module not seen before.
    fn scan_modules(&mut self) -> CrashcapResult<()> {
        let process = self.process.as_ref().ok_or(CrashcapError::NoTarget)?;
        let ranges = maps::modules(&maps::read_maps(process.pid())?);
        for (name, base) in self.modules.refresh(ranges) {
            self.emit(OutputMask::VERBOSE, &format!("module {name} loaded at {base:#x}\n"));
            self.queued.push_back(Event::ModuleLoaded { name, base });
        }
        self.arm_rendezvous();
        Ok(())
    }

    fn arm_rendezvous(&mut self) {
        if self.rendezvous_armed {
            return;
        }
        let Some(process) = self.process.as_ref() else {
            return;
        };
        let Some(loader) = self
            .modules
            .iter()
            .find(|module| module.name.starts_with("ld-") || module.name.starts_with("ld64"))
            .map(|module| module.name.clone())
        else {
            return;
        };

        match self.modules.resolve(&loader, RENDEZVOUS_SYMBOL) {
            Ok(Some(address)) => match self.breakpoints.add_internal(process, address) {
                Ok(()) => {
                    debug!("watching {loader}!{RENDEZVOUS_SYMBOL} for module loads");
                    self.rendezvous_armed = true;
                }
                Err(err) => debug!("cannot watch {loader} for module loads: {err}"),
            },
            Ok(None) | Err(_) => debug!("{loader} has no {RENDEZVOUS_SYMBOL}"),
        }
    }

    fn on_signal(&mut self, tid: Pid, signal: Signal) -> CrashcapResult<Option<Event>> {
        let pid = {
            let process = self.process.as_mut().ok_or(CrashcapError::NoTarget)?;
            process.add_thread(tid);
            process.pid()
        };

        if signal == Signal::SIGSTOP && self.interrupter.take_request() {
            self.stop = Some(Stop::quiet(tid));
            return Ok(Some(Event::Exception {
                code: ExceptionCode::ControlBreak,
                first_chance: true,
            }));
        }

        if !self.created {
            // Job-control noise between fork and exec.
            continue_thread(tid, Some(signal))?;
            return Ok(None);
        }

        if signal == Signal::SIGTRAP {
            if let Some(event) = self.on_breakpoint(tid)? {
                return Ok(event);
            }
        }

        let info = ptrace::getsiginfo(tid)?;
        let address = match signal {
            // SAFETY: si_addr is the active union member for fault signals.
            Signal::SIGSEGV | Signal::SIGBUS | Signal::SIGILL | Signal::SIGFPE => unsafe { info.si_addr() as u64 },
            _ => 0,
        };
        let fault = Fault {
            si_code: info.si_code,
            address,
            stack_pointer: registers::frame(tid).ok().map(|frame| frame.sp),
        };
        let code = signals::exception_code(signal, fault);
        let first_chance = signals::handler_installed(pid, tid, signal);
        trace!("thread {tid} got {signal} -> {code} (first chance: {first_chance})");

        self.stop = Some(Stop {
            tid,
            signal: Some(signal),
            breakpoint: None,
        });
        Ok(Some(Event::Exception { code, first_chance }))
    }

    /// `Some(event)` when the trap came from one of our breakpoints, with
    /// `None` inside for the loader hook once the target is running again.
    fn on_breakpoint(&mut self, tid: Pid) -> CrashcapResult<Option<Option<Event>>> {
        let Ok(frame) = registers::frame(tid) else {
            return Ok(None);
        };
        let Some(hit) = self.breakpoints.hit(frame.pc).cloned() else {
            return Ok(None);
        };
        registers::set_pc(tid, hit.address)?;
        self.stop = Some(Stop {
            tid,
            signal: None,
            breakpoint: Some(hit.address),
        });

        if !hit.is_internal() {
            return Ok(Some(Some(Event::Breakpoint(hit.id))));
        }
        self.scan_modules()?;
        if let Some(event) = self.queued.pop_front() {
            return Ok(Some(Some(event)));
        }
        self.resume_stopped()?;
        Ok(Some(None))
    }

    fn resume_stopped(&mut self) -> CrashcapResult<()> {
        let Some(stop) = self.stop.take() else {
            return Ok(());
        };
        if let Some(address) = stop.breakpoint {
            let process = self.process()?;
            let status = self.breakpoints.step_over(process, stop.tid, address)?;
            if !matches!(status, WaitStatus::Stopped(_, Signal::SIGTRAP)) {
                self.deferred.push_back(status);
                return self.release_parked();
            }
        }
        continue_thread(stop.tid, stop.signal)?;
        self.release_parked()
    }

    fn release_parked(&mut self) -> CrashcapResult<()> {
        for tid in mem::take(&mut self.parked) {
            continue_thread(tid, None)?;
        }
        Ok(())
    }

    /// Stop every thread other than the current one.
    fn park_threads(&mut self) -> CrashcapResult<()> {
        let current = self.stop.map(|stop| stop.tid);
        let running: Vec<Pid> = self
            .process()?
            .threads()
            .filter(|tid| Some(*tid) != current && !self.parked.contains(tid))
            .collect();

        for tid in running {
            if let Err(err) = ptrace::interrupt(tid) {
                debug!("cannot interrupt thread {tid}: {err}");
                continue;
            }
            loop {
                match waitpid(tid, Some(WaitPidFlag::__WALL)) {
                    Ok(WaitStatus::PtraceEvent(_, _, event)) if event == ptrace::Event::PTRACE_EVENT_STOP as i32 => {
                        self.parked.insert(tid);
                        break;
                    }
                    Ok(status) => {
                        // Handled as a regular event on the next wait.
                        self.deferred.push_back(status);
                        break;
                    }
                    Err(Errno::EINTR) => continue,
                    Err(err) => {
                        debug!("lost thread {tid}: {err}");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Current thread first, then the rest in tid order.
    fn report_order(&self) -> CrashcapResult<Vec<Pid>> {
        let current = self.stop.map(|stop| stop.tid);
        let mut threads: Vec<Pid> = current.into_iter().collect();
        threads.extend(self.process()?.threads().filter(|tid| Some(*tid) != current));
        Ok(threads)
    }
}

/// Wait for a new child's first stop. `None` if it died before stopping.
fn first_stop(child: Pid) -> CrashcapResult<Option<WaitStatus>> {
    loop {
        match waitpid(child, Some(WaitPidFlag::__WALL)) {
            Ok(status @ (WaitStatus::Stopped(..) | WaitStatus::PtraceEvent(..))) => return Ok(Some(status)),
            Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) | Err(Errno::ECHILD) => return Ok(None),
            Ok(_) | Err(Errno::EINTR) => continue,
            Err(err) => return Err(err.into()),
        }
    }
}

/// Stops that a job-control signal put the whole group into.
fn is_group_stop(signal: Signal) -> bool {
    matches!(
        signal,
        Signal::SIGSTOP | Signal::SIGTSTP | Signal::SIGTTIN | Signal::SIGTTOU
    )
}

/// Leave a thread in its group-stop while still reporting its events.
fn listen(tid: Pid) -> CrashcapResult<()> {
    // SAFETY: PTRACE_LISTEN takes no address or data.
    let ret = unsafe {
        libc::ptrace(
            libc::PTRACE_LISTEN,
            tid.as_raw(),
            ptr::null_mut::<c_void>(),
            ptr::null_mut::<c_void>(),
        )
    };
    match Errno::result(ret) {
        Ok(_) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn continue_thread(tid: Pid, signal: Option<Signal>) -> CrashcapResult<()> {
    match ptrace::cont(tid, signal) {
        // Already gone; its exit shows up on the next wait.
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

impl DebugEngine for PtraceEngine {
    fn set_output_sink(&mut self, sink: OutputSink) -> CrashcapResult<()> {
        self.sink = Some(sink);
        Ok(())
    }

    fn set_symbol_path(&mut self, path: &str) -> CrashcapResult<()> {
        self.modules.set_symbol_path(SymbolPath::parse(path));
        Ok(())
    }

    fn launch(&mut self, command: &str) -> CrashcapResult<u32> {
        if self.process.is_some() {
            return Err(CrashcapError::Engine {
                operation: "launch",
                status: Errno::EBUSY as u32,
            });
        }
        let argv = command_line::split(command)?;
        let process = ProcessHandle::launch(&argv)?;
        let pid = process.pid();

        self.forget_target();
        self.created = false;
        self.interrupter.attach(pid);
        self.process = Some(process);
        self.emit(OutputMask::VERBOSE, &format!("launched pid {pid}: {command}\n"));
        Ok(pid.as_raw() as u32)
    }

    fn wait_for_event(&mut self, timeout: Duration) -> CrashcapResult<Option<Event>> {
        if let Some(event) = self.queued.pop_front() {
            return Ok(Some(event));
        }
        if self.process.is_none() {
            return Ok(None);
        }

        let deadline = Instant::now() + timeout;
        loop {
            let status = match self.deferred.pop_front() {
                Some(status) => status,
                None => match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG | WaitPidFlag::__WALL)) {
                    Ok(WaitStatus::StillAlive) => {
                        if Instant::now() >= deadline {
                            return Ok(Some(Event::Timeout));
                        }
                        thread::sleep(WAIT_SLICE);
                        continue;
                    }
                    Ok(status) => status,
                    Err(Errno::EINTR) => continue,
                    Err(Errno::ECHILD) => {
                        debug!("target vanished");
                        self.forget_target();
                        return Ok(None);
                    }
                    Err(err) => return Err(err.into()),
                },
            };

            if let Some(event) = self.on_status(status)? {
                return Ok(Some(event));
            }
        }
    }

    /// Signals raised by the target go back to it on either continuation:
    /// its handler only runs if the signal is delivered, and an unhandled
    /// one must be delivered to take its default action.
    fn resume(&mut self, continuation: Continuation) -> CrashcapResult<()> {
        if !self.queued.is_empty() {
            trace!("{} events left in this stop", self.queued.len());
            return Ok(());
        }
        trace!("resuming ({continuation:?})");
        self.resume_stopped()
    }

    fn interrupter(&self) -> Arc<dyn Interrupter> {
        self.interrupter.clone()
    }

    fn resolve_symbol(&mut self, module: &str, name: &str) -> CrashcapResult<Option<u64>> {
        self.modules.resolve(module, name)
    }

    fn add_breakpoint(&mut self, expression: &str) -> CrashcapResult<BreakpointId> {
        let (module, name) = expression
            .split_once('!')
            .ok_or_else(|| CrashcapError::BadExpression(expression.to_string()))?;
        let address = self
            .modules
            .resolve(module, name)?
            .ok_or_else(|| CrashcapError::BadExpression(expression.to_string()))?;
        let process = self.process.as_ref().ok_or(CrashcapError::NoTarget)?;
        let id = self.breakpoints.add(process, address)?;
        debug!("breakpoint {id} at {expression} ({address:#x})");
        Ok(id)
    }

    fn set_breakpoint_enabled(&mut self, id: BreakpointId, enabled: bool) -> CrashcapResult<()> {
        let process = self.process.as_ref().ok_or(CrashcapError::NoTarget)?;
        self.breakpoints.set_enabled(process, id, enabled)
    }

    fn report_current_state(&mut self) -> CrashcapResult<()> {
        let tid = self.stop.map(|stop| stop.tid).ok_or(CrashcapError::NoTarget)?;
        let text = report::current_state(self.process()?, &self.modules, &self.breakpoints, tid)?;
        self.emit(OutputMask::NORMAL, &text);
        Ok(())
    }

    fn report_all_stacks(&mut self, max_frames: usize) -> CrashcapResult<()> {
        self.park_threads()?;
        let current = self.stop;
        let process = self.process()?;

        let mut text = String::new();
        for tid in self.report_order()? {
            let is_current = current.is_some_and(|stop| stop.tid == tid);
            match registers::frame(tid) {
                Ok(frame) => {
                    let at_entry = is_current && current.is_some_and(|stop| stop.breakpoint.is_some());
                    let pcs = report::walk(process, frame, at_entry, max_frames);
                    text.push_str(&report::format_stack(tid, is_current, &pcs, &self.modules));
                }
                Err(err) => {
                    let _ = writeln!(text, "thread {tid}: registers unavailable ({err})");
                }
            }
        }
        self.emit(OutputMask::NORMAL, &text);
        Ok(())
    }

    fn write_dump(&mut self, path: &Path, format: DumpFormat) -> CrashcapResult<()> {
        self.park_threads()?;
        let threads = self.report_order()?;
        dump::write_dump(path, format, self.process()?, &self.modules, &self.breakpoints, &threads)
    }

    fn terminate(&mut self) -> CrashcapResult<i32> {
        let mut process = self.process.take().ok_or(CrashcapError::NoTarget)?;
        self.forget_target();
        let status = process.kill()?;
        debug!("process {} terminated with {status}", process.pid());
        Ok(status)
    }

    fn release(&mut self) {
        if let Some(mut process) = self.process.take() {
            if let Err(err) = process.kill() {
                warn!("failed to kill process {}: {err}", process.pid());
            }
        }
        self.forget_target();
    }
}

impl Drop for PtraceEngine {
    fn drop(&mut self) {
        self.release();
    }
}
