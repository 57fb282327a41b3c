//! Hang detection running beside the supervisor's event loop.
//!
//! The watchdog ticks on its own thread at a fixed period. Each tick either
//! spots a modal dialog owned by the target or adds one period to the elapsed
//! run time; on either symptom it breaks into the target once. The only state
//! shared with the supervisor is [`WatchdogState`], which is atomics only.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};

use crate::engine::Interrupter;

/// Default tick period.
pub const DEFAULT_POLL_PERIOD: Duration = Duration::from_millis(1000);

/// Timing configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogPolicy {
    /// Run-time budget; `None` means unlimited.
    pub timeout: Option<Duration>,
    pub poll_period: Duration,
}

impl WatchdogPolicy {
    /// Budget given in whole seconds; zero disables the timeout.
    pub fn with_timeout_secs(seconds: u64) -> Self {
        Self {
            timeout: (seconds > 0).then(|| Duration::from_secs(seconds)),
            ..Self::default()
        }
    }
}

impl Default for WatchdogPolicy {
    fn default() -> Self {
        Self {
            timeout: None,
            poll_period: DEFAULT_POLL_PERIOD,
        }
    }
}

/// Why the watchdog broke in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HangSymptom {
    Timeout { elapsed: Duration },
    ModalDialog,
}

const SYMPTOM_NONE: u8 = 0;
const SYMPTOM_TIMEOUT: u8 = 1;
const SYMPTOM_DIALOG: u8 = 2;

/// Counters shared between the watchdog thread and the supervisor.
#[derive(Debug, Default)]
pub struct WatchdogState {
    elapsed_ms: AtomicU64,
    suppressed: AtomicBool,
    symptom: AtomicU8,
}

impl WatchdogState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Start a fresh run. Only called at launch.
    pub fn reset(&self) {
        self.elapsed_ms.store(0, Ordering::SeqCst);
        self.symptom.store(SYMPTOM_NONE, Ordering::SeqCst);
        self.suppressed.store(false, Ordering::SeqCst);
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms.load(Ordering::SeqCst))
    }

    /// Whether an interrupt has been requested in this run.
    pub fn is_suppressed(&self) -> bool {
        self.suppressed.load(Ordering::SeqCst)
    }

    /// The symptom behind the pending interrupt, if the watchdog fired.
    pub fn symptom(&self) -> Option<HangSymptom> {
        match self.symptom.load(Ordering::SeqCst) {
            SYMPTOM_TIMEOUT => Some(HangSymptom::Timeout {
                elapsed: self.elapsed(),
            }),
            SYMPTOM_DIALOG => Some(HangSymptom::ModalDialog),
            _ => None,
        }
    }

    fn advance(&self, period: Duration) -> Duration {
        let step = u64::try_from(period.as_millis()).unwrap_or(u64::MAX);
        let before = self.elapsed_ms.fetch_add(step, Ordering::SeqCst);
        Duration::from_millis(before.saturating_add(step))
    }

    /// Claim the single interrupt of this run. `false` if already claimed.
    fn suppress(&self) -> bool {
        self.suppressed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Take this run's interrupt away from the watchdog. `false` if the
    /// watchdog has already fired.
    pub fn claim(&self) -> bool {
        self.suppress()
    }

    fn record(&self, symptom: HangSymptom) {
        let tag = match symptom {
            HangSymptom::Timeout { .. } => SYMPTOM_TIMEOUT,
            HangSymptom::ModalDialog => SYMPTOM_DIALOG,
        };
        self.symptom.store(tag, Ordering::SeqCst);
    }

    fn release_claim(&self) {
        self.symptom.store(SYMPTOM_NONE, Ordering::SeqCst);
        self.suppressed.store(false, Ordering::SeqCst);
    }
}

/// Looks for a blocking UI prompt owned by the target.
pub trait DialogDetector: Send + Sync {
    fn modal_dialog_open(&self, pid: u32) -> bool;
}

/// Detector for platforms without a notion of modal dialogs.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDialogDetector;

impl DialogDetector for NoDialogDetector {
    fn modal_dialog_open(&self, _pid: u32) -> bool {
        false
    }
}

/// One watchdog bound to one running target.
pub struct Watchdog {
    policy: WatchdogPolicy,
    pid: u32,
    state: Arc<WatchdogState>,
    detector: Arc<dyn DialogDetector>,
    interrupter: Arc<dyn Interrupter>,
}

impl Watchdog {
    pub fn new(
        policy: WatchdogPolicy,
        pid: u32,
        state: Arc<WatchdogState>,
        detector: Arc<dyn DialogDetector>,
        interrupter: Arc<dyn Interrupter>,
    ) -> Self {
        Self {
            policy,
            pid,
            state,
            detector,
            interrupter,
        }
    }

    /// Run one tick. Returns the symptom when this tick broke into the target.
    pub fn tick(&self) -> Option<HangSymptom> {
        if self.state.is_suppressed() {
            return None;
        }

        let symptom = if self.detector.modal_dialog_open(self.pid) {
            HangSymptom::ModalDialog
        } else {
            let elapsed = self.state.advance(self.policy.poll_period);
            match self.policy.timeout {
                Some(timeout) if elapsed >= timeout => HangSymptom::Timeout { elapsed },
                _ => return None,
            }
        };

        if !self.state.suppress() {
            return None;
        }

        match symptom {
            HangSymptom::ModalDialog => warn!("modal dialog detected in process {}", self.pid),
            HangSymptom::Timeout { elapsed } => {
                warn!("process {} timed out after {}s", self.pid, elapsed.as_secs())
            }
        }

        // Published before the break-in so the main loop can attribute the stop.
        self.state.record(symptom);
        if let Err(err) = self.interrupter.interrupt() {
            warn!("failed to interrupt process {}: {err}", self.pid);
            self.state.release_claim();
            return None;
        }
        Some(symptom)
    }

    /// Tick on a background thread until the returned handle is dropped.
    pub fn spawn(self) -> std::io::Result<WatchdogHandle> {
        let (stop, stopped) = mpsc::channel::<()>();
        let period = self.policy.poll_period;
        let thread = thread::Builder::new()
            .name("crashcap-watchdog".into())
            .spawn(move || {
                loop {
                    match stopped.recv_timeout(period) {
                        Err(RecvTimeoutError::Timeout) => {
                            self.tick();
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("watchdog stopped");
            })?;

        Ok(WatchdogHandle {
            stop: Some(stop),
            thread: Some(thread),
        })
    }
}

/// Stops and joins the watchdog thread when dropped.
#[derive(Debug)]
pub struct WatchdogHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for WatchdogHandle {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("watchdog thread panicked");
            }
        }
    }
}

#[cfg(target_os = "linux")]
pub use self::linux::TerminalPromptDetector;

#[cfg(target_os = "linux")]
mod linux {
    use std::fs;

    use super::DialogDetector;

    #[cfg(target_arch = "x86_64")]
    const SYS_READ: u64 = 0;
    #[cfg(not(target_arch = "x86_64"))]
    const SYS_READ: u64 = 63;

    /// Treats a target blocked reading from its terminal as a modal prompt.
    ///
    /// The console counterpart of a modal dialog is an interactive prompt:
    /// the main thread sits in `read(2)` on a tty and nobody will answer.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct TerminalPromptDetector;

    impl DialogDetector for TerminalPromptDetector {
        fn modal_dialog_open(&self, pid: u32) -> bool {
            let Ok(syscall) = fs::read_to_string(format!("/proc/{pid}/syscall")) else {
                return false;
            };
            let Some(fd) = blocked_read_fd(&syscall) else {
                return false;
            };
            fs::read_link(format!("/proc/{pid}/fd/{fd}"))
                .map(|target| is_terminal_path(&target.to_string_lossy()))
                .unwrap_or(false)
        }
    }

    /// File descriptor of a `read(2)` in progress, from `/proc/<pid>/syscall`.
    pub(super) fn blocked_read_fd(syscall: &str) -> Option<u64> {
        let mut fields = syscall.split_whitespace();
        let number = fields.next()?.parse::<u64>().ok()?;
        if number != SYS_READ {
            return None;
        }
        let fd = fields.next()?;
        u64::from_str_radix(fd.trim_start_matches("0x"), 16).ok()
    }

    pub(super) fn is_terminal_path(path: &str) -> bool {
        path.starts_with("/dev/pts/") || path.starts_with("/dev/tty") || path == "/dev/console"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    use crate::errors::{CrashcapError, CrashcapResult};

    #[derive(Default)]
    struct CountingInterrupter {
        calls: AtomicUsize,
        fail: AtomicBool,
    }

    impl Interrupter for CountingInterrupter {
        fn interrupt(&self) -> CrashcapResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(CrashcapError::NoTarget);
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct FlagDetector(AtomicBool);

    impl DialogDetector for FlagDetector {
        fn modal_dialog_open(&self, _pid: u32) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn watchdog(
        policy: WatchdogPolicy,
    ) -> (Watchdog, Arc<WatchdogState>, Arc<CountingInterrupter>, Arc<FlagDetector>) {
        let state = WatchdogState::new();
        let interrupter = Arc::new(CountingInterrupter::default());
        let detector = Arc::new(FlagDetector::default());
        let dog = Watchdog::new(policy, 42, state.clone(), detector.clone(), interrupter.clone());
        (dog, state, interrupter, detector)
    }

    #[test]
    fn timeout_fires_on_fifth_tick() {
        let (dog, state, interrupter, _) = watchdog(WatchdogPolicy::with_timeout_secs(5));
        for tick in 1..=4 {
            assert_eq!(dog.tick(), None, "tick {tick}");
        }
        assert_eq!(interrupter.calls.load(Ordering::SeqCst), 0);

        assert_eq!(
            dog.tick(),
            Some(HangSymptom::Timeout {
                elapsed: Duration::from_secs(5)
            })
        );
        assert_eq!(interrupter.calls.load(Ordering::SeqCst), 1);
        assert!(state.is_suppressed());
        assert!(matches!(state.symptom(), Some(HangSymptom::Timeout { .. })));
    }

    #[test]
    fn suppressed_watchdog_never_fires_twice() {
        let (dog, state, interrupter, detector) = watchdog(WatchdogPolicy::with_timeout_secs(1));
        assert!(dog.tick().is_some());
        let elapsed = state.elapsed();

        detector.0.store(true, Ordering::SeqCst);
        for _ in 0..10 {
            assert_eq!(dog.tick(), None);
        }
        assert_eq!(interrupter.calls.load(Ordering::SeqCst), 1);
        assert_eq!(state.elapsed(), elapsed);
    }

    #[test]
    fn unlimited_budget_only_counts() {
        let (dog, state, interrupter, _) = watchdog(WatchdogPolicy::with_timeout_secs(0));
        for _ in 0..100 {
            assert_eq!(dog.tick(), None);
        }
        assert_eq!(state.elapsed(), Duration::from_secs(100));
        assert_eq!(interrupter.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn modal_dialog_fires_immediately() {
        let (dog, state, interrupter, detector) = watchdog(WatchdogPolicy::default());
        detector.0.store(true, Ordering::SeqCst);
        assert_eq!(dog.tick(), Some(HangSymptom::ModalDialog));
        assert_eq!(interrupter.calls.load(Ordering::SeqCst), 1);
        assert_eq!(state.symptom(), Some(HangSymptom::ModalDialog));
        assert_eq!(state.elapsed(), Duration::ZERO);
    }

    #[test]
    fn failed_interrupt_is_retried_on_next_tick() {
        let (dog, state, interrupter, _) = watchdog(WatchdogPolicy::with_timeout_secs(1));
        interrupter.fail.store(true, Ordering::SeqCst);
        assert_eq!(dog.tick(), None);
        assert!(!state.is_suppressed());
        assert_eq!(state.symptom(), None);

        interrupter.fail.store(false, Ordering::SeqCst);
        assert!(dog.tick().is_some());
        assert_eq!(interrupter.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn reset_rearms_for_a_new_launch() {
        let (dog, state, interrupter, _) = watchdog(WatchdogPolicy::with_timeout_secs(1));
        assert!(dog.tick().is_some());
        state.reset();
        assert_eq!(state.elapsed(), Duration::ZERO);
        assert_eq!(state.symptom(), None);
        assert!(dog.tick().is_some());
        assert_eq!(interrupter.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn spawned_watchdog_ticks_and_stops() {
        let policy = WatchdogPolicy {
            timeout: Some(Duration::from_millis(20)),
            poll_period: Duration::from_millis(5),
        };
        let (dog, state, interrupter, _) = watchdog(policy);
        let handle = dog.spawn().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !state.is_suppressed() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        drop(handle);

        assert!(state.is_suppressed());
        assert_eq!(interrupter.calls.load(Ordering::SeqCst), 1);
        assert!(state.elapsed() >= Duration::from_millis(20));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn blocked_terminal_read_is_recognised() {
        use super::linux::{blocked_read_fd, is_terminal_path};

        #[cfg(target_arch = "x86_64")]
        let line = "0 0x0 0x7ffd1c 0x400 0x0 0x0 0x0 0x7ffd10 0x7f00aa\n";
        #[cfg(not(target_arch = "x86_64"))]
        let line = "63 0x0 0x7ffd1c 0x400 0x0 0x0 0x0 0x7ffd10 0x7f00aa\n";

        assert_eq!(blocked_read_fd(line), Some(0));
        assert_eq!(blocked_read_fd("running\n"), None);
        assert_eq!(blocked_read_fd("230 0x1 0x0 0x0 0x0 0x0 0x0 0x0 0x0\n"), None);
        assert!(is_terminal_path("/dev/pts/3"));
        assert!(!is_terminal_path("pipe:[1234]"));
    }
}
