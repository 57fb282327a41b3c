//! Process management wrapping `ptrace` interactions.

use std::collections::BTreeSet;
use std::env;
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use log::{debug, trace};
use nix::errno::Errno;
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, execv, fork};

use crate::errors::{CrashcapError, CrashcapResult};

/// Exit status the forked child uses when `execv` fails.
const EXEC_FAILED: i32 = 127;

/// Represents a traced process under the supervisor's control.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Pid,
    threads: BTreeSet<Pid>,
}

impl ProcessHandle {
    /// Fork, exec `argv`, and seize the child before it runs a single
    /// instruction of the new image.
    pub fn launch(argv: &[String]) -> CrashcapResult<Self> {
        let program = argv.first().ok_or(CrashcapError::EmptyCommandLine)?;
        let resolved = find_program(program).ok_or_else(|| {
            CrashcapError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{program}: command not found"),
            ))
        })?;
        debug!("launching {} as {program}", resolved.display());

        // PATH is searched here; the child must not allocate after fork.
        let file = CString::new(resolved.as_os_str().as_bytes())?;
        let args = argv
            .iter()
            .map(|arg| CString::new(arg.as_str()))
            .collect::<Result<Vec<_>, _>>()?;

        // SAFETY: the child only raises a signal and execs before exiting.
        match unsafe { fork() }? {
            ForkResult::Child => {
                let _ = signal::raise(Signal::SIGSTOP);
                let _ = execv(&file, &args);
                // SAFETY: `_exit` skips the parent's atexit handlers and buffers.
                unsafe { nix::libc::_exit(EXEC_FAILED) }
            }
            ForkResult::Parent { child } => Self::seize(child),
        }
    }

    fn seize(child: Pid) -> CrashcapResult<Self> {
        match waitpid(child, Some(WaitPidFlag::WUNTRACED))? {
            WaitStatus::Stopped(_, Signal::SIGSTOP) => {}
            status => {
                debug!("child {child} did not stop before exec: {status:?}");
                return Err(CrashcapError::Engine {
                    operation: "launch",
                    status: EXEC_FAILED as u32,
                });
            }
        }

        let options = Options::PTRACE_O_TRACECLONE
            | Options::PTRACE_O_TRACEFORK
            | Options::PTRACE_O_TRACEVFORK
            | Options::PTRACE_O_TRACEVFORKDONE
            | Options::PTRACE_O_TRACEEXEC
            | Options::PTRACE_O_EXITKILL;
        if let Err(err) = ptrace::seize(child, options) {
            let _ = signal::kill(child, Signal::SIGKILL);
            let _ = waitpid(child, None);
            return Err(err.into());
        }
        signal::kill(child, Signal::SIGCONT)?;
        trace!("seized {child}");

        Ok(Self {
            pid: child,
            threads: BTreeSet::from([child]),
        })
    }

    /// A handle on the calling process, for reading its own memory.
    #[cfg(test)]
    pub(crate) fn current() -> Self {
        let pid = nix::unistd::getpid();
        Self {
            pid,
            threads: BTreeSet::from([pid]),
        }
    }

    /// Access the underlying PID for logging or future syscalls.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn threads(&self) -> impl Iterator<Item = Pid> + '_ {
        self.threads.iter().copied()
    }

    pub fn has_thread(&self, tid: Pid) -> bool {
        self.threads.contains(&tid)
    }

    pub fn add_thread(&mut self, tid: Pid) {
        self.threads.insert(tid);
    }

    pub fn remove_thread(&mut self, tid: Pid) {
        self.threads.remove(&tid);
    }

    /// After an exec only the thread group leader survives.
    pub fn reset_threads(&mut self) {
        self.threads = BTreeSet::from([self.pid]);
    }

    /// Read up to `len` bytes at `address`. Short reads stop at the first
    /// unmapped page.
    pub fn read_memory(&self, address: u64, len: usize) -> CrashcapResult<Vec<u8>> {
        let mem = open_memory(self.pid, false)?;
        let mut buffer = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let Some(offset) = address.checked_add(filled as u64) else {
                break;
            };
            match mem.read_at(&mut buffer[filled..], offset) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) if err.raw_os_error() == Some(Errno::EINTR as i32) => continue,
                Err(err) if filled == 0 => return Err(err.into()),
                Err(_) => break,
            }
        }
        buffer.truncate(filled);
        Ok(buffer)
    }

    pub fn read_u64(&self, address: u64) -> CrashcapResult<u64> {
        let bytes = self.read_memory(address, 8)?;
        let bytes: [u8; 8] = bytes.try_into().map_err(|_| CrashcapError::SysCall(Errno::EFAULT))?;
        Ok(u64::from_ne_bytes(bytes))
    }

    pub fn write_memory(&self, address: u64, data: &[u8]) -> CrashcapResult<()> {
        poke(self.pid, address, data)
    }

    /// Kill the whole thread group and reap it, returning the shell-style
    /// status the leader ended with.
    pub fn kill(&mut self) -> CrashcapResult<i32> {
        match signal::kill(self.pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => return Err(err.into()),
        }

        let mut status = 128 + Signal::SIGKILL as i32;
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::__WALL)) {
                Ok(WaitStatus::Exited(pid, code)) if pid == self.pid => {
                    status = code;
                    break;
                }
                Ok(WaitStatus::Signaled(pid, sig, _)) if pid == self.pid => {
                    status = 128 + sig as i32;
                    break;
                }
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => break,
                Err(err) => return Err(err.into()),
            }
        }
        self.threads.clear();
        Ok(status)
    }
}

fn open_memory(pid: Pid, write: bool) -> CrashcapResult<File> {
    let path = format!("/proc/{pid}/mem");
    Ok(OpenOptions::new().read(true).write(write).open(path)?)
}

/// Write into the memory of any stopped tracee, including ones that are
/// not part of the handle's thread group.
pub fn poke(pid: Pid, address: u64, data: &[u8]) -> CrashcapResult<()> {
    open_memory(pid, true)?.write_all_at(data, address)?;
    Ok(())
}

/// Resolve `program` the way a shell would.
pub fn find_program(program: &str) -> Option<PathBuf> {
    if program.contains('/') {
        let path = PathBuf::from(program);
        return is_executable(&path).then_some(path);
    }
    let search = env::var_os("PATH")?;
    env::split_paths(&search)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
