//! Architecture-specific register access.

use nix::unistd::Pid;

use crate::errors::CrashcapResult;

/// The registers a stack walk starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub pc: u64,
    pub sp: u64,
    pub fp: u64,
}

#[cfg(target_arch = "x86_64")]
mod imp {
    use nix::sys::ptrace;
    use nix::unistd::Pid;

    use super::Frame;
    use crate::errors::CrashcapResult;

    /// Length of the software breakpoint instruction.
    pub const BREAKPOINT_LEN: u64 = 1;
    pub const BREAKPOINT: u8 = 0xcc;

    pub fn frame(tid: Pid) -> CrashcapResult<Frame> {
        let regs = ptrace::getregs(tid)?;
        Ok(Frame {
            pc: regs.rip,
            sp: regs.rsp,
            fp: regs.rbp,
        })
    }

    pub fn set_pc(tid: Pid, pc: u64) -> CrashcapResult<()> {
        let mut regs = ptrace::getregs(tid)?;
        regs.rip = pc;
        ptrace::setregs(tid, regs)?;
        Ok(())
    }

    pub fn named(tid: Pid) -> CrashcapResult<Vec<(&'static str, u64)>> {
        let r = ptrace::getregs(tid)?;
        Ok(vec![
            ("rax", r.rax),
            ("rbx", r.rbx),
            ("rcx", r.rcx),
            ("rdx", r.rdx),
            ("rsi", r.rsi),
            ("rdi", r.rdi),
            ("rip", r.rip),
            ("rsp", r.rsp),
            ("rbp", r.rbp),
            ("r8", r.r8),
            ("r9", r.r9),
            ("r10", r.r10),
            ("r11", r.r11),
            ("r12", r.r12),
            ("r13", r.r13),
            ("r14", r.r14),
            ("r15", r.r15),
            ("eflags", r.eflags),
            ("cs", r.cs),
            ("ss", r.ss),
            ("fs_base", r.fs_base),
            ("gs_base", r.gs_base),
        ])
    }
}

#[cfg(not(target_arch = "x86_64"))]
mod imp {
    use nix::unistd::Pid;

    use super::Frame;
    use crate::errors::{CrashcapError, CrashcapResult};

    pub const BREAKPOINT_LEN: u64 = 0;
    pub const BREAKPOINT: u8 = 0;

    pub fn frame(_tid: Pid) -> CrashcapResult<Frame> {
        Err(CrashcapError::Unsupported("register access"))
    }

    pub fn set_pc(_tid: Pid, _pc: u64) -> CrashcapResult<()> {
        Err(CrashcapError::Unsupported("register access"))
    }

    pub fn named(_tid: Pid) -> CrashcapResult<Vec<(&'static str, u64)>> {
        Err(CrashcapError::Unsupported("register access"))
    }
}

pub use imp::{BREAKPOINT, BREAKPOINT_LEN};

pub fn frame(tid: Pid) -> CrashcapResult<Frame> {
    imp::frame(tid)
}

pub fn set_pc(tid: Pid, pc: u64) -> CrashcapResult<()> {
    imp::set_pc(tid, pc)
}

pub fn named(tid: Pid) -> CrashcapResult<Vec<(&'static str, u64)>> {
    imp::named(tid)
}

/// Software breakpoints need an architecture that can plant and step over
/// a one-byte trap.
pub fn supports_breakpoints() -> bool {
    BREAKPOINT_LEN != 0
}

/// Three `name=value` pairs per line.
pub fn format_named(registers: &[(&'static str, u64)]) -> String {
    registers
        .chunks(3)
        .map(|row| {
            row.iter()
                .map(|(name, value)| format!("{name}={value:016x}"))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}
