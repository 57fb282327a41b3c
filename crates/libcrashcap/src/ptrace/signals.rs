//! Translate signal stops into exception events.

use std::fs;

use nix::sys::signal::Signal;
use nix::unistd::Pid;

use crate::exception::ExceptionCode;

const FPE_INTDIV: i32 = 1;
const FPE_INTOVF: i32 = 2;
const FPE_FLTDIV: i32 = 3;
const FPE_FLTOVF: i32 = 4;
const FPE_FLTUND: i32 = 5;
const FPE_FLTRES: i32 = 6;
const FPE_FLTINV: i32 = 7;
const FPE_FLTSUB: i32 = 8;
const ILL_PRVOPC: i32 = 5;
const ILL_PRVREG: i32 = 6;
const BUS_ADRALN: i32 = 1;
const TRAP_TRACE: i32 = 2;

/// A fault this close to the stack pointer is treated as running off the
/// end of the stack.
const STACK_OVERFLOW_WINDOW: u64 = 64 * 1024;

/// Fault details pulled from the stop's siginfo.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Fault {
    pub si_code: i32,
    pub address: u64,
    pub stack_pointer: Option<u64>,
}

pub fn exception_code(signal: Signal, fault: Fault) -> ExceptionCode {
    match signal {
        Signal::SIGSEGV => match fault.stack_pointer {
            Some(sp) if fault.address.abs_diff(sp) <= STACK_OVERFLOW_WINDOW => ExceptionCode::StackOverflow,
            _ => ExceptionCode::AccessViolation,
        },
        Signal::SIGFPE => match fault.si_code {
            FPE_INTDIV => ExceptionCode::IntDivideByZero,
            FPE_INTOVF => ExceptionCode::IntOverflow,
            FPE_FLTDIV => ExceptionCode::FltDivideByZero,
            FPE_FLTOVF => ExceptionCode::FltOverflow,
            FPE_FLTUND => ExceptionCode::FltUnderflow,
            FPE_FLTRES => ExceptionCode::FltInexactResult,
            FPE_FLTSUB => ExceptionCode::ArrayBoundsExceeded,
            FPE_FLTINV => ExceptionCode::FltInvalidOperation,
            _ => ExceptionCode::FltInvalidOperation,
        },
        Signal::SIGILL => match fault.si_code {
            ILL_PRVOPC | ILL_PRVREG => ExceptionCode::PrivInstruction,
            _ => ExceptionCode::IllegalInstruction,
        },
        Signal::SIGBUS => match fault.si_code {
            BUS_ADRALN => ExceptionCode::DatatypeMisalignment,
            _ => ExceptionCode::InPageError,
        },
        Signal::SIGTRAP => match fault.si_code {
            TRAP_TRACE => ExceptionCode::SingleStep,
            _ => ExceptionCode::Breakpoint,
        },
        Signal::SIGABRT => ExceptionCode::ApplicationAbort,
        other => ExceptionCode::Other(other as i32 as u32),
    }
}

/// Whether `signal` will reach a handler the target installed: caught and
/// not blocked by the stopped thread.
pub fn handler_installed(pid: Pid, tid: Pid, signal: Signal) -> bool {
    fs::read_to_string(format!("/proc/{pid}/task/{tid}/status"))
        .map(|status| delivered_to_handler(&status, signal))
        .unwrap_or(false)
}

fn delivered_to_handler(status: &str, signal: Signal) -> bool {
    let bit = 1u64 << (signal as i32 - 1);
    let caught = mask(status, "SigCgt").unwrap_or(0);
    let blocked = mask(status, "SigBlk").unwrap_or(0);
    caught & bit != 0 && blocked & bit == 0
}

/// Read a hex signal mask line such as `SigCgt:\t0000000180004002`.
fn mask(status: &str, field: &str) -> Option<u64> {
    status.lines().find_map(|line| {
        let value = line.strip_prefix(field)?.strip_prefix(':')?;
        u64::from_str_radix(value.trim(), 16).ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_code(si_code: i32) -> Fault {
        Fault {
            si_code,
            ..Fault::default()
        }
    }

    #[test]
    fn segfaults_near_the_stack_pointer_are_overflows() {
        let overflow = Fault {
            si_code: 1,
            address: 0x7ffc_0000_0ff8,
            stack_pointer: Some(0x7ffc_0000_1000),
        };
        assert_eq!(exception_code(Signal::SIGSEGV, overflow), ExceptionCode::StackOverflow);

        let null = Fault {
            address: 0,
            ..overflow
        };
        assert_eq!(exception_code(Signal::SIGSEGV, null), ExceptionCode::AccessViolation);
        assert_eq!(exception_code(Signal::SIGSEGV, with_code(1)), ExceptionCode::AccessViolation);
    }

    #[test]
    fn arithmetic_faults_follow_si_code() {
        assert_eq!(exception_code(Signal::SIGFPE, with_code(FPE_INTDIV)), ExceptionCode::IntDivideByZero);
        assert_eq!(exception_code(Signal::SIGFPE, with_code(FPE_INTOVF)), ExceptionCode::IntOverflow);
        assert_eq!(exception_code(Signal::SIGFPE, with_code(FPE_FLTDIV)), ExceptionCode::FltDivideByZero);
        assert_eq!(exception_code(Signal::SIGFPE, with_code(FPE_FLTUND)), ExceptionCode::FltUnderflow);
        assert_eq!(exception_code(Signal::SIGFPE, with_code(FPE_FLTSUB)), ExceptionCode::ArrayBoundsExceeded);
        assert_eq!(exception_code(Signal::SIGFPE, with_code(0)), ExceptionCode::FltInvalidOperation);
    }

    #[test]
    fn privileged_instructions_are_told_apart() {
        assert_eq!(exception_code(Signal::SIGILL, with_code(ILL_PRVOPC)), ExceptionCode::PrivInstruction);
        assert_eq!(exception_code(Signal::SIGILL, with_code(2)), ExceptionCode::IllegalInstruction);
    }

    #[test]
    fn remaining_signals() {
        assert_eq!(exception_code(Signal::SIGBUS, with_code(BUS_ADRALN)), ExceptionCode::DatatypeMisalignment);
        assert_eq!(exception_code(Signal::SIGBUS, with_code(2)), ExceptionCode::InPageError);
        assert_eq!(exception_code(Signal::SIGTRAP, with_code(TRAP_TRACE)), ExceptionCode::SingleStep);
        assert_eq!(exception_code(Signal::SIGTRAP, with_code(128)), ExceptionCode::Breakpoint);
        assert_eq!(exception_code(Signal::SIGABRT, Fault::default()), ExceptionCode::ApplicationAbort);
        let chld = exception_code(Signal::SIGCHLD, Fault::default());
        assert_eq!(chld, ExceptionCode::Other(Signal::SIGCHLD as u32));
        assert!(!chld.is_fatal());
    }

    const STATUS: &str = "Name:\tcat\nSigBlk:\t0000000000000400\nSigIgn:\t0000000000001000\nSigCgt:\t0000000000000600\n";

    #[test]
    fn handler_requires_caught_and_unblocked() {
        // SIGSEGV (11) is caught and blocked, SIGUSR1 (10) caught only.
        assert!(!delivered_to_handler(STATUS, Signal::SIGSEGV));
        assert!(delivered_to_handler(STATUS, Signal::SIGUSR1));
        assert!(!delivered_to_handler(STATUS, Signal::SIGABRT));
    }

    #[test]
    fn masks_are_hex() {
        assert_eq!(mask(STATUS, "SigCgt"), Some(0x600));
        assert_eq!(mask(STATUS, "SigPnd"), None);
    }
}
