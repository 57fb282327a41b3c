//! Exception codes and the classification table deciding which debugger
//! exceptions trigger a diagnostic capture.

use std::fmt;

/// Closed set of exception codes the supervisor reasons about.
///
/// Status values follow the NTSTATUS numbering so that every engine reports
/// the same `code XXXXXXXX` line regardless of the platform underneath.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionCode {
    AccessViolation,
    ArrayBoundsExceeded,
    Breakpoint,
    DatatypeMisalignment,
    FltDenormalOperand,
    FltDivideByZero,
    FltInexactResult,
    FltInvalidOperation,
    FltOverflow,
    FltStackCheck,
    FltUnderflow,
    GuardPage,
    IllegalInstruction,
    InPageError,
    IntDivideByZero,
    IntOverflow,
    InvalidDisposition,
    InvalidHandle,
    NoncontinuableException,
    PrivInstruction,
    SingleStep,
    StackOverflow,
    /// The target asked to be aborted (`abort()`, fatal application exit).
    ApplicationAbort,
    /// An asynchronous break-in requested by the debugger.
    ControlBreak,
    /// Any code outside the table.
    Other(u32),
}

impl ExceptionCode {
    /// Every named code, in table order.
    pub const NAMED: [ExceptionCode; 24] = [
        ExceptionCode::AccessViolation,
        ExceptionCode::ArrayBoundsExceeded,
        ExceptionCode::Breakpoint,
        ExceptionCode::DatatypeMisalignment,
        ExceptionCode::FltDenormalOperand,
        ExceptionCode::FltDivideByZero,
        ExceptionCode::FltInexactResult,
        ExceptionCode::FltInvalidOperation,
        ExceptionCode::FltOverflow,
        ExceptionCode::FltStackCheck,
        ExceptionCode::FltUnderflow,
        ExceptionCode::GuardPage,
        ExceptionCode::IllegalInstruction,
        ExceptionCode::InPageError,
        ExceptionCode::IntDivideByZero,
        ExceptionCode::IntOverflow,
        ExceptionCode::InvalidDisposition,
        ExceptionCode::InvalidHandle,
        ExceptionCode::NoncontinuableException,
        ExceptionCode::PrivInstruction,
        ExceptionCode::SingleStep,
        ExceptionCode::StackOverflow,
        ExceptionCode::ApplicationAbort,
        ExceptionCode::ControlBreak,
    ];

    /// The 32-bit status value of this code.
    pub fn code(self) -> u32 {
        match self {
            ExceptionCode::AccessViolation => 0xC000_0005,
            ExceptionCode::ArrayBoundsExceeded => 0xC000_008C,
            ExceptionCode::Breakpoint => 0x8000_0003,
            ExceptionCode::DatatypeMisalignment => 0x8000_0002,
            ExceptionCode::FltDenormalOperand => 0xC000_008D,
            ExceptionCode::FltDivideByZero => 0xC000_008E,
            ExceptionCode::FltInexactResult => 0xC000_008F,
            ExceptionCode::FltInvalidOperation => 0xC000_0090,
            ExceptionCode::FltOverflow => 0xC000_0091,
            ExceptionCode::FltStackCheck => 0xC000_0092,
            ExceptionCode::FltUnderflow => 0xC000_0093,
            ExceptionCode::GuardPage => 0x8000_0001,
            ExceptionCode::IllegalInstruction => 0xC000_001D,
            ExceptionCode::InPageError => 0xC000_0006,
            ExceptionCode::IntDivideByZero => 0xC000_0094,
            ExceptionCode::IntOverflow => 0xC000_0095,
            ExceptionCode::InvalidDisposition => 0xC000_0026,
            ExceptionCode::InvalidHandle => 0xC000_0008,
            ExceptionCode::NoncontinuableException => 0xC000_0025,
            ExceptionCode::PrivInstruction => 0xC000_0096,
            ExceptionCode::SingleStep => 0x8000_0004,
            ExceptionCode::StackOverflow => 0xC000_00FD,
            ExceptionCode::ApplicationAbort => 0x4000_0015,
            ExceptionCode::ControlBreak => 0x4001_0005,
            ExceptionCode::Other(code) => code,
        }
    }

    /// Map a raw status value back onto the table.
    pub fn from_code(code: u32) -> Self {
        Self::NAMED
            .into_iter()
            .find(|named| named.code() == code)
            .unwrap_or(ExceptionCode::Other(code))
    }

    /// Whether the code belongs to the fatal allow-list.
    pub fn is_fatal(self) -> bool {
        !matches!(self, ExceptionCode::ControlBreak | ExceptionCode::Other(_))
    }
}

impl fmt::Display for ExceptionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.code())
    }
}

/// What the supervisor does with an exception event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Resume with the default continuation.
    Ignore,
    /// Resume and let the target's own handler deal with it.
    ContinueHandled,
    /// Capture diagnostics and terminate.
    Capture,
}

/// Tunables of the classification table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassifierPolicy {
    /// Capture fatal exceptions already on first chance, before the
    /// target's handler runs. Illegal instructions are still exempt.
    pub capture_first_chance: bool,
}

/// Classify an exception. Pure and deterministic.
pub fn classify(code: ExceptionCode, first_chance: bool, policy: &ClassifierPolicy) -> Classification {
    if first_chance {
        // CPU feature checks rely on catching this one.
        if code == ExceptionCode::IllegalInstruction {
            return Classification::ContinueHandled;
        }
        return if policy.capture_first_chance && code.is_fatal() {
            Classification::Capture
        } else {
            Classification::ContinueHandled
        };
    }

    if code.is_fatal() {
        Classification::Capture
    } else {
        Classification::Ignore
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fatal_codes() -> impl Iterator<Item = ExceptionCode> {
        ExceptionCode::NAMED.into_iter().filter(|code| code.is_fatal())
    }

    #[test]
    fn second_chance_fatal_codes_capture() {
        let policy = ClassifierPolicy::default();
        for code in fatal_codes() {
            assert_eq!(classify(code, false, &policy), Classification::Capture, "{code:?}");
        }
    }

    #[test]
    fn first_chance_fatal_codes_continue_handled() {
        let policy = ClassifierPolicy::default();
        for code in fatal_codes() {
            assert_eq!(
                classify(code, true, &policy),
                Classification::ContinueHandled,
                "{code:?}"
            );
        }
    }

    #[test]
    fn illegal_instruction_first_chance_never_captures() {
        for capture_first_chance in [false, true] {
            let policy = ClassifierPolicy { capture_first_chance };
            assert_eq!(
                classify(ExceptionCode::IllegalInstruction, true, &policy),
                Classification::ContinueHandled
            );
        }
        assert_eq!(
            classify(ExceptionCode::IllegalInstruction, false, &ClassifierPolicy::default()),
            Classification::Capture
        );
    }

    #[test]
    fn eager_policy_captures_first_chance_faults() {
        let policy = ClassifierPolicy {
            capture_first_chance: true,
        };
        assert_eq!(
            classify(ExceptionCode::AccessViolation, true, &policy),
            Classification::Capture
        );
        assert_eq!(
            classify(ExceptionCode::ControlBreak, true, &policy),
            Classification::ContinueHandled
        );
        assert_eq!(
            classify(ExceptionCode::Other(0xE06D_7363), true, &policy),
            Classification::ContinueHandled
        );
    }

    #[test]
    fn unknown_and_break_codes_are_not_fatal() {
        let policy = ClassifierPolicy::default();
        assert_eq!(
            classify(ExceptionCode::ControlBreak, false, &policy),
            Classification::Ignore
        );
        assert_eq!(
            classify(ExceptionCode::Other(0xE06D_7363), false, &policy),
            Classification::Ignore
        );
    }

    #[test]
    fn status_values_round_trip() {
        for code in ExceptionCode::NAMED {
            assert_eq!(ExceptionCode::from_code(code.code()), code);
        }
        assert_eq!(ExceptionCode::from_code(0x1234), ExceptionCode::Other(0x1234));
        assert_eq!(ExceptionCode::AccessViolation.to_string(), "c0000005");
    }
}
