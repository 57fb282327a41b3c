//! Text reports of a stopped target: current state and stack traces.

use std::fmt::Write;

use nix::unistd::Pid;

use super::breakpoint::BreakpointTable;
use super::disasm::{self, CONTEXT_INSTRUCTIONS};
use super::process::ProcessHandle;
use super::registers::{self, Frame};
use super::symbols::ModuleTable;
use crate::errors::CrashcapResult;

/// Bytes read at the stop address for decoding.
const CODE_BYTES: usize = 64;

/// Where the thread stopped, its source line, the code there, and registers.
pub fn current_state(
    process: &ProcessHandle,
    modules: &ModuleTable,
    breakpoints: &BreakpointTable,
    tid: Pid,
) -> CrashcapResult<String> {
    let frame = registers::frame(tid)?;
    let mut text = String::new();

    let _ = writeln!(
        text,
        "thread {tid} stopped at {} ({:016x})",
        modules.describe(frame.pc),
        frame.pc
    );
    if let Some(line) = modules.source_line(frame.pc) {
        let _ = writeln!(text, "source: {line}");
    }
    match process.read_memory(frame.pc, CODE_BYTES) {
        Ok(mut code) if !code.is_empty() => {
            breakpoints.unpatch(frame.pc, &mut code);
            text.push_str("code:\n");
            for line in disasm::disassemble(&code, frame.pc, CONTEXT_INSTRUCTIONS) {
                let _ = writeln!(text, "  {line}");
            }
        }
        _ => {
            let _ = writeln!(text, "code:   {:016x}  ??", frame.pc);
        }
    }
    text.push_str(&registers::format_named(&registers::named(tid)?));
    text.push('\n');
    Ok(text)
}

/// Return addresses from a frame-pointer walk, starting with `frame.pc`.
///
/// At a function's first instruction the return address still sits at the
/// stack pointer and the frame pointer belongs to the caller.
pub fn walk(process: &ProcessHandle, frame: Frame, at_entry: bool, max_frames: usize) -> Vec<u64> {
    let mut pcs = vec![frame.pc];
    if at_entry && pcs.len() < max_frames {
        match process.read_u64(frame.sp) {
            Ok(ret) if ret != 0 => pcs.push(ret),
            _ => return pcs,
        }
    }

    let mut fp = frame.fp;
    while pcs.len() < max_frames {
        if fp == 0 || fp % 8 != 0 {
            break;
        }
        let Some(slot) = fp.checked_add(8) else {
            break;
        };
        let (Ok(next), Ok(ret)) = (process.read_u64(fp), process.read_u64(slot)) else {
            break;
        };
        if ret == 0 {
            break;
        }
        pcs.push(ret);
        if next <= fp {
            break;
        }
        fp = next;
    }
    pcs
}

/// One numbered line per frame.
pub fn format_stack(tid: Pid, current: bool, pcs: &[u64], modules: &ModuleTable) -> String {
    let mut text = format!("thread {tid}{}\n", if current { " (current)" } else { "" });
    for (index, pc) in pcs.iter().enumerate() {
        let _ = write!(text, " {index:02} {pc:016x} {}", modules.describe(*pc));
        // Return addresses point after the call.
        let lookup = if index == 0 { *pc } else { pc.saturating_sub(1) };
        if let Some(line) = modules.source_line(lookup) {
            let _ = write!(text, " [{line}]");
        }
        text.push('\n');
    }
    text
}
