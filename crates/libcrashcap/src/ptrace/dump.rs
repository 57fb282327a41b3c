//! Dump files: a text header followed by raw memory blocks.
//!
//! ```text
//! CRASHCAP-DUMP 1
//! format minimal
//! pid 4242
//! thread 4242 rax=0000000000000000 ...
//! module 00005555... 00005555... /usr/bin/app
//! memory 00007ffd... 4096
//! <4096 raw bytes>
//! end
//! ```

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use log::debug;
use nix::unistd::Pid;

use super::breakpoint::BreakpointTable;
use super::maps::{self, Mapping};
use super::process::ProcessHandle;
use super::registers;
use super::symbols::ModuleTable;
use crate::engine::DumpFormat;
use crate::errors::CrashcapResult;

pub const MAGIC: &str = "CRASHCAP-DUMP 1";

/// Bytes kept below the stack pointer.
const RED_ZONE: u64 = 128;
/// Bytes kept above the stack pointer of each thread.
const STACK_WINDOW: u64 = 64 * 1024;
/// Largest memory block read and written at once.
const CHUNK: u64 = 1024 * 1024;

/// Memory ranges to save, sorted and without overlap.
pub fn regions(format: DumpFormat, maps: &[Mapping], stack_pointers: &[u64]) -> Vec<(u64, u64)> {
    let mut ranges: Vec<(u64, u64)> = stack_pointers
        .iter()
        .filter_map(|&sp| {
            let mapping = maps.iter().find(|m| m.contains(sp) && m.readable())?;
            let start = sp.saturating_sub(RED_ZONE).max(mapping.start) & !0xf;
            let end = sp.saturating_add(STACK_WINDOW).min(mapping.end);
            Some((start.max(mapping.start), end))
        })
        .collect();

    if format == DumpFormat::Full {
        ranges.extend(
            maps.iter()
                .filter(|m| m.readable() && m.private() && !m.is_special())
                .map(|m| (m.start, m.end)),
        );
    }

    ranges.sort_unstable();
    let mut merged: Vec<(u64, u64)> = Vec::with_capacity(ranges.len());
    for (start, end) in ranges {
        match merged.last_mut() {
            Some(last) if start <= last.1 => last.1 = last.1.max(end),
            _ => merged.push((start, end)),
        }
    }
    merged
}

pub fn write_dump(
    path: &Path,
    format: DumpFormat,
    process: &ProcessHandle,
    modules: &ModuleTable,
    breakpoints: &BreakpointTable,
    threads: &[Pid],
) -> CrashcapResult<()> {
    let maps = maps::read_maps(process.pid())?;
    let mut out = BufWriter::new(File::create(path)?);

    writeln!(out, "{MAGIC}")?;
    writeln!(
        out,
        "format {}",
        match format {
            DumpFormat::Minimal => "minimal",
            DumpFormat::Full => "full",
        }
    )?;
    writeln!(out, "pid {}", process.pid())?;

    let mut stack_pointers = Vec::new();
    for &tid in threads {
        match registers::named(tid) {
            Ok(regs) => {
                let line = regs
                    .iter()
                    .map(|(name, value)| format!("{name}={value:016x}"))
                    .collect::<Vec<_>>()
                    .join(" ");
                writeln!(out, "thread {tid} {line}")?;
                if let Ok(frame) = registers::frame(tid) {
                    stack_pointers.push(frame.sp);
                }
            }
            Err(err) => writeln!(out, "thread {tid} registers unavailable: {err}")?,
        }
    }

    for module in modules.iter() {
        writeln!(
            out,
            "module {:016x} {:016x} {}",
            module.base,
            module.end,
            module.path.display()
        )?;
    }

    for (start, end) in regions(format, &maps, &stack_pointers) {
        write_region(&mut out, process, breakpoints, start, end)?;
    }

    writeln!(out, "end")?;
    out.flush()?;
    Ok(())
}

/// Copy `start..end` into `out` as one `memory` block per chunk, up to
/// the first unreadable byte.
fn write_region<W: Write>(
    out: &mut W,
    process: &ProcessHandle,
    breakpoints: &BreakpointTable,
    start: u64,
    end: u64,
) -> CrashcapResult<()> {
    let mut at = start;
    while at < end {
        let len = (end - at).min(CHUNK) as usize;
        let mut bytes = match process.read_memory(at, len) {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!("skipping {at:#x}-{end:#x}: {err}");
                break;
            }
        };
        if bytes.is_empty() {
            break;
        }
        breakpoints.unpatch(at, &mut bytes);
        writeln!(out, "memory {at:016x} {}", bytes.len())?;
        out.write_all(&bytes)?;
        writeln!(out)?;

        if bytes.len() < len {
            break;
        }
        at += bytes.len() as u64;
    }
    Ok(())
}
