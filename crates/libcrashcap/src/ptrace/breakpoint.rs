//! Software breakpoints planted in the target's text.

use std::collections::BTreeMap;

use log::trace;
use nix::sys::ptrace;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;

use super::process::ProcessHandle;
use super::registers::{self, BREAKPOINT};
use crate::errors::{CrashcapError, CrashcapResult};
use crate::event::BreakpointId;

/// Id reserved for breakpoints the engine plants for itself.
const INTERNAL: BreakpointId = BreakpointId(0);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    pub id: BreakpointId,
    pub address: u64,
    saved: u8,
    enabled: bool,
}

impl Breakpoint {
    pub fn is_internal(&self) -> bool {
        self.id == INTERNAL
    }
}

#[derive(Debug)]
pub struct BreakpointTable {
    by_address: BTreeMap<u64, Breakpoint>,
    next_id: u32,
}

impl Default for BreakpointTable {
    fn default() -> Self {
        Self {
            by_address: BTreeMap::new(),
            next_id: 1,
        }
    }
}

impl BreakpointTable {
    /// Plant an enabled breakpoint at `address`. A second request for the
    /// same address shares the existing breakpoint.
    pub fn add(&mut self, process: &ProcessHandle, address: u64) -> CrashcapResult<BreakpointId> {
        if let Some(existing) = self.by_address.get(&address) {
            if existing.is_internal() {
                return Err(CrashcapError::BadExpression(format!("{address:#x} is reserved")));
            }
            return Ok(existing.id);
        }
        let id = BreakpointId(self.next_id);
        self.plant(process, address, id)?;
        self.next_id += 1;
        Ok(id)
    }

    pub fn add_internal(&mut self, process: &ProcessHandle, address: u64) -> CrashcapResult<()> {
        if self.by_address.contains_key(&address) {
            return Ok(());
        }
        self.plant(process, address, INTERNAL)
    }

    fn plant(&mut self, process: &ProcessHandle, address: u64, id: BreakpointId) -> CrashcapResult<()> {
        if !registers::supports_breakpoints() {
            return Err(CrashcapError::Unsupported("software breakpoints"));
        }
        let saved = *process
            .read_memory(address, 1)?
            .first()
            .ok_or(CrashcapError::BadExpression(format!("{address:#x} is not mapped")))?;
        process.write_memory(address, &[BREAKPOINT])?;
        trace!("breakpoint {id} planted at {address:#x}");
        self.by_address.insert(
            address,
            Breakpoint {
                id,
                address,
                saved,
                enabled: true,
            },
        );
        Ok(())
    }

    pub fn set_enabled(&mut self, process: &ProcessHandle, id: BreakpointId, enabled: bool) -> CrashcapResult<()> {
        let breakpoint = self
            .by_address
            .values_mut()
            .find(|bp| bp.id == id && id != INTERNAL)
            .ok_or(CrashcapError::UnknownBreakpoint(id.0))?;
        if breakpoint.enabled != enabled {
            let byte = if enabled { BREAKPOINT } else { breakpoint.saved };
            process.write_memory(breakpoint.address, &[byte])?;
            breakpoint.enabled = enabled;
        }
        Ok(())
    }

    /// The enabled breakpoint a trap at `pc` came from, if any.
    pub fn hit(&self, pc: u64) -> Option<&Breakpoint> {
        let address = pc.checked_sub(registers::BREAKPOINT_LEN)?;
        self.by_address.get(&address).filter(|bp| bp.enabled)
    }

    /// Put the original bytes back over every armed trap in `bytes`, which
    /// were read from `address`.
    pub fn unpatch(&self, address: u64, bytes: &mut [u8]) {
        let end = address.saturating_add(bytes.len() as u64);
        for breakpoint in self.by_address.range(address..end).map(|(_, bp)| bp) {
            if breakpoint.enabled {
                bytes[(breakpoint.address - address) as usize] = breakpoint.saved;
            }
        }
    }

    /// Address and original byte of every armed trap.
    pub fn originals(&self) -> impl Iterator<Item = (u64, u8)> + '_ {
        self.by_address
            .values()
            .filter(|bp| bp.enabled)
            .map(|bp| (bp.address, bp.saved))
    }

    /// Write the trap back over every enabled breakpoint.
    pub fn rearm(&self, process: &ProcessHandle) -> CrashcapResult<()> {
        for (address, _) in self.originals() {
            process.write_memory(address, &[BREAKPOINT])?;
        }
        Ok(())
    }

    /// Addresses are meaningless once the image is replaced.
    pub fn clear(&mut self) {
        self.by_address.clear();
    }

    /// Execute the original instruction under `address` on thread `tid`,
    /// then re-arm the trap. Returns the status the step ended with.
    pub fn step_over(&self, process: &ProcessHandle, tid: Pid, address: u64) -> CrashcapResult<WaitStatus> {
        let Some(breakpoint) = self.by_address.get(&address).filter(|bp| bp.enabled) else {
            return Ok(WaitStatus::Stopped(tid, nix::sys::signal::Signal::SIGTRAP));
        };
        process.write_memory(address, &[breakpoint.saved])?;
        ptrace::step(tid, None)?;
        let status = waitpid(tid, Some(WaitPidFlag::__WALL))?;
        if !matches!(status, WaitStatus::Exited(..) | WaitStatus::Signaled(..)) {
            process.write_memory(address, &[BREAKPOINT])?;
        }
        Ok(status)
    }
}

#[cfg(test)]
impl BreakpointTable {
    /// Record a trap as planted without touching any process.
    pub(super) fn insert_planted(&mut self, address: u64, saved: u8, enabled: bool) -> BreakpointId {
        let id = BreakpointId(self.next_id);
        self.next_id += 1;
        self.by_address.insert(
            address,
            Breakpoint {
                id,
                address,
                saved,
                enabled,
            },
        );
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpatch_restores_armed_traps_in_range() {
        let mut table = BreakpointTable::default();
        table.insert_planted(0x1001, 0x55, true);
        table.insert_planted(0x1003, 0x90, false);
        table.insert_planted(0x2000, 0x41, true);

        let mut code = [0x48, BREAKPOINT, 0x89, 0x90];
        table.unpatch(0x1000, &mut code);
        assert_eq!(code, [0x48, 0x55, 0x89, 0x90]);

        let mut tail = [BREAKPOINT];
        table.unpatch(u64::MAX, &mut tail);
        assert_eq!(tail, [BREAKPOINT]);
    }

    #[test]
    fn originals_skip_disabled_traps() {
        let mut table = BreakpointTable::default();
        table.insert_planted(0x1001, 0x55, true);
        table.insert_planted(0x1003, 0x90, false);
        assert_eq!(table.originals().collect::<Vec<_>>(), [(0x1001, 0x55)]);

        table.clear();
        assert_eq!(table.originals().count(), 0);
    }

    #[test]
    fn hits_are_matched_after_the_trap() {
        let mut table = BreakpointTable::default();
        let id = table.insert_planted(0x1000, 0x55, true);
        assert_eq!(table.hit(0x1000 + registers::BREAKPOINT_LEN).map(|bp| bp.id), Some(id));
        assert!(table.hit(0x2000).is_none());
    }
}
