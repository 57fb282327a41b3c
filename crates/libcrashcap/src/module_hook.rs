//! Breakpoints on abort and assert entry points, installed as modules load.
//!
//! Some failures never raise a classifiable exception: the C runtime prints
//! an assertion message and exits, or a stack protector calls straight into
//! `abort`. Breaking on those entry points lets the supervisor capture them
//! anyway.

use log::{debug, warn};

use crate::engine::DebugEngine;
use crate::errors::CrashcapResult;
use crate::event::BreakpointId;

/// Entry points watched by default.
pub const DEFAULT_ABORT_SYMBOLS: &[&str] = &[
    "abort",
    "__assert_fail",
    "__assert_perror_fail",
    "__stack_chk_fail",
    "__fortify_fail",
    "_assert",
    "_wassert",
];

/// A breakpoint installed by the hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointDescriptor {
    /// `module!symbol`
    pub expression: String,
    pub id: BreakpointId,
    enabled: bool,
}

impl BreakpointDescriptor {
    pub fn enabled(&self) -> bool {
        self.enabled
    }
}

/// Installs abort breakpoints on every module load.
#[derive(Debug, Clone)]
pub struct ModuleLoadHook {
    symbols: Vec<String>,
    descriptors: Vec<BreakpointDescriptor>,
}

impl Default for ModuleLoadHook {
    fn default() -> Self {
        Self::new(DEFAULT_ABORT_SYMBOLS.iter().map(|s| s.to_string()))
    }
}

impl ModuleLoadHook {
    pub fn new(symbols: impl IntoIterator<Item = String>) -> Self {
        Self {
            symbols: symbols.into_iter().collect(),
            descriptors: Vec::new(),
        }
    }

    /// Install breakpoints for `module`. Returns how many were added.
    pub fn on_module_loaded<E: DebugEngine + ?Sized>(&mut self, engine: &mut E, module: &str) -> usize {
        let mut added = 0;
        for symbol in &self.symbols {
            // Best effort: modules without the symbol, or without symbols at all, are fine.
            match engine.resolve_symbol(module, symbol) {
                Ok(Some(_)) => {}
                Ok(None) => continue,
                Err(err) => {
                    debug!("cannot resolve {module}!{symbol}: {err}");
                    continue;
                }
            }

            let expression = format!("{module}!{symbol}");
            match engine.add_breakpoint(&expression) {
                Ok(id) => {
                    debug!("breakpoint {id} at {expression}");
                    self.descriptors.push(BreakpointDescriptor {
                        expression,
                        id,
                        enabled: true,
                    });
                    added += 1;
                }
                Err(err) => warn!("failed to set breakpoint at {expression} ({:#010x})", err.status()),
            }
        }
        added
    }

    /// The descriptor behind `id`, if this hook installed it.
    pub fn owns(&self, id: BreakpointId) -> Option<&BreakpointDescriptor> {
        self.descriptors.iter().find(|bp| bp.id == id)
    }

    pub fn descriptors(&self) -> &[BreakpointDescriptor] {
        &self.descriptors
    }

    /// Enable or disable every installed breakpoint.
    pub fn set_enabled<E: DebugEngine + ?Sized>(&mut self, engine: &mut E, enabled: bool) -> CrashcapResult<()> {
        for descriptor in self.descriptors.iter_mut().filter(|bp| bp.enabled != enabled) {
            engine.set_breakpoint_enabled(descriptor.id, enabled)?;
            descriptor.enabled = enabled;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedEngine;

    #[test]
    fn resolved_symbols_get_breakpoints() {
        let mut engine = ScriptedEngine::new(Vec::new())
            .with_symbol("libc.so.6", "abort", 0x7f00_1000)
            .with_symbol("libc.so.6", "__assert_fail", 0x7f00_2000);
        let mut hook = ModuleLoadHook::default();

        assert_eq!(hook.on_module_loaded(&mut engine, "libc.so.6"), 2);
        assert_eq!(hook.on_module_loaded(&mut engine, "app"), 0);

        let expressions: Vec<_> = hook.descriptors().iter().map(|bp| bp.expression.as_str()).collect();
        assert_eq!(expressions, ["libc.so.6!abort", "libc.so.6!__assert_fail"]);
        assert!(hook.descriptors().iter().all(BreakpointDescriptor::enabled));

        let journal = engine.journal();
        assert_eq!(journal.lock().unwrap().breakpoints.len(), 2);
    }

    #[test]
    fn owns_only_its_own_breakpoints() {
        let mut engine = ScriptedEngine::new(Vec::new()).with_symbol("libc.so.6", "abort", 0x1000);
        let mut hook = ModuleLoadHook::default();
        hook.on_module_loaded(&mut engine, "libc.so.6");

        let id = hook.descriptors()[0].id;
        assert_eq!(hook.owns(id).map(|bp| bp.expression.as_str()), Some("libc.so.6!abort"));
        assert!(hook.owns(BreakpointId(999)).is_none());
    }

    #[test]
    fn registration_failure_is_not_fatal() {
        let mut engine = ScriptedEngine::new(Vec::new())
            .with_symbol("libc.so.6", "abort", 0x1000)
            .failing("add_breakpoint");
        let mut hook = ModuleLoadHook::default();
        assert_eq!(hook.on_module_loaded(&mut engine, "libc.so.6"), 0);
        assert!(hook.descriptors().is_empty());
    }

    #[test]
    fn lookup_failure_is_skipped() {
        let mut engine = ScriptedEngine::new(Vec::new())
            .with_symbol("libc.so.6", "abort", 0x1000)
            .failing("resolve_symbol");
        let mut hook = ModuleLoadHook::default();
        assert_eq!(hook.on_module_loaded(&mut engine, "libc.so.6"), 0);
    }

    #[test]
    fn toggling_reaches_the_engine() {
        let mut engine = ScriptedEngine::new(Vec::new()).with_symbol("libc.so.6", "abort", 0x1000);
        let mut hook = ModuleLoadHook::new(["abort".to_string()]);
        hook.on_module_loaded(&mut engine, "libc.so.6");

        hook.set_enabled(&mut engine, false).unwrap();
        assert!(!hook.descriptors()[0].enabled());
        hook.set_enabled(&mut engine, false).unwrap();

        let journal = engine.journal();
        let journal = journal.lock().unwrap();
        assert!(!journal.breakpoints[0].2);
        assert_eq!(journal.toggles, 1);
    }
}
