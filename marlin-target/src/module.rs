//! Module identity for expressions that outlive their object file.
//!
//! A DWARF expression may need the module it was extracted from long after
//! parsing, but must not keep the object file alive. Expressions therefore
//! carry a [`ModuleId`] and the debugger resolves it through the registry at
//! evaluation time; an unloaded module simply fails to resolve.

use std::collections::HashMap;
use std::path::PathBuf;

/// Opaque handle naming a loaded module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId(u64);

/// Descriptive data kept per registered module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleHandle {
    pub path: PathBuf,
    /// Difference between the module's link-time and load-time addresses.
    pub load_bias: u64,
}

/// Registry mapping [`ModuleId`]s to module data.
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    modules: HashMap<u64, ModuleHandle>,
    next_id: u64,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handle: ModuleHandle) -> ModuleId {
        let id = self.next_id;
        self.next_id += 1;
        self.modules.insert(id, handle);
        ModuleId(id)
    }

    pub fn resolve(&self, id: ModuleId) -> Option<&ModuleHandle> {
        self.modules.get(&id.0)
    }

    /// Drop a module, e.g. after the dynamic linker unloads it. Expressions
    /// holding its id keep working until they next need the module.
    pub fn unregister(&mut self, id: ModuleId) -> Option<ModuleHandle> {
        self.modules.remove(&id.0)
    }
}
