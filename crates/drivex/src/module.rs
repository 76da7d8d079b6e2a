use tracing::debug;

/// One resolved import of a loaded module: the name of the imported function
/// and the runtime address it was bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Import {
    pub name: String,
    pub address: u64,
}

/// A loaded guest module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDescriptor {
    /// Stable identity used for tracking across load and unload.
    pub id: String,
    pub base: u64,
    pub size: u64,
    /// Runtime address of the module's entry point.
    pub entry_point: u64,
    /// Preferred load address from the image header, for translating
    /// runtime addresses back to image offsets in diagnostics.
    pub native_base: u64,
    pub imports: Vec<Import>,
}

impl ModuleDescriptor {
    pub fn contains(&self, address: u64) -> bool {
        address >= self.base && address < self.base + self.size
    }

    /// Translate a runtime address into the image's native address space.
    pub fn to_native(&self, address: u64) -> u64 {
        address.wrapping_sub(self.base).wrapping_add(self.native_base)
    }

    /// Translate a native image address to its runtime location.
    pub fn to_runtime(&self, address: u64) -> u64 {
        address
            .wrapping_sub(self.native_base)
            .wrapping_add(self.base)
    }
}

/// The set of currently loaded modules.
#[derive(Debug, Default)]
pub struct ModuleMap {
    modules: Vec<ModuleDescriptor>,
}

impl ModuleMap {
    /// Record a loaded module, replacing any previous record with the same
    /// identity.
    pub fn register(&mut self, module: ModuleDescriptor) {
        if let Some(existing) = self.modules.iter_mut().find(|m| m.id == module.id) {
            debug!(module = %module.id, "replacing stale module record");
            *existing = module;
        } else {
            self.modules.push(module);
        }
    }

    pub fn unregister(&mut self, id: &str) -> Option<ModuleDescriptor> {
        let index = self.modules.iter().position(|m| m.id == id)?;
        Some(self.modules.remove(index))
    }

    pub fn get(&self, id: &str) -> Option<&ModuleDescriptor> {
        self.modules.iter().find(|m| m.id == id)
    }

    /// The module whose mapped range covers `address`.
    pub fn find(&self, address: u64) -> Option<&ModuleDescriptor> {
        self.modules.iter().find(|m| m.contains(address))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModuleDescriptor> {
        self.modules.iter()
    }
}
