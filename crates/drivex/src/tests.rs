mod api;
mod consistency;
mod engine;
mod memcheck;
mod state_manager;

use crate::module::{Import, ModuleDescriptor};

/// A minimal module record for tests.
pub(crate) fn test_module(id: &str, base: u64, imports: Vec<(&str, u64)>) -> ModuleDescriptor {
    ModuleDescriptor {
        id: id.into(),
        base,
        size: 0x1_0000,
        entry_point: base + 0x100,
        native_base: 0x1_0000,
        imports: imports
            .into_iter()
            .map(|(name, address)| Import {
                name: name.into(),
                address,
            })
            .collect(),
    }
}
