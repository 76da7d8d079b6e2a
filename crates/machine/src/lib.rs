//! Forkable guest machine states.
//!
//! A [Machine] owns an arena of [ExecutionState]s addressed by opaque
//! [StateId] handles. Each state carries a program counter, an x86-32 style
//! register file, byte-granular sparse memory holding concrete or symbolic
//! bytes, a constraint set, a forking gate, and a per-plugin bookkeeping map
//! that is deep-cloned whenever the state forks.
//!
//! [Machine::fork] consumes the input handle: after a fork the original
//! handle may denote either branch, so all further work must go through the
//! two handles of the returned [ForkedPair].

pub mod machine;
pub mod memory;
pub mod plugin;
pub mod state;

pub use crate::machine::{Error, ForkedPair, Machine, Result};
pub use crate::memory::Memory;
pub use crate::plugin::{PluginId, PluginState, PluginStateMap};
pub use crate::state::{ExecutionState, Register, StateId, StateStatus};

#[cfg(test)]
mod tests;
