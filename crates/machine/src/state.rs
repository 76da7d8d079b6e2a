use symexpr::{ConstraintSet, SymValue};

use crate::memory::Memory;
use crate::plugin::PluginStateMap;

/// Handle of one execution state.
///
/// Deliberately not `Copy`: [crate::Machine::fork] takes the handle by value,
/// so code cannot keep using a pre-fork handle as though it still denoted one
/// particular branch.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateId(pub(crate) u64);

impl std::fmt::Display for StateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "state {}", self.0)
    }
}

/// General-purpose registers of the 32-bit guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Register {
    Eax,
    Ebx,
    Ecx,
    Edx,
    Esi,
    Edi,
    Ebp,
    Esp,
}

impl Register {
    pub(crate) const COUNT: usize = 8;

    pub(crate) fn index(self) -> usize {
        match self {
            Register::Eax => 0,
            Register::Ebx => 1,
            Register::Ecx => 2,
            Register::Edx => 3,
            Register::Esi => 4,
            Register::Edi => 5,
            Register::Ebp => 6,
            Register::Esp => 7,
        }
    }
}

/// Whether a state is still part of the exploration frontier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateStatus {
    Running,
    Terminated { reason: String },
}

/// One hypothesis about the guest machine.
#[derive(Debug, Clone)]
pub struct ExecutionState {
    pub(crate) id: u64,
    pub(crate) pc: u64,
    pub(crate) registers: [SymValue; Register::COUNT],
    pub(crate) memory: Memory,
    pub(crate) constraints: ConstraintSet,
    pub(crate) forking_enabled: bool,
    pub(crate) pid: u64,
    pub(crate) plugins: PluginStateMap,
    pub(crate) status: StateStatus,
}

impl ExecutionState {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            pc: 0,
            registers: std::array::from_fn(|_| SymValue::concrete(0, 32)),
            memory: Memory::default(),
            constraints: ConstraintSet::new(),
            forking_enabled: true,
            pid: 0,
            plugins: PluginStateMap::default(),
            status: StateStatus::Running,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.status, StateStatus::Running)
    }
}
