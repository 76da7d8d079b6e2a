use std::collections::BTreeMap;

use symexpr::{BoolExpr, SymValue};

use crate::memory;
use crate::plugin::{PluginId, PluginState};
use crate::state::{ExecutionState, Register, StateId, StateStatus};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error occurred while accessing guest memory.
    #[error(transparent)]
    Memory(#[from] memory::Error),

    /// The constraint facade could not decide a required query.
    #[error(transparent)]
    Constraint(#[from] symexpr::Error),

    #[error("unknown or terminated state {0}")]
    UnknownState(u64),

    #[error("forking is disabled for state {0}")]
    ForkingDisabled(u64),

    /// One side of a requested fork can never be satisfied.
    #[error("fork condition is one-sided: {0}")]
    InfeasibleBranch(String),

    /// A register holds symbolic data where a concrete value is required.
    #[error("register {register:?} is symbolic in state {state}")]
    SymbolicRegister { state: u64, register: Register },
}

/// The two handles produced by a fork. The positive branch satisfies the
/// fork condition, the negative branch its negation.
#[derive(Debug)]
pub struct ForkedPair {
    pub positive: StateId,
    pub negative: StateId,
}

/// Arena of execution states plus the process-wide symbol policy.
#[derive(Debug, Default)]
pub struct Machine {
    states: BTreeMap<u64, ExecutionState>,
    next_id: u64,
    /// When set, every "fresh symbol" request yields a concrete example
    /// value instead. This implements the overconstrained debugging mode.
    concretize_symbols: bool,
}

impl Machine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a fresh state at pc 0 with an empty address space.
    pub fn create_state(&mut self) -> StateId {
        let id = self.next_id;
        self.next_id += 1;
        self.states.insert(id, ExecutionState::new(id));
        StateId(id)
    }

    /// Enable or disable concrete-example substitution for fresh symbols.
    pub fn set_concretize_symbols(&mut self, concretize: bool) {
        self.concretize_symbols = concretize;
    }

    pub fn concretize_symbols(&self) -> bool {
        self.concretize_symbols
    }

    /// Handles of all states still in the exploration frontier.
    pub fn live_states(&self) -> Vec<StateId> {
        self.states
            .values()
            .filter(|state| state.is_running())
            .map(|state| StateId(state.id))
            .collect()
    }

    fn state(&self, id: &StateId) -> Result<&ExecutionState> {
        self.states
            .get(&id.0)
            .filter(|state| state.is_running())
            .ok_or(Error::UnknownState(id.0))
    }

    fn state_mut(&mut self, id: &StateId) -> Result<&mut ExecutionState> {
        self.states
            .get_mut(&id.0)
            .filter(|state| state.is_running())
            .ok_or(Error::UnknownState(id.0))
    }

    // ---- control flow ----------------------------------------------------

    pub fn pc(&self, id: &StateId) -> Result<u64> {
        Ok(self.state(id)?.pc)
    }

    pub fn set_pc(&mut self, id: &StateId, pc: u64) -> Result<()> {
        self.state_mut(id)?.pc = pc;
        Ok(())
    }

    /// Pop a stdcall frame as though the callee executed and returned: the
    /// return address is consumed from the stack, `arg_count` stack-passed
    /// arguments are discarded, and pc moves to the return address. Returns
    /// the return address.
    pub fn bypass_function(&mut self, id: &StateId, arg_count: usize) -> Result<u64> {
        let esp = self.read_register_concrete(id, Register::Esp)?;
        let return_address = {
            let state = self.state(id)?;
            let bytes = state.memory.read_concrete(esp, 4)?;
            u32::from_le_bytes(bytes.try_into().unwrap()) as u64
        };

        let state = self.state_mut(id)?;
        state.pc = return_address;
        state.registers[Register::Esp.index()] =
            SymValue::concrete(esp + 4 * (1 + arg_count as u64), 32);

        Ok(return_address)
    }

    // ---- registers -------------------------------------------------------

    pub fn read_register(&self, id: &StateId, register: Register) -> Result<SymValue> {
        Ok(self.state(id)?.registers[register.index()].clone())
    }

    /// Read a register that must evaluate concretely, either structurally or
    /// through the state's constraint bindings.
    pub fn read_register_concrete(&self, id: &StateId, register: Register) -> Result<u64> {
        let state = self.state(id)?;
        let value = &state.registers[register.index()];
        state
            .constraints
            .evaluate(value)
            .ok_or(Error::SymbolicRegister {
                state: id.0,
                register,
            })
    }

    pub fn write_register(
        &mut self,
        id: &StateId,
        register: Register,
        value: SymValue,
    ) -> Result<()> {
        self.state_mut(id)?.registers[register.index()] = value;
        Ok(())
    }

    pub fn write_register_concrete(
        &mut self,
        id: &StateId,
        register: Register,
        value: u64,
    ) -> Result<()> {
        self.write_register(id, register, SymValue::concrete(value, 32))
    }

    // ---- memory ----------------------------------------------------------

    pub fn read_memory(&self, id: &StateId, address: u64, size: usize) -> Result<SymValue> {
        Ok(self.state(id)?.memory.read(address, size)?)
    }

    pub fn read_memory_concrete(&self, id: &StateId, address: u64, size: usize) -> Result<Vec<u8>> {
        Ok(self.state(id)?.memory.read_concrete(address, size)?)
    }

    pub fn write_memory(&mut self, id: &StateId, address: u64, value: SymValue) -> Result<()> {
        Ok(self.state_mut(id)?.memory.write(address, value)?)
    }

    pub fn write_memory_bytes(&mut self, id: &StateId, address: u64, data: &[u8]) -> Result<()> {
        Ok(self.state_mut(id)?.memory.write_bytes(address, data)?)
    }

    // ---- symbols and constraints -----------------------------------------

    /// Create a fresh symbolic value scoped to the state, or a concrete
    /// example value in concretize mode.
    pub fn create_symbol(
        &mut self,
        id: &StateId,
        name: impl Into<String>,
        bits: u16,
    ) -> Result<SymValue> {
        self.state(id)?;
        if self.concretize_symbols {
            return Ok(SymValue::concrete(0, bits));
        }

        let name = format!("{name}_{state}", name = name.into(), state = id.0);
        Ok(SymValue::variable(name, bits))
    }

    pub fn add_constraint(&mut self, id: &StateId, constraint: BoolExpr) -> Result<()> {
        self.state_mut(id)?.constraints.add(constraint);
        Ok(())
    }

    pub fn may_be_true(&self, id: &StateId, expr: &BoolExpr) -> Result<bool> {
        Ok(self.state(id)?.constraints.may_be_true(expr)?)
    }

    pub fn must_be_false(&self, id: &StateId, expr: &BoolExpr) -> Result<bool> {
        Ok(self.state(id)?.constraints.must_be_false(expr)?)
    }

    /// Concrete value of `value` under the state's constraint bindings.
    pub fn evaluate(&self, id: &StateId, value: &SymValue) -> Result<Option<u64>> {
        Ok(self.state(id)?.constraints.evaluate(value))
    }

    // ---- forking ---------------------------------------------------------

    pub fn is_forking_enabled(&self, id: &StateId) -> Result<bool> {
        Ok(self.state(id)?.forking_enabled)
    }

    pub fn set_forking(&mut self, id: &StateId, enabled: bool) -> Result<()> {
        self.state_mut(id)?.forking_enabled = enabled;
        Ok(())
    }

    /// Fork `state` on `condition`, consuming the handle. Registers, memory,
    /// plugin states, and constraints are deep-cloned; the positive branch
    /// gains `condition` and the negative branch its negation. Both branches
    /// must be satisfiable.
    pub fn fork(&mut self, state: StateId, condition: BoolExpr) -> Result<ForkedPair> {
        {
            let existing = self.state(&state)?;
            if !existing.forking_enabled {
                return Err(Error::ForkingDisabled(state.0));
            }

            let negated = !condition.clone();
            if existing.constraints.must_be_false(&condition)?
                || existing.constraints.must_be_false(&negated)?
            {
                return Err(Error::InfeasibleBranch(condition.to_string()));
            }
        }

        let negative_id = self.next_id;
        self.next_id += 1;

        let mut negative = self.states.get(&state.0).unwrap().clone();
        negative.id = negative_id;
        negative.constraints.add(!condition.clone());
        self.states.insert(negative_id, negative);

        let positive = self.states.get_mut(&state.0).unwrap();
        positive.constraints.add(condition);

        Ok(ForkedPair {
            positive: state,
            negative: StateId(negative_id),
        })
    }

    // ---- lifecycle -------------------------------------------------------

    /// Drop a state from the exploration frontier. The record is retained
    /// for diagnostics.
    pub fn terminate(&mut self, id: &StateId, reason: impl Into<String>) -> Result<()> {
        let state = self.state_mut(id)?;
        state.status = StateStatus::Terminated {
            reason: reason.into(),
        };
        Ok(())
    }

    /// Whether the handle denotes a live state.
    pub fn is_live(&self, id: &StateId) -> bool {
        self.states
            .get(&id.0)
            .map(ExecutionState::is_running)
            .unwrap_or(false)
    }

    /// Termination reason of a dead state, for diagnostics.
    pub fn termination_reason(&self, id: &StateId) -> Option<&str> {
        match self.states.get(&id.0)?.status {
            StateStatus::Terminated { ref reason } => Some(reason),
            StateStatus::Running => None,
        }
    }

    // ---- process and plugin bookkeeping ----------------------------------

    pub fn pid(&self, id: &StateId) -> Result<u64> {
        Ok(self.state(id)?.pid)
    }

    pub fn set_pid(&mut self, id: &StateId, pid: u64) -> Result<()> {
        self.state_mut(id)?.pid = pid;
        Ok(())
    }

    /// Borrow a plugin's per-state bookkeeping, creating it on first access.
    pub fn plugin_state_mut<T: PluginState + Default>(
        &mut self,
        id: &StateId,
        plugin: PluginId,
    ) -> Result<&mut T> {
        Ok(self.state_mut(id)?.plugins.get_or_default_mut(plugin))
    }

    /// Borrow a plugin's per-state bookkeeping if it exists.
    pub fn plugin_state<T: PluginState>(&self, id: &StateId, plugin: PluginId) -> Option<&T> {
        self.states
            .get(&id.0)
            .and_then(|state| state.plugins.get(plugin))
    }
}
