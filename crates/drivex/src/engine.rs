use std::collections::{BTreeMap, BTreeSet};

use guest_machine::{Machine, PluginId, Result, StateId};
use symexpr::SymValue;
use tracing::{debug, trace};

use crate::api::ExecCtx;
use crate::consistency::{ConsistencyModel, ConsistencyPolicy};
use crate::module::ModuleDescriptor;
use crate::monitor::Hook;

/// Import-name lookup for one handler set.
pub trait HandlerTable {
    /// Handler identifier for an imported function, if the set annotates it.
    fn handler_for(&self, name: &str) -> Option<u16>;

    /// Imports deliberately left unannotated; suppresses the missing-handler
    /// diagnostic.
    fn is_ignored(&self, name: &str) -> bool {
        let _ = name;
        false
    }

    /// Imports that are exported data rather than functions; never callable,
    /// so never a missing handler.
    fn is_exported_variable(&self, name: &str) -> bool {
        let _ = name;
        false
    }
}

/// Per-state registration and model bookkeeping of one handler set.
///
/// Keys are (address, process, handler); the value records the module the
/// registration was made on behalf of, so unloading that module can retract
/// exactly its registrations.
#[derive(Debug, Clone, Default)]
pub struct RegistrationBook {
    registered: BTreeMap<(u64, u64, u16), Option<String>>,
    model_stack: Vec<ConsistencyModel>,
}

/// Branches produced by a disjunctive fork, pairing each branch with the
/// selector value it is constrained to.
#[derive(Debug)]
pub struct ForkOutcome {
    pub selector: SymValue,
    pub branches: Vec<(StateId, u64)>,
}

/// Registration, scoping, and forking machinery shared by every handler set.
///
/// The engine is a capability object: handler sets own one and pass the
/// execution context in explicitly, so one engine instance serves every
/// state without hidden shared mutability.
#[derive(Debug, Clone)]
pub struct AnnotationEngine {
    /// Identity hooks are routed under.
    plugin: PluginId,
    /// Identity the registration book is stored under, distinct from
    /// `plugin` because handler sets keep their own bookkeeping there.
    book: PluginId,
    policy: ConsistencyPolicy,
    /// When non-empty, import annotations only fire for calls whose return
    /// address lies in one of these modules.
    calling_modules: BTreeSet<String>,
}

impl AnnotationEngine {
    pub fn new(
        plugin: PluginId,
        book: PluginId,
        policy: ConsistencyPolicy,
        calling_modules: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            plugin,
            book,
            policy,
            calling_modules: calling_modules.into_iter().collect(),
        }
    }

    pub fn policy(&self) -> &ConsistencyPolicy {
        &self.policy
    }

    // ---- registration ----------------------------------------------------

    /// Register `handler` for calls at `address` in `state`'s process.
    /// Idempotent; returns whether a new registration was made.
    pub fn register_entry_point(
        &self,
        cx: &mut ExecCtx,
        state: &StateId,
        handler: u16,
        address: u64,
        module: Option<&ModuleDescriptor>,
    ) -> Result<bool> {
        let pid = cx.machine.pid(state)?;
        let book: &mut RegistrationBook = cx.machine.plugin_state_mut(state, self.book)?;
        let inserted = book
            .registered
            .insert((address, pid, handler), module.map(|m| m.id.clone()))
            .is_none();

        if inserted {
            cx.monitor.connect(
                address,
                Hook {
                    plugin: self.plugin,
                    handler,
                },
            );
            trace!(
                plugin = %self.plugin,
                address = format_args!("{address:#x}"),
                pid,
                handler,
                "entry point registered"
            );
        }
        Ok(inserted)
    }

    /// Whether `handler` is registered at `address` for `state`'s process.
    /// Gates hook dispatch: the monitor table is process-wide, registration
    /// is per-state.
    pub fn is_registered(
        &self,
        machine: &Machine,
        state: &StateId,
        handler: u16,
        address: u64,
    ) -> Result<bool> {
        let pid = machine.pid(state)?;
        Ok(machine
            .plugin_state::<RegistrationBook>(state, self.book)
            .map(|book| book.registered.contains_key(&(address, pid, handler)))
            .unwrap_or(false))
    }

    /// Register annotations for every import of `module` the table covers.
    ///
    /// Fail-open per import: an import without a handler is logged and
    /// skipped rather than aborting the load, except for names the table
    /// declares ignored or data exports. Returns the number of new
    /// registrations.
    pub fn register_entry_points(
        &self,
        cx: &mut ExecCtx,
        state: &StateId,
        module: &ModuleDescriptor,
        table: &dyn HandlerTable,
    ) -> Result<usize> {
        let mut registered = 0;
        for import in &module.imports {
            match table.handler_for(&import.name) {
                Some(handler) => {
                    if self.register_entry_point(cx, state, handler, import.address, Some(module))? {
                        registered += 1;
                    }
                }
                None if table.is_ignored(&import.name) => {
                    trace!(import = %import.name, "import ignored by design")
                }
                None if table.is_exported_variable(&import.name) => {
                    trace!(import = %import.name, "import is exported data")
                }
                None => debug!(
                    plugin = %self.plugin,
                    import = %import.name,
                    "no annotation for import"
                ),
            }
        }
        debug!(plugin = %self.plugin, module = %module.id, registered, "imports annotated");
        Ok(registered)
    }

    /// Retract every registration made on behalf of `module`, plus any
    /// registration at an address inside its mapped range, for `state`'s
    /// process. Returns the number retracted.
    pub fn unregister_entry_points(
        &self,
        cx: &mut ExecCtx,
        state: &StateId,
        module: &ModuleDescriptor,
    ) -> Result<usize> {
        let pid = cx.machine.pid(state)?;
        let range = module.base..module.base + module.size;
        let id = module.id.clone();

        let book: &mut RegistrationBook = cx.machine.plugin_state_mut(state, self.book)?;
        let before = book.registered.len();
        book.registered.retain(|&(address, entry_pid, _), owner| {
            entry_pid != pid || (owner.as_deref() != Some(id.as_str()) && !range.contains(&address))
        });
        Ok(before - book.registered.len())
    }

    /// Whether a call returning to `return_address` comes from a module this
    /// engine annotates calls for. Unrestricted when no calling modules were
    /// configured.
    pub fn called_from_tracked(
        &self,
        modules: &crate::module::ModuleMap,
        return_address: u64,
    ) -> bool {
        if self.calling_modules.is_empty() {
            return true;
        }
        modules
            .find(return_address)
            .map(|module| self.calling_modules.contains(&module.id))
            .unwrap_or(false)
    }

    // ---- consistency -----------------------------------------------------

    /// Resolve the model for `function` in `state`: an explicit policy
    /// override wins, then a pinned model, then the policy default.
    pub fn consistency(
        &self,
        machine: &Machine,
        state: &StateId,
        function: &str,
    ) -> Result<ConsistencyModel> {
        if let Some(model) = self.policy.override_for(function) {
            return Ok(model);
        }
        let pinned = machine
            .plugin_state::<RegistrationBook>(state, self.book)
            .and_then(|book| book.model_stack.last().copied());
        Ok(pinned.unwrap_or(self.policy.default_model()))
    }

    /// Pin `model` for the duration of an annotated call. Pins nest LIFO;
    /// the matching return handler must pop.
    pub fn push_model(
        &self,
        machine: &mut Machine,
        state: &StateId,
        model: ConsistencyModel,
    ) -> Result<()> {
        let book: &mut RegistrationBook = machine.plugin_state_mut(state, self.book)?;
        book.model_stack.push(model);
        Ok(())
    }

    pub fn pop_model(&self, machine: &mut Machine, state: &StateId) -> Result<Option<ConsistencyModel>> {
        let book: &mut RegistrationBook = machine.plugin_state_mut(state, self.book)?;
        Ok(book.model_stack.pop())
    }

    // ---- forking ---------------------------------------------------------

    /// Fork `state` into one branch per candidate value, all constrained on
    /// one fresh selector symbol: branch `i` satisfies `selector ==
    /// values[i]`, and the branches jointly cover the selector's feasible
    /// values. Consumes the handle like [Machine::fork]; the first branch
    /// reuses the input state's storage.
    ///
    /// The forking gate is forced open for the duration and every branch
    /// leaves with the input state's original gate value. In concretize
    /// mode no fork happens and the single surviving branch takes the first
    /// candidate.
    pub fn fork_range(
        &self,
        cx: &mut ExecCtx,
        state: StateId,
        label: &str,
        values: &[u64],
        bits: u16,
    ) -> Result<ForkOutcome> {
        assert!(!values.is_empty(), "fork_range needs at least one value");

        let selector = cx.machine.create_symbol(&state, label, bits)?;
        if selector.as_concrete().is_some() {
            return Ok(ForkOutcome {
                selector: SymValue::concrete(values[0], bits),
                branches: vec![(state, values[0])],
            });
        }

        let restore = cx.machine.is_forking_enabled(&state)?;
        cx.machine.set_forking(&state, true)?;

        let mut branches = Vec::with_capacity(values.len());
        let mut current = state;
        for &value in &values[..values.len() - 1] {
            let pair = cx
                .machine
                .fork(current, selector.clone().equals(SymValue::concrete(value, bits)))?;
            cx.machine.set_forking(&pair.positive, restore)?;
            branches.push((pair.positive, value));
            current = pair.negative;
        }

        let last = *values.last().expect("values is non-empty");
        cx.machine
            .add_constraint(&current, selector.clone().equals(SymValue::concrete(last, bits)))?;
        cx.machine.set_forking(&current, restore)?;
        branches.push((current, last));

        debug!(label, branches = branches.len(), "state forked over value range");
        Ok(ForkOutcome { selector, branches })
    }

    /// Fork `state` into `count + 1` structurally identical branches
    /// distinguished only by their selector value `0..=count`. The caller
    /// applies the distinguishing logic afterwards; nothing else differs
    /// between the branches.
    pub fn fork_states(
        &self,
        cx: &mut ExecCtx,
        state: StateId,
        label: &str,
        count: usize,
    ) -> Result<ForkOutcome> {
        let values: Vec<u64> = (0..=count as u64).collect();
        self.fork_range(cx, state, label, &values, 32)
    }
}
