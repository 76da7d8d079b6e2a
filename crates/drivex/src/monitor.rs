use std::collections::BTreeMap;

use guest_machine::{Machine, PluginId, Register, Result, StateId};
use tracing::trace;

/// Owner of the per-state pending-return ledger.
pub const MONITOR_PLUGIN: PluginId = PluginId("function-monitor");

/// Routing record for an annotated address: which plugin handles it and
/// which of the plugin's handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hook {
    pub plugin: PluginId,
    pub handler: u16,
}

/// A call frame whose return handler has not fired yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingReturn {
    pub hook: Hook,
    /// Stack pointer at the call instruction, i.e. the slot holding the
    /// return address. Identifies the frame.
    pub sp: u64,
    pub return_address: u64,
}

/// Pending returns of one state, keyed by frame. Forks clone this wholesale
/// with the rest of the state's plugin bookkeeping, so each branch reaps its
/// own returns.
#[derive(Debug, Clone, Default)]
struct MonitorState {
    pending: BTreeMap<u64, PendingReturn>,
}

/// Address-to-hook routing for annotated functions.
///
/// The hook table is process-wide and append-only; whether a hook actually
/// fires in a given state is the owning plugin's per-state registration
/// decision.
#[derive(Debug, Default)]
pub struct FunctionMonitor {
    hooks: BTreeMap<u64, Vec<Hook>>,
}

impl FunctionMonitor {
    /// Route calls at `address` to `hook`. Connecting the same hook twice is
    /// a no-op.
    pub fn connect(&mut self, address: u64, hook: Hook) {
        let entry = self.hooks.entry(address).or_default();
        if !entry.contains(&hook) {
            trace!(address = format_args!("{address:#x}"), plugin = %hook.plugin, "hook connected");
            entry.push(hook);
        }
    }

    pub fn hooks_at(&self, address: u64) -> Vec<Hook> {
        self.hooks.get(&address).cloned().unwrap_or_default()
    }

    /// Record that `hook`'s return handler must fire when the frame at `sp`
    /// unwinds to `return_address`. At most one pending return exists per
    /// frame; a second registration for the same frame replaces the first.
    pub fn register_return(
        &self,
        machine: &mut Machine,
        state: &StateId,
        sp: u64,
        return_address: u64,
        hook: Hook,
    ) -> Result<()> {
        let monitor: &mut MonitorState = machine.plugin_state_mut(state, MONITOR_PLUGIN)?;
        monitor.pending.insert(
            sp,
            PendingReturn {
                hook,
                sp,
                return_address,
            },
        );
        Ok(())
    }

    /// Drop every pending return targeting `return_address`, leaving the
    /// state itself alone. The narrow cancellation for a branch whose
    /// pending returns a fork stranded. The in-tree handler sets fork at
    /// return time or keep their frames for reaping on return, so the
    /// caller is an embedder whose own forking redirects a branch away from
    /// a recorded unwind.
    pub fn erase_pending(
        &self,
        machine: &mut Machine,
        state: &StateId,
        return_address: u64,
    ) -> Result<usize> {
        let monitor: &mut MonitorState = machine.plugin_state_mut(state, MONITOR_PLUGIN)?;
        let before = monitor.pending.len();
        monitor
            .pending
            .retain(|_, pending| pending.return_address != return_address);
        Ok(before - monitor.pending.len())
    }

    /// Take the pending return matching execution at `pc`, if any.
    ///
    /// Frames are matched by return address, and when several recursive
    /// frames share one, by depth: the deepest frame below the current stack
    /// pointer unwinds first. A symbolic stack pointer falls back to the
    /// return address alone.
    pub fn take_matching_return(
        &self,
        machine: &mut Machine,
        state: &StateId,
        pc: u64,
    ) -> Result<Option<PendingReturn>> {
        let esp = machine.read_register_concrete(state, Register::Esp).ok();
        let monitor: &mut MonitorState = machine.plugin_state_mut(state, MONITOR_PLUGIN)?;

        let frame = monitor
            .pending
            .iter()
            .filter(|(_, pending)| pending.return_address == pc)
            .filter(|(&sp, _)| esp.map(|esp| sp < esp).unwrap_or(true))
            .map(|(&sp, _)| sp)
            .max();

        Ok(frame.map(|sp| monitor.pending.remove(&sp).unwrap()))
    }

    /// Number of pending returns in `state`, for diagnostics.
    pub fn pending_count(&self, machine: &Machine, state: &StateId) -> usize {
        machine
            .plugin_state::<MonitorState>(state, MONITOR_PLUGIN)
            .map(|monitor| monitor.pending.len())
            .unwrap_or(0)
    }
}
