use bitflags::bitflags;
use guest_machine::{Machine, PluginId, Result, StateId};
use tracing::{debug, trace};

use crate::module::ModuleDescriptor;

pub const MEMCHECK_PLUGIN: PluginId = PluginId("memory-checker");

bitflags! {
    /// Permissions of a granted region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemoryAccess: u8 {
        const READ = 1;
        const WRITE = 2;
        const EXECUTE = 4;
    }
}

/// One region the exercised driver is currently allowed to touch.
#[derive(Debug, Clone, PartialEq)]
pub struct Grant {
    /// Module the grant is attributed to, when known.
    pub module: Option<String>,
    pub base: u64,
    pub length: u64,
    pub access: MemoryAccess,
    /// Diagnostic label, conventionally `<surface>:<function or resource>`.
    pub tag: String,
}

#[derive(Debug, Clone, Default)]
struct CheckerState {
    grants: Vec<Grant>,
}

/// Dynamic memory-grant bookkeeping.
///
/// Annotation handlers grant a region when an allocation succeeds and revoke
/// it when the driver frees it; anything still granted when the owning
/// module unloads is a leak. Grants live in per-state plugin bookkeeping so
/// forked branches account independently.
#[derive(Debug, Default)]
pub struct MemoryChecker;

impl MemoryChecker {
    pub fn grant(
        &self,
        machine: &mut Machine,
        state: &StateId,
        module: Option<&ModuleDescriptor>,
        base: u64,
        length: u64,
        access: MemoryAccess,
        tag: impl Into<String>,
    ) -> Result<()> {
        let grant = Grant {
            module: module.map(|m| m.id.clone()),
            base,
            length,
            access,
            tag: tag.into(),
        };
        trace!(
            base = format_args!("{base:#x}"),
            length,
            tag = %grant.tag,
            "memory granted"
        );
        let checker: &mut CheckerState = machine.plugin_state_mut(state, MEMCHECK_PLUGIN)?;
        checker.grants.push(grant);
        Ok(())
    }

    /// Revoke every grant whose tag matches `pattern`. A trailing `*` makes
    /// the pattern a prefix match. Returns the number of revoked grants.
    pub fn revoke_tag(&self, machine: &mut Machine, state: &StateId, pattern: &str) -> Result<usize> {
        let checker: &mut CheckerState = machine.plugin_state_mut(state, MEMCHECK_PLUGIN)?;
        let before = checker.grants.len();
        checker
            .grants
            .retain(|grant| !tag_matches(pattern, &grant.tag));
        let revoked = before - checker.grants.len();
        debug!(pattern, revoked, "grants revoked by tag");
        Ok(revoked)
    }

    /// Revoke every grant rooted at `base`. Returns the number of revoked
    /// grants; zero usually means the driver freed something it never owned.
    pub fn revoke_base(&self, machine: &mut Machine, state: &StateId, base: u64) -> Result<usize> {
        let checker: &mut CheckerState = machine.plugin_state_mut(state, MEMCHECK_PLUGIN)?;
        let before = checker.grants.len();
        checker.grants.retain(|grant| grant.base != base);
        Ok(before - checker.grants.len())
    }

    pub fn grants(&self, machine: &Machine, state: &StateId) -> Vec<Grant> {
        machine
            .plugin_state::<CheckerState>(state, MEMCHECK_PLUGIN)
            .map(|checker| checker.grants.clone())
            .unwrap_or_default()
    }

    /// Outstanding grants attributable to `module`: attributed to it
    /// explicitly, or rooted inside its mapped range.
    pub fn leaks(&self, machine: &Machine, state: &StateId, module: &ModuleDescriptor) -> Vec<Grant> {
        self.grants(machine, state)
            .into_iter()
            .filter(|grant| {
                grant.module.as_deref() == Some(module.id.as_str()) || module.contains(grant.base)
            })
            .collect()
    }
}

fn tag_matches(pattern: &str, tag: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => tag.starts_with(prefix),
        None => tag == pattern,
    }
}
