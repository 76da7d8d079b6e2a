//! Drives the exercised driver through its lifecycle: annotate its entry
//! point at load, harvest the driver object after `DriverEntry`, and settle
//! accounts at unload.

use std::collections::{BTreeMap, BTreeSet};

use guest_machine::{PluginId, Register, StateId};
use strum::{FromRepr, IntoStaticStr};
use tracing::{debug, info, trace, warn};

use crate::api::{Error, ExecCtx, Result};
use crate::config::UnloadPolicy;
use crate::consistency::ConsistencyPolicy;
use crate::engine::AnnotationEngine;
use crate::handlers::{nt_success, pass_through, read_args, read_u32, Frame, HandlerAction};
use crate::memcheck::{Grant, MemoryAccess};
use crate::module::ModuleDescriptor;
use crate::monitor::{Hook, PendingReturn};

pub const PLUGIN: PluginId = PluginId("exerciser");
const BOOK: PluginId = PluginId("exerciser:book");
const STATE: PluginId = PluginId("exerciser:state");

// 32-bit DRIVER_OBJECT layout.
const DRIVER_OBJECT_SIZE: u64 = 0xA8;
const DRIVER_UNLOAD_OFFSET: u64 = 0x34;
const MAJOR_FUNCTION_OFFSET: u64 = 0x38;
const IRP_MJ_MAXIMUM_FUNCTION: u64 = 28;
const _: () = assert!(MAJOR_FUNCTION_OFFSET + IRP_MJ_MAXIMUM_FUNCTION * 4 == DRIVER_OBJECT_SIZE);

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, IntoStaticStr)]
#[repr(u16)]
pub enum ExerciserFn {
    DriverEntry,
    DriverUnload,
}

/// Registrations the exerciser asks other plugins to make after
/// `DriverEntry` succeeds. Returned to the dispatcher rather than performed
/// in place, because they belong to plugins the exerciser does not own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowUp {
    IrpDispatch { address: u64, major: u32 },
    DriverUnload { address: u64 },
}

#[derive(Debug, Clone, Default)]
struct ExerciserState {
    /// Tracked modules already seen loading, to ignore duplicate load
    /// notifications.
    loaded: BTreeSet<String>,
    /// Driver-object pointer per in-flight `DriverEntry` frame.
    entries: BTreeMap<u64, u64>,
}

pub struct DriverExerciser {
    engine: AnnotationEngine,
    tracked: BTreeSet<String>,
    unload_policy: UnloadPolicy,
}

impl DriverExerciser {
    pub fn new(policy: ConsistencyPolicy, tracked: Vec<String>, unload_policy: UnloadPolicy) -> Self {
        Self {
            engine: AnnotationEngine::new(PLUGIN, BOOK, policy, Vec::new()),
            tracked: tracked.into_iter().collect(),
            unload_policy,
        }
    }

    pub fn on_module_load(&mut self, cx: &mut ExecCtx, state: &StateId, module: &ModuleDescriptor) -> Result<()> {
        if !self.tracked.contains(&module.id) {
            trace!(module = %module.id, "module not exercised");
            return Ok(());
        }

        let fresh = {
            let book: &mut ExerciserState = cx.machine.plugin_state_mut(state, STATE)?;
            book.loaded.insert(module.id.clone())
        };
        if !fresh {
            debug!(module = %module.id, "duplicate load notification ignored");
            return Ok(());
        }

        self.engine.register_entry_point(
            cx,
            state,
            ExerciserFn::DriverEntry as u16,
            module.entry_point,
            Some(module),
        )?;
        info!(
            module = %module.id,
            entry_point = format_args!("{:#x}", module.entry_point),
            "exercising driver"
        );
        Ok(())
    }

    /// Settle accounts for an exercised module leaving the process: revoke
    /// the exerciser's own grants, report what the driver still holds, and
    /// apply the unload policy to the state. Returns the leaked grants.
    pub fn on_module_unload(
        &mut self,
        cx: &mut ExecCtx,
        state: &StateId,
        module: &ModuleDescriptor,
    ) -> Result<Vec<Grant>> {
        if !self.tracked.contains(&module.id) {
            return Ok(Vec::new());
        }

        self.engine.unregister_entry_points(cx, state, module)?;
        {
            let book: &mut ExerciserState = cx.machine.plugin_state_mut(state, STATE)?;
            book.loaded.remove(&module.id);
        }

        let leaks = match cx.memcheck {
            Some(checker) => {
                checker.revoke_tag(cx.machine, state, "exerciser:*")?;
                let leaks = checker.leaks(cx.machine, state, module);
                for leak in &leaks {
                    warn!(
                        tag = %leak.tag,
                        base = format_args!("{:#x}", leak.base),
                        length = leak.length,
                        "allocation leaked across module unload"
                    );
                }
                leaks
            }
            None => Vec::new(),
        };

        match self.unload_policy {
            UnloadPolicy::Kill => {
                cx.machine
                    .terminate(state, format!("module {} unloaded", module.id))?;
            }
            UnloadPolicy::Succeed => {
                cx.states.succeed_state(cx.machine, state)?;
            }
        }
        Ok(leaks)
    }

    pub fn on_call(
        &mut self,
        cx: &mut ExecCtx,
        state: &StateId,
        frame: &Frame,
        handler: u16,
    ) -> Result<HandlerAction> {
        let f = ExerciserFn::from_repr(handler).ok_or(Error::UnknownHandler {
            plugin: PLUGIN,
            handler,
        })?;
        if !self.engine.is_registered(cx.machine, state, handler, frame.function)? {
            return Ok(HandlerAction::Continue);
        }

        match f {
            ExerciserFn::DriverEntry => self.driver_entry_call(cx, state, frame),
            ExerciserFn::DriverUnload => {
                debug!(state = %state, "driver unload routine invoked");
                Ok(HandlerAction::Continue)
            }
        }
    }

    pub fn on_return(
        &mut self,
        cx: &mut ExecCtx,
        state: &StateId,
        pending: &PendingReturn,
    ) -> Result<Vec<FollowUp>> {
        let f = ExerciserFn::from_repr(pending.hook.handler).ok_or(Error::UnknownHandler {
            plugin: PLUGIN,
            handler: pending.hook.handler,
        })?;
        match f {
            ExerciserFn::DriverEntry => self.driver_entry_return(cx, state, pending),
            ExerciserFn::DriverUnload => Ok(Vec::new()),
        }
    }

    /// Register the unload routine harvested from the driver object.
    pub fn register_unload(&mut self, cx: &mut ExecCtx, state: &StateId, address: u64) -> Result<()> {
        let owner = cx.modules.find(address).cloned();
        self.engine.register_entry_point(
            cx,
            state,
            ExerciserFn::DriverUnload as u16,
            address,
            owner.as_ref(),
        )?;
        debug!(address = format_args!("{address:#x}"), "unload routine registered");
        Ok(())
    }

    /// The OS hands `DriverEntry` two structures it built itself; grant
    /// them so the memory checker accepts the driver reading them.
    fn driver_entry_call(&mut self, cx: &mut ExecCtx, state: &StateId, frame: &Frame) -> Result<HandlerAction> {
        let (driver_object, registry_path) = match read_args(cx.machine, state, frame, 2) {
            Ok(args) => (args[0], args[1]),
            Err(err) => return Ok(pass_through("DriverEntry", err)),
        };
        info!(
            state = %state,
            driver_object = format_args!("{driver_object:#x}"),
            "driver entry started"
        );

        let model = self.engine.consistency(cx.machine, state, "DriverEntry")?;
        self.engine.push_model(cx.machine, state, model)?;

        if let Some(checker) = cx.memcheck {
            checker.grant(
                cx.machine,
                state,
                None,
                driver_object,
                DRIVER_OBJECT_SIZE,
                MemoryAccess::READ | MemoryAccess::WRITE,
                "exerciser:DriverObject",
            )?;
            if registry_path != 0 {
                checker.grant(
                    cx.machine,
                    state,
                    None,
                    registry_path,
                    8,
                    MemoryAccess::READ,
                    "exerciser:RegistryPath",
                )?;
            }
        }

        {
            let book: &mut ExerciserState = cx.machine.plugin_state_mut(state, STATE)?;
            book.entries.insert(frame.sp, driver_object);
        }
        cx.monitor.register_return(
            cx.machine,
            state,
            frame.sp,
            frame.return_address,
            Hook {
                plugin: PLUGIN,
                handler: ExerciserFn::DriverEntry as u16,
            },
        )?;
        Ok(HandlerAction::Continue)
    }

    fn driver_entry_return(
        &mut self,
        cx: &mut ExecCtx,
        state: &StateId,
        pending: &PendingReturn,
    ) -> Result<Vec<FollowUp>> {
        self.engine.pop_model(cx.machine, state)?;
        let driver_object = {
            let book: &mut ExerciserState = cx.machine.plugin_state_mut(state, STATE)?;
            book.entries.remove(&pending.sp)
        };

        let Ok(status) = cx.machine.read_register_concrete(state, Register::Eax) else {
            warn!("driver entry returned a symbolic status");
            return Ok(Vec::new());
        };

        if !nt_success(status) {
            if let Some(checker) = cx.memcheck {
                checker.revoke_tag(cx.machine, state, "exerciser:*")?;
            }
            cx.machine.terminate(
                state,
                format!("DriverEntry failed with status {status:#010x}"),
            )?;
            return Ok(Vec::new());
        }

        info!(state = %state, "driver entry succeeded");
        let Some(driver_object) = driver_object else {
            warn!("no driver object recorded for this frame");
            return Ok(Vec::new());
        };

        // Walk the driver object the entry point just filled in.
        let mut follow_ups = Vec::new();
        if let Ok(unload) = read_u32(cx.machine, state, driver_object + DRIVER_UNLOAD_OFFSET) {
            if unload != 0 {
                follow_ups.push(FollowUp::DriverUnload {
                    address: unload as u64,
                });
            }
        }

        let mut seen = BTreeSet::new();
        for major in 0..IRP_MJ_MAXIMUM_FUNCTION {
            let slot = driver_object + MAJOR_FUNCTION_OFFSET + major * 4;
            let Ok(routine) = read_u32(cx.machine, state, slot) else {
                warn!(major, "unreadable major function slot, walk stopped");
                break;
            };
            if routine != 0 && seen.insert(routine) {
                follow_ups.push(FollowUp::IrpDispatch {
                    address: routine as u64,
                    major: major as u32,
                });
            }
        }
        info!(dispatch_routines = seen.len(), "driver object harvested");
        Ok(follow_ups)
    }
}
