//! Annotations for the kernel executive surface: ntoskrnl.exe imports plus
//! the IRP dispatch entry points the exerciser discovers in the driver
//! object.

use std::collections::BTreeMap;

use guest_machine::{PluginId, Register, StateId};
use strum::{FromRepr, IntoStaticStr};
use symexpr::SymValue;
use tracing::{debug, info, trace, warn};

use crate::api::{Error, ExecCtx, Result};
use crate::consistency::{ConsistencyModel, ConsistencyPolicy};
use crate::engine::{AnnotationEngine, HandlerTable};
use crate::handlers::{
    nt_success, pass_through, read_args, read_cstring, read_unicode_string, write_u32, zero_extended,
    Frame, HandlerAction, STATUS_INSUFFICIENT_RESOURCES, STATUS_SUCCESS,
};
use crate::memcheck::MemoryAccess;
use crate::monitor::{Hook, PendingReturn};

pub const PLUGIN: PluginId = PluginId("ntoskrnl");
const BOOK: PluginId = PluginId("ntoskrnl:book");
const STATE: PluginId = PluginId("ntoskrnl:state");

/// Imports with no useful annotation.
const IGNORED_IMPORTS: [&str; 4] = [
    "RtlInitUnicodeString",
    "KeInitializeSpinLock",
    "KeAcquireSpinLock",
    "KeReleaseSpinLock",
];

/// Imported data symbols; they appear in import tables but are never
/// called.
const EXPORTED_VARIABLES: [&str; 2] = ["KeTickCount", "KeServiceDescriptorTable"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, IntoStaticStr)]
#[repr(u16)]
pub enum NtFn {
    DbgPrint,
    KeStallExecutionProcessor,
    RtlEqualUnicodeString,
    ExAllocatePoolWithTag,
    ExFreePoolWithTag,
    IoCreateDevice,
    /// A major-function dispatch routine from the driver object, registered
    /// by the exerciser after `DriverEntry` succeeds.
    IrpDispatch,
}

impl NtFn {
    pub fn name(self) -> &'static str {
        self.into()
    }

    fn from_import(name: &str) -> Option<Self> {
        let f = match name {
            "DbgPrint" => Self::DbgPrint,
            "KeStallExecutionProcessor" => Self::KeStallExecutionProcessor,
            "RtlEqualUnicodeString" => Self::RtlEqualUnicodeString,
            "ExAllocatePoolWithTag" => Self::ExAllocatePoolWithTag,
            "ExFreePoolWithTag" => Self::ExFreePoolWithTag,
            "IoCreateDevice" => Self::IoCreateDevice,
            _ => return None,
        };
        Some(f)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum SavedCall {
    PoolAllocation { length: u64, tag: u64 },
    CreateDevice { device_ptr: u64 },
}

#[derive(Debug, Clone, Default)]
struct NtState {
    calls: BTreeMap<u64, SavedCall>,
    /// Major-function index of each registered dispatch routine, for
    /// diagnostics when one fires.
    dispatch_majors: BTreeMap<u64, u32>,
}

pub struct NtoskrnlHandlers {
    engine: AnnotationEngine,
}

impl HandlerTable for NtoskrnlHandlers {
    fn handler_for(&self, name: &str) -> Option<u16> {
        NtFn::from_import(name).map(|f| f as u16)
    }

    fn is_ignored(&self, name: &str) -> bool {
        IGNORED_IMPORTS.contains(&name)
    }

    fn is_exported_variable(&self, name: &str) -> bool {
        EXPORTED_VARIABLES.contains(&name)
    }
}

impl NtoskrnlHandlers {
    pub fn new(policy: ConsistencyPolicy, calling_modules: Vec<String>) -> Self {
        Self {
            engine: AnnotationEngine::new(PLUGIN, BOOK, policy, calling_modules),
        }
    }

    pub fn on_module_load(
        &mut self,
        cx: &mut ExecCtx,
        state: &StateId,
        module: &crate::module::ModuleDescriptor,
    ) -> Result<()> {
        self.engine.register_entry_points(cx, state, module, self)?;
        Ok(())
    }

    pub fn on_module_unload(
        &mut self,
        cx: &mut ExecCtx,
        state: &StateId,
        module: &crate::module::ModuleDescriptor,
    ) -> Result<()> {
        let retracted = self.engine.unregister_entry_points(cx, state, module)?;
        debug!(module = %module.id, retracted, "ntoskrnl annotations retracted");
        Ok(())
    }

    /// Register a dispatch routine harvested from the driver object's
    /// major-function table.
    pub fn register_irp_dispatch(
        &mut self,
        cx: &mut ExecCtx,
        state: &StateId,
        address: u64,
        major: u32,
    ) -> Result<()> {
        let owner = cx.modules.find(address).cloned();
        self.engine
            .register_entry_point(cx, state, NtFn::IrpDispatch as u16, address, owner.as_ref())?;
        let nt: &mut NtState = cx.machine.plugin_state_mut(state, STATE)?;
        nt.dispatch_majors.insert(address, major);
        debug!(major, address = format_args!("{address:#x}"), "dispatch routine registered");
        Ok(())
    }

    pub fn on_call(
        &mut self,
        cx: &mut ExecCtx,
        state: &StateId,
        frame: &Frame,
        handler: u16,
    ) -> Result<HandlerAction> {
        let f = NtFn::from_repr(handler).ok_or(Error::UnknownHandler {
            plugin: PLUGIN,
            handler,
        })?;

        if !self.engine.is_registered(cx.machine, state, handler, frame.function)? {
            return Ok(HandlerAction::Continue);
        }
        if f != NtFn::IrpDispatch && !self.engine.called_from_tracked(cx.modules, frame.return_address)
        {
            trace!(function = f.name(), "call from untracked module passed through");
            return Ok(HandlerAction::Continue);
        }

        match f {
            NtFn::DbgPrint => self.dbg_print_call(cx, state, frame),
            NtFn::KeStallExecutionProcessor => self.stall_call(cx, state, frame),
            NtFn::RtlEqualUnicodeString => self.equal_unicode_call(cx, state, frame),
            NtFn::ExAllocatePoolWithTag => self.pool_allocate_call(cx, state, frame),
            NtFn::ExFreePoolWithTag => self.pool_free_call(cx, state, frame),
            NtFn::IoCreateDevice => self.create_device_call(cx, state, frame),
            NtFn::IrpDispatch => self.irp_dispatch_call(cx, state, frame),
        }
    }

    pub fn on_return(&mut self, cx: &mut ExecCtx, state: &StateId, pending: &PendingReturn) -> Result<()> {
        let f = NtFn::from_repr(pending.hook.handler).ok_or(Error::UnknownHandler {
            plugin: PLUGIN,
            handler: pending.hook.handler,
        })?;
        let saved = {
            let nt: &mut NtState = cx.machine.plugin_state_mut(state, STATE)?;
            nt.calls.remove(&pending.sp)
        };

        match (f, saved) {
            (NtFn::ExAllocatePoolWithTag, Some(SavedCall::PoolAllocation { length, tag })) => {
                self.pool_allocate_return(cx, state, pending, length, tag)
            }
            (NtFn::IoCreateDevice, Some(SavedCall::CreateDevice { device_ptr })) => {
                self.create_device_return(cx, state, device_ptr)
            }
            (NtFn::IrpDispatch, _) => {
                match cx.machine.read_register_concrete(state, Register::Eax) {
                    Ok(status) => {
                        debug!(status = format_args!("{status:#x}"), "dispatch routine returned")
                    }
                    Err(_) => debug!("dispatch routine returned a symbolic status"),
                }
                Ok(())
            }
            (f, _) => {
                trace!(function = f.name(), "return observed");
                Ok(())
            }
        }
    }

    // ---- call handlers ---------------------------------------------------

    /// Forward the guest's debug output to the host log and skip the call.
    fn dbg_print_call(&mut self, cx: &mut ExecCtx, state: &StateId, frame: &Frame) -> Result<HandlerAction> {
        let format_ptr = match read_args(cx.machine, state, frame, 1) {
            Ok(args) => args[0],
            Err(err) => return Ok(pass_through("DbgPrint", err)),
        };
        let message = read_cstring(cx.machine, state, format_ptr, 256);
        info!(message = %message.trim_end(), "guest debug output");

        // DbgPrint is cdecl; the caller pops its own arguments.
        cx.machine.bypass_function(state, 0)?;
        cx.machine
            .write_register(state, Register::Eax, SymValue::concrete(STATUS_SUCCESS, 32))?;
        Ok(HandlerAction::BypassReturn)
    }

    /// Busy-wait stalls contribute nothing under symbolic execution.
    fn stall_call(&mut self, cx: &mut ExecCtx, state: &StateId, frame: &Frame) -> Result<HandlerAction> {
        let microseconds = read_args(cx.machine, state, frame, 1)
            .map(|args| args[0])
            .unwrap_or(0);
        trace!(microseconds, "execution stall skipped");
        cx.machine.bypass_function(state, 1)?;
        Ok(HandlerAction::BypassReturn)
    }

    /// Replace the comparison verdict with a fresh symbolic boolean so both
    /// outcomes stay reachable.
    fn equal_unicode_call(&mut self, cx: &mut ExecCtx, state: &StateId, frame: &Frame) -> Result<HandlerAction> {
        if self.model(cx, state, "RtlEqualUnicodeString")? == ConsistencyModel::Strict {
            return Ok(HandlerAction::Continue);
        }
        if let Ok(args) = read_args(cx.machine, state, frame, 2) {
            let lhs = read_unicode_string(cx.machine, state, args[0]).unwrap_or_default();
            let rhs = read_unicode_string(cx.machine, state, args[1]).unwrap_or_default();
            trace!(lhs = %lhs, rhs = %rhs, "string comparison made symbolic");
        }

        let verdict = cx.machine.create_symbol(state, "RtlEqualUnicodeString", 8)?;
        cx.machine.bypass_function(state, 3)?;
        cx.machine
            .write_register(state, Register::Eax, zero_extended(verdict, 4))?;
        Ok(HandlerAction::BypassReturn)
    }

    fn pool_allocate_call(&mut self, cx: &mut ExecCtx, state: &StateId, frame: &Frame) -> Result<HandlerAction> {
        let (length, tag) = match read_args(cx.machine, state, frame, 3) {
            Ok(args) => (args[1], args[2]),
            Err(err) => return Ok(pass_through("ExAllocatePoolWithTag", err)),
        };
        {
            let nt: &mut NtState = cx.machine.plugin_state_mut(state, STATE)?;
            nt.calls
                .insert(frame.sp, SavedCall::PoolAllocation { length, tag });
        }
        cx.monitor.register_return(
            cx.machine,
            state,
            frame.sp,
            frame.return_address,
            Hook {
                plugin: PLUGIN,
                handler: NtFn::ExAllocatePoolWithTag as u16,
            },
        )?;
        Ok(HandlerAction::Continue)
    }

    fn pool_free_call(&mut self, cx: &mut ExecCtx, state: &StateId, frame: &Frame) -> Result<HandlerAction> {
        let base = match read_args(cx.machine, state, frame, 1) {
            Ok(args) => args[0],
            Err(err) => return Ok(pass_through("ExFreePoolWithTag", err)),
        };
        if let Some(checker) = cx.memcheck {
            let revoked = checker.revoke_base(cx.machine, state, base)?;
            if revoked == 0 {
                warn!(
                    base = format_args!("{base:#x}"),
                    "driver freed pool it was never granted"
                );
            }
        }
        Ok(HandlerAction::Continue)
    }

    fn create_device_call(&mut self, cx: &mut ExecCtx, state: &StateId, frame: &Frame) -> Result<HandlerAction> {
        let device_ptr = match read_args(cx.machine, state, frame, 7) {
            Ok(args) => args[6],
            Err(err) => return Ok(pass_through("IoCreateDevice", err)),
        };
        {
            let nt: &mut NtState = cx.machine.plugin_state_mut(state, STATE)?;
            nt.calls.insert(frame.sp, SavedCall::CreateDevice { device_ptr });
        }
        cx.monitor.register_return(
            cx.machine,
            state,
            frame.sp,
            frame.return_address,
            Hook {
                plugin: PLUGIN,
                handler: NtFn::IoCreateDevice as u16,
            },
        )?;
        Ok(HandlerAction::Continue)
    }

    fn irp_dispatch_call(&mut self, cx: &mut ExecCtx, state: &StateId, frame: &Frame) -> Result<HandlerAction> {
        let major = cx
            .machine
            .plugin_state::<NtState>(state, STATE)
            .and_then(|nt| nt.dispatch_majors.get(&frame.function).copied());
        debug!(
            major = major.unwrap_or(u32::MAX),
            address = format_args!("{:#x}", frame.function),
            "irp dispatch routine invoked"
        );
        cx.monitor.register_return(
            cx.machine,
            state,
            frame.sp,
            frame.return_address,
            Hook {
                plugin: PLUGIN,
                handler: NtFn::IrpDispatch as u16,
            },
        )?;
        Ok(HandlerAction::Continue)
    }

    // ---- return handlers -------------------------------------------------

    fn pool_allocate_return(
        &mut self,
        cx: &mut ExecCtx,
        state: &StateId,
        pending: &PendingReturn,
        length: u64,
        tag: u64,
    ) -> Result<()> {
        let Ok(address) = cx.machine.read_register_concrete(state, Register::Eax) else {
            return Ok(());
        };
        if address == 0 {
            trace!("pool allocation failed natively");
            return Ok(());
        }
        let label = format!("ntoskrnl:pool:{}", pool_tag(tag));

        match self.model(cx, state, "ExAllocatePoolWithTag")? {
            ConsistencyModel::Local => {
                // The failure branch returns null, which real pool
                // exhaustion produces.
                let verdict = cx.machine.create_symbol(state, "ExAllocatePoolWithTag", 8)?;
                let restore = cx.machine.is_forking_enabled(state)?;
                cx.machine.set_forking(state, true)?;
                let pair = cx.machine.fork(state.clone(), verdict.non_zero())?;
                cx.machine.set_forking(&pair.positive, restore)?;
                cx.machine.set_forking(&pair.negative, restore)?;

                self.grant_pool(cx, &pair.positive, pending.return_address, address, length, label)?;
                cx.machine
                    .write_register(&pair.negative, Register::Eax, SymValue::concrete(0, 32))?;
            }
            _ => {
                self.grant_pool(cx, state, pending.return_address, address, length, label)?;
            }
        }
        Ok(())
    }

    fn grant_pool(
        &self,
        cx: &mut ExecCtx,
        state: &StateId,
        return_address: u64,
        base: u64,
        length: u64,
        tag: String,
    ) -> Result<()> {
        let Some(checker) = cx.memcheck else {
            return Ok(());
        };
        let owner = cx.modules.find(return_address).cloned();
        checker.grant(
            cx.machine,
            state,
            owner.as_ref(),
            base,
            length,
            MemoryAccess::READ | MemoryAccess::WRITE,
            tag,
        )?;
        Ok(())
    }

    fn create_device_return(&mut self, cx: &mut ExecCtx, state: &StateId, device_ptr: u64) -> Result<()> {
        let Ok(status) = cx.machine.read_register_concrete(state, Register::Eax) else {
            return Ok(());
        };
        if !nt_success(status) {
            return Ok(());
        }
        if self.model(cx, state, "IoCreateDevice")? != ConsistencyModel::Local {
            return Ok(());
        }

        let outcome = self.engine.fork_range(
            cx,
            state.clone(),
            "IoCreateDevice",
            &[STATUS_SUCCESS, STATUS_INSUFFICIENT_RESOURCES],
            32,
        )?;
        for (branch, value) in &outcome.branches {
            cx.machine
                .write_register(branch, Register::Eax, SymValue::concrete(*value, 32))?;
            if *value != STATUS_SUCCESS && device_ptr != 0 {
                write_u32(cx.machine, branch, device_ptr, 0)?;
            }
        }
        Ok(())
    }

    fn model(&self, cx: &ExecCtx, state: &StateId, function: &str) -> Result<ConsistencyModel> {
        Ok(self.engine.consistency(cx.machine, state, function)?)
    }
}

/// Render a pool tag as its four ASCII characters when printable.
fn pool_tag(raw: u64) -> String {
    let bytes = (raw as u32).to_le_bytes();
    if bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
        bytes.iter().map(|&b| b as char).collect()
    } else {
        format!("{raw:#010x}")
    }
}
