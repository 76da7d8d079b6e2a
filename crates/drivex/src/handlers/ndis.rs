//! Annotations for the NDIS miniport surface: the ndis.sys imports a
//! miniport driver calls, and the miniport entry points it registers back
//! into NDIS.

use std::collections::{BTreeMap, BTreeSet};

use guest_machine::{PluginId, Register, StateId};
use strum::{FromRepr, IntoStaticStr};
use symexpr::SymValue;
use tracing::{debug, info, trace, warn};

use crate::api::{Error, ExecCtx, Result};
use crate::config::NdisConfig;
use crate::consistency::{ConsistencyModel, ConsistencyPolicy};
use crate::engine::{AnnotationEngine, HandlerTable};
use crate::handlers::{
    nt_success, pass_through, read_args, read_u32, read_unicode_string, write_arg, write_u32,
    zero_extended, Frame, HandlerAction, NDIS_STATUS_FAILURE, NDIS_STATUS_SUCCESS,
};
use crate::memcheck::MemoryAccess;
use crate::monitor::{Hook, PendingReturn};

pub const PLUGIN: PluginId = PluginId("ndis");
const BOOK: PluginId = PluginId("ndis:book");
const STATE: PluginId = PluginId("ndis:state");

pub const OID_GEN_MEDIA_CONNECT_STATUS: u64 = 0x0001_0114;

/// NDIS 4.0 `MINIPORT_CHARACTERISTICS`: major and minor version bytes,
/// two bytes of padding, then thirteen handler pointers.
const CHARACTERISTICS40_SIZE: u64 = 4 + 13 * 4;
const _: () = assert!(CHARACTERISTICS40_SIZE == 56);

/// Handler-pointer slots of the characteristics structure that have an
/// entry-point annotation.
const MINIPORT_HANDLER_SLOTS: [(u64, NdisFn); 9] = [
    (4, NdisFn::MiniportCheckForHang),
    (16, NdisFn::MiniportHalt),
    (20, NdisFn::MiniportHandleInterrupt),
    (24, NdisFn::MiniportInitialize),
    (28, NdisFn::MiniportIsr),
    (32, NdisFn::MiniportQueryInformation),
    (40, NdisFn::MiniportReset),
    (44, NdisFn::MiniportSend),
    (48, NdisFn::MiniportSetInformation),
];

/// Imports with no useful annotation; listed so their absence is not
/// reported during registration.
const IGNORED_IMPORTS: [&str; 6] = [
    "NdisInitializeString",
    "NdisFreeString",
    "NdisWriteErrorLogEntry",
    "NdisMSleep",
    "NdisInterlockedIncrement",
    "NdisInterlockedDecrement",
];

/// Handler identifiers of the NDIS set. Import annotations are named after
/// the imported function; `Miniport*` variants are driver entry points
/// registered through `NdisMRegisterMiniport` and `NdisMInitializeTimer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, IntoStaticStr)]
#[repr(u16)]
pub enum NdisFn {
    NdisMInitializeWrapper,
    NdisMRegisterMiniport,
    NdisAllocateMemory,
    NdisAllocateMemoryWithTag,
    NdisAllocateMemoryWithTagPriority,
    NdisFreeMemory,
    NdisMAllocateSharedMemory,
    NdisMFreeSharedMemory,
    NdisMRegisterIoPortRange,
    NdisMDeregisterIoPortRange,
    NdisMMapIoSpace,
    NdisMQueryAdapterResources,
    NdisReadPciSlotInformation,
    NdisWritePciSlotInformation,
    NdisOpenConfiguration,
    NdisReadConfiguration,
    NdisCloseConfiguration,
    NdisReadNetworkAddress,
    NdisMSetAttributes,
    NdisMSetAttributesEx,
    NdisMInitializeTimer,
    NdisSetTimer,
    NdisMCancelTimer,
    NdisMRegisterInterrupt,
    MiniportInitialize,
    MiniportHalt,
    MiniportCheckForHang,
    MiniportQueryInformation,
    MiniportSetInformation,
    MiniportSend,
    MiniportReset,
    MiniportIsr,
    MiniportHandleInterrupt,
    MiniportTimer,
}

impl NdisFn {
    pub fn name(self) -> &'static str {
        self.into()
    }

    fn is_entry_point(self) -> bool {
        self.name().starts_with("Miniport")
    }

    fn from_import(name: &str) -> Option<Self> {
        let f = match name {
            "NdisMInitializeWrapper" => Self::NdisMInitializeWrapper,
            "NdisMRegisterMiniport" => Self::NdisMRegisterMiniport,
            "NdisAllocateMemory" => Self::NdisAllocateMemory,
            "NdisAllocateMemoryWithTag" => Self::NdisAllocateMemoryWithTag,
            "NdisAllocateMemoryWithTagPriority" => Self::NdisAllocateMemoryWithTagPriority,
            "NdisFreeMemory" => Self::NdisFreeMemory,
            "NdisMAllocateSharedMemory" => Self::NdisMAllocateSharedMemory,
            "NdisMFreeSharedMemory" => Self::NdisMFreeSharedMemory,
            "NdisMRegisterIoPortRange" => Self::NdisMRegisterIoPortRange,
            "NdisMDeregisterIoPortRange" => Self::NdisMDeregisterIoPortRange,
            "NdisMMapIoSpace" => Self::NdisMMapIoSpace,
            "NdisMQueryAdapterResources" => Self::NdisMQueryAdapterResources,
            "NdisReadPciSlotInformation" => Self::NdisReadPciSlotInformation,
            "NdisWritePciSlotInformation" => Self::NdisWritePciSlotInformation,
            "NdisOpenConfiguration" => Self::NdisOpenConfiguration,
            "NdisReadConfiguration" => Self::NdisReadConfiguration,
            "NdisCloseConfiguration" => Self::NdisCloseConfiguration,
            "NdisReadNetworkAddress" => Self::NdisReadNetworkAddress,
            "NdisMSetAttributes" => Self::NdisMSetAttributes,
            "NdisMSetAttributesEx" => Self::NdisMSetAttributesEx,
            "NdisMInitializeTimer" => Self::NdisMInitializeTimer,
            "NdisSetTimer" => Self::NdisSetTimer,
            "NdisMCancelTimer" => Self::NdisMCancelTimer,
            "NdisMRegisterInterrupt" => Self::NdisMRegisterInterrupt,
            _ => return None,
        };
        Some(f)
    }
}

/// Arguments a call handler saved for its return handler, keyed by frame.
#[derive(Debug, Clone, PartialEq)]
enum SavedCall {
    WrapperHandle {
        handle_ptr: u64,
    },
    Allocate {
        out_ptr: u64,
        length: u64,
    },
    AllocatePriority {
        length: u64,
    },
    SharedMemory {
        va_ptr: u64,
        length: u64,
    },
    IoPortRange {
        out_ptr: u64,
        ports: u64,
    },
    MapIoSpace {
        out_ptr: u64,
        length: u64,
    },
    QueryResources {
        status_ptr: u64,
    },
    OpenConfiguration {
        status_ptr: u64,
    },
    ReadConfiguration {
        status_ptr: u64,
        param_ptr_ptr: u64,
        keyword: String,
    },
    ReadNetworkAddress {
        status_ptr: u64,
        addr_ptr_ptr: u64,
        len_ptr: u64,
    },
    QueryInformation {
        oid: u64,
        buffer: u64,
        written_ptr: u64,
    },
}

/// Per-state NDIS bookkeeping.
#[derive(Debug, Clone, Default)]
struct NdisState {
    calls: BTreeMap<u64, SavedCall>,
    /// Timer routines registered through `NdisMInitializeTimer`.
    timer_routines: BTreeSet<u64>,
    /// This state is a forked branch that runs a timer routine out of turn;
    /// it is reaped when the routine returns.
    fake_timer: bool,
    /// This state is a forked branch with a fabricated OID query result.
    fake_query: bool,
}

/// Process-wide record of which timer routines and hang checks have been
/// exercised.
///
/// Deliberately not per-state: the goal is to run each routine once across
/// the whole exploration, which also makes the produced forks depend on
/// state scheduling order.
#[derive(Debug, Default)]
pub struct TimerCoverage {
    explored: BTreeSet<u64>,
    hang_check_exercised: bool,
}

impl TimerCoverage {
    pub fn reset(&mut self) {
        self.explored.clear();
        self.hang_check_exercised = false;
    }
}

pub struct NdisHandlers {
    engine: AnnotationEngine,
    config: NdisConfig,
    timers: TimerCoverage,
}

impl HandlerTable for NdisHandlers {
    fn handler_for(&self, name: &str) -> Option<u16> {
        NdisFn::from_import(name).map(|f| f as u16)
    }

    fn is_ignored(&self, name: &str) -> bool {
        IGNORED_IMPORTS.contains(&name)
    }
}

impl NdisHandlers {
    pub fn new(
        policy: ConsistencyPolicy,
        config: NdisConfig,
        calling_modules: Vec<String>,
        timers: TimerCoverage,
    ) -> Self {
        Self {
            engine: AnnotationEngine::new(PLUGIN, BOOK, policy, calling_modules),
            config,
            timers,
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
        debug!(module = %module.id, retracted, "ndis annotations retracted");
        Ok(())
    }

    pub fn on_call(
        &mut self,
        cx: &mut ExecCtx,
        state: &StateId,
        frame: &Frame,
        handler: u16,
    ) -> Result<HandlerAction> {
        let f = NdisFn::from_repr(handler).ok_or(Error::UnknownHandler {
            plugin: PLUGIN,
            handler,
        })?;

        if !self.engine.is_registered(cx.machine, state, handler, frame.function)? {
            return Ok(HandlerAction::Continue);
        }
        if !f.is_entry_point() && !self.engine.called_from_tracked(cx.modules, frame.return_address) {
            trace!(function = f.name(), "call from untracked module passed through");
            return Ok(HandlerAction::Continue);
        }
        trace!(function = f.name(), state = %state, "annotated ndis call");

        match f {
            NdisFn::NdisMInitializeWrapper => self.initialize_wrapper_call(cx, state, frame),
            NdisFn::NdisMRegisterMiniport => self.register_miniport_call(cx, state, frame),
            NdisFn::NdisAllocateMemory | NdisFn::NdisAllocateMemoryWithTag => {
                self.allocate_call(cx, state, frame, f)
            }
            NdisFn::NdisAllocateMemoryWithTagPriority => {
                self.allocate_priority_call(cx, state, frame)
            }
            NdisFn::NdisFreeMemory => self.free_memory_call(cx, state, frame, 0),
            NdisFn::NdisMAllocateSharedMemory => self.shared_memory_call(cx, state, frame),
            NdisFn::NdisMFreeSharedMemory => self.free_memory_call(cx, state, frame, 3),
            NdisFn::NdisMRegisterIoPortRange => self.io_port_range_call(cx, state, frame),
            NdisFn::NdisMDeregisterIoPortRange => self.deregister_io_port_range_call(cx, state),
            NdisFn::NdisMMapIoSpace => self.map_io_space_call(cx, state, frame),
            NdisFn::NdisMQueryAdapterResources => self.query_resources_call(cx, state, frame),
            NdisFn::NdisReadPciSlotInformation => self.read_pci_call(cx, state, frame),
            NdisFn::NdisWritePciSlotInformation => self.write_pci_call(cx, state, frame),
            NdisFn::NdisOpenConfiguration => self.open_configuration_call(cx, state, frame),
            NdisFn::NdisReadConfiguration => self.read_configuration_call(cx, state, frame),
            NdisFn::NdisCloseConfiguration => Ok(HandlerAction::Continue),
            NdisFn::NdisReadNetworkAddress => self.read_network_address_call(cx, state, frame),
            NdisFn::NdisMSetAttributes => self.set_attributes_call(cx, state, frame, 3),
            NdisFn::NdisMSetAttributesEx => self.set_attributes_call(cx, state, frame, 4),
            NdisFn::NdisMInitializeTimer => self.initialize_timer_call(cx, state, frame),
            NdisFn::NdisSetTimer => self.set_timer_call(cx, state, frame),
            NdisFn::NdisMCancelTimer => {
                trace!("timer cancellation observed");
                Ok(HandlerAction::Continue)
            }
            NdisFn::NdisMRegisterInterrupt => {
                self.register_return(cx, state, frame, f)?;
                Ok(HandlerAction::Continue)
            }
            NdisFn::MiniportInitialize => self.miniport_initialize_call(cx, state, frame),
            NdisFn::MiniportCheckForHang => self.check_for_hang_call(cx, state, frame),
            NdisFn::MiniportQueryInformation => self.query_information_call(cx, state, frame),
            NdisFn::MiniportTimer => self.miniport_timer_call(cx, state, frame),
            NdisFn::MiniportHalt
            | NdisFn::MiniportSetInformation
            | NdisFn::MiniportSend
            | NdisFn::MiniportReset
            | NdisFn::MiniportIsr
            | NdisFn::MiniportHandleInterrupt => {
                trace!(function = f.name(), "miniport entry point observed");
                Ok(HandlerAction::Continue)
            }
        }
    }

    pub fn on_return(&mut self, cx: &mut ExecCtx, state: &StateId, pending: &PendingReturn) -> Result<()> {
        let f = NdisFn::from_repr(pending.hook.handler).ok_or(Error::UnknownHandler {
            plugin: PLUGIN,
            handler: pending.hook.handler,
        })?;
        let saved = self.take_call(cx, state, pending.sp)?;
        trace!(function = f.name(), state = %state, "annotated ndis return");

        match (f, saved) {
            (NdisFn::NdisMInitializeWrapper, Some(SavedCall::WrapperHandle { handle_ptr })) => {
                if let Ok(handle) = read_u32(cx.machine, state, handle_ptr) {
                    debug!(handle = format_args!("{handle:#x}"), "ndis wrapper initialized");
                }
                Ok(())
            }
            (NdisFn::NdisMRegisterMiniport, _) => {
                self.observe_status(cx, state, "NdisMRegisterMiniport")
            }
            (
                NdisFn::NdisAllocateMemory | NdisFn::NdisAllocateMemoryWithTag,
                Some(SavedCall::Allocate { out_ptr, length }),
            ) => self.allocation_return(cx, state, pending, f.name(), out_ptr, length),
            (
                NdisFn::NdisAllocateMemoryWithTagPriority,
                Some(SavedCall::AllocatePriority { length }),
            ) => self.allocate_priority_return(cx, state, pending, length),
            (NdisFn::NdisMAllocateSharedMemory, Some(SavedCall::SharedMemory { va_ptr, length })) => {
                self.shared_memory_return(cx, state, pending, va_ptr, length)
            }
            (NdisFn::NdisMRegisterIoPortRange, Some(SavedCall::IoPortRange { out_ptr, ports })) => {
                self.allocation_return(cx, state, pending, "NdisMRegisterIoPortRange", out_ptr, ports)
            }
            (NdisFn::NdisMMapIoSpace, Some(SavedCall::MapIoSpace { out_ptr, length })) => {
                self.allocation_return(cx, state, pending, "NdisMMapIoSpace", out_ptr, length)
            }
            (NdisFn::NdisMQueryAdapterResources, Some(SavedCall::QueryResources { status_ptr })) => {
                self.query_resources_return(cx, state, status_ptr)
            }
            (NdisFn::NdisOpenConfiguration, Some(SavedCall::OpenConfiguration { status_ptr })) => {
                if let Ok(status) = read_u32(cx.machine, state, status_ptr) {
                    debug!(status = format_args!("{status:#x}"), "configuration opened");
                }
                Ok(())
            }
            (
                NdisFn::NdisReadConfiguration,
                Some(SavedCall::ReadConfiguration {
                    status_ptr,
                    param_ptr_ptr,
                    keyword,
                }),
            ) => self.read_configuration_return(cx, state, status_ptr, param_ptr_ptr, &keyword),
            (
                NdisFn::NdisReadNetworkAddress,
                Some(SavedCall::ReadNetworkAddress {
                    status_ptr,
                    addr_ptr_ptr,
                    len_ptr,
                }),
            ) => self.read_network_address_return(cx, state, status_ptr, addr_ptr_ptr, len_ptr),
            (NdisFn::NdisMRegisterInterrupt, _) => {
                self.interrupt_return(cx, state)
            }
            (NdisFn::MiniportInitialize, _) => self.miniport_initialize_return(cx, state),
            (NdisFn::MiniportCheckForHang, _) => self.check_for_hang_return(cx, state),
            (
                NdisFn::MiniportQueryInformation,
                Some(SavedCall::QueryInformation {
                    oid,
                    buffer,
                    written_ptr,
                }),
            ) => self.query_information_return(cx, state, oid, buffer, written_ptr),
            (NdisFn::MiniportTimer, _) => self.miniport_timer_return(cx, state),
            (f, saved) => {
                trace!(function = f.name(), saved = saved.is_some(), "return observed");
                Ok(())
            }
        }
    }

    // ---- bookkeeping helpers ---------------------------------------------

    fn save_call(&self, cx: &mut ExecCtx, state: &StateId, sp: u64, call: SavedCall) -> Result<()> {
        let ndis: &mut NdisState = cx.machine.plugin_state_mut(state, STATE)?;
        ndis.calls.insert(sp, call);
        Ok(())
    }

    fn take_call(&self, cx: &mut ExecCtx, state: &StateId, sp: u64) -> Result<Option<SavedCall>> {
        let ndis: &mut NdisState = cx.machine.plugin_state_mut(state, STATE)?;
        Ok(ndis.calls.remove(&sp))
    }

    fn register_return(&self, cx: &mut ExecCtx, state: &StateId, frame: &Frame, f: NdisFn) -> Result<()> {
        cx.monitor.register_return(
            cx.machine,
            state,
            frame.sp,
            frame.return_address,
            Hook {
                plugin: PLUGIN,
                handler: f as u16,
            },
        )?;
        Ok(())
    }

    fn model(&self, cx: &ExecCtx, state: &StateId, function: &str) -> Result<ConsistencyModel> {
        Ok(self.engine.consistency(cx.machine, state, function)?)
    }

    fn grant(
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

    fn revoke_base(&self, cx: &mut ExecCtx, state: &StateId, base: u64) -> Result<()> {
        if let Some(checker) = cx.memcheck {
            let revoked = checker.revoke_base(cx.machine, state, base)?;
            if revoked == 0 {
                warn!(
                    base = format_args!("{base:#x}"),
                    "driver freed a region it was never granted"
                );
            }
        }
        Ok(())
    }

    fn observe_status(&self, cx: &mut ExecCtx, state: &StateId, function: &str) -> Result<()> {
        match cx.machine.read_register_concrete(state, Register::Eax) {
            Ok(status) => debug!(function, status = format_args!("{status:#x}"), "call returned"),
            Err(_) => debug!(function, "call returned a symbolic status"),
        }
        Ok(())
    }

    // ---- import annotations ----------------------------------------------

    fn initialize_wrapper_call(
        &mut self,
        cx: &mut ExecCtx,
        state: &StateId,
        frame: &Frame,
    ) -> Result<HandlerAction> {
        let handle_ptr = match read_args(cx.machine, state, frame, 1) {
            Ok(args) => args[0],
            Err(err) => return Ok(pass_through("NdisMInitializeWrapper", err)),
        };
        self.save_call(cx, state, frame.sp, SavedCall::WrapperHandle { handle_ptr })?;
        self.register_return(cx, state, frame, NdisFn::NdisMInitializeWrapper)?;
        Ok(HandlerAction::Continue)
    }

    /// Harvest the miniport characteristics table and register every
    /// populated handler pointer as a driver entry point.
    fn register_miniport_call(
        &mut self,
        cx: &mut ExecCtx,
        state: &StateId,
        frame: &Frame,
    ) -> Result<HandlerAction> {
        let (characteristics, length) = match read_args(cx.machine, state, frame, 3) {
            Ok(args) => (args[1], args[2]),
            Err(err) => return Ok(pass_through("NdisMRegisterMiniport", err)),
        };
        if length < CHARACTERISTICS40_SIZE {
            warn!(length, "miniport characteristics too short, call passed through");
            return Ok(HandlerAction::Continue);
        }

        for (offset, entry_point) in MINIPORT_HANDLER_SLOTS {
            let address = match read_u32(cx.machine, state, characteristics + offset) {
                Ok(address) => address as u64,
                Err(err) => return Ok(pass_through("NdisMRegisterMiniport", err)),
            };
            if address == 0 {
                continue;
            }
            let owner = cx.modules.find(address).cloned();
            self.engine
                .register_entry_point(cx, state, entry_point as u16, address, owner.as_ref())?;
        }
        info!("miniport characteristics harvested");

        self.register_return(cx, state, frame, NdisFn::NdisMRegisterMiniport)?;
        Ok(HandlerAction::Continue)
    }

    fn allocate_call(
        &mut self,
        cx: &mut ExecCtx,
        state: &StateId,
        frame: &Frame,
        f: NdisFn,
    ) -> Result<HandlerAction> {
        let (out_ptr, length) = match read_args(cx.machine, state, frame, 2) {
            Ok(args) => (args[0], args[1]),
            Err(err) => return Ok(pass_through(f.name(), err)),
        };
        self.save_call(cx, state, frame.sp, SavedCall::Allocate { out_ptr, length })?;
        self.register_return(cx, state, frame, f)?;
        Ok(HandlerAction::Continue)
    }

    fn allocate_priority_call(
        &mut self,
        cx: &mut ExecCtx,
        state: &StateId,
        frame: &Frame,
    ) -> Result<HandlerAction> {
        let length = match read_args(cx.machine, state, frame, 2) {
            Ok(args) => args[1],
            Err(err) => return Ok(pass_through("NdisAllocateMemoryWithTagPriority", err)),
        };
        self.save_call(cx, state, frame.sp, SavedCall::AllocatePriority { length })?;
        self.register_return(cx, state, frame, NdisFn::NdisAllocateMemoryWithTagPriority)?;
        Ok(HandlerAction::Continue)
    }

    fn free_memory_call(
        &mut self,
        cx: &mut ExecCtx,
        state: &StateId,
        frame: &Frame,
        address_arg: usize,
    ) -> Result<HandlerAction> {
        let base = match read_args(cx.machine, state, frame, address_arg + 1) {
            Ok(args) => args[address_arg],
            Err(err) => return Ok(pass_through("NdisFreeMemory", err)),
        };
        self.revoke_base(cx, state, base)?;
        Ok(HandlerAction::Continue)
    }

    fn shared_memory_call(
        &mut self,
        cx: &mut ExecCtx,
        state: &StateId,
        frame: &Frame,
    ) -> Result<HandlerAction> {
        let (length, va_ptr) = match read_args(cx.machine, state, frame, 4) {
            Ok(args) => (args[1], args[3]),
            Err(err) => return Ok(pass_through("NdisMAllocateSharedMemory", err)),
        };
        self.save_call(cx, state, frame.sp, SavedCall::SharedMemory { va_ptr, length })?;
        self.register_return(cx, state, frame, NdisFn::NdisMAllocateSharedMemory)?;
        Ok(HandlerAction::Continue)
    }

    fn io_port_range_call(
        &mut self,
        cx: &mut ExecCtx,
        state: &StateId,
        frame: &Frame,
    ) -> Result<HandlerAction> {
        let (out_ptr, ports) = match read_args(cx.machine, state, frame, 4) {
            Ok(args) => (args[0], args[3]),
            Err(err) => return Ok(pass_through("NdisMRegisterIoPortRange", err)),
        };
        self.save_call(cx, state, frame.sp, SavedCall::IoPortRange { out_ptr, ports })?;
        self.register_return(cx, state, frame, NdisFn::NdisMRegisterIoPortRange)?;
        Ok(HandlerAction::Continue)
    }

    fn deregister_io_port_range_call(&mut self, cx: &mut ExecCtx, state: &StateId) -> Result<HandlerAction> {
        if let Some(checker) = cx.memcheck {
            checker.revoke_tag(cx.machine, state, "ndis:NdisMRegisterIoPortRange")?;
        }
        Ok(HandlerAction::Continue)
    }

    fn map_io_space_call(
        &mut self,
        cx: &mut ExecCtx,
        state: &StateId,
        frame: &Frame,
    ) -> Result<HandlerAction> {
        let (out_ptr, length) = match read_args(cx.machine, state, frame, 5) {
            Ok(args) => (args[0], args[4]),
            Err(err) => return Ok(pass_through("NdisMMapIoSpace", err)),
        };
        self.save_call(cx, state, frame.sp, SavedCall::MapIoSpace { out_ptr, length })?;
        self.register_return(cx, state, frame, NdisFn::NdisMMapIoSpace)?;
        Ok(HandlerAction::Continue)
    }

    fn query_resources_call(
        &mut self,
        cx: &mut ExecCtx,
        state: &StateId,
        frame: &Frame,
    ) -> Result<HandlerAction> {
        let status_ptr = match read_args(cx.machine, state, frame, 1) {
            Ok(args) => args[0],
            Err(err) => return Ok(pass_through("NdisMQueryAdapterResources", err)),
        };
        self.save_call(cx, state, frame.sp, SavedCall::QueryResources { status_ptr })?;
        self.register_return(cx, state, frame, NdisFn::NdisMQueryAdapterResources)?;
        Ok(HandlerAction::Continue)
    }

    /// Bypass the PCI config-space read and hand the driver fully symbolic
    /// configuration bytes.
    fn read_pci_call(&mut self, cx: &mut ExecCtx, state: &StateId, frame: &Frame) -> Result<HandlerAction> {
        if self.model(cx, state, "NdisReadPciSlotInformation")? == ConsistencyModel::Strict {
            return Ok(HandlerAction::Continue);
        }
        let (buffer, length) = match read_args(cx.machine, state, frame, 5) {
            Ok(args) => (args[3], args[4]),
            Err(err) => return Ok(pass_through("NdisReadPciSlotInformation", err)),
        };
        if length > 256 {
            warn!(length, "implausible pci read length, call passed through");
            return Ok(HandlerAction::Continue);
        }

        for offset in 0..length {
            let byte = cx.machine.create_symbol(state, "pci", 8)?;
            cx.machine.write_memory(state, buffer + offset, byte)?;
        }
        cx.machine.bypass_function(state, 5)?;
        cx.machine
            .write_register(state, Register::Eax, SymValue::concrete(length, 32))?;
        debug!(length, "pci configuration read made symbolic");
        Ok(HandlerAction::BypassReturn)
    }

    fn write_pci_call(&mut self, cx: &mut ExecCtx, state: &StateId, frame: &Frame) -> Result<HandlerAction> {
        if self.model(cx, state, "NdisWritePciSlotInformation")? == ConsistencyModel::Strict {
            return Ok(HandlerAction::Continue);
        }
        let length = match read_args(cx.machine, state, frame, 5) {
            Ok(args) => args[4],
            Err(err) => return Ok(pass_through("NdisWritePciSlotInformation", err)),
        };
        cx.machine.bypass_function(state, 5)?;
        cx.machine
            .write_register(state, Register::Eax, SymValue::concrete(length, 32))?;
        trace!(length, "pci configuration write consumed");
        Ok(HandlerAction::BypassReturn)
    }

    fn open_configuration_call(
        &mut self,
        cx: &mut ExecCtx,
        state: &StateId,
        frame: &Frame,
    ) -> Result<HandlerAction> {
        let status_ptr = match read_args(cx.machine, state, frame, 1) {
            Ok(args) => args[0],
            Err(err) => return Ok(pass_through("NdisOpenConfiguration", err)),
        };
        self.save_call(cx, state, frame.sp, SavedCall::OpenConfiguration { status_ptr })?;
        self.register_return(cx, state, frame, NdisFn::NdisOpenConfiguration)?;
        Ok(HandlerAction::Continue)
    }

    fn read_configuration_call(
        &mut self,
        cx: &mut ExecCtx,
        state: &StateId,
        frame: &Frame,
    ) -> Result<HandlerAction> {
        let (status_ptr, param_ptr_ptr, keyword_ptr) = match read_args(cx.machine, state, frame, 4) {
            Ok(args) => (args[0], args[1], args[3]),
            Err(err) => return Ok(pass_through("NdisReadConfiguration", err)),
        };
        let keyword = match read_unicode_string(cx.machine, state, keyword_ptr) {
            Ok(keyword) => keyword,
            Err(err) => return Ok(pass_through("NdisReadConfiguration", err)),
        };
        debug!(keyword = %keyword, "driver reads configuration keyword");

        self.save_call(
            cx,
            state,
            frame.sp,
            SavedCall::ReadConfiguration {
                status_ptr,
                param_ptr_ptr,
                keyword,
            },
        )?;
        self.register_return(cx, state, frame, NdisFn::NdisReadConfiguration)?;
        Ok(HandlerAction::Continue)
    }

    fn read_network_address_call(
        &mut self,
        cx: &mut ExecCtx,
        state: &StateId,
        frame: &Frame,
    ) -> Result<HandlerAction> {
        let (status_ptr, addr_ptr_ptr, len_ptr) = match read_args(cx.machine, state, frame, 3) {
            Ok(args) => (args[0], args[1], args[2]),
            Err(err) => return Ok(pass_through("NdisReadNetworkAddress", err)),
        };
        self.save_call(
            cx,
            state,
            frame.sp,
            SavedCall::ReadNetworkAddress {
                status_ptr,
                addr_ptr_ptr,
                len_ptr,
            },
        )?;
        self.register_return(cx, state, frame, NdisFn::NdisReadNetworkAddress)?;
        Ok(HandlerAction::Continue)
    }

    fn set_attributes_call(
        &mut self,
        cx: &mut ExecCtx,
        state: &StateId,
        frame: &Frame,
        bus_type_arg: usize,
    ) -> Result<HandlerAction> {
        if let Some(bus_type) = self.config.forced_bus_type {
            match write_arg(cx.machine, state, frame, bus_type_arg, bus_type as u64) {
                Ok(()) => debug!(bus_type, "adapter bus type rewritten"),
                Err(err) => return Ok(pass_through("NdisMSetAttributes", err)),
            }
        }
        Ok(HandlerAction::Continue)
    }

    fn initialize_timer_call(
        &mut self,
        cx: &mut ExecCtx,
        state: &StateId,
        frame: &Frame,
    ) -> Result<HandlerAction> {
        let routine = match read_args(cx.machine, state, frame, 3) {
            Ok(args) => args[2],
            Err(err) => return Ok(pass_through("NdisMInitializeTimer", err)),
        };
        if routine == 0 {
            return Ok(HandlerAction::Continue);
        }

        {
            let ndis: &mut NdisState = cx.machine.plugin_state_mut(state, STATE)?;
            ndis.timer_routines.insert(routine);
        }
        let owner = cx.modules.find(routine).cloned();
        self.engine
            .register_entry_point(cx, state, NdisFn::MiniportTimer as u16, routine, owner.as_ref())?;
        debug!(routine = format_args!("{routine:#x}"), "timer routine registered");
        Ok(HandlerAction::Continue)
    }

    /// Stretch the requested timer interval by the configured scale,
    /// rewriting the argument in place. Never forks.
    fn set_timer_call(&mut self, cx: &mut ExecCtx, state: &StateId, frame: &Frame) -> Result<HandlerAction> {
        let interval = match read_args(cx.machine, state, frame, 2) {
            Ok(args) => args[1],
            Err(err) => return Ok(pass_through("NdisSetTimer", err)),
        };
        let scaled = interval.saturating_mul(self.config.timer_scale);
        if scaled != interval {
            write_arg(cx.machine, state, frame, 1, scaled)?;
            debug!(interval, scaled, "timer interval scaled");
        }
        Ok(HandlerAction::Continue)
    }

    // ---- import return handlers ------------------------------------------

    /// Shared return path of the status-returning resource acquisitions:
    /// grant the produced region, and under the local model fork an
    /// explicit failure branch the real execution never took.
    fn allocation_return(
        &mut self,
        cx: &mut ExecCtx,
        state: &StateId,
        pending: &PendingReturn,
        function: &str,
        out_ptr: u64,
        length: u64,
    ) -> Result<()> {
        let Ok(status) = cx.machine.read_register_concrete(state, Register::Eax) else {
            debug!(function, "symbolic status on return, outcome left alone");
            return Ok(());
        };
        if !nt_success(status) {
            trace!(function, status = format_args!("{status:#x}"), "acquisition failed natively");
            return Ok(());
        }
        let Ok(base) = read_u32(cx.machine, state, out_ptr) else {
            warn!(function, "cannot read produced address, outcome left alone");
            return Ok(());
        };
        let base = base as u64;
        let tag = format!("ndis:{function}");

        match self.model(cx, state, function)? {
            ConsistencyModel::Strict | ConsistencyModel::Overconstrained => {
                self.grant(cx, state, pending.return_address, base, length, tag)?;
            }
            ConsistencyModel::Overapprox => {
                self.grant(cx, state, pending.return_address, base, length, tag)?;
                let status = cx.machine.create_symbol(state, function, 32)?;
                cx.machine.write_register(state, Register::Eax, status)?;
            }
            ConsistencyModel::Local => {
                let outcome = self.engine.fork_range(
                    cx,
                    state.clone(),
                    function,
                    &[NDIS_STATUS_SUCCESS, NDIS_STATUS_FAILURE],
                    32,
                )?;
                for (branch, value) in &outcome.branches {
                    cx.machine
                        .write_register(branch, Register::Eax, SymValue::concrete(*value, 32))?;
                    if *value == NDIS_STATUS_SUCCESS {
                        self.grant(cx, branch, pending.return_address, base, length, tag.clone())?;
                    } else {
                        write_u32(cx.machine, branch, out_ptr, 0)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn allocate_priority_return(
        &mut self,
        cx: &mut ExecCtx,
        state: &StateId,
        pending: &PendingReturn,
        length: u64,
    ) -> Result<()> {
        // Carried over from the status-returning allocators: this function
        // returns the allocation pointer, yet eax is checked like a status
        // and then granted as the address either way.
        let Ok(status) = cx.machine.read_register_concrete(state, Register::Eax) else {
            return Ok(());
        };
        if !nt_success(status) {
            trace!(status = format_args!("{status:#x}"), "allocation reported failure");
        }
        // TODO: grant only on a non-null return; a failed allocation
        // currently grants a region at address zero.
        self.grant(
            cx,
            state,
            pending.return_address,
            status,
            length,
            "ndis:NdisAllocateMemoryWithTagPriority".into(),
        )?;
        Ok(())
    }

    /// The shared-memory allocator returns through output pointers, so the
    /// success disjunction is wired into the virtual-address cell itself: a
    /// fresh flag selects between the real address and null, and the two
    /// branches constrain the flag both ways.
    fn shared_memory_return(
        &mut self,
        cx: &mut ExecCtx,
        state: &StateId,
        pending: &PendingReturn,
        va_ptr: u64,
        length: u64,
    ) -> Result<()> {
        let Ok(address) = read_u32(cx.machine, state, va_ptr) else {
            warn!("cannot read shared memory address, outcome left alone");
            return Ok(());
        };
        let address = address as u64;
        if address == 0 {
            trace!("shared memory allocation failed natively");
            return Ok(());
        }
        let tag = "ndis:NdisMAllocateSharedMemory".to_string();

        match self.model(cx, state, "NdisMAllocateSharedMemory")? {
            ConsistencyModel::Strict | ConsistencyModel::Overconstrained => {
                self.grant(cx, state, pending.return_address, address, length, tag)?;
            }
            ConsistencyModel::Overapprox => {
                let flag = cx.machine.create_symbol(state, "NdisMAllocateSharedMemory", 8)?;
                let cell = SymValue::select(
                    flag.non_zero(),
                    SymValue::concrete(address, 32),
                    SymValue::concrete(0, 32),
                );
                cx.machine.write_memory(state, va_ptr, cell)?;
                self.grant(cx, state, pending.return_address, address, length, tag)?;
            }
            ConsistencyModel::Local => {
                let flag = cx.machine.create_symbol(state, "NdisMAllocateSharedMemory", 8)?;
                let cell = SymValue::select(
                    flag.clone().non_zero(),
                    SymValue::concrete(address, 32),
                    SymValue::concrete(0, 32),
                );
                cx.machine.write_memory(state, va_ptr, cell)?;

                let restore = cx.machine.is_forking_enabled(state)?;
                cx.machine.set_forking(state, true)?;
                let pair = cx.machine.fork(state.clone(), flag.non_zero())?;
                cx.machine.set_forking(&pair.positive, restore)?;
                cx.machine.set_forking(&pair.negative, restore)?;

                self.grant(cx, &pair.positive, pending.return_address, address, length, tag)?;
                write_u32(cx.machine, &pair.negative, va_ptr, 0)?;
                debug!(
                    granted = %pair.positive,
                    failed = %pair.negative,
                    "shared memory outcome forked"
                );
            }
        }
        Ok(())
    }

    fn query_resources_return(&mut self, cx: &mut ExecCtx, state: &StateId, status_ptr: u64) -> Result<()> {
        match self.model(cx, state, "NdisMQueryAdapterResources")? {
            ConsistencyModel::Strict | ConsistencyModel::Overconstrained => {}
            ConsistencyModel::Overapprox => {
                let status = cx
                    .machine
                    .create_symbol(state, "NdisMQueryAdapterResources", 32)?;
                cx.machine.write_memory(state, status_ptr, status)?;
            }
            ConsistencyModel::Local => {
                let outcome = self.engine.fork_range(
                    cx,
                    state.clone(),
                    "NdisMQueryAdapterResources",
                    &[NDIS_STATUS_SUCCESS, NDIS_STATUS_FAILURE],
                    32,
                )?;
                for (branch, value) in &outcome.branches {
                    write_u32(cx.machine, branch, status_ptr, *value as u32)?;
                }
            }
        }
        Ok(())
    }

    fn read_configuration_return(
        &mut self,
        cx: &mut ExecCtx,
        state: &StateId,
        status_ptr: u64,
        param_ptr_ptr: u64,
        keyword: &str,
    ) -> Result<()> {
        let Ok(status) = read_u32(cx.machine, state, status_ptr) else {
            return Ok(());
        };
        if !nt_success(status as u64) {
            trace!(keyword, "configuration keyword absent");
            return Ok(());
        }

        let ignored = self
            .config
            .ignored_keywords
            .iter()
            .any(|k| k.eq_ignore_ascii_case(keyword));

        match self.model(cx, state, "NdisReadConfiguration")? {
            ConsistencyModel::Strict | ConsistencyModel::Overconstrained => {}
            ConsistencyModel::Overapprox => {
                if !ignored {
                    self.inject_configuration_value(cx, state, param_ptr_ptr, keyword)?;
                }
            }
            ConsistencyModel::Local => {
                let outcome = self.engine.fork_range(
                    cx,
                    state.clone(),
                    "NdisReadConfiguration",
                    &[NDIS_STATUS_SUCCESS, NDIS_STATUS_FAILURE],
                    32,
                )?;
                for (branch, value) in &outcome.branches {
                    if *value == NDIS_STATUS_SUCCESS {
                        if !ignored {
                            self.inject_configuration_value(cx, branch, param_ptr_ptr, keyword)?;
                        }
                    } else {
                        write_u32(cx.machine, branch, status_ptr, NDIS_STATUS_FAILURE as u32)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Replace the integer payload of the returned
    /// `NDIS_CONFIGURATION_PARAMETER` with a fresh symbol named after the
    /// keyword, and grant the parameter structure itself.
    fn inject_configuration_value(
        &self,
        cx: &mut ExecCtx,
        state: &StateId,
        param_ptr_ptr: u64,
        keyword: &str,
    ) -> Result<()> {
        let Ok(param_ptr) = read_u32(cx.machine, state, param_ptr_ptr) else {
            return Ok(());
        };
        let param_ptr = param_ptr as u64;
        if param_ptr == 0 {
            return Ok(());
        }

        let value = cx
            .machine
            .create_symbol(state, format!("NdisReadConfiguration_{keyword}"), 32)?;
        // Parameter type at offset 0, the value union at offset 4.
        cx.machine.write_memory(state, param_ptr + 4, value)?;
        if let Some(checker) = cx.memcheck {
            checker.grant(
                cx.machine,
                state,
                None,
                param_ptr,
                12,
                MemoryAccess::READ,
                "ndis:config",
            )?;
        }
        debug!(keyword, "configuration value made symbolic");
        Ok(())
    }

    fn read_network_address_return(
        &mut self,
        cx: &mut ExecCtx,
        state: &StateId,
        status_ptr: u64,
        addr_ptr_ptr: u64,
        len_ptr: u64,
    ) -> Result<()> {
        let Ok(status) = read_u32(cx.machine, state, status_ptr) else {
            return Ok(());
        };
        if !nt_success(status as u64) {
            trace!("no network address in the registry");
            return Ok(());
        }

        let model = self.model(cx, state, "NdisReadNetworkAddress")?;
        match model {
            ConsistencyModel::Strict | ConsistencyModel::Overconstrained => {
                self.fill_network_address(cx, state, addr_ptr_ptr, len_ptr, false)?;
            }
            ConsistencyModel::Overapprox => {
                self.fill_network_address(cx, state, addr_ptr_ptr, len_ptr, true)?;
            }
            ConsistencyModel::Local => {
                let outcome = self.engine.fork_range(
                    cx,
                    state.clone(),
                    "NdisReadNetworkAddress",
                    &[NDIS_STATUS_SUCCESS, NDIS_STATUS_FAILURE],
                    32,
                )?;
                for (branch, value) in &outcome.branches {
                    if *value == NDIS_STATUS_SUCCESS {
                        self.fill_network_address(cx, branch, addr_ptr_ptr, len_ptr, true)?;
                    } else {
                        write_u32(cx.machine, branch, status_ptr, NDIS_STATUS_FAILURE as u32)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn fill_network_address(
        &self,
        cx: &mut ExecCtx,
        state: &StateId,
        addr_ptr_ptr: u64,
        len_ptr: u64,
        symbolic: bool,
    ) -> Result<()> {
        let (Ok(address), Ok(length)) = (
            read_u32(cx.machine, state, addr_ptr_ptr),
            read_u32(cx.machine, state, len_ptr),
        ) else {
            return Ok(());
        };
        let address = address as u64;
        if address == 0 {
            return Ok(());
        }

        if let Some(mac) = self.config.network_address {
            cx.machine.write_memory_bytes(state, address, &mac)?;
            write_u32(cx.machine, state, len_ptr, mac.len() as u32)?;
            debug!("network address forced from configuration");
        } else if symbolic {
            for offset in 0..u64::from(length).min(32) {
                let byte = cx.machine.create_symbol(state, "mac", 8)?;
                cx.machine.write_memory(state, address + offset, byte)?;
            }
            debug!(length, "network address made symbolic");
        }
        Ok(())
    }

    fn interrupt_return(&mut self, cx: &mut ExecCtx, state: &StateId) -> Result<()> {
        let Ok(status) = cx.machine.read_register_concrete(state, Register::Eax) else {
            return Ok(());
        };
        if !nt_success(status) {
            return Ok(());
        }
        if self.model(cx, state, "NdisMRegisterInterrupt")? == ConsistencyModel::Local {
            let outcome = self.engine.fork_range(
                cx,
                state.clone(),
                "NdisMRegisterInterrupt",
                &[NDIS_STATUS_SUCCESS, NDIS_STATUS_FAILURE],
                32,
            )?;
            for (branch, value) in &outcome.branches {
                cx.machine
                    .write_register(branch, Register::Eax, SymValue::concrete(*value, 32))?;
            }
        }
        Ok(())
    }

    // ---- entry-point annotations -----------------------------------------

    /// Pin the initialization model for the whole time the driver spends in
    /// `MiniportInitialize`, so nested API calls fork consistently.
    fn miniport_initialize_call(
        &mut self,
        cx: &mut ExecCtx,
        state: &StateId,
        frame: &Frame,
    ) -> Result<HandlerAction> {
        let model = self.model(cx, state, "MiniportInitialize")?;
        self.engine.push_model(cx.machine, state, model)?;
        self.register_return(cx, state, frame, NdisFn::MiniportInitialize)?;
        info!(state = %state, "miniport initialization started");
        Ok(HandlerAction::Continue)
    }

    fn miniport_initialize_return(&mut self, cx: &mut ExecCtx, state: &StateId) -> Result<()> {
        self.engine.pop_model(cx.machine, state)?;
        let Ok(status) = cx.machine.read_register_concrete(state, Register::Eax) else {
            debug!("miniport initialization returned a symbolic status");
            return Ok(());
        };

        if nt_success(status) {
            info!(state = %state, "miniport initialized");
            cx.states.succeed_state(cx.machine, state)?;
        } else {
            cx.machine.terminate(
                state,
                format!("MiniportInitialize failed with status {status:#010x}"),
            )?;
        }
        Ok(())
    }

    /// Exercise the hang-check path once per run by making one check's
    /// verdict symbolic.
    fn check_for_hang_call(&mut self, cx: &mut ExecCtx, state: &StateId, frame: &Frame) -> Result<HandlerAction> {
        if self.model(cx, state, "MiniportCheckForHang")? != ConsistencyModel::Overapprox {
            return Ok(HandlerAction::Continue);
        }
        if self.timers.hang_check_exercised {
            return Ok(HandlerAction::Continue);
        }
        self.timers.hang_check_exercised = true;
        self.register_return(cx, state, frame, NdisFn::MiniportCheckForHang)?;
        Ok(HandlerAction::Continue)
    }

    fn check_for_hang_return(&mut self, cx: &mut ExecCtx, state: &StateId) -> Result<()> {
        let verdict = cx.machine.create_symbol(state, "hang", 8)?;
        cx.machine
            .write_register(state, Register::Eax, zero_extended(verdict, 4))?;
        debug!("hang check verdict made symbolic");
        Ok(())
    }

    fn query_information_call(
        &mut self,
        cx: &mut ExecCtx,
        state: &StateId,
        frame: &Frame,
    ) -> Result<HandlerAction> {
        let (oid, buffer, written_ptr) = match read_args(cx.machine, state, frame, 5) {
            Ok(args) => (args[1], args[2], args[4]),
            Err(err) => return Ok(pass_through("MiniportQueryInformation", err)),
        };
        self.save_call(
            cx,
            state,
            frame.sp,
            SavedCall::QueryInformation {
                oid,
                buffer,
                written_ptr,
            },
        )?;
        self.register_return(cx, state, frame, NdisFn::MiniportQueryInformation)?;
        Ok(HandlerAction::Continue)
    }

    fn query_information_return(
        &mut self,
        cx: &mut ExecCtx,
        state: &StateId,
        oid: u64,
        buffer: u64,
        written_ptr: u64,
    ) -> Result<()> {
        if oid == OID_GEN_MEDIA_CONNECT_STATUS {
            if let Some(connected) = self.config.force_connected {
                if buffer != 0 {
                    // NdisMediaStateConnected is 0, disconnected is 1.
                    write_u32(cx.machine, state, buffer, u32::from(!connected))?;
                    cx.machine
                        .write_register(state, Register::Eax, SymValue::concrete(NDIS_STATUS_SUCCESS, 32))?;
                    debug!(connected, "media connect status forced");
                }
                return Ok(());
            }
        }

        let already_fake = cx
            .machine
            .plugin_state::<NdisState>(state, STATE)
            .map(|ndis| ndis.fake_query)
            .unwrap_or(false);
        if self.model(cx, state, "MiniportQueryInformation")? != ConsistencyModel::Local
            || already_fake
            || buffer == 0
        {
            return Ok(());
        }

        // Fork one branch where the query produced an arbitrary value, to
        // shake out result validation in the protocol above.
        let outcome = self
            .engine
            .fork_states(cx, state.clone(), "MiniportQueryInformation", 1)?;
        let (fake, _) = &outcome.branches[1];
        cx.machine.plugin_state_mut::<NdisState>(fake, STATE)?.fake_query = true;
        let value = cx.machine.create_symbol(fake, format!("oid_{oid:x}"), 32)?;
        cx.machine.write_memory(fake, buffer, value)?;
        if written_ptr != 0 {
            write_u32(cx.machine, fake, written_ptr, 4)?;
        }
        debug!(oid = format_args!("{oid:#x}"), fake = %fake, "query result branch fabricated");
        Ok(())
    }

    /// When a timer fires, fork one branch per registered-but-unexplored
    /// timer routine and point each branch at one routine, so every routine
    /// runs at least once across the exploration.
    fn miniport_timer_call(&mut self, cx: &mut ExecCtx, state: &StateId, frame: &Frame) -> Result<HandlerAction> {
        // Registered for every branch: fake branches are reaped on return.
        self.register_return(cx, state, frame, NdisFn::MiniportTimer)?;

        if self.model(cx, state, "MiniportTimer")? != ConsistencyModel::Overapprox {
            return Ok(HandlerAction::Continue);
        }

        let routines: Vec<u64> = {
            let ndis: &mut NdisState = cx.machine.plugin_state_mut(state, STATE)?;
            ndis.timer_routines.iter().copied().collect()
        };
        self.timers.explored.insert(frame.function);
        let others: Vec<u64> = routines
            .into_iter()
            .filter(|routine| !self.timers.explored.contains(routine))
            .collect();
        if others.is_empty() {
            return Ok(HandlerAction::Continue);
        }
        self.timers.explored.extend(others.iter().copied());

        let outcome = self
            .engine
            .fork_states(cx, state.clone(), "MiniportTimer", others.len())?;
        for (index, (branch, _)) in outcome.branches.iter().enumerate().skip(1) {
            let target = others[index - 1];
            cx.machine.set_pc(branch, target)?;
            cx.machine.plugin_state_mut::<NdisState>(branch, STATE)?.fake_timer = true;
            debug!(
                branch = %branch,
                routine = format_args!("{target:#x}"),
                "timer branch redirected to unexplored routine"
            );
        }
        Ok(HandlerAction::ForkSuspend)
    }

    fn miniport_timer_return(&mut self, cx: &mut ExecCtx, state: &StateId) -> Result<()> {
        let fake = cx
            .machine
            .plugin_state::<NdisState>(state, STATE)
            .map(|ndis| ndis.fake_timer)
            .unwrap_or(false);
        if fake {
            cx.machine.terminate(state, "fake timer branch completed")?;
        }
        Ok(())
    }
}
