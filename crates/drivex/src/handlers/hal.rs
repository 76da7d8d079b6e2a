//! Annotations for the hardware abstraction layer: port I/O and bus
//! configuration queries, the device side the symbolic environment cannot
//! model concretely.

use guest_machine::{PluginId, Register, StateId};
use strum::FromRepr;
use symexpr::SymValue;
use tracing::{debug, trace, warn};

use crate::api::{Error, ExecCtx, Result};
use crate::consistency::{ConsistencyModel, ConsistencyPolicy};
use crate::engine::{AnnotationEngine, HandlerTable};
use crate::handlers::{pass_through, read_args, zero_extended, Frame, HandlerAction};
use crate::monitor::PendingReturn;

pub const PLUGIN: PluginId = PluginId("hal");
const BOOK: PluginId = PluginId("hal:book");

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u16)]
pub enum HalFn {
    ReadPortUchar,
    ReadPortUshort,
    ReadPortUlong,
    WritePortUchar,
    WritePortUshort,
    WritePortUlong,
    HalGetBusData,
}

impl HalFn {
    /// Import names follow the kernel headers, not Rust casing.
    pub fn name(self) -> &'static str {
        match self {
            Self::ReadPortUchar => "READ_PORT_UCHAR",
            Self::ReadPortUshort => "READ_PORT_USHORT",
            Self::ReadPortUlong => "READ_PORT_ULONG",
            Self::WritePortUchar => "WRITE_PORT_UCHAR",
            Self::WritePortUshort => "WRITE_PORT_USHORT",
            Self::WritePortUlong => "WRITE_PORT_ULONG",
            Self::HalGetBusData => "HalGetBusData",
        }
    }

    fn from_import(name: &str) -> Option<Self> {
        let f = match name {
            "READ_PORT_UCHAR" => Self::ReadPortUchar,
            "READ_PORT_USHORT" => Self::ReadPortUshort,
            "READ_PORT_ULONG" => Self::ReadPortUlong,
            "WRITE_PORT_UCHAR" => Self::WritePortUchar,
            "WRITE_PORT_USHORT" => Self::WritePortUshort,
            "WRITE_PORT_ULONG" => Self::WritePortUlong,
            "HalGetBusData" => Self::HalGetBusData,
            _ => return None,
        };
        Some(f)
    }

    fn read_bits(self) -> Option<u16> {
        match self {
            Self::ReadPortUchar => Some(8),
            Self::ReadPortUshort => Some(16),
            Self::ReadPortUlong => Some(32),
            _ => None,
        }
    }
}

pub struct HalHandlers {
    engine: AnnotationEngine,
}

impl HandlerTable for HalHandlers {
    fn handler_for(&self, name: &str) -> Option<u16> {
        HalFn::from_import(name).map(|f| f as u16)
    }
}

impl HalHandlers {
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
        self.engine.unregister_entry_points(cx, state, module)?;
        Ok(())
    }

    pub fn on_call(
        &mut self,
        cx: &mut ExecCtx,
        state: &StateId,
        frame: &Frame,
        handler: u16,
    ) -> Result<HandlerAction> {
        let f = HalFn::from_repr(handler).ok_or(Error::UnknownHandler {
            plugin: PLUGIN,
            handler,
        })?;

        if !self.engine.is_registered(cx.machine, state, handler, frame.function)? {
            return Ok(HandlerAction::Continue);
        }
        if !self.engine.called_from_tracked(cx.modules, frame.return_address) {
            return Ok(HandlerAction::Continue);
        }

        if let Some(bits) = f.read_bits() {
            return self.port_read_call(cx, state, frame, f, bits);
        }
        match f {
            HalFn::WritePortUchar | HalFn::WritePortUshort | HalFn::WritePortUlong => {
                self.port_write_call(cx, state, frame, f)
            }
            HalFn::HalGetBusData => self.bus_data_call(cx, state, frame),
            _ => unreachable!("port reads are handled above"),
        }
    }

    /// No return handlers are registered; port accesses are consumed at the
    /// call.
    pub fn on_return(&mut self, _cx: &mut ExecCtx, _state: &StateId, pending: &PendingReturn) -> Result<()> {
        warn!(handler = pending.hook.handler, "unexpected hal return handler");
        Ok(())
    }

    /// Device registers can hold anything; a port read produces a fresh
    /// unconstrained symbol unless the model demands the real value.
    fn port_read_call(
        &mut self,
        cx: &mut ExecCtx,
        state: &StateId,
        frame: &Frame,
        f: HalFn,
        bits: u16,
    ) -> Result<HandlerAction> {
        if self.model(cx, state, f.name())? == ConsistencyModel::Strict {
            return Ok(HandlerAction::Continue);
        }
        let port = match read_args(cx.machine, state, frame, 1) {
            Ok(args) => args[0],
            Err(err) => return Ok(pass_through(f.name(), err)),
        };

        let value = cx
            .machine
            .create_symbol(state, format!("port_{port:x}"), bits)?;
        cx.machine.bypass_function(state, 1)?;
        cx.machine
            .write_register(state, Register::Eax, zero_extended(value, 4))?;
        debug!(port = format_args!("{port:#x}"), bits, "port read made symbolic");
        Ok(HandlerAction::BypassReturn)
    }

    fn port_write_call(
        &mut self,
        cx: &mut ExecCtx,
        state: &StateId,
        frame: &Frame,
        f: HalFn,
    ) -> Result<HandlerAction> {
        if self.model(cx, state, f.name())? == ConsistencyModel::Strict {
            return Ok(HandlerAction::Continue);
        }
        if let Ok(args) = read_args(cx.machine, state, frame, 2) {
            trace!(
                port = format_args!("{:#x}", args[0]),
                value = format_args!("{:#x}", args[1]),
                "port write consumed"
            );
        }
        cx.machine.bypass_function(state, 2)?;
        Ok(HandlerAction::BypassReturn)
    }

    /// Hand the driver symbolic bus configuration instead of querying
    /// hardware that does not exist.
    fn bus_data_call(&mut self, cx: &mut ExecCtx, state: &StateId, frame: &Frame) -> Result<HandlerAction> {
        if self.model(cx, state, "HalGetBusData")? == ConsistencyModel::Strict {
            return Ok(HandlerAction::Continue);
        }
        let (bus, slot, buffer, length) = match read_args(cx.machine, state, frame, 5) {
            Ok(args) => (args[1], args[2], args[3], args[4]),
            Err(err) => return Ok(pass_through("HalGetBusData", err)),
        };
        if length > 256 {
            warn!(length, "implausible bus data length, call passed through");
            return Ok(HandlerAction::Continue);
        }

        for offset in 0..length {
            let byte = cx.machine.create_symbol(state, "bus", 8)?;
            cx.machine.write_memory(state, buffer + offset, byte)?;
        }
        cx.machine.bypass_function(state, 5)?;
        cx.machine
            .write_register(state, Register::Eax, SymValue::concrete(length, 32))?;
        debug!(bus, slot, length, "bus data made symbolic");
        Ok(HandlerAction::BypassReturn)
    }

    fn model(&self, cx: &ExecCtx, state: &StateId, function: &str) -> Result<ConsistencyModel> {
        Ok(self.engine.consistency(cx.machine, state, function)?)
    }
}
