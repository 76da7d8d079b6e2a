//! Handler sets for the annotated API surfaces.
//!
//! Each set owns an [crate::engine::AnnotationEngine] and dispatches on a
//! handler-identifier enum whose discriminants travel through
//! [crate::monitor::Hook] records. Call handlers run at the first
//! instruction of an annotated function; return handlers run when a frame
//! the monitor tracked unwinds.

pub mod exerciser;
pub mod hal;
pub mod ndis;
pub mod ntoskrnl;

use guest_machine::{Machine, Register, Result, StateId};
use symexpr::SymValue;

/// What the dispatcher does after a call handler runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerAction {
    /// Resume execution of the annotated function.
    Continue,
    /// The handler consumed the call: the frame was popped and pc moved to
    /// the return address, so the annotated function never runs.
    BypassReturn,
    /// The handler forked or retargeted states; the caller must reschedule
    /// instead of stepping the current state further.
    ForkSuspend,
}

/// Stack frame of an annotated stdcall function, captured at its first
/// instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// Address of the annotated function.
    pub function: u64,
    /// Stack pointer at capture, i.e. the slot holding the return address.
    pub sp: u64,
    pub return_address: u64,
}

impl Frame {
    /// Capture the frame of the call currently executing at `function`.
    /// Fails when the stack pointer or return address is symbolic or
    /// undefined; callers treat that as "leave the call alone".
    pub fn at_call(machine: &Machine, state: &StateId, function: u64) -> Result<Self> {
        let sp = machine.read_register_concrete(state, Register::Esp)?;
        let return_address = read_u32(machine, state, sp)? as u64;
        Ok(Self {
            function,
            sp,
            return_address,
        })
    }

    /// Address of the `index`th stack-passed argument.
    pub fn arg_address(&self, index: usize) -> u64 {
        self.sp + 4 * (1 + index as u64)
    }
}

pub const STATUS_SUCCESS: u64 = 0;
pub const STATUS_UNSUCCESSFUL: u64 = 0xC000_0001;
pub const STATUS_INSUFFICIENT_RESOURCES: u64 = 0xC000_009A;

pub const NDIS_STATUS_SUCCESS: u64 = STATUS_SUCCESS;
pub const NDIS_STATUS_FAILURE: u64 = STATUS_UNSUCCESSFUL;
pub const NDIS_STATUS_RESOURCES: u64 = STATUS_INSUFFICIENT_RESOURCES;

/// NT status codes with the severity bits clear indicate success.
pub(crate) fn nt_success(status: u64) -> bool {
    (status as u32 as i32) >= 0
}

pub(crate) fn read_arg(machine: &Machine, state: &StateId, frame: &Frame, index: usize) -> Result<u64> {
    Ok(read_u32(machine, state, frame.arg_address(index))? as u64)
}

pub(crate) fn write_arg(
    machine: &mut Machine,
    state: &StateId,
    frame: &Frame,
    index: usize,
    value: u64,
) -> Result<()> {
    write_u32(machine, state, frame.arg_address(index), value as u32)
}

pub(crate) fn read_args(
    machine: &Machine,
    state: &StateId,
    frame: &Frame,
    count: usize,
) -> Result<Vec<u64>> {
    (0..count).map(|i| read_arg(machine, state, frame, i)).collect()
}

/// Degrade an annotated call whose parameters cannot be decoded into an
/// unannotated one.
pub(crate) fn pass_through(function: &str, err: impl std::fmt::Display) -> HandlerAction {
    tracing::warn!(function, %err, "cannot decode call parameters, passing call through");
    HandlerAction::Continue
}

pub(crate) fn read_u32(machine: &Machine, state: &StateId, address: u64) -> Result<u32> {
    let bytes = machine.read_memory_concrete(state, address, 4)?;
    Ok(u32::from_le_bytes(bytes.try_into().expect("read 4 bytes")))
}

pub(crate) fn write_u32(
    machine: &mut Machine,
    state: &StateId,
    address: u64,
    value: u32,
) -> Result<()> {
    machine.write_memory_bytes(state, address, &value.to_le_bytes())
}

/// Widen a narrow value to `bytes` bytes with concrete zero high bytes, the
/// shape of a zero-extended register write.
pub(crate) fn zero_extended(value: SymValue, bytes: usize) -> SymValue {
    let mut parts: Vec<SymValue> = (0..value.size()).map(|i| value.byte(i)).collect();
    parts.resize(bytes, SymValue::concrete(0, 8));
    SymValue::from_le_bytes(parts)
}

/// Read a guest `UNICODE_STRING`: a 16-bit byte length, a 16-bit capacity,
/// and a pointer to UTF-16LE payload.
pub(crate) fn read_unicode_string(machine: &Machine, state: &StateId, address: u64) -> Result<String> {
    let header = machine.read_memory_concrete(state, address, 8)?;
    let length = u16::from_le_bytes([header[0], header[1]]) as u64;
    let buffer = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as u64;

    let payload = machine.read_memory_concrete(state, buffer, (length & !1) as usize)?;
    let units: Vec<u16> = payload
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    Ok(String::from_utf16_lossy(&units))
}

/// Read a NUL-terminated byte string, stopping at `cap` bytes or at the
/// first undefined or symbolic byte.
pub(crate) fn read_cstring(machine: &Machine, state: &StateId, address: u64, cap: usize) -> String {
    let mut bytes = Vec::new();
    for offset in 0..cap as u64 {
        match machine.read_memory_concrete(state, address + offset, 1) {
            Ok(byte) if byte[0] != 0 => bytes.push(byte[0]),
            _ => break,
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}
