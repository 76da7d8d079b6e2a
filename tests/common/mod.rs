//! Shared substrate for the annotation integration tests: a machine, a
//! configured dispatcher, and helpers that lay out stdcall frames the way a
//! 32-bit guest would.

use drivex::{Import, ModuleDescriptor, WindowsApi};
use guest_machine::{Machine, Register, StateId};

pub const DRIVER_BASE: u64 = 0x40_0000;
pub const DRIVER_SIZE: u64 = 0x1_0000;
/// A call site inside the exercised driver, used as the return address of
/// annotated import calls.
pub const DRIVER_CALL_SITE: u64 = DRIVER_BASE + 0x500;

pub fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn api(config: &str) -> WindowsApi {
    let config = serde_json::from_str(config).expect("valid configuration");
    WindowsApi::new(config).expect("valid configuration")
}

pub fn driver_module(id: &str, imports: Vec<(&str, u64)>) -> ModuleDescriptor {
    ModuleDescriptor {
        id: id.into(),
        base: DRIVER_BASE,
        size: DRIVER_SIZE,
        entry_point: DRIVER_BASE + 0x100,
        native_base: 0x1_0000,
        imports: imports
            .into_iter()
            .map(|(name, address)| Import {
                name: name.into(),
                address,
            })
            .collect(),
    }
}

/// Lay out a stdcall frame at `sp` and move execution to `function`: the
/// return address goes into the slot esp points at, arguments above it.
/// Returns `sp` for later frame matching.
pub fn call(
    machine: &mut Machine,
    state: &StateId,
    sp: u64,
    function: u64,
    return_address: u64,
    args: &[u64],
) -> u64 {
    machine
        .write_memory_bytes(state, sp, &(return_address as u32).to_le_bytes())
        .unwrap();
    for (index, arg) in args.iter().enumerate() {
        machine
            .write_memory_bytes(
                state,
                sp + 4 * (1 + index as u64),
                &(*arg as u32).to_le_bytes(),
            )
            .unwrap();
    }
    machine
        .write_register_concrete(state, Register::Esp, sp)
        .unwrap();
    machine.set_pc(state, function).unwrap();
    sp
}

/// Simulate the callee returning: eax holds the result, the stdcall frame is
/// popped, and execution resumes at the return address.
pub fn ret(
    machine: &mut Machine,
    state: &StateId,
    sp: u64,
    return_address: u64,
    arg_count: usize,
    eax: u64,
) {
    machine
        .write_register_concrete(state, Register::Eax, eax)
        .unwrap();
    machine
        .write_register_concrete(state, Register::Esp, sp + 4 * (1 + arg_count as u64))
        .unwrap();
    machine.set_pc(state, return_address).unwrap();
}

pub fn read_u32(machine: &Machine, state: &StateId, address: u64) -> u32 {
    let bytes = machine.read_memory_concrete(state, address, 4).unwrap();
    u32::from_le_bytes(bytes.try_into().unwrap())
}

pub fn write_u32(machine: &mut Machine, state: &StateId, address: u64, value: u32) {
    machine
        .write_memory_bytes(state, address, &value.to_le_bytes())
        .unwrap();
}
