//! End-to-end driver lifecycle: module load, `DriverEntry`, miniport
//! registration, and initialization, driven through the dispatcher the way
//! the execution substrate would.

mod common;

use common::{api, call, driver_module, init_logging, ret, write_u32, DRIVER_BASE, DRIVER_CALL_SITE};
use drivex::HandlerAction;
use guest_machine::Machine;

const CONFIG: &str = r#"{
    "consistency": { "default": "local" },
    "exerciser": { "modules": ["pcnet.sys"] },
    "memory_checker": true
}"#;

const DRIVER_OBJECT: u64 = 0x10_0000;
const REGISTRY_PATH: u64 = 0x11_0000;
const CHARACTERISTICS: u64 = 0x12_0000;
const UNLOAD_ROUTINE: u64 = DRIVER_BASE + 0x1000;
const DISPATCH_ROUTINE: u64 = DRIVER_BASE + 0x2000;
const MINIPORT_INITIALIZE: u64 = DRIVER_BASE + 0x3000;

#[test]
fn driver_initializes_through_the_full_lifecycle() {
    init_logging();
    let mut machine = Machine::new();
    let state = machine.create_state();
    let mut api = api(CONFIG);
    api.attach(&mut machine);

    let module = driver_module("pcnet.sys", vec![("NdisMRegisterMiniport", 0x80_0100)]);
    let entry_point = module.entry_point;
    api.on_module_load(&mut machine, &state, module).unwrap();

    // The OS invokes DriverEntry.
    let entry_sp = call(
        &mut machine,
        &state,
        0x30_0000,
        entry_point,
        0x70_0000,
        &[DRIVER_OBJECT, REGISTRY_PATH],
    );
    let action = api.on_instruction(&mut machine, &state).unwrap();
    assert_eq!(action, HandlerAction::Continue);
    // The OS-built structures are granted for the driver to read.
    assert_eq!(
        api.memory_checker()
            .unwrap()
            .grants(&machine, &state)
            .len(),
        2
    );

    // Inside DriverEntry the driver registers its miniport characteristics.
    machine
        .write_memory_bytes(&state, CHARACTERISTICS, &[0; 56])
        .unwrap();
    write_u32(&mut machine, &state, CHARACTERISTICS + 24, MINIPORT_INITIALIZE as u32);

    let register_sp = call(
        &mut machine,
        &state,
        0x2F_F000,
        0x80_0100,
        DRIVER_CALL_SITE,
        &[0x1234, CHARACTERISTICS, 56],
    );
    api.on_instruction(&mut machine, &state).unwrap();
    // The populated handler slot became an annotated entry point.
    assert_eq!(api.monitor().hooks_at(MINIPORT_INITIALIZE).len(), 1);

    ret(&mut machine, &state, register_sp, DRIVER_CALL_SITE, 3, 0);
    api.on_instruction(&mut machine, &state).unwrap();
    assert_eq!(machine.live_states().len(), 1);

    // The driver fills in its driver object before returning success.
    machine
        .write_memory_bytes(&state, DRIVER_OBJECT, &[0; 0xA8])
        .unwrap();
    write_u32(&mut machine, &state, DRIVER_OBJECT + 0x34, UNLOAD_ROUTINE as u32);
    write_u32(
        &mut machine,
        &state,
        DRIVER_OBJECT + 0x38 + 14 * 4,
        DISPATCH_ROUTINE as u32,
    );

    ret(&mut machine, &state, entry_sp, 0x70_0000, 2, 0);
    api.on_instruction(&mut machine, &state).unwrap();
    assert!(machine.is_live(&state));
    // The harvested unload and dispatch routines are annotated now.
    assert_eq!(api.monitor().hooks_at(UNLOAD_ROUTINE).len(), 1);
    assert_eq!(api.monitor().hooks_at(DISPATCH_ROUTINE).len(), 1);
    assert_eq!(api.state_manager().successful_count(), 0);

    // NDIS invokes the registered MiniportInitialize, which succeeds.
    let init_sp = call(
        &mut machine,
        &state,
        0x2F_E000,
        MINIPORT_INITIALIZE,
        0x80_0200,
        &[],
    );
    api.on_instruction(&mut machine, &state).unwrap();
    ret(&mut machine, &state, init_sp, 0x80_0200, 6, 0);
    api.on_instruction(&mut machine, &state).unwrap();

    assert!(machine.is_live(&state));
    assert!(api.state_manager().is_successful(&state));
    assert_eq!(api.state_manager().successful_count(), 1);
}

#[test]
fn a_failing_driver_entry_retires_the_state() {
    init_logging();
    let mut machine = Machine::new();
    let state = machine.create_state();
    let mut api = api(CONFIG);
    api.attach(&mut machine);

    let module = driver_module("pcnet.sys", vec![]);
    let entry_point = module.entry_point;
    api.on_module_load(&mut machine, &state, module).unwrap();

    let sp = call(
        &mut machine,
        &state,
        0x30_0000,
        entry_point,
        0x70_0000,
        &[DRIVER_OBJECT, REGISTRY_PATH],
    );
    api.on_instruction(&mut machine, &state).unwrap();
    assert!(!api
        .memory_checker()
        .unwrap()
        .grants(&machine, &state)
        .is_empty());

    ret(&mut machine, &state, sp, 0x70_0000, 2, 0xC000_0001);
    api.on_instruction(&mut machine, &state).unwrap();

    assert!(!machine.is_live(&state));
    let reason = machine.termination_reason(&state).unwrap();
    assert!(reason.contains("DriverEntry failed"), "reason: {reason}");
    // The OS-structure grants were taken back before the state died.
    assert!(api
        .memory_checker()
        .unwrap()
        .grants(&machine, &state)
        .is_empty());
    assert_eq!(api.state_manager().successful_count(), 0);
}

#[test]
fn driver_object_walk_stops_at_unmapped_memory() {
    init_logging();
    let mut machine = Machine::new();
    let state = machine.create_state();
    let mut api = api(CONFIG);

    let module = driver_module("pcnet.sys", vec![]);
    let entry_point = module.entry_point;
    api.on_module_load(&mut machine, &state, module).unwrap();

    let sp = call(
        &mut machine,
        &state,
        0x30_0000,
        entry_point,
        0x70_0000,
        &[DRIVER_OBJECT, REGISTRY_PATH],
    );
    api.on_instruction(&mut machine, &state).unwrap();

    // The driver never initializes its driver object, so the harvest finds
    // nothing readable. The state survives regardless.
    ret(&mut machine, &state, sp, 0x70_0000, 2, 0);
    api.on_instruction(&mut machine, &state).unwrap();

    assert!(machine.is_live(&state));
    assert!(api.monitor().hooks_at(UNLOAD_ROUTINE).is_empty());
}

#[test]
fn succeed_unload_policy_marks_the_state_instead_of_killing_it() {
    init_logging();
    let mut machine = Machine::new();
    let state = machine.create_state();
    let mut api = api(
        r#"{
            "consistency": { "default": "strict" },
            "exerciser": { "modules": ["pcnet.sys"], "unload_policy": "succeed" }
        }"#,
    );

    let module = driver_module("pcnet.sys", vec![]);
    api.on_module_load(&mut machine, &state, module).unwrap();
    api.on_module_unload(&mut machine, &state, "pcnet.sys").unwrap();

    assert!(machine.is_live(&state));
    assert!(api.state_manager().is_successful(&state));
}
