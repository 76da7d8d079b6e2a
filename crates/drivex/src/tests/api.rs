use guest_machine::Machine;

use crate::api::WindowsApi;
use crate::handlers::HandlerAction;
use crate::tests::test_module;

fn api() -> WindowsApi {
    let config = serde_json::from_str(
        r#"{
            "consistency": { "default": "local" },
            "exerciser": { "modules": ["driver.sys"] },
            "memory_checker": true
        }"#,
    )
    .expect("valid configuration");
    WindowsApi::new(config).expect("valid configuration")
}

#[test]
fn module_load_annotates_imports_and_the_entry_point() {
    let mut machine = Machine::new();
    let state = machine.create_state();
    let mut api = api();
    api.attach(&mut machine);

    let module = test_module(
        "driver.sys",
        0x40_0000,
        vec![("NdisAllocateMemory", 0x80_0000), ("NotAnImport", 0x80_0010)],
    );
    let entry_point = module.entry_point;
    api.on_module_load(&mut machine, &state, module).unwrap();

    assert_eq!(api.monitor().hooks_at(0x80_0000).len(), 1);
    assert!(api.monitor().hooks_at(0x80_0010).is_empty());
    assert_eq!(api.monitor().hooks_at(entry_point).len(), 1);
    assert!(api.modules().get("driver.sys").is_some());
}

#[test]
fn untracked_modules_are_not_exercised() {
    let mut machine = Machine::new();
    let state = machine.create_state();
    let mut api = api();

    let module = test_module("helper.sys", 0x50_0000, vec![("NdisAllocateMemory", 0x80_0000)]);
    let entry_point = module.entry_point;
    api.on_module_load(&mut machine, &state, module).unwrap();

    // Import annotations are process-wide, but only exercised modules get a
    // DriverEntry hook.
    assert_eq!(api.monitor().hooks_at(0x80_0000).len(), 1);
    assert!(api.monitor().hooks_at(entry_point).is_empty());
}

#[test]
fn an_undecodable_call_passes_through() {
    let mut machine = Machine::new();
    let state = machine.create_state();
    let mut api = api();
    api.attach(&mut machine);

    let module = test_module("driver.sys", 0x40_0000, vec![("NdisAllocateMemory", 0x80_0000)]);
    api.on_module_load(&mut machine, &state, module).unwrap();

    // esp is 0 and nothing is mapped there, so the call frame cannot be
    // captured. The call must run unannotated instead of killing the state.
    machine.set_pc(&state, 0x80_0000).unwrap();
    let action = api.on_instruction(&mut machine, &state).unwrap();

    assert_eq!(action, HandlerAction::Continue);
    assert!(machine.is_live(&state));
    assert!(api
        .memory_checker()
        .expect("checker enabled")
        .grants(&machine, &state)
        .is_empty());
}

#[test]
fn instructions_without_annotations_are_ignored() {
    let mut machine = Machine::new();
    let state = machine.create_state();
    let mut api = api();

    machine.set_pc(&state, 0x1234).unwrap();
    let action = api.on_instruction(&mut machine, &state).unwrap();
    assert_eq!(action, HandlerAction::Continue);
}

#[test]
fn unloading_an_unknown_module_is_harmless() {
    let mut machine = Machine::new();
    let state = machine.create_state();
    let mut api = api();

    let leaks = api.on_module_unload(&mut machine, &state, "ghost.sys").unwrap();
    assert!(leaks.is_empty());
    assert!(machine.is_live(&state));
}

#[test]
fn the_default_unload_policy_retires_the_state() {
    let mut machine = Machine::new();
    let state = machine.create_state();
    let mut api = api();

    let module = test_module("driver.sys", 0x40_0000, vec![]);
    api.on_module_load(&mut machine, &state, module).unwrap();
    api.on_module_unload(&mut machine, &state, "driver.sys").unwrap();

    assert!(!machine.is_live(&state));
    assert_eq!(
        machine.termination_reason(&state),
        Some("module driver.sys unloaded")
    );
    assert!(api.modules().get("driver.sys").is_none());
}
