use symexpr::SymValue;

use crate::*;

#[derive(Debug, Clone, Default, PartialEq)]
struct TestBook {
    entries: Vec<u64>,
}

const TEST_PLUGIN: PluginId = PluginId("test");

#[test]
fn fork_clones_plugin_state_deeply() {
    let mut machine = Machine::new();
    let state = machine.create_state();

    machine
        .plugin_state_mut::<TestBook>(&state, TEST_PLUGIN)
        .unwrap()
        .entries
        .push(0x1000);

    let selector = machine.create_symbol(&state, "selector", 32).unwrap();
    let pair = machine
        .fork(state, selector.equals(SymValue::concrete(1, 32)))
        .unwrap();

    // Both branches observe the pre-fork entry.
    for id in [&pair.positive, &pair.negative] {
        let book: &TestBook = machine.plugin_state(id, TEST_PLUGIN).unwrap();
        assert_eq!(book.entries, vec![0x1000]);
    }

    // Mutating one branch leaves the other untouched.
    machine
        .plugin_state_mut::<TestBook>(&pair.positive, TEST_PLUGIN)
        .unwrap()
        .entries
        .push(0x2000);

    let negative: &TestBook = machine.plugin_state(&pair.negative, TEST_PLUGIN).unwrap();
    assert_eq!(negative.entries, vec![0x1000]);
}

#[test]
fn fork_diverges_on_condition() {
    let mut machine = Machine::new();
    let state = machine.create_state();
    let selector = machine.create_symbol(&state, "selector", 32).unwrap();

    let condition = selector.clone().equals(SymValue::concrete(7, 32));
    let pair = machine.fork(state, condition.clone()).unwrap();

    assert!(machine.may_be_true(&pair.positive, &condition).unwrap());
    assert!(machine.must_be_false(&pair.negative, &condition).unwrap());
    assert_eq!(machine.evaluate(&pair.positive, &selector).unwrap(), Some(7));
}

#[test]
fn fork_requires_forking_enabled() {
    let mut machine = Machine::new();
    let state = machine.create_state();
    let selector = machine.create_symbol(&state, "selector", 32).unwrap();

    machine.set_forking(&state, false).unwrap();
    let result = machine.fork(state, selector.equals(SymValue::concrete(1, 32)));
    assert!(matches!(result, Err(Error::ForkingDisabled(_))));
}

#[test]
fn fork_rejects_one_sided_condition() {
    let mut machine = Machine::new();
    let state = machine.create_state();
    let selector = machine.create_symbol(&state, "selector", 32).unwrap();
    machine
        .add_constraint(&state, selector.clone().equals(SymValue::concrete(3, 32)))
        .unwrap();

    let result = machine.fork(state, selector.equals(SymValue::concrete(3, 32)));
    assert!(matches!(result, Err(Error::InfeasibleBranch(_))));
}

#[test]
fn bypass_function_pops_stdcall_frame() {
    let mut machine = Machine::new();
    let state = machine.create_state();

    // Frame: return address plus two u32 arguments.
    machine
        .write_register_concrete(&state, Register::Esp, 0x9000)
        .unwrap();
    machine
        .write_memory_bytes(&state, 0x9000, &0x4011_22u32.to_le_bytes())
        .unwrap();
    machine
        .write_memory_bytes(&state, 0x9004, &100u32.to_le_bytes())
        .unwrap();
    machine
        .write_memory_bytes(&state, 0x9008, &200u32.to_le_bytes())
        .unwrap();

    let return_address = machine.bypass_function(&state, 2).unwrap();
    assert_eq!(return_address, 0x4011_22);
    assert_eq!(machine.pc(&state).unwrap(), 0x4011_22);
    assert_eq!(
        machine
            .read_register_concrete(&state, Register::Esp)
            .unwrap(),
        0x9000 + 12
    );
}

#[test]
fn terminated_states_leave_the_frontier() {
    let mut machine = Machine::new();
    let state = machine.create_state();
    assert_eq!(machine.live_states().len(), 1);

    machine.terminate(&state, "initialization failed").unwrap();
    assert!(machine.live_states().is_empty());
    assert!(!machine.is_live(&state));
    assert_eq!(
        machine.termination_reason(&state),
        Some("initialization failed")
    );

    // Further access through the dead handle is an error.
    assert!(matches!(machine.pc(&state), Err(Error::UnknownState(_))));
}

#[test]
fn concretize_mode_yields_concrete_examples() {
    let mut machine = Machine::new();
    let state = machine.create_state();
    machine.set_concretize_symbols(true);

    let value = machine.create_symbol(&state, "status", 32).unwrap();
    assert_eq!(value.as_concrete(), Some(0));
}
