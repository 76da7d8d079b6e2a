use guest_machine::{Machine, PluginId, StateId};
use symexpr::SymValue;

use crate::api::ExecCtx;
use crate::consistency::{ConsistencyModel, ConsistencyPolicy};
use crate::engine::{AnnotationEngine, HandlerTable};
use crate::module::ModuleMap;
use crate::monitor::FunctionMonitor;
use crate::state_manager::StateManager;
use crate::tests::test_module;

const PLUGIN: PluginId = PluginId("test");
const BOOK: PluginId = PluginId("test:book");

struct Fixture {
    machine: Machine,
    monitor: FunctionMonitor,
    modules: ModuleMap,
    states: StateManager,
    engine: AnnotationEngine,
    state: StateId,
}

impl Fixture {
    fn new(policy: ConsistencyPolicy) -> Self {
        let mut machine = Machine::new();
        let state = machine.create_state();
        Self {
            machine,
            monitor: FunctionMonitor::default(),
            modules: ModuleMap::default(),
            states: StateManager::default(),
            engine: AnnotationEngine::new(PLUGIN, BOOK, policy, Vec::<String>::new()),
            state,
        }
    }

    fn local() -> Self {
        Self::new(ConsistencyPolicy::new(ConsistencyModel::Local))
    }
}

/// Borrow the fixture's services apart so the engine stays callable.
macro_rules! cx {
    ($fx:expr) => {
        ExecCtx {
            machine: &mut $fx.machine,
            monitor: &mut $fx.monitor,
            modules: &$fx.modules,
            memcheck: None,
            states: &mut $fx.states,
        }
    };
}

struct TestTable;

impl HandlerTable for TestTable {
    fn handler_for(&self, name: &str) -> Option<u16> {
        match name {
            "Alloc" => Some(1),
            "Free" => Some(2),
            _ => None,
        }
    }

    fn is_ignored(&self, name: &str) -> bool {
        name == "Noise"
    }
}

#[test]
fn registration_is_idempotent() {
    let mut fx = Fixture::local();
    let state = fx.state.clone();

    let mut cx = cx!(fx);
    assert!(fx
        .engine
        .register_entry_point(&mut cx, &state, 1, 0x1000, None)
        .unwrap());
    assert!(!fx
        .engine
        .register_entry_point(&mut cx, &state, 1, 0x1000, None)
        .unwrap());
    // A different handler at the same address is a distinct registration.
    assert!(fx
        .engine
        .register_entry_point(&mut cx, &state, 2, 0x1000, None)
        .unwrap());
    drop(cx);

    assert_eq!(fx.monitor.hooks_at(0x1000).len(), 2);
    assert!(fx.engine.is_registered(&fx.machine, &state, 1, 0x1000).unwrap());
    assert!(!fx.engine.is_registered(&fx.machine, &state, 3, 0x1000).unwrap());
}

#[test]
fn import_registration_skips_unknown_and_ignored_names() {
    let mut fx = Fixture::local();
    let state = fx.state.clone();
    let module = test_module(
        "driver.sys",
        0x40_0000,
        vec![
            ("Alloc", 0x80_0000),
            ("Noise", 0x80_0010),
            ("Mystery", 0x80_0020),
        ],
    );

    let mut cx = cx!(fx);
    let registered = fx
        .engine
        .register_entry_points(&mut cx, &state, &module, &TestTable)
        .unwrap();
    drop(cx);

    assert_eq!(registered, 1);
    assert_eq!(fx.monitor.hooks_at(0x80_0000).len(), 1);
    assert!(fx.monitor.hooks_at(0x80_0010).is_empty());
    assert!(fx.monitor.hooks_at(0x80_0020).is_empty());
}

#[test]
fn unregistration_is_scoped_to_the_module() {
    let mut fx = Fixture::local();
    let state = fx.state.clone();
    let module = test_module("driver.sys", 0x40_0000, vec![("Alloc", 0x80_0000)]);
    let other = test_module("other.sys", 0x90_0000, vec![]);

    let mut cx = cx!(fx);
    // Import annotation made on behalf of the module, outside its range.
    fx.engine
        .register_entry_points(&mut cx, &state, &module, &TestTable)
        .unwrap();
    // Entry point inside the module's range, without provenance.
    fx.engine
        .register_entry_point(&mut cx, &state, 2, 0x40_0100, None)
        .unwrap();
    // Unrelated registration that must survive.
    fx.engine
        .register_entry_point(&mut cx, &state, 2, 0x90_0100, Some(&other))
        .unwrap();

    let retracted = fx
        .engine
        .unregister_entry_points(&mut cx, &state, &module)
        .unwrap();
    drop(cx);
    assert_eq!(retracted, 2);

    assert!(!fx.engine.is_registered(&fx.machine, &state, 1, 0x80_0000).unwrap());
    assert!(!fx.engine.is_registered(&fx.machine, &state, 2, 0x40_0100).unwrap());
    assert!(fx.engine.is_registered(&fx.machine, &state, 2, 0x90_0100).unwrap());
}

#[test]
fn registration_is_per_state() {
    let mut fx = Fixture::local();
    let state = fx.state.clone();

    let mut cx = cx!(fx);
    fx.engine
        .register_entry_point(&mut cx, &state, 1, 0x1000, None)
        .unwrap();
    drop(cx);

    let other = fx.machine.create_state();
    assert!(fx.engine.is_registered(&fx.machine, &state, 1, 0x1000).unwrap());
    assert!(!fx.engine.is_registered(&fx.machine, &other, 1, 0x1000).unwrap());
}

#[test]
fn fork_range_produces_disjoint_covering_branches() {
    let mut fx = Fixture::local();
    let state = fx.state.clone();
    let values = [0x10u64, 0x20, 0x30];

    let mut cx = cx!(fx);
    let outcome = fx
        .engine
        .fork_range(&mut cx, state, "status", &values, 32)
        .unwrap();
    drop(cx);
    assert_eq!(outcome.branches.len(), 3);

    for (branch, value) in &outcome.branches {
        // Each branch binds the selector to exactly its value.
        assert_eq!(
            fx.machine.evaluate(branch, &outcome.selector).unwrap(),
            Some(*value)
        );
        for other in values.iter().filter(|other| *other != value) {
            let condition = outcome
                .selector
                .clone()
                .equals(SymValue::concrete(*other, 32));
            assert!(fx.machine.must_be_false(branch, &condition).unwrap());
        }
    }
}

#[test]
fn fork_range_restores_the_forking_gate() {
    let mut fx = Fixture::local();
    let state = fx.state.clone();
    fx.machine.set_forking(&state, false).unwrap();

    let mut cx = cx!(fx);
    let outcome = fx
        .engine
        .fork_range(&mut cx, state, "status", &[0, 1], 32)
        .unwrap();
    drop(cx);

    assert_eq!(outcome.branches.len(), 2);
    for (branch, _) in &outcome.branches {
        assert!(!fx.machine.is_forking_enabled(branch).unwrap());
    }
}

#[test]
fn fork_range_concretizes_to_the_first_candidate() {
    let mut fx = Fixture::local();
    fx.machine.set_concretize_symbols(true);
    let state = fx.state.clone();

    let mut cx = cx!(fx);
    let outcome = fx
        .engine
        .fork_range(&mut cx, state, "status", &[7, 8], 32)
        .unwrap();
    drop(cx);

    assert_eq!(outcome.branches.len(), 1);
    assert_eq!(outcome.branches[0].1, 7);
    assert_eq!(outcome.selector.as_concrete(), Some(7));
}

#[test]
fn fork_states_yields_one_extra_branch() {
    let mut fx = Fixture::local();
    let state = fx.state.clone();

    let mut cx = cx!(fx);
    let outcome = fx.engine.fork_states(&mut cx, state, "timer", 2).unwrap();
    drop(cx);

    // count branches for the caller's alternatives plus the original.
    assert_eq!(outcome.branches.len(), 3);
    let selectors: Vec<u64> = outcome.branches.iter().map(|(_, value)| *value).collect();
    assert_eq!(selectors, vec![0, 1, 2]);
    for (branch, value) in &outcome.branches {
        assert_eq!(
            fx.machine.evaluate(branch, &outcome.selector).unwrap(),
            Some(*value)
        );
    }
}

#[test]
fn pinned_model_sits_between_override_and_default() {
    let policy = ConsistencyPolicy::new(ConsistencyModel::Local)
        .with_override("Pinned", ConsistencyModel::Overapprox);
    let mut fx = Fixture::new(policy);
    let state = fx.state.clone();

    assert_eq!(
        fx.engine.consistency(&fx.machine, &state, "Other").unwrap(),
        ConsistencyModel::Local
    );

    fx.engine
        .push_model(&mut fx.machine, &state, ConsistencyModel::Strict)
        .unwrap();
    // The pin replaces the default for functions without an override.
    assert_eq!(
        fx.engine.consistency(&fx.machine, &state, "Other").unwrap(),
        ConsistencyModel::Strict
    );
    // An explicit override still wins.
    assert_eq!(
        fx.engine.consistency(&fx.machine, &state, "Pinned").unwrap(),
        ConsistencyModel::Overapprox
    );

    assert_eq!(
        fx.engine.pop_model(&mut fx.machine, &state).unwrap(),
        Some(ConsistencyModel::Strict)
    );
    assert_eq!(
        fx.engine.consistency(&fx.machine, &state, "Other").unwrap(),
        ConsistencyModel::Local
    );
}
