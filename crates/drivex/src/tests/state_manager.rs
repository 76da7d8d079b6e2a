use guest_machine::Machine;

use crate::state_manager::{Error, StateManager};

#[test]
fn success_is_idempotent() {
    let mut machine = Machine::new();
    let state = machine.create_state();
    let mut states = StateManager::default();

    states.succeed_state(&machine, &state).unwrap();
    states.succeed_state(&machine, &state).unwrap();

    assert!(states.is_successful(&state));
    assert_eq!(states.successful_count(), 1);
}

#[test]
fn a_dead_state_cannot_succeed() {
    let mut machine = Machine::new();
    let state = machine.create_state();
    machine.terminate(&state, "done").unwrap();

    let mut states = StateManager::default();
    assert!(matches!(
        states.succeed_state(&machine, &state),
        Err(Error::NotLive(_))
    ));
    assert_eq!(states.successful_count(), 0);
}

#[test]
fn frontier_shrinks_to_one_successful_state() {
    let mut machine = Machine::new();
    let winner = machine.create_state();
    let losers = [machine.create_state(), machine.create_state()];

    let mut states = StateManager::default();
    states.succeed_state(&machine, &winner).unwrap();

    assert_eq!(states.kill_all_but_one_successful(&mut machine), 2);
    assert!(machine.is_live(&winner));
    for loser in &losers {
        assert!(!machine.is_live(loser));
        assert_eq!(
            machine.termination_reason(loser),
            Some("another state completed successfully")
        );
    }
}

#[test]
fn frontier_reduction_needs_a_live_successful_state() {
    let mut machine = Machine::new();
    let first = machine.create_state();
    let second = machine.create_state();

    let mut states = StateManager::default();
    // Nothing succeeded yet.
    assert_eq!(states.kill_all_but_one_successful(&mut machine), 0);
    assert!(machine.is_live(&first));

    // A successful state that has since died does not count either.
    states.succeed_state(&machine, &first).unwrap();
    machine.terminate(&first, "crashed later").unwrap();
    assert_eq!(states.kill_all_but_one_successful(&mut machine), 0);
    assert!(machine.is_live(&second));
}
