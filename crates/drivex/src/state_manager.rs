use std::collections::BTreeSet;

use guest_machine::{Machine, StateId};
use tracing::info;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0} is not live and cannot be marked successful")]
    NotLive(StateId),
}

/// Tracks which execution states completed the exercised scenario.
///
/// Success is a plugin-level verdict, not a machine one: a state is
/// successful once some handler decides the driver got far enough, e.g. its
/// initialization entry point returned a success status.
#[derive(Debug, Default)]
pub struct StateManager {
    successful: BTreeSet<StateId>,
}

impl StateManager {
    /// Mark a live state as having completed successfully. Idempotent.
    pub fn succeed_state(&mut self, machine: &Machine, state: &StateId) -> Result<()> {
        if !machine.is_live(state) {
            return Err(Error::NotLive(state.clone()));
        }
        if self.successful.insert(state.clone()) {
            info!(state = %state, "state completed successfully");
        }
        Ok(())
    }

    pub fn is_successful(&self, state: &StateId) -> bool {
        self.successful.contains(state)
    }

    pub fn successful_count(&self) -> usize {
        self.successful.len()
    }

    /// Terminate every live state except one successful survivor, shrinking
    /// the frontier once a run has produced what it needs. A no-op when no
    /// successful state is still live. Returns the number of terminated
    /// states.
    ///
    /// Nothing in the dispatch path calls this: it is the run-end operation
    /// the embedder invokes, via [crate::WindowsApi::state_manager_mut],
    /// when it decides exploration is over.
    pub fn kill_all_but_one_successful(&mut self, machine: &mut Machine) -> usize {
        let Some(keep) = self
            .successful
            .iter()
            .find(|state| machine.is_live(state))
            .cloned()
        else {
            return 0;
        };

        let mut killed = 0;
        for state in machine.live_states() {
            if state != keep {
                // The handle came straight from the live set.
                machine
                    .terminate(&state, "another state completed successfully")
                    .ok();
                killed += 1;
            }
        }
        info!(keep = %keep, killed, "frontier reduced to one successful state");
        killed
    }
}
