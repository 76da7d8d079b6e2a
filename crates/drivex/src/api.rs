use guest_machine::{Machine, PluginId, StateId};
use tracing::{info, warn};

use crate::config::{self, ApiConfig};
use crate::consistency::ConsistencyModel;
use crate::handlers::exerciser::{self, DriverExerciser, FollowUp};
use crate::handlers::hal::{self, HalHandlers};
use crate::handlers::ndis::{self, NdisHandlers, TimerCoverage};
use crate::handlers::ntoskrnl::{self, NtoskrnlHandlers};
use crate::handlers::{Frame, HandlerAction};
use crate::memcheck::{Grant, MemoryChecker};
use crate::module::{ModuleDescriptor, ModuleMap};
use crate::monitor::{FunctionMonitor, Hook, PendingReturn};
use crate::state_manager::StateManager;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Machine(#[from] guest_machine::Error),

    #[error(transparent)]
    StateManager(#[from] crate::state_manager::Error),

    #[error("plugin {plugin} has no handler {handler}")]
    UnknownHandler { plugin: PluginId, handler: u16 },

    #[error("no plugin {0} attached")]
    UnknownPlugin(PluginId),
}

/// The execution context handed to handlers: the machine plus every shared
/// service, borrowed apart so a handler can use them side by side.
pub struct ExecCtx<'a> {
    pub machine: &'a mut Machine,
    pub monitor: &'a mut FunctionMonitor,
    pub modules: &'a ModuleMap,
    pub memcheck: Option<&'a MemoryChecker>,
    pub states: &'a mut StateManager,
}

/// Top-level dispatcher tying the annotated API surfaces together.
///
/// The substrate drives it with three notifications: an instruction is about
/// to execute, a module loaded, a module unloaded. Everything else, from
/// call and return routing to state lifecycle, happens inside.
pub struct WindowsApi {
    monitor: FunctionMonitor,
    modules: ModuleMap,
    memcheck: Option<MemoryChecker>,
    states: StateManager,

    ndis: NdisHandlers,
    ntoskrnl: NtoskrnlHandlers,
    hal: HalHandlers,
    exerciser: DriverExerciser,

    concretize: bool,
}

impl WindowsApi {
    /// Build the dispatcher from a validated configuration. Any
    /// configuration problem is fatal here, before a single instruction
    /// runs.
    pub fn new(config: ApiConfig) -> config::Result<Self> {
        config.validate()?;
        let policy = config.policy()?;
        let unload_policy = config.unload_policy()?;
        let tracked = config.exerciser.modules.clone();
        let concretize = policy.mentions(ConsistencyModel::Overconstrained);

        Ok(Self {
            monitor: FunctionMonitor::default(),
            modules: ModuleMap::default(),
            memcheck: config.memory_checker.then(MemoryChecker::default),
            states: StateManager::default(),
            ndis: NdisHandlers::new(
                policy.clone(),
                config.ndis.clone(),
                tracked.clone(),
                TimerCoverage::default(),
            ),
            ntoskrnl: NtoskrnlHandlers::new(policy.clone(), tracked.clone()),
            hal: HalHandlers::new(policy.clone(), tracked.clone()),
            exerciser: DriverExerciser::new(policy, tracked, unload_policy),
            concretize,
        })
    }

    /// Apply process-wide machine settings. Call once per machine before
    /// execution starts.
    pub fn attach(&self, machine: &mut Machine) {
        if self.concretize {
            info!("overconstrained model selected, concretizing every fresh symbol");
        }
        machine.set_concretize_symbols(self.concretize);
    }

    pub fn memory_checker(&self) -> Option<&MemoryChecker> {
        self.memcheck.as_ref()
    }

    pub fn state_manager(&self) -> &StateManager {
        &self.states
    }

    pub fn state_manager_mut(&mut self) -> &mut StateManager {
        &mut self.states
    }

    pub fn modules(&self) -> &ModuleMap {
        &self.modules
    }

    pub fn monitor(&self) -> &FunctionMonitor {
        &self.monitor
    }

    /// Notification that `state` is about to execute the instruction at its
    /// current pc. Fires matured return handlers first, then call handlers
    /// of any annotation registered at this address.
    pub fn on_instruction(&mut self, machine: &mut Machine, state: &StateId) -> Result<HandlerAction> {
        let pc = machine.pc(state)?;

        loop {
            let Some(pending) = self.monitor.take_matching_return(machine, state, pc)? else {
                break;
            };
            self.dispatch_return(machine, state, &pending)?;
            if !machine.is_live(state) {
                return Ok(HandlerAction::Continue);
            }
        }

        let hooks = self.monitor.hooks_at(pc);
        if hooks.is_empty() {
            return Ok(HandlerAction::Continue);
        }

        // A call the handler cannot decode runs unannotated rather than
        // aborting the state.
        let frame = match Frame::at_call(machine, state, pc) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(
                    pc = format_args!("{pc:#x}"),
                    %err,
                    "cannot capture call frame, passing call through"
                );
                return Ok(HandlerAction::Continue);
            }
        };

        for hook in hooks {
            let action = self.dispatch_call(machine, state, hook, &frame)?;
            if action != HandlerAction::Continue {
                return Ok(action);
            }
            if !machine.is_live(state) {
                break;
            }
        }
        Ok(HandlerAction::Continue)
    }

    /// Notification that a module was mapped into `state`'s process.
    pub fn on_module_load(
        &mut self,
        machine: &mut Machine,
        state: &StateId,
        module: ModuleDescriptor,
    ) -> Result<()> {
        info!(
            module = %module.id,
            base = format_args!("{:#x}", module.base),
            size = module.size,
            "module loaded"
        );
        self.modules.register(module.clone());

        let Self {
            monitor,
            modules,
            memcheck,
            states,
            ndis,
            ntoskrnl,
            hal,
            exerciser,
            ..
        } = self;
        let mut cx = ExecCtx {
            machine,
            monitor,
            modules,
            memcheck: memcheck.as_ref(),
            states,
        };

        ndis.on_module_load(&mut cx, state, &module)?;
        ntoskrnl.on_module_load(&mut cx, state, &module)?;
        hal.on_module_load(&mut cx, state, &module)?;
        exerciser.on_module_load(&mut cx, state, &module)?;
        Ok(())
    }

    /// Notification that the module with identity `module_id` is being
    /// unmapped from `state`'s process. Returns the leaked grants the
    /// memory checker found, if it is enabled.
    pub fn on_module_unload(
        &mut self,
        machine: &mut Machine,
        state: &StateId,
        module_id: &str,
    ) -> Result<Vec<Grant>> {
        let Some(module) = self.modules.get(module_id).cloned() else {
            warn!(module = module_id, "unload notification for unknown module");
            return Ok(Vec::new());
        };

        let leaks = {
            let Self {
                monitor,
                modules,
                memcheck,
                states,
                ndis,
                ntoskrnl,
                hal,
                exerciser,
                ..
            } = self;
            let mut cx = ExecCtx {
                machine,
                monitor,
                modules,
                memcheck: memcheck.as_ref(),
                states,
            };

            ndis.on_module_unload(&mut cx, state, &module)?;
            ntoskrnl.on_module_unload(&mut cx, state, &module)?;
            hal.on_module_unload(&mut cx, state, &module)?;
            // The exerciser runs last: its unload policy may retire the
            // state, after which no plugin may touch it.
            exerciser.on_module_unload(&mut cx, state, &module)?
        };

        self.modules.unregister(module_id);
        Ok(leaks)
    }

    fn dispatch_call(
        &mut self,
        machine: &mut Machine,
        state: &StateId,
        hook: Hook,
        frame: &Frame,
    ) -> Result<HandlerAction> {
        let Self {
            monitor,
            modules,
            memcheck,
            states,
            ndis,
            ntoskrnl,
            hal,
            exerciser,
            ..
        } = self;
        let mut cx = ExecCtx {
            machine,
            monitor,
            modules,
            memcheck: memcheck.as_ref(),
            states,
        };

        if hook.plugin == ndis::PLUGIN {
            ndis.on_call(&mut cx, state, frame, hook.handler)
        } else if hook.plugin == ntoskrnl::PLUGIN {
            ntoskrnl.on_call(&mut cx, state, frame, hook.handler)
        } else if hook.plugin == hal::PLUGIN {
            hal.on_call(&mut cx, state, frame, hook.handler)
        } else if hook.plugin == exerciser::PLUGIN {
            exerciser.on_call(&mut cx, state, frame, hook.handler)
        } else {
            Err(Error::UnknownPlugin(hook.plugin))
        }
    }

    fn dispatch_return(
        &mut self,
        machine: &mut Machine,
        state: &StateId,
        pending: &PendingReturn,
    ) -> Result<()> {
        let Self {
            monitor,
            modules,
            memcheck,
            states,
            ndis,
            ntoskrnl,
            hal,
            exerciser,
            ..
        } = self;
        let mut cx = ExecCtx {
            machine,
            monitor,
            modules,
            memcheck: memcheck.as_ref(),
            states,
        };

        if pending.hook.plugin == ndis::PLUGIN {
            ndis.on_return(&mut cx, state, pending)
        } else if pending.hook.plugin == ntoskrnl::PLUGIN {
            ntoskrnl.on_return(&mut cx, state, pending)
        } else if pending.hook.plugin == hal::PLUGIN {
            hal.on_return(&mut cx, state, pending)
        } else if pending.hook.plugin == exerciser::PLUGIN {
            let follow_ups = exerciser.on_return(&mut cx, state, pending)?;
            for follow_up in follow_ups {
                match follow_up {
                    FollowUp::IrpDispatch { address, major } => {
                        ntoskrnl.register_irp_dispatch(&mut cx, state, address, major)?;
                    }
                    FollowUp::DriverUnload { address } => {
                        exerciser.register_unload(&mut cx, state, address)?;
                    }
                }
            }
            Ok(())
        } else {
            Err(Error::UnknownPlugin(pending.hook.plugin))
        }
    }
}
