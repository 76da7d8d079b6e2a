use std::any::Any;
use std::collections::BTreeMap;
use std::fmt::Debug;

/// Identity of a plugin attaching per-state bookkeeping to execution states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PluginId(pub &'static str);

impl std::fmt::Display for PluginId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.0)
    }
}

/// Per-(plugin, state) mutable bookkeeping. A plugin state must clone with
/// value semantics: forking an execution state clones every plugin state
/// bit-for-bit, and the clones never share mutable substructure.
pub trait PluginState: Any + Debug {
    fn clone_box(&self) -> Box<dyn PluginState>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any + Debug + Clone> PluginState for T {
    fn clone_box(&self) -> Box<dyn PluginState> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// The plugin-state map of one execution state.
#[derive(Debug, Default)]
pub struct PluginStateMap {
    states: BTreeMap<PluginId, Box<dyn PluginState>>,
}

impl Clone for PluginStateMap {
    fn clone(&self) -> Self {
        Self {
            states: self
                .states
                .iter()
                .map(|(&id, state)| (id, state.as_ref().clone_box()))
                .collect(),
        }
    }
}

impl PluginStateMap {
    /// Borrow the plugin's state, creating it from `Default` on first access.
    pub fn get_or_default_mut<T: PluginState + Default>(&mut self, plugin: PluginId) -> &mut T {
        self.states
            .entry(plugin)
            .or_insert_with(|| Box::new(T::default()))
            .as_any_mut()
            .downcast_mut::<T>()
            .unwrap_or_else(|| panic!("plugin state type mismatch for {plugin}"))
    }

    /// Borrow the plugin's state if it has been created.
    pub fn get<T: PluginState>(&self, plugin: PluginId) -> Option<&T> {
        self.states
            .get(&plugin)
            .map(|state| {
                // The blanket impl would otherwise resolve these calls on the
                // `&Box` itself; deref to the trait object explicitly.
                state
                    .as_ref()
                    .as_any()
                    .downcast_ref::<T>()
                    .unwrap_or_else(|| panic!("plugin state type mismatch for {plugin}"))
            })
    }
}
