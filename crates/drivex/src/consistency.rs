use std::collections::BTreeMap;

use strum::{Display, EnumString, IntoStaticStr};

/// How faithfully an annotated function's outcome is represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Display, EnumString, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
pub enum ConsistencyModel {
    /// Pass the concrete outcome through unchanged and only observe it.
    Strict,

    /// Replace the outcome with a finite disjunction of concrete result
    /// codes, forking one branch per candidate. Every branch remains
    /// reachable in a real execution.
    Local,

    /// Replace the outcome with one unconstrained fresh symbol. Cheap and
    /// complete, but admits executions no real environment produces.
    #[strum(serialize = "overapproximate")]
    Overapprox,

    /// Strict, plus a process-wide switch that concretizes every fresh
    /// symbol to an example value. A debugging aid for replaying one path.
    Overconstrained,
}

/// Per-function model resolution: a default model plus per-function
/// overrides keyed by annotated function name.
#[derive(Debug, Clone)]
pub struct ConsistencyPolicy {
    default: ConsistencyModel,
    overrides: BTreeMap<String, ConsistencyModel>,
}

impl ConsistencyPolicy {
    pub fn new(default: ConsistencyModel) -> Self {
        Self {
            default,
            overrides: BTreeMap::new(),
        }
    }

    pub fn with_override(mut self, function: impl Into<String>, model: ConsistencyModel) -> Self {
        self.overrides.insert(function.into(), model);
        self
    }

    pub fn default_model(&self) -> ConsistencyModel {
        self.default
    }

    pub fn override_for(&self, function: &str) -> Option<ConsistencyModel> {
        self.overrides.get(function).copied()
    }

    /// Resolve the model for `function`: an explicit override wins over the
    /// policy default. Callers with a pinned model (see
    /// [crate::engine::AnnotationEngine::push_model]) consult the pin between
    /// these two.
    pub fn resolve(&self, function: &str) -> ConsistencyModel {
        self.override_for(function).unwrap_or(self.default)
    }

    /// Whether any resolution can ever yield `model`.
    pub fn mentions(&self, model: ConsistencyModel) -> bool {
        self.default == model || self.overrides.values().any(|&m| m == model)
    }
}
