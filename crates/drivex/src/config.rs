use std::collections::BTreeMap;
use std::str::FromStr;

use serde::Deserialize;

use crate::consistency::{ConsistencyModel, ConsistencyPolicy};

pub type Result<T> = std::result::Result<T, Error>;

/// Configuration errors are fatal: a run with a half-applied configuration
/// produces results that look meaningful and are not.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("unknown consistency model {0:?}")]
    UnknownModel(String),

    #[error("unknown unload policy {0:?}, expected \"kill\" or \"succeed\"")]
    UnknownUnloadPolicy(String),

    #[error("no modules selected for exercising")]
    NoModules,

    #[error(
        "the overconstrained model concretizes every symbol and cannot be \
         combined with the memory checker"
    )]
    OverconstrainedWithChecker,
}

/// Top-level deserialized configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiConfig {
    pub consistency: ConsistencyConfig,
    pub exerciser: ExerciserConfig,
    #[serde(default)]
    pub ndis: NdisConfig,
    /// Enable dynamic memory-grant tracking and unload leak checks.
    #[serde(default)]
    pub memory_checker: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsistencyConfig {
    /// Model applied to every annotated function without an override.
    pub default: String,
    /// Per-function model overrides, keyed by annotated function name.
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExerciserConfig {
    /// Identities of the modules to exercise.
    pub modules: Vec<String>,
    /// What happens to a state when an exercised module unloads cleanly.
    #[serde(default = "default_unload_policy")]
    pub unload_policy: String,
}

fn default_unload_policy() -> String {
    "kill".into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NdisConfig {
    /// Multiplier applied to every timer interval the driver requests,
    /// stretching or compressing guest-perceived time.
    #[serde(default = "default_timer_scale")]
    pub timer_scale: u64,
    /// Force this MAC address instead of symbolic bytes when the driver
    /// reads its network address.
    #[serde(default)]
    pub network_address: Option<[u8; 6]>,
    /// Rewrite the adapter bus type the driver reports at registration.
    #[serde(default)]
    pub forced_bus_type: Option<u32>,
    /// Registry keywords that keep their concrete values instead of
    /// becoming symbolic.
    #[serde(default)]
    pub ignored_keywords: Vec<String>,
    /// Force the media connect state reported to OID queries.
    #[serde(default)]
    pub force_connected: Option<bool>,
}

fn default_timer_scale() -> u64 {
    1
}

impl Default for NdisConfig {
    fn default() -> Self {
        Self {
            timer_scale: default_timer_scale(),
            network_address: None,
            forced_bus_type: None,
            ignored_keywords: Vec::new(),
            force_connected: None,
        }
    }
}

/// Fate of a state whose exercised module unloads without errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnloadPolicy {
    /// Terminate the state; the scenario is over.
    Kill,
    /// Mark the state successful and keep it live.
    Succeed,
}

impl ApiConfig {
    pub(crate) fn policy(&self) -> Result<ConsistencyPolicy> {
        let default = parse_model(&self.consistency.default)?;
        let mut policy = ConsistencyPolicy::new(default);
        for (function, model) in &self.consistency.overrides {
            policy = policy.with_override(function.clone(), parse_model(model)?);
        }
        Ok(policy)
    }

    pub(crate) fn unload_policy(&self) -> Result<UnloadPolicy> {
        match self.exerciser.unload_policy.as_str() {
            "kill" => Ok(UnloadPolicy::Kill),
            "succeed" => Ok(UnloadPolicy::Succeed),
            other => Err(Error::UnknownUnloadPolicy(other.into())),
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.exerciser.modules.is_empty() {
            return Err(Error::NoModules);
        }
        let policy = self.policy()?;
        self.unload_policy()?;
        if self.memory_checker && policy.mentions(ConsistencyModel::Overconstrained) {
            return Err(Error::OverconstrainedWithChecker);
        }
        Ok(())
    }
}

fn parse_model(text: &str) -> Result<ConsistencyModel> {
    ConsistencyModel::from_str(text).map_err(|_| Error::UnknownModel(text.into()))
}
