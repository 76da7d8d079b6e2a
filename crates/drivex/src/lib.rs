//! Annotation engine for symbolically exercising Windows driver APIs.
//!
//! A [WindowsApi] instance watches an exercised driver through a
//! [monitor::FunctionMonitor] and routes annotated calls and returns to
//! handler sets for the NDIS, ntoskrnl, and HAL surfaces plus a driver
//! exerciser that drives load, entry-point, and unload flows. Each handler
//! runs under a configurable consistency model that decides how faithfully
//! the annotated function's outcome is represented: pass it through
//! unchanged, fork a finite disjunction of concrete result codes, replace it
//! with one unconstrained symbol, or concretize every symbol for debugging.

pub mod api;
pub mod config;
pub mod consistency;
pub mod engine;
pub mod handlers;
pub mod memcheck;
pub mod module;
pub mod monitor;
pub mod state_manager;

pub use crate::api::{ExecCtx, WindowsApi};
pub use crate::config::ApiConfig;
pub use crate::consistency::{ConsistencyModel, ConsistencyPolicy};
pub use crate::handlers::{Frame, HandlerAction};
pub use crate::module::{Import, ModuleDescriptor, ModuleMap};

#[cfg(test)]
mod tests;
