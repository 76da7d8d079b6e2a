//! Symbolic values and constraints for annotating guest execution.
//!
//! The facade is deliberately small: fresh named variables, concrete
//! constants, byte extraction/concatenation for memory traffic, and a
//! `select` combinator for conditional outcomes. Satisfiability queries are
//! answered by [ConstraintSet] over a decidable fragment; anything the set
//! cannot decide is an error the caller must treat as fatal for the querying
//! state rather than a silent guess.

mod constraints;
mod eval;
mod expr;

pub use crate::constraints::*;
pub use crate::expr::*;

#[cfg(test)]
mod tests;
