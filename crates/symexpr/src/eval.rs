use std::collections::BTreeMap;

use crate::expr::{BoolExpr, SymValue, VarId};

/// Concrete assignments for symbolic variables, derived from constraints.
pub type Bindings = BTreeMap<VarId, u64>;

/// Evaluate a value under the given bindings. Returns `None` if the value
/// depends on an unbound variable.
pub fn eval_value(value: &SymValue, bindings: &Bindings) -> Option<u64> {
    match value {
        SymValue::Concrete { value, .. } => Some(*value),
        SymValue::Variable { id, .. } => bindings.get(id).copied(),
        SymValue::Extract { source, byte } => {
            eval_value(source, bindings).map(|v| (v >> (8 * byte)) & 0xFF)
        }
        SymValue::Concat { parts } => {
            let mut result = 0u64;
            let mut shift = 0u32;
            for part in parts {
                let v = eval_value(part, bindings)?;
                result |= v << shift;
                shift += u32::from(part.bits());
            }
            Some(result)
        }
        SymValue::Select {
            condition,
            on_true,
            on_false,
        } => match eval_bool(condition, bindings) {
            Some(true) => eval_value(on_true, bindings),
            Some(false) => eval_value(on_false, bindings),
            None => {
                // Both arms agreeing makes the condition irrelevant.
                let t = eval_value(on_true, bindings)?;
                let f = eval_value(on_false, bindings)?;
                (t == f).then_some(t)
            }
        },
    }
}

/// Evaluate a boolean expression under the given bindings. Returns `None` if
/// the outcome depends on an unbound variable.
pub fn eval_bool(expr: &BoolExpr, bindings: &Bindings) -> Option<bool> {
    match expr {
        BoolExpr::Literal(value) => Some(*value),
        BoolExpr::Equal(lhs, rhs) => {
            Some(eval_value(lhs, bindings)? == eval_value(rhs, bindings)?)
        }
        BoolExpr::NonZero(value) => Some(eval_value(value, bindings)? != 0),
        BoolExpr::Not(inner) => eval_bool(inner, bindings).map(|b| !b),
        BoolExpr::And(lhs, rhs) => match (eval_bool(lhs, bindings), eval_bool(rhs, bindings)) {
            (Some(false), _) | (_, Some(false)) => Some(false),
            (Some(true), Some(true)) => Some(true),
            _ => None,
        },
        BoolExpr::Or(lhs, rhs) => match (eval_bool(lhs, bindings), eval_bool(rhs, bindings)) {
            (Some(true), _) | (_, Some(true)) => Some(true),
            (Some(false), Some(false)) => Some(false),
            _ => None,
        },
    }
}

/// Collect the variables a value mentions into `out`.
pub fn value_variables(value: &SymValue, out: &mut Vec<VarId>) {
    match value {
        SymValue::Concrete { .. } => (),
        SymValue::Variable { id, .. } => out.push(*id),
        SymValue::Extract { source, .. } => value_variables(source, out),
        SymValue::Concat { parts } => {
            for part in parts {
                value_variables(part, out);
            }
        }
        SymValue::Select {
            condition,
            on_true,
            on_false,
        } => {
            bool_variables(condition, out);
            value_variables(on_true, out);
            value_variables(on_false, out);
        }
    }
}

/// Collect the variables a boolean expression mentions into `out`.
pub fn bool_variables(expr: &BoolExpr, out: &mut Vec<VarId>) {
    match expr {
        BoolExpr::Literal(_) => (),
        BoolExpr::Equal(lhs, rhs) => {
            value_variables(lhs, out);
            value_variables(rhs, out);
        }
        BoolExpr::NonZero(value) => value_variables(value, out),
        BoolExpr::Not(inner) => bool_variables(inner, out),
        BoolExpr::And(lhs, rhs) | BoolExpr::Or(lhs, rhs) => {
            bool_variables(lhs, out);
            bool_variables(rhs, out);
        }
    }
}
