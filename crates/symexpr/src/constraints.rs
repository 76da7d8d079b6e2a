use std::collections::{BTreeMap, BTreeSet};

use crate::eval::{bool_variables, eval_bool, eval_value, Bindings};
use crate::expr::{BoolExpr, SymValue, VarId};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The constraint set cannot decide the query. Callers must treat this
    /// as fatal for the querying state; guessing an answer would silently
    /// corrupt the exploration.
    #[error("cannot decide satisfiability of: {0}")]
    Undecidable(String),
}

/// The feasible-value bookkeeping of one execution state.
///
/// Constraints only ever narrow the feasible set. Equalities between a
/// variable and a known value fold into bindings, disequalities fold into
/// per-variable exclusion sets, and queries over variables the fold could
/// not track are [Error::Undecidable], never a default.
#[derive(Debug, Clone, Default)]
pub struct ConstraintSet {
    constraints: Vec<BoolExpr>,
    bindings: Bindings,
    exclusions: BTreeMap<VarId, BTreeSet<u64>>,
    /// Variables mentioned by constraints that were not folded into bindings
    /// or exclusions. Queries over these cannot be decided here.
    opaque: BTreeSet<VarId>,
    infeasible: bool,
}

impl ConstraintSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Permanently narrow the feasible set with `constraint`.
    pub fn add(&mut self, constraint: BoolExpr) {
        match eval_bool(&constraint, &self.bindings) {
            Some(true) => (),
            Some(false) => self.infeasible = true,
            None => self.fold(&constraint),
        }
        self.constraints.push(constraint);
    }

    /// Whether any assignment can still satisfy every recorded constraint.
    pub fn is_feasible(&self) -> bool {
        !self.infeasible
    }

    pub fn constraints(&self) -> &[BoolExpr] {
        &self.constraints
    }

    /// Concrete value of `value` under the recorded bindings, if decided.
    pub fn evaluate(&self, value: &SymValue) -> Option<u64> {
        eval_value(value, &self.bindings)
    }

    /// The recorded variable bindings.
    pub fn bindings(&self) -> &Bindings {
        &self.bindings
    }

    /// Whether `expr` can be true in some satisfying assignment.
    pub fn may_be_true(&self, expr: &BoolExpr) -> Result<bool> {
        if self.infeasible {
            return Ok(false);
        }

        if let Some(decided) = eval_bool(expr, &self.bindings) {
            return Ok(decided);
        }

        self.decide_leaf(expr)
            .ok_or_else(|| Error::Undecidable(expr.to_string()))
    }

    /// Whether `expr` is false in every satisfying assignment.
    pub fn must_be_false(&self, expr: &BoolExpr) -> Result<bool> {
        self.may_be_true(expr).map(|may| !may)
    }

    /// Record the shape of an undecided constraint. `var == value` becomes a
    /// binding, `var != value` an exclusion; anything else leaves its
    /// variables opaque.
    fn fold(&mut self, constraint: &BoolExpr) {
        match constraint {
            BoolExpr::Equal(..) => {
                if let Some((var, value)) = self.variable_equality(constraint) {
                    self.bind(var, value);
                    return;
                }
            }
            BoolExpr::Not(inner) => {
                if let Some((var, value)) = self.variable_equality(inner) {
                    self.exclude(var, value);
                    return;
                }
            }
            _ => (),
        }

        let mut vars = Vec::new();
        bool_variables(constraint, &mut vars);
        self.opaque.extend(vars);
    }

    /// Match `var == evaluable` in either operand order.
    fn variable_equality(&self, expr: &BoolExpr) -> Option<(VarId, u64)> {
        let BoolExpr::Equal(lhs, rhs) = expr else {
            return None;
        };

        if let (Some(var), Some(value)) = (lhs.as_variable(), eval_value(rhs, &self.bindings)) {
            return Some((var, value));
        }
        if let (Some(var), Some(value)) = (rhs.as_variable(), eval_value(lhs, &self.bindings)) {
            return Some((var, value));
        }
        None
    }

    fn bind(&mut self, var: VarId, value: u64) {
        if self.exclusions.get(&var).is_some_and(|set| set.contains(&value)) {
            self.infeasible = true;
            return;
        }

        match self.bindings.get(&var) {
            Some(&bound) if bound != value => self.infeasible = true,
            Some(_) => (),
            None => {
                self.bindings.insert(var, value);
                self.propagate();
            }
        }
    }

    fn exclude(&mut self, var: VarId, value: u64) {
        if self.bindings.get(&var) == Some(&value) {
            self.infeasible = true;
            return;
        }
        self.exclusions.entry(var).or_default().insert(value);
    }

    /// Re-check recorded constraints after a new binding; a previously
    /// undecidable constraint may now evaluate, possibly to a contradiction.
    fn propagate(&mut self) {
        let contradicted = self
            .constraints
            .iter()
            .any(|constraint| eval_bool(constraint, &self.bindings) == Some(false));
        if contradicted {
            self.infeasible = true;
        }
    }

    /// Decide `may_be_true` for leaf predicates over a single tracked
    /// variable. Returns `None` when outside the decidable fragment.
    ///
    /// Negation swaps satisfiability with avoidability, so both directions
    /// are computed: a query may be true iff some non-excluded witness
    /// exists, and may be false iff a non-excluded counterexample exists.
    fn decide_leaf(&self, expr: &BoolExpr) -> Option<bool> {
        self.leaf_satisfiability(expr).map(|(may_true, _)| may_true)
    }

    fn leaf_satisfiability(&self, expr: &BoolExpr) -> Option<(bool, bool)> {
        match expr {
            BoolExpr::Not(inner) => self
                .leaf_satisfiability(inner)
                .map(|(may_true, may_false)| (may_false, may_true)),
            BoolExpr::Equal(..) => {
                let (var, bits, value) = self.tracked_variable_equality(expr)?;
                let may_true = !self.excluded(var, value);
                let may_false = self.free_values_excluding(var, bits, value) > 0;
                Some((may_true, may_false))
            }
            BoolExpr::NonZero(operand) => {
                let (var, bits) = Self::free_variable(operand)?;
                if self.opaque.contains(&var) || self.bindings.contains_key(&var) {
                    return None;
                }
                let may_true = self.free_values_excluding(var, bits, 0) > 0;
                let may_false = !self.excluded(var, 0);
                Some((may_true, may_false))
            }
            _ => None,
        }
    }

    /// Match `var == evaluable` where `var` is unbound and tracked only via
    /// exclusions.
    fn tracked_variable_equality(&self, expr: &BoolExpr) -> Option<(VarId, u16, u64)> {
        let BoolExpr::Equal(lhs, rhs) = expr else {
            return None;
        };

        let ((var, bits), value) = match (
            Self::free_variable(lhs),
            eval_value(rhs, &self.bindings),
            Self::free_variable(rhs),
            eval_value(lhs, &self.bindings),
        ) {
            (Some(var), Some(value), _, _) => (var, value),
            (_, _, Some(var), Some(value)) => (var, value),
            _ => return None,
        };

        if self.opaque.contains(&var) || self.bindings.contains_key(&var) {
            return None;
        }

        Some((var, bits, value))
    }

    fn free_variable(value: &SymValue) -> Option<(VarId, u16)> {
        match value {
            SymValue::Variable { id, bits, .. } => Some((*id, *bits)),
            _ => None,
        }
    }

    /// Number of domain values other than `value` not ruled out by
    /// exclusions, saturating at the domain size.
    fn free_values_excluding(&self, var: VarId, bits: u16, value: u64) -> u128 {
        let domain: u128 = if bits >= 64 { 1 << 64 } else { 1u128 << bits };
        let excluded_others = self
            .exclusions
            .get(&var)
            .map(|set| set.iter().filter(|&&v| v != value).count() as u128)
            .unwrap_or(0);

        (domain - 1).saturating_sub(excluded_others)
    }

    fn excluded(&self, var: VarId, value: u64) -> bool {
        self.exclusions
            .get(&var)
            .is_some_and(|set| set.contains(&value))
    }
}
