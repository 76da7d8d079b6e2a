use crate::*;

#[test]
fn equality_binds_variable() {
    let selector = SymValue::variable("selector", 32);
    let mut constraints = ConstraintSet::new();
    constraints.add(selector.clone().equals(SymValue::concrete(5, 32)));

    assert!(constraints.is_feasible());
    assert_eq!(constraints.evaluate(&selector), Some(5));
}

#[test]
fn conflicting_bindings_are_infeasible() {
    let selector = SymValue::variable("selector", 32);
    let mut constraints = ConstraintSet::new();
    constraints.add(selector.clone().equals(SymValue::concrete(5, 32)));
    constraints.add(selector.equals(SymValue::concrete(6, 32)));

    assert!(!constraints.is_feasible());
}

#[test]
fn exclusion_then_binding_conflict() {
    let selector = SymValue::variable("selector", 32);
    let mut constraints = ConstraintSet::new();
    constraints.add(!selector.clone().equals(SymValue::concrete(5, 32)));
    assert!(constraints.is_feasible());

    constraints.add(selector.equals(SymValue::concrete(5, 32)));
    assert!(!constraints.is_feasible());
}

#[test]
fn bound_queries_evaluate() {
    let selector = SymValue::variable("selector", 32);
    let mut constraints = ConstraintSet::new();
    constraints.add(selector.clone().equals(SymValue::concrete(5, 32)));

    let same = selector.clone().equals(SymValue::concrete(5, 32));
    let other = selector.equals(SymValue::concrete(9, 32));
    assert!(constraints.may_be_true(&same).unwrap());
    assert!(constraints.must_be_false(&other).unwrap());
}

#[test]
fn free_variable_queries_are_satisfiable_both_ways() {
    let flag = SymValue::variable("flag", 8);
    let constraints = ConstraintSet::new();

    let set = flag.clone().equals(SymValue::concrete(1, 8));
    assert!(constraints.may_be_true(&set).unwrap());
    assert!(!constraints.must_be_false(&set).unwrap());
    assert!(constraints.may_be_true(&!flag.equals(SymValue::concrete(1, 8))).unwrap());
}

#[test]
fn excluded_value_queries_decide() {
    let selector = SymValue::variable("selector", 32);
    let mut constraints = ConstraintSet::new();
    constraints.add(!selector.clone().equals(SymValue::concrete(3, 32)));

    let excluded = selector.clone().equals(SymValue::concrete(3, 32));
    let open = selector.equals(SymValue::concrete(4, 32));
    assert!(constraints.must_be_false(&excluded).unwrap());
    assert!(constraints.may_be_true(&open).unwrap());
}

#[test]
fn one_bit_domain_exhausts() {
    let bit = SymValue::variable("bit", 1);
    let mut constraints = ConstraintSet::new();
    constraints.add(!bit.clone().equals(SymValue::concrete(1, 1)));

    // Only 0 remains, so "bit != 0" cannot be satisfied.
    let nonzero = bit.non_zero();
    assert!(constraints.must_be_false(&nonzero).unwrap());
}

#[test]
fn opaque_queries_are_undecidable() {
    let x = SymValue::variable("x", 32);
    let y = SymValue::variable("y", 32);
    let mut constraints = ConstraintSet::new();

    // Variable-to-variable equality cannot be folded.
    constraints.add(x.clone().equals(y));
    assert!(constraints.is_feasible());

    let query = x.equals(SymValue::concrete(0, 32));
    assert!(matches!(
        constraints.may_be_true(&query),
        Err(Error::Undecidable(_))
    ));
}

#[test]
fn select_evaluates_under_bindings() {
    let flag = SymValue::variable("success", 8);
    let address = SymValue::concrete(0x1000, 32);
    let zero = SymValue::concrete(0, 32);
    let selected = SymValue::select(flag.clone().non_zero(), address, zero);

    let mut constraints = ConstraintSet::new();
    assert_eq!(constraints.evaluate(&selected), None);

    constraints.add(flag.equals(SymValue::concrete(1, 8)));
    assert_eq!(constraints.evaluate(&selected), Some(0x1000));
}
