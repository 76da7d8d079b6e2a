use std::str::FromStr;

use crate::consistency::{ConsistencyModel, ConsistencyPolicy};

#[test]
fn models_parse_from_configuration_names() {
    assert_eq!(
        ConsistencyModel::from_str("strict").unwrap(),
        ConsistencyModel::Strict
    );
    assert_eq!(
        ConsistencyModel::from_str("local").unwrap(),
        ConsistencyModel::Local
    );
    assert_eq!(
        ConsistencyModel::from_str("overapproximate").unwrap(),
        ConsistencyModel::Overapprox
    );
    assert_eq!(
        ConsistencyModel::from_str("overconstrained").unwrap(),
        ConsistencyModel::Overconstrained
    );
    assert!(ConsistencyModel::from_str("eventual").is_err());
}

#[test]
fn override_wins_over_default() {
    let policy = ConsistencyPolicy::new(ConsistencyModel::Local)
        .with_override("NdisSetTimer", ConsistencyModel::Strict);

    assert_eq!(policy.resolve("NdisSetTimer"), ConsistencyModel::Strict);
    assert_eq!(policy.resolve("NdisAllocateMemory"), ConsistencyModel::Local);
}

#[test]
fn mentions_sees_default_and_overrides() {
    let policy = ConsistencyPolicy::new(ConsistencyModel::Strict)
        .with_override("Foo", ConsistencyModel::Overconstrained);

    assert!(policy.mentions(ConsistencyModel::Strict));
    assert!(policy.mentions(ConsistencyModel::Overconstrained));
    assert!(!policy.mentions(ConsistencyModel::Local));
}
