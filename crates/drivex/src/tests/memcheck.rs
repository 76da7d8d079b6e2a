use guest_machine::{Machine, StateId};

use crate::memcheck::{MemoryAccess, MemoryChecker};
use crate::tests::test_module;

fn fixture() -> (Machine, StateId, MemoryChecker) {
    let mut machine = Machine::new();
    let state = machine.create_state();
    (machine, state, MemoryChecker::default())
}

#[test]
fn revoke_by_tag_supports_exact_and_prefix_patterns() {
    let (mut machine, state, checker) = fixture();
    checker
        .grant(&mut machine, &state, None, 0x1000, 64, MemoryAccess::READ, "ndis:alloc:Nd")
        .unwrap();
    checker
        .grant(&mut machine, &state, None, 0x2000, 12, MemoryAccess::READ, "ndis:config")
        .unwrap();
    checker
        .grant(
            &mut machine,
            &state,
            None,
            0x3000,
            0xA8,
            MemoryAccess::READ | MemoryAccess::WRITE,
            "exerciser:DriverObject",
        )
        .unwrap();

    // Exact pattern leaves unrelated tags alone.
    assert_eq!(
        checker.revoke_tag(&mut machine, &state, "ndis:config").unwrap(),
        1
    );
    // Trailing `*` widens to a prefix match.
    assert_eq!(checker.revoke_tag(&mut machine, &state, "ndis:*").unwrap(), 1);

    let grants = checker.grants(&machine, &state);
    assert_eq!(grants.len(), 1);
    assert_eq!(grants[0].tag, "exerciser:DriverObject");
}

#[test]
fn revoke_by_base_reports_unmatched_frees() {
    let (mut machine, state, checker) = fixture();
    checker
        .grant(&mut machine, &state, None, 0x1000, 64, MemoryAccess::READ, "ndis:alloc:a")
        .unwrap();

    assert_eq!(checker.revoke_base(&mut machine, &state, 0x1000).unwrap(), 1);
    // Freeing a region the driver never owned revokes nothing.
    assert_eq!(checker.revoke_base(&mut machine, &state, 0x1000).unwrap(), 0);
}

#[test]
fn leaks_are_scoped_to_the_module() {
    let (mut machine, state, checker) = fixture();
    let module = test_module("driver.sys", 0x40_0000, vec![]);
    let other = test_module("other.sys", 0x90_0000, vec![]);

    // Attributed to the module, rooted elsewhere.
    checker
        .grant(
            &mut machine,
            &state,
            Some(&module),
            0x1000,
            64,
            MemoryAccess::READ,
            "ndis:alloc:X",
        )
        .unwrap();
    // Unattributed, but rooted inside the module's mapped range.
    checker
        .grant(
            &mut machine,
            &state,
            None,
            0x40_0800,
            16,
            MemoryAccess::READ,
            "ntoskrnl:pool:Tag1",
        )
        .unwrap();
    // Belongs to a different module entirely.
    checker
        .grant(
            &mut machine,
            &state,
            Some(&other),
            0x5000,
            32,
            MemoryAccess::READ,
            "ndis:alloc:Y",
        )
        .unwrap();

    let leaks = checker.leaks(&machine, &state, &module);
    assert_eq!(leaks.len(), 2);
    assert!(leaks.iter().any(|leak| leak.tag == "ndis:alloc:X"));
    assert!(leaks.iter().any(|leak| leak.tag == "ntoskrnl:pool:Tag1"));
}

#[test]
fn forked_branches_account_independently() {
    let (mut machine, state, checker) = fixture();
    checker
        .grant(&mut machine, &state, None, 0x1000, 64, MemoryAccess::READ, "ndis:alloc:a")
        .unwrap();

    let flag = machine.create_symbol(&state, "flag", 8).unwrap();
    let pair = machine.fork(state, flag.non_zero()).unwrap();

    checker
        .revoke_base(&mut machine, &pair.negative, 0x1000)
        .unwrap();

    assert_eq!(checker.grants(&machine, &pair.positive).len(), 1);
    assert!(checker.grants(&machine, &pair.negative).is_empty());
}
