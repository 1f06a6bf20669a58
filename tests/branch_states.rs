//! Branch state transitions, rebase and merge rules.
//!
//! These tests verify that:
//! 1. Timestamps order every state decision
//! 2. Rebase is a no-op for UP_TO_DATE and FORWARD branches
//! 3. Only FORWARD branches can be merged
//! 4. Invariants hold under random operation sequences

use proptest::prelude::*;
use revision_branching::{
    AtomicTimestampAuthority, BranchError, BranchManager, BranchState, Timestamp,
    TimestampAuthority, MAIN_PATH,
};
use std::sync::Arc;

fn manager() -> BranchManager {
    BranchManager::new(Arc::new(AtomicTimestampAuthority::new())).unwrap()
}

fn commit(manager: &BranchManager, path: &str) -> Timestamp {
    let timestamp = manager.authority().get_timestamp().unwrap();
    manager.handle_commit(path, timestamp).unwrap();
    timestamp
}

// =============================================================================
// SCENARIOS
// =============================================================================

#[test]
fn test_task_branch_lifecycle() {
    let manager = manager();

    let a = manager.create_branch(MAIN_PATH, "a").unwrap();
    assert_eq!(a.base_timestamp(), Timestamp(1));
    assert_eq!(a.head_timestamp(), Timestamp(1));
    assert_eq!(manager.branch_state("MAIN/a").unwrap(), BranchState::UpToDate);

    commit(&manager, MAIN_PATH);
    assert_eq!(manager.branch_state("MAIN/a").unwrap(), BranchState::Behind);

    commit(&manager, "MAIN/a");
    assert_eq!(manager.branch_state("MAIN/a").unwrap(), BranchState::Diverged);

    assert!(matches!(
        manager.merge("MAIN/a", MAIN_PATH),
        Err(BranchError::Merge(_))
    ));

    let rebased = manager.rebase("MAIN/a").unwrap();
    assert!(rebased.base_timestamp() > Timestamp(3));
    assert_eq!(manager.branch_state("MAIN/a").unwrap(), BranchState::Forward);

    manager.merge("MAIN/a", MAIN_PATH).unwrap();
    assert_eq!(manager.branch_state("MAIN/a").unwrap(), BranchState::Diverged);
    assert_eq!(
        manager.branch_state_between(MAIN_PATH, "MAIN/a").unwrap(),
        BranchState::UpToDate
    );
}

#[test]
fn test_equality_ignores_head() {
    let manager = manager();
    let before = manager.create_branch(MAIN_PATH, "a").unwrap();
    commit(&manager, "MAIN/a");
    let after = manager.get_branch("MAIN/a").unwrap();

    assert_ne!(before.head_timestamp(), after.head_timestamp());
    assert_eq!(before, after);
}

#[test]
fn test_grandchild_stale_until_rebased() {
    let manager = manager();
    manager.create_branch(MAIN_PATH, "project").unwrap();
    manager.create_branch("MAIN/project", "task").unwrap();
    commit(&manager, "MAIN/project/task");

    commit(&manager, MAIN_PATH);
    manager.rebase("MAIN/project").unwrap();

    assert_eq!(
        manager.branch_state("MAIN/project/task").unwrap(),
        BranchState::Stale
    );
    assert!(matches!(
        manager.merge("MAIN/project/task", "MAIN/project"),
        Err(BranchError::Merge(_))
    ));

    // Own commits are kept across the rebase.
    let task = manager.rebase("MAIN/project/task").unwrap();
    assert!(task.has_commits());
    assert_eq!(
        manager.branch_state("MAIN/project/task").unwrap(),
        BranchState::Forward
    );
    manager.merge("MAIN/project/task", "MAIN/project").unwrap();
}

#[test]
fn test_sibling_comparison() {
    let manager = manager();
    manager.create_branch(MAIN_PATH, "a").unwrap();
    manager.create_branch(MAIN_PATH, "b").unwrap();
    commit(&manager, "MAIN/b");

    assert_eq!(
        manager.branch_state_between("MAIN/b", "MAIN/a").unwrap(),
        BranchState::Forward
    );
    assert_eq!(
        manager.branch_state_between("MAIN/a", "MAIN/b").unwrap(),
        BranchState::Stale
    );
}

#[test]
fn test_main_always_up_to_date() {
    let manager = manager();
    commit(&manager, MAIN_PATH);
    assert_eq!(manager.branch_state(MAIN_PATH).unwrap(), BranchState::UpToDate);
}

// =============================================================================
// PROPERTIES
// =============================================================================

#[derive(Clone, Debug)]
enum Op {
    Create(usize),
    Commit(usize),
    Rebase(usize),
    Merge(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        any::<usize>().prop_map(Op::Create),
        any::<usize>().prop_map(Op::Commit),
        any::<usize>().prop_map(Op::Rebase),
        any::<usize>().prop_map(Op::Merge),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: every operation keeps head >= base and follows the
    /// rebase and merge rules for the state it started from.
    #[test]
    fn branch_rules_hold(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let manager = manager();
        let mut created = 0;

        for op in ops {
            let branches = manager.get_branches();
            let pick = |i: usize| branches[i % branches.len()].clone();

            match op {
                Op::Create(i) => {
                    let parent = pick(i);
                    created += 1;
                    let branch = manager.create_branch(parent.path(), &format!("b{created}")).unwrap();
                    let parent = manager.get_branch(parent.path()).unwrap();
                    prop_assert!(branch.base_timestamp() > parent.head_timestamp());
                    prop_assert_eq!(manager.branch_state(branch.path()).unwrap(), BranchState::UpToDate);
                }
                Op::Commit(i) => {
                    let branch = pick(i);
                    let timestamp = manager.authority().get_timestamp().unwrap();
                    let updated = manager.handle_commit(branch.path(), timestamp).unwrap();
                    prop_assert_eq!(updated.head_timestamp(), timestamp);
                    prop_assert!(manager.handle_commit(branch.path(), timestamp).is_err());
                }
                Op::Rebase(i) => {
                    let branch = pick(i);
                    if branch.is_root() {
                        continue;
                    }
                    let before = manager.branch_state(branch.path()).unwrap();
                    let rebased = manager.rebase(branch.path()).unwrap();
                    let after = manager.branch_state(branch.path()).unwrap();

                    match before {
                        BranchState::UpToDate | BranchState::Forward => {
                            prop_assert_eq!(&rebased, &branch);
                            prop_assert_eq!(rebased.head_timestamp(), branch.head_timestamp());
                            prop_assert_eq!(after, before);
                        }
                        BranchState::Behind => {
                            prop_assert_eq!(after, BranchState::UpToDate);
                        }
                        BranchState::Diverged | BranchState::Stale => {
                            let expected = if branch.has_commits() {
                                BranchState::Forward
                            } else {
                                BranchState::UpToDate
                            };
                            prop_assert_eq!(after, expected);
                        }
                    }
                }
                Op::Merge(i) => {
                    let source = pick(i);
                    if source.is_root() {
                        continue;
                    }
                    let state = manager.branch_state(source.path()).unwrap();
                    let merged = manager.merge(source.path(), source.parent_path());
                    prop_assert_eq!(merged.is_ok(), state == BranchState::Forward);
                }
            }

            for branch in manager.get_branches() {
                prop_assert!(branch.head_timestamp() >= branch.base_timestamp());
            }
        }
    }
}
