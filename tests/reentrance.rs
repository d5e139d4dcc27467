//! Re-entrant scheduling: contracts creating and scheduling further
//! contracts into their own group while they execute.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use workcontract::{ScheduleResult, WorkContractGroup};

#[test]
fn fan_out_within_same_group() {
    // Capacity equals the child count: without the parent's slot returning
    // to the free pool before its callable runs, one child would fail.
    const CHILDREN: usize = 8;
    let group = WorkContractGroup::new(CHILDREN);

    let created_children = Arc::new(AtomicUsize::new(0));
    let created_failures = Arc::new(AtomicUsize::new(0));
    let executed_children = Arc::new(AtomicUsize::new(0));

    let parent = {
        let inner_group = Arc::clone(&group);
        let created_children = Arc::clone(&created_children);
        let created_failures = Arc::clone(&created_failures);
        let executed_children = Arc::clone(&executed_children);
        group
            .create_contract(move || {
                for _ in 0..CHILDREN {
                    let executed_children = Arc::clone(&executed_children);
                    match inner_group.create_contract(move || {
                        executed_children.fetch_add(1, Ordering::Relaxed);
                    }) {
                        Ok(child) => {
                            created_children.fetch_add(1, Ordering::Relaxed);
                            child.schedule();
                        }
                        Err(_) => {
                            created_failures.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
                // Deliberately no group.wait() in here: the parent itself
                // still counts as executing.
            })
            .unwrap()
    };

    assert!(parent.is_valid());
    assert_eq!(parent.schedule(), ScheduleResult::Scheduled);

    // Drains the parent first, then every child it scheduled.
    group.execute_all_background_work();

    assert_eq!(created_failures.load(Ordering::Relaxed), 0);
    assert_eq!(created_children.load(Ordering::Relaxed), CHILDREN);
    assert_eq!(executed_children.load(Ordering::Relaxed), CHILDREN);

    assert_eq!(group.scheduled_count(), 0);
    assert_eq!(group.executing_count(), 0);
    assert_eq!(group.active_count(), 0);
}

fn spawn_recursive(
    group: &Arc<WorkContractGroup>,
    depth: u32,
    max_depth: u32,
    created: &Arc<AtomicUsize>,
    executed: &Arc<AtomicUsize>,
) {
    executed.fetch_add(1, Ordering::Relaxed);
    if depth >= max_depth {
        return;
    }
    for _ in 0..2 {
        let child_group = Arc::clone(group);
        let child_created = Arc::clone(created);
        let child_executed = Arc::clone(executed);
        if let Ok(handle) = group.create_contract(move || {
            spawn_recursive(
                &child_group,
                depth + 1,
                max_depth,
                &child_created,
                &child_executed,
            );
        }) {
            created.fetch_add(1, Ordering::Relaxed);
            handle.schedule();
        }
    }
}

#[test]
fn recursive_creation_within_same_group() {
    // A depth-3 binary tree is 15 contracts worst-case; leave headroom.
    let group = WorkContractGroup::new(128);

    let created = Arc::new(AtomicUsize::new(0));
    let executed = Arc::new(AtomicUsize::new(0));

    let root = {
        let root_group = Arc::clone(&group);
        let root_created = Arc::clone(&created);
        let root_executed = Arc::clone(&executed);
        group
            .create_contract(move || {
                spawn_recursive(&root_group, 0, 3, &root_created, &root_executed);
            })
            .unwrap()
    };
    created.fetch_add(1, Ordering::Relaxed);
    assert_eq!(root.schedule(), ScheduleResult::Scheduled);

    group.execute_all_background_work();

    assert_eq!(
        executed.load(Ordering::Relaxed),
        created.load(Ordering::Relaxed)
    );
    assert_eq!(executed.load(Ordering::Relaxed), 15);

    assert_eq!(group.scheduled_count(), 0);
    assert_eq!(group.executing_count(), 0);
    assert_eq!(group.active_count(), 0);
}
