//! Generational handle safety across slot reuse and owner death.

use std::sync::Arc;

use workcontract::{resolve_owner, HandleOwner, ScheduleResult, WorkContractGroup};

#[test]
fn stale_handle_after_slot_reuse_fails_cleanly() {
    // Capacity 1 forces the second contract to reuse the first slot.
    let group = WorkContractGroup::new(1);

    let first = group.create_contract(|| {}).unwrap();
    assert!(first.is_valid());
    assert_eq!(first.schedule(), ScheduleResult::Scheduled);
    assert_eq!(group.execute_all_background_work(), 1);

    let second = group.create_contract(|| {}).unwrap();
    assert_eq!(second.index(), first.index());
    assert_ne!(second.generation(), first.generation());

    // The old name must not touch the slot's new occupant.
    assert!(!first.is_valid());
    assert_eq!(first.schedule(), ScheduleResult::Invalid);
    assert!(!first.unschedule());
    assert!(!first.release());

    assert!(second.is_valid());
    assert_eq!(second.schedule(), ScheduleResult::Scheduled);
    assert_eq!(group.execute_all_background_work(), 1);
}

#[test]
fn raw_handles_resolve_through_the_owner_registry() {
    let group = WorkContractGroup::new(4);
    let handle = group.create_contract(|| {}).unwrap();

    let raw = handle.raw();
    assert!(raw.is_valid());
    let owner = resolve_owner(&raw).expect("live handle must resolve");
    // The resolved owner is the group itself, retained.
    assert!(owner.validate(raw.index(), raw.generation()));
    drop(owner);

    handle.schedule();
    group.execute_all_background_work();
    assert!(!raw.is_valid());
    assert!(resolve_owner(&raw).is_none());
}

#[test]
fn handles_outlive_their_group_without_dangling() {
    let group = WorkContractGroup::new(4);
    let handle = group.create_contract(|| {}).unwrap();
    let raw = handle.raw();
    assert!(raw.is_valid());

    drop(group);

    assert!(!handle.is_valid());
    assert!(handle.group().is_none());
    assert_eq!(handle.schedule(), ScheduleResult::Invalid);
    assert!(!raw.is_valid());
    assert!(resolve_owner(&raw).is_none());
}

#[test]
fn resolving_retains_the_owner() {
    let group = WorkContractGroup::new(4);
    let handle = group.create_contract(|| {}).unwrap();
    let raw = handle.raw();

    let retained = resolve_owner(&raw).expect("live handle must resolve");
    let before = Arc::strong_count(&group);
    drop(group);
    assert!(before >= 2);

    // The registry row is gone with the last user Arc only after the
    // retained reference drops.
    assert!(retained.validate(raw.index(), raw.generation()));
    drop(retained);
    assert!(resolve_owner(&raw).is_none());
}

#[test]
fn null_and_cross_group_handles_never_validate() {
    let group_a = WorkContractGroup::new(4);
    let group_b = WorkContractGroup::new(4);
    let handle_a = group_a.create_contract(|| {}).unwrap();

    assert!(!workcontract::RawHandle::null().is_valid());

    // Same index, different owner: the raw forms are distinct names.
    let handle_b = group_b.create_contract(|| {}).unwrap();
    assert_eq!(handle_a.index(), handle_b.index());
    assert!(!handle_a.raw().same_slot(&handle_b.raw()));
}
