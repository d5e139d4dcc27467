//! Randomized stress: long interleavings of create/schedule/unschedule/drain
//! against one group, single-threaded and under worker contention. Seeded,
//! so failures replay.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::{Rng, SeedableRng};
use rand_xorshift::XorShiftRng;

use workcontract::{
    ScheduleResult, WorkContractGroup, WorkContractHandle, WorkService, WorkServiceConfig,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn randomized_single_thread_interleaving_balances_counters() {
    init_logging();
    let group = WorkContractGroup::new(64);
    let executed = Arc::new(AtomicUsize::new(0));
    let mut rng = XorShiftRng::seed_from_u64(0x9e37_79b9_7f4a_7c15);

    let mut handles: Vec<WorkContractHandle> = Vec::new();
    // Every contract whose schedule stuck (Scheduled, never unscheduled)
    // must run exactly once, whatever order the dice picked.
    let mut net_scheduled = 0usize;

    for _ in 0..5_000 {
        match rng.gen_range(0..5) {
            0 | 1 => {
                let executed = Arc::clone(&executed);
                if let Ok(handle) = group.create_contract(move || {
                    executed.fetch_add(1, Ordering::Relaxed);
                }) {
                    handles.push(handle);
                }
            }
            2 => {
                if !handles.is_empty() {
                    let pick = rng.gen_range(0..handles.len());
                    if handles[pick].schedule() == ScheduleResult::Scheduled {
                        net_scheduled += 1;
                    }
                }
            }
            3 => {
                if !handles.is_empty() {
                    let pick = rng.gen_range(0..handles.len());
                    if handles[pick].unschedule() {
                        net_scheduled -= 1;
                    }
                }
            }
            _ => {
                group.execute_all_background_work();
                // Stale names pile up; shed some so the pick stays mixed.
                if handles.len() > 128 {
                    handles.retain(|handle| handle.is_valid());
                }
            }
        }
    }

    // Whatever is still scheduled runs now.
    group.execute_all_background_work();
    group.wait();
    assert_eq!(executed.load(Ordering::Relaxed), net_scheduled);

    // Allocated-but-never-scheduled slots go back to the pool.
    for handle in &handles {
        handle.release();
    }

    assert_eq!(group.scheduled_count(), 0);
    assert_eq!(group.executing_count(), 0);
    assert_eq!(group.active_count(), 0);
}

#[test]
fn contended_producers_against_a_running_service() {
    init_logging();
    let service = WorkService::new(WorkServiceConfig {
        thread_count: 3,
        ..WorkServiceConfig::default()
    });
    let group = WorkContractGroup::new(256);
    service.add_work_contract_group(&group);
    service.start().unwrap();
    service.wait_until_primed();

    let executed = Arc::new(AtomicUsize::new(0));
    let created = Arc::new(AtomicUsize::new(0));

    let mut producers = Vec::new();
    for seed in 0..4u64 {
        let group = Arc::clone(&group);
        let executed = Arc::clone(&executed);
        let created = Arc::clone(&created);
        producers.push(std::thread::spawn(move || {
            let mut rng = XorShiftRng::seed_from_u64(0xdead_beef ^ seed);
            let mut remaining = 500;
            while remaining > 0 {
                if rng.gen_bool(0.7) {
                    let executed = Arc::clone(&executed);
                    match group.create_contract(move || {
                        executed.fetch_add(1, Ordering::Relaxed);
                    }) {
                        Ok(handle) => {
                            created.fetch_add(1, Ordering::Relaxed);
                            handle.schedule();
                            remaining -= 1;
                        }
                        Err(_) => {
                            // Capacity pressure; let the workers drain.
                            std::thread::yield_now();
                        }
                    }
                } else {
                    std::thread::yield_now();
                }
            }
        }));
    }
    for producer in producers {
        producer.join().unwrap();
    }

    group.wait();
    assert_eq!(created.load(Ordering::Relaxed), 2_000);
    assert_eq!(executed.load(Ordering::Relaxed), 2_000);
    assert_eq!(group.scheduled_count(), 0);
    assert_eq!(group.executing_count(), 0);
    assert_eq!(group.active_count(), 0);

    service.stop().unwrap();
}
