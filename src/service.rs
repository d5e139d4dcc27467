//! The work service: a pool of worker threads draining registered groups.
//!
//! Workers rotate round-robin over the attached groups, take one background
//! contract per visit, and park on the shared eventcount after a fruitless
//! full rotation. Groups wake a worker per newly scheduled item. There is no
//! stealing and no priority; fairness is the rotation plus each group's own
//! cursor spreading.
//!
//! The service holds `Weak` rows to its groups and upgrades (retains) for
//! the duration of one selection pass. A group dropped while attached is
//! simply never touched again; its row prunes away on the next admin call
//! or idle rotation, so drop-without-remove is safe by construction.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::error::{GroupOperationStatus, ServiceError};
use crate::group::WorkContractGroup;
use crate::job::ExecutionKind;
use crate::latch::{CountLatch, LockLatch};
use crate::sleep::Sleep;
use crate::unwind;

/// A callback observing worker-thread starts and exits; receives the worker
/// index within `0..thread_count`.
pub type ThreadLifecycleHandler = dyn Fn(usize) + Send + Sync;

/// Work service configuration.
#[derive(Clone)]
pub struct WorkServiceConfig {
    /// Worker threads to spawn; 0 auto-detects the hardware concurrency.
    pub thread_count: usize,
    /// Worker threads are named `"{prefix}-{index}"`.
    pub thread_name_prefix: String,
    /// How long `stop` waits for workers to finish in-flight callables
    /// before detaching them with a warning.
    pub shutdown_deadline: Duration,
    /// Invoked on each worker thread right after it starts.
    pub start_handler: Option<Arc<ThreadLifecycleHandler>>,
    /// Invoked on each worker thread right before it exits.
    pub exit_handler: Option<Arc<ThreadLifecycleHandler>>,
}

impl Default for WorkServiceConfig {
    fn default() -> Self {
        Self {
            thread_count: 0,
            thread_name_prefix: "workcontract-worker".to_string(),
            shutdown_deadline: Duration::from_secs(5),
            start_handler: None,
            exit_handler: None,
        }
    }
}

impl fmt::Debug for WorkServiceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkServiceConfig")
            .field("thread_count", &self.thread_count)
            .field("thread_name_prefix", &self.thread_name_prefix)
            .field("shutdown_deadline", &self.shutdown_deadline)
            .field("start_handler", &self.start_handler.is_some())
            .field("exit_handler", &self.exit_handler.is_some())
            .finish()
    }
}

/// Aggregate result of a service-level main-thread drain.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MainThreadWorkResult {
    /// Contracts executed across all attached groups.
    pub contracts_executed: usize,
    /// Groups that had main-thread work published when visited.
    pub groups_with_work: usize,
}

/// State shared between the service façade and its worker threads.
struct ServiceCore {
    groups: RwLock<Vec<Weak<WorkContractGroup>>>,
    sleep: Arc<Sleep>,
    running: AtomicBool,
    config: WorkServiceConfig,
}

impl ServiceCore {
    /// Snapshot the live groups, retaining each for the caller's use.
    /// Prunes dead rows when any are found.
    fn live_groups(&self) -> Vec<Arc<WorkContractGroup>> {
        let groups = self.groups.read();
        let live: Vec<_> = groups.iter().filter_map(Weak::upgrade).collect();
        let dead = groups.len() - live.len();
        drop(groups);
        if dead > 0 {
            self.groups.write().retain(|row| row.strong_count() > 0);
        }
        live
    }
}

/// A pool of worker threads that drains one or more [`WorkContractGroup`]s.
pub struct WorkService {
    core: Arc<ServiceCore>,
    thread_count: usize,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
    primed: Mutex<Vec<Arc<LockLatch>>>,
    stopped: Mutex<Option<Arc<CountLatch>>>,
}

impl WorkService {
    pub fn new(config: WorkServiceConfig) -> Self {
        let thread_count = if config.thread_count == 0 {
            num_cpus::get()
        } else {
            config.thread_count
        };
        Self {
            core: Arc::new(ServiceCore {
                groups: RwLock::new(Vec::new()),
                sleep: Arc::new(Sleep::new()),
                running: AtomicBool::new(false),
                config,
            }),
            thread_count,
            threads: Mutex::new(Vec::new()),
            primed: Mutex::new(Vec::new()),
            stopped: Mutex::new(None),
        }
    }

    /// Number of worker threads this service runs with.
    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    pub fn is_running(&self) -> bool {
        self.core.running.load(Ordering::Acquire)
    }

    /// Spawns the worker threads.
    pub fn start(&self) -> Result<(), ServiceError> {
        if self.core.running.swap(true, Ordering::AcqRel) {
            return Err(ServiceError::AlreadyRunning);
        }
        let latch = Arc::new(CountLatch::new(self.thread_count));
        *self.stopped.lock() = Some(Arc::clone(&latch));

        let mut threads = self.threads.lock();
        let mut primed = self.primed.lock();
        primed.clear();
        for index in 0..self.thread_count {
            let core = Arc::clone(&self.core);
            let latch = Arc::clone(&latch);
            let primed_latch = Arc::new(LockLatch::new());
            primed.push(Arc::clone(&primed_latch));
            let name = format!("{}-{}", self.core.config.thread_name_prefix, index);
            let handle = thread::Builder::new()
                .name(name)
                .spawn(move || worker_main(core, index, primed_latch, latch))
                .expect("failed to spawn worker thread");
            threads.push(handle);
        }
        Ok(())
    }

    /// Blocks until every worker thread has entered its main loop. Useful
    /// for benchmarking against a fully spun-up pool.
    pub fn wait_until_primed(&self) {
        let primed: Vec<Arc<LockLatch>> = self.primed.lock().clone();
        for latch in primed {
            latch.wait();
        }
    }

    /// Signals workers to finish and joins them within the configured
    /// shutdown deadline. In-flight callables are never interrupted;
    /// overshooting the deadline logs a warning and detaches the stragglers.
    pub fn stop(&self) -> Result<(), ServiceError> {
        if !self.core.running.swap(false, Ordering::AcqRel) {
            return Err(ServiceError::NotRunning);
        }
        self.core.sleep.wake_all();

        let latch = self.stopped.lock().take();
        let mut threads = self.threads.lock();
        let exited = latch.map_or(true, |latch| {
            latch.wait_for(self.core.config.shutdown_deadline)
        });
        if exited {
            for handle in threads.drain(..) {
                let _ = handle.join();
            }
        } else {
            log::warn!(
                "work service overshot its shutdown deadline ({:?}); detaching {} worker(s)",
                self.core.config.shutdown_deadline,
                threads.len()
            );
            threads.clear();
        }
        Ok(())
    }

    /// Registers a group as a work provider. Idempotent per group.
    pub fn add_work_contract_group(
        &self,
        group: &Arc<WorkContractGroup>,
    ) -> GroupOperationStatus {
        let mut groups = self.core.groups.write();
        groups.retain(|row| row.strong_count() > 0);
        if groups
            .iter()
            .any(|row| row.as_ptr() == Arc::as_ptr(group))
        {
            return GroupOperationStatus::Exists;
        }
        groups.push(Arc::downgrade(group));
        drop(groups);
        group.attach_waker(&self.core.sleep);
        // New provider: give every parked worker a fresh look.
        self.core.sleep.wake_all();
        GroupOperationStatus::Added
    }

    /// Unregisters a group and releases the service's interest in it.
    pub fn remove_work_contract_group(
        &self,
        group: &Arc<WorkContractGroup>,
    ) -> GroupOperationStatus {
        let mut groups = self.core.groups.write();
        let before = groups.len();
        groups.retain(|row| row.as_ptr() != Arc::as_ptr(group));
        let removed = groups.len() != before;
        drop(groups);
        if removed {
            group.detach_waker(&self.core.sleep);
            GroupOperationStatus::Removed
        } else {
            GroupOperationStatus::NotFound
        }
    }

    /// Detaches every group.
    pub fn clear(&self) {
        let rows: Vec<_> = std::mem::take(&mut *self.core.groups.write());
        for row in rows {
            if let Some(group) = row.upgrade() {
                group.detach_waker(&self.core.sleep);
            }
        }
    }

    /// Number of live groups currently attached. Dead rows (groups dropped
    /// without an explicit remove) are pruned on the way.
    pub fn work_contract_group_count(&self) -> usize {
        self.core.live_groups().len()
    }

    /// True when any attached group has main-thread work published.
    pub fn has_main_thread_work(&self) -> bool {
        self.core
            .live_groups()
            .iter()
            .any(|group| group.has_main_thread_work())
    }

    /// Drains main-thread work across attached groups on the calling thread,
    /// up to `budget` contracts when one is given.
    pub fn execute_main_thread_work(&self, budget: Option<usize>) -> MainThreadWorkResult {
        let mut result = MainThreadWorkResult::default();
        for group in self.core.live_groups() {
            let remaining = budget.map(|budget| budget - result.contracts_executed);
            if remaining == Some(0) {
                break;
            }
            if !group.has_main_thread_work() {
                continue;
            }
            result.groups_with_work += 1;
            result.contracts_executed += group.execute_main_thread_work(remaining);
        }
        result
    }
}

impl Drop for WorkService {
    fn drop(&mut self) {
        let _ = self.stop();
        self.clear();
    }
}

impl fmt::Debug for WorkService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkService")
            .field("thread_count", &self.thread_count)
            .field("running", &self.is_running())
            .field("groups", &self.core.live_groups().len())
            .finish()
    }
}

/// The worker main loop: rotate over the groups, take one contract per
/// visit, park when a full rotation comes up empty.
fn worker_main(
    core: Arc<ServiceCore>,
    index: usize,
    primed: Arc<LockLatch>,
    stopped: Arc<CountLatch>,
) {
    // Scheduler bugs must not unwind through the pool; user-callable panics
    // are already caught at the group's execution shim.
    let abort_guard = unwind::AbortIfPanic;

    if let Some(handler) = &core.config.start_handler {
        handler(index);
    }
    primed.set();

    let mut cursor = index;
    while core.running.load(Ordering::Acquire) {
        let token = core.sleep.prepare();
        let groups = core.live_groups();

        let mut found = false;
        for offset in 0..groups.len() {
            let group = &groups[(cursor + offset) % groups.len()];
            if group.execute_one(ExecutionKind::AnyThread, cursor) {
                found = true;
                break;
            }
        }
        // Advance the rotation so the next scan starts one group over,
        // whether or not this one produced work.
        cursor = cursor.wrapping_add(1);

        if !found {
            drop(groups);
            // Re-check the run flag after taking the token: a stop that
            // landed before `prepare` has already consumed its wake, and
            // parking here would strand the thread.
            if core.running.load(Ordering::Acquire) {
                core.sleep.sleep(token);
            }
        }
    }

    if let Some(handler) = &core.config.exit_handler {
        handler(index);
    }

    stopped.count_down();
    std::mem::forget(abort_guard);
}
