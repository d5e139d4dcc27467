//! Work contract groups: capacity-bounded slabs of schedulable work.
//!
//! A group owns a fixed array of slots. Creating a contract claims a free
//! slot and stores the callable; scheduling publishes the slot into a
//! per-kind selection bitset; selection claims one published slot and runs
//! it. The hot paths (create, schedule, select) touch only atomics; the
//! group's locks sit on the wait path and the service-attachment admin path.
//!
//! Re-entrance is the load-bearing property: when a regular contract is
//! selected, its callable is moved onto the selecting thread's stack and the
//! slot returns to the free pool *before* the callable runs, so work running
//! inside the group can create and schedule further contracts up to full
//! capacity. Yieldable contracts are the exception: they keep their slot
//! (state `Executing`) across yields so the same callable can run again.

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_utils::CachePadded;
use once_cell::sync::OnceCell;
use parking_lot::{Condvar, Mutex};

use crate::bitset::{AtomicBitSet, BITS_PER_BLOCK};
use crate::error::{CreateContractError, ScheduleResult};
use crate::handle::{self, bump_generation, HandleOwner, OwnerId, RawHandle, FIRST_GENERATION};
use crate::job::{ExecutionKind, Work, WorkResult};
use crate::sleep::Sleep;
use crate::unwind;
use crate::PanicHandler;

/// Slot states. `EXECUTING` is only ever observed for yieldable contracts;
/// a regular contract's slot is already back to `FREE` while its callable
/// runs.
mod state {
    pub(super) const FREE: u32 = 0;
    pub(super) const ALLOCATED: u32 = 1;
    pub(super) const SCHEDULED: u32 = 2;
    pub(super) const EXECUTING: u32 = 3;
    pub(super) const COMPLETING: u32 = 4;
}

/// Generation and state live in one word so every transition compares both
/// at once; a recycled slot can never be confused for its predecessor by a
/// state-only CAS.
fn pack(generation: u32, state: u32) -> u64 {
    (u64::from(generation) << 32) | u64::from(state)
}

fn generation_of(meta: u64) -> u32 {
    (meta >> 32) as u32
}

fn state_of(meta: u64) -> u32 {
    meta as u32
}

struct Slot {
    meta: AtomicU64,
    main_thread: AtomicBool,
    yieldable: AtomicBool,
    /// The callable. Written by the allocating thread before the slot is
    /// published as `ALLOCATED`, and moved out by whichever thread owns the
    /// slot's current exclusive transition (selection, release, yield
    /// re-entry). The state machine is what makes this sound: at most one
    /// thread holds such a transition at a time, and the Release/Acquire
    /// pairs on `meta` order the cell accesses.
    work: UnsafeCell<Option<Work>>,
}

unsafe impl Sync for Slot {}

impl Slot {
    fn new() -> Self {
        Self {
            meta: AtomicU64::new(pack(FIRST_GENERATION, state::FREE)),
            main_thread: AtomicBool::new(false),
            yieldable: AtomicBool::new(false),
            work: UnsafeCell::new(None),
        }
    }

    fn kind(&self) -> ExecutionKind {
        if self.main_thread.load(Ordering::Relaxed) {
            ExecutionKind::MainThread
        } else {
            ExecutionKind::AnyThread
        }
    }
}

fn kind_index(kind: ExecutionKind) -> usize {
    match kind {
        ExecutionKind::AnyThread => 0,
        ExecutionKind::MainThread => 1,
    }
}

/// A capacity-bounded container of work contracts.
///
/// Construction hands back an `Arc`; services and handles hold `Weak`
/// references, so dropping the last owning `Arc` detaches the group from
/// every attached service without further ceremony.
pub struct WorkContractGroup {
    name: Option<String>,
    capacity: usize,
    slots: Box<[Slot]>,
    /// Free pool: a set bit means the slot can be claimed by `create_contract`.
    free: AtomicBitSet,
    /// Published work, one set per [`ExecutionKind`] so a service worker can
    /// never select main-thread work.
    scheduled_sets: [AtomicBitSet; 2],
    active: CachePadded<AtomicUsize>,
    scheduled: [CachePadded<AtomicUsize>; 2],
    executing: [CachePadded<AtomicUsize>; 2],
    alloc_cursor: CachePadded<AtomicUsize>,
    idle_lock: Mutex<()>,
    idle_condvar: Condvar,
    panic_handler: Mutex<Option<Arc<PanicHandler>>>,
    /// Sleep handles of attached services; scheduling background work wakes
    /// one worker per newly published item.
    wakers: Mutex<Vec<Weak<Sleep>>>,
    owner_id: OnceCell<OwnerId>,
    weak_self: Weak<WorkContractGroup>,
}

impl WorkContractGroup {
    /// Creates a group with room for `capacity` contracts.
    pub fn new(capacity: usize) -> Arc<Self> {
        Self::build(capacity, None)
    }

    /// Creates a named group; the name shows up in `Debug` output and log
    /// lines only.
    pub fn with_name(capacity: usize, name: impl Into<String>) -> Arc<Self> {
        Self::build(capacity, Some(name.into()))
    }

    fn build(capacity: usize, name: Option<String>) -> Arc<Self> {
        assert!(capacity > 0, "group capacity must be non-zero");
        let bits = capacity.div_ceil(BITS_PER_BLOCK) * BITS_PER_BLOCK;
        let group = Arc::new_cyclic(|weak| Self {
            name,
            capacity,
            slots: (0..capacity).map(|_| Slot::new()).collect(),
            free: AtomicBitSet::new_first_set(bits, capacity),
            scheduled_sets: [AtomicBitSet::new(bits), AtomicBitSet::new(bits)],
            active: CachePadded::new(AtomicUsize::new(0)),
            scheduled: [
                CachePadded::new(AtomicUsize::new(0)),
                CachePadded::new(AtomicUsize::new(0)),
            ],
            executing: [
                CachePadded::new(AtomicUsize::new(0)),
                CachePadded::new(AtomicUsize::new(0)),
            ],
            alloc_cursor: CachePadded::new(AtomicUsize::new(0)),
            idle_lock: Mutex::new(()),
            idle_condvar: Condvar::new(),
            panic_handler: Mutex::new(None),
            wakers: Mutex::new(Vec::new()),
            owner_id: OnceCell::new(),
            weak_self: weak.clone(),
        });
        let id = handle::register_owner(&group);
        group
            .owner_id
            .set(id)
            .expect("owner id assigned exactly once");
        group
    }

    /// Number of contracts the group can hold.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Installs the hook that observes callable panics and yieldable
    /// failures. The default hook logs at error level.
    pub fn set_panic_handler<H>(&self, handler: H)
    where
        H: Fn(Box<dyn std::any::Any + Send>) + Send + Sync + 'static,
    {
        *self.panic_handler.lock() = Some(Arc::new(handler));
    }

    /// Creates an [`ExecutionKind::AnyThread`] contract.
    pub fn create_contract<F>(&self, f: F) -> Result<WorkContractHandle, CreateContractError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.create_contract_with_kind(f, ExecutionKind::AnyThread)
    }

    /// Creates a contract with an explicit execution kind.
    pub fn create_contract_with_kind<F>(
        &self,
        f: F,
        kind: ExecutionKind,
    ) -> Result<WorkContractHandle, CreateContractError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.allocate(Work::Once(Box::new(f)), kind)
    }

    /// Creates a yieldable contract: the callable may return
    /// [`WorkResult::Yield`] to be run again without releasing its slot.
    pub fn create_yieldable_contract<F>(
        &self,
        f: F,
        kind: ExecutionKind,
    ) -> Result<WorkContractHandle, CreateContractError>
    where
        F: FnMut() -> WorkResult + Send + 'static,
    {
        self.allocate(Work::Yieldable(Box::new(f)), kind)
    }

    fn allocate(
        &self,
        work: Work,
        kind: ExecutionKind,
    ) -> Result<WorkContractHandle, CreateContractError> {
        let cursor = self.alloc_cursor.fetch_add(1, Ordering::Relaxed);
        let index = self
            .free
            .try_acquire(cursor)
            .ok_or(CreateContractError::CapacityExceeded)?;
        let slot = &self.slots[index];
        let meta = slot.meta.load(Ordering::Acquire);
        debug_assert_eq!(state_of(meta), state::FREE);
        let generation = generation_of(meta);

        let yieldable = work.is_yieldable();
        // SAFETY: owning the free bit gives this thread the slot's exclusive
        // transition; nothing else touches the cell until ALLOCATED is
        // published below.
        unsafe {
            *slot.work.get() = Some(work);
        }
        slot.main_thread
            .store(kind == ExecutionKind::MainThread, Ordering::Relaxed);
        slot.yieldable.store(yieldable, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
        slot.meta
            .store(pack(generation, state::ALLOCATED), Ordering::Release);

        Ok(WorkContractHandle {
            group: self.weak_self.clone(),
            index: index as u32,
            generation,
        })
    }

    /// Publishes an allocated contract for execution. Linearizable per slot:
    /// exactly one caller gets [`ScheduleResult::Scheduled`] per generation.
    pub fn schedule(&self, handle: &WorkContractHandle) -> ScheduleResult {
        if !handle.belongs_to(self) {
            return ScheduleResult::Invalid;
        }
        self.schedule_slot(handle.index as usize, handle.generation)
    }

    pub(crate) fn schedule_slot(&self, index: usize, generation: u32) -> ScheduleResult {
        let Some(slot) = self.slots.get(index) else {
            return ScheduleResult::Invalid;
        };
        let kind = slot.kind();
        let k = kind_index(kind);

        // Count before the slot becomes selectable so a racing selector can
        // never decrement below zero; undone if the CAS loses.
        self.scheduled[k].fetch_add(1, Ordering::Relaxed);
        match slot.meta.compare_exchange(
            pack(generation, state::ALLOCATED),
            pack(generation, state::SCHEDULED),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                self.scheduled_sets[k].set(index);
                if kind == ExecutionKind::AnyThread {
                    self.wake_services();
                }
                ScheduleResult::Scheduled
            }
            Err(observed) => {
                self.scheduled[k].fetch_sub(1, Ordering::Relaxed);
                self.signal_if_idle();
                if generation_of(observed) != generation {
                    ScheduleResult::Invalid
                } else {
                    match state_of(observed) {
                        state::SCHEDULED | state::EXECUTING => ScheduleResult::AlreadyScheduled,
                        state::FREE | state::COMPLETING => ScheduleResult::Invalid,
                        _ => ScheduleResult::NotScheduled,
                    }
                }
            }
        }
    }

    /// Best-effort cancellation of a scheduled-but-unselected contract.
    /// Returns false once selection has already claimed the slot.
    pub fn unschedule(&self, handle: &WorkContractHandle) -> bool {
        if !handle.belongs_to(self) {
            return false;
        }
        let index = handle.index as usize;
        let Some(slot) = self.slots.get(index) else {
            return false;
        };
        if slot
            .meta
            .compare_exchange(
                pack(handle.generation, state::SCHEDULED),
                pack(handle.generation, state::ALLOCATED),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }
        let k = kind_index(slot.kind());
        self.scheduled_sets[k].clear(index);
        self.scheduled[k].fetch_sub(1, Ordering::Relaxed);
        self.signal_if_idle();
        true
    }

    /// Releases an allocated contract that will never be scheduled, freeing
    /// its slot. Returns false if the slot has moved on.
    pub fn release(&self, handle: &WorkContractHandle) -> bool {
        if !handle.belongs_to(self) {
            return false;
        }
        let index = handle.index as usize;
        let Some(slot) = self.slots.get(index) else {
            return false;
        };
        if slot
            .meta
            .compare_exchange(
                pack(handle.generation, state::ALLOCATED),
                pack(handle.generation, state::COMPLETING),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }
        // SAFETY: the COMPLETING transition above grants exclusive access.
        unsafe {
            (*slot.work.get()).take();
        }
        self.retire_slot(slot, index, handle.generation);
        true
    }

    /// Selects and runs one published contract of `kind` on the calling
    /// thread. Returns false when no work of that kind is available.
    pub(crate) fn execute_one(&self, kind: ExecutionKind, cursor: usize) -> bool {
        let k = kind_index(kind);
        loop {
            let Some(index) = self.scheduled_sets[k].try_acquire(cursor) else {
                return false;
            };
            let slot = &self.slots[index];
            let meta = slot.meta.load(Ordering::Acquire);
            if state_of(meta) != state::SCHEDULED {
                // Stale bit: the slot was unscheduled, released, or has been
                // recycled since the bit was set. Skip it.
                continue;
            }
            let generation = generation_of(meta);
            if slot
                .meta
                .compare_exchange(
                    pack(generation, state::SCHEDULED),
                    pack(generation, state::EXECUTING),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                continue;
            }
            if slot.kind() != kind {
                // A stale bit handed us a recycled slot of the other kind.
                // Hand it back: restore the state first so the re-set bit
                // always points at a selectable slot.
                slot.meta
                    .store(pack(generation, state::SCHEDULED), Ordering::Release);
                self.scheduled_sets[kind_index(slot.kind())].set(index);
                continue;
            }

            self.run_claimed(slot, index, k, generation);
            return true;
        }
    }

    /// Runs a claimed slot. On entry the slot is `EXECUTING` and owned by
    /// this thread.
    fn run_claimed(&self, slot: &Slot, index: usize, k: usize, generation: u32) {
        // Executing goes up before scheduled comes down so `wait` can never
        // observe both at zero mid-handoff.
        self.executing[k].fetch_add(1, Ordering::Relaxed);
        self.scheduled[k].fetch_sub(1, Ordering::Relaxed);

        // SAFETY: the EXECUTING transition grants exclusive access.
        let work = unsafe { (*slot.work.get()).take() };
        match work {
            Some(Work::Once(f)) => {
                // Free the slot before running so the callable can re-enter
                // the group up to full capacity.
                self.retire_slot(slot, index, generation);
                let result = unwind::halt_unwinding(f);
                self.executing[k].fetch_sub(1, Ordering::Relaxed);
                self.signal_if_idle();
                if let Err(payload) = result {
                    self.handle_panic(payload);
                }
            }
            Some(Work::Yieldable(mut f)) => {
                let result = unwind::halt_unwinding(&mut f);
                match result {
                    Ok(WorkResult::Yield) | Ok(WorkResult::YieldUntil(_)) => {
                        // Deadline parking is a graph-level feature; a bare
                        // group re-publishes immediately either way.
                        // SAFETY: still EXECUTING, still exclusively ours.
                        unsafe {
                            *slot.work.get() = Some(Work::Yieldable(f));
                        }
                        self.scheduled[k].fetch_add(1, Ordering::Relaxed);
                        slot.meta
                            .store(pack(generation, state::SCHEDULED), Ordering::Release);
                        self.scheduled_sets[k].set(index);
                        if k == kind_index(ExecutionKind::AnyThread) {
                            self.wake_services();
                        }
                        self.executing[k].fetch_sub(1, Ordering::Relaxed);
                        self.signal_if_idle();
                    }
                    Ok(WorkResult::Complete) => {
                        drop(f);
                        self.retire_slot(slot, index, generation);
                        self.executing[k].fetch_sub(1, Ordering::Relaxed);
                        self.signal_if_idle();
                    }
                    Ok(WorkResult::Fail(err)) => {
                        drop(f);
                        self.retire_slot(slot, index, generation);
                        self.executing[k].fetch_sub(1, Ordering::Relaxed);
                        self.signal_if_idle();
                        self.handle_panic(Box::new(err));
                    }
                    Err(payload) => {
                        drop(f);
                        self.retire_slot(slot, index, generation);
                        self.executing[k].fetch_sub(1, Ordering::Relaxed);
                        self.signal_if_idle();
                        self.handle_panic(payload);
                    }
                }
            }
            None => {
                // Unreachable by construction; restore accounting anyway so a
                // logic error cannot wedge `wait`.
                debug_assert!(false, "claimed slot had no work");
                self.retire_slot(slot, index, generation);
                self.executing[k].fetch_sub(1, Ordering::Relaxed);
                self.signal_if_idle();
            }
        }
    }

    /// Bumps the generation and returns the slot to the free pool. Stale
    /// handles fail the generation compare from here on.
    fn retire_slot(&self, slot: &Slot, index: usize, generation: u32) {
        slot.meta.store(
            pack(bump_generation(generation), state::FREE),
            Ordering::Release,
        );
        self.active.fetch_sub(1, Ordering::Relaxed);
        self.free.set(index);
    }

    /// Drains every schedulable [`ExecutionKind::AnyThread`] contract on the
    /// calling thread, including contracts scheduled re-entrantly while the
    /// drain runs. Returns the number executed.
    pub fn execute_all_background_work(&self) -> usize {
        let mut executed = 0;
        while self.execute_one(ExecutionKind::AnyThread, executed) {
            executed += 1;
        }
        executed
    }

    /// Drains every schedulable [`ExecutionKind::MainThread`] contract on the
    /// calling thread. Returns the number executed.
    pub fn execute_all_main_thread_work(&self) -> usize {
        self.execute_main_thread_work(None)
    }

    /// Like [`execute_all_main_thread_work`](Self::execute_all_main_thread_work)
    /// but stops after `limit` contracts when a budget is given.
    pub fn execute_main_thread_work(&self, limit: Option<usize>) -> usize {
        let mut executed = 0;
        while limit.map_or(true, |limit| executed < limit)
            && self.execute_one(ExecutionKind::MainThread, executed)
        {
            executed += 1;
        }
        executed
    }

    /// True when main-thread work is currently published.
    pub fn has_main_thread_work(&self) -> bool {
        self.main_thread_scheduled_count() > 0
    }

    /// Blocks until nothing is scheduled and nothing is executing.
    pub fn wait(&self) {
        let mut guard = self.idle_lock.lock();
        while !self.is_idle() {
            self.idle_condvar.wait(&mut guard);
        }
    }

    fn is_idle(&self) -> bool {
        self.scheduled_count() == 0 && self.executing_count() == 0
    }

    fn signal_if_idle(&self) {
        if self.is_idle() {
            let guard = self.idle_lock.lock();
            drop(guard);
            self.idle_condvar.notify_all();
        }
    }

    /// Slots not currently free.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Contracts published and awaiting selection, both kinds.
    pub fn scheduled_count(&self) -> usize {
        self.scheduled[0].load(Ordering::Acquire) + self.scheduled[1].load(Ordering::Acquire)
    }

    /// Contracts currently running, both kinds.
    pub fn executing_count(&self) -> usize {
        self.executing[0].load(Ordering::Acquire) + self.executing[1].load(Ordering::Acquire)
    }

    pub fn main_thread_scheduled_count(&self) -> usize {
        self.scheduled[kind_index(ExecutionKind::MainThread)].load(Ordering::Acquire)
    }

    pub fn main_thread_executing_count(&self) -> usize {
        self.executing[kind_index(ExecutionKind::MainThread)].load(Ordering::Acquire)
    }

    /// Routes a failure payload from a graph shim into the group's hook.
    pub(crate) fn report_failure(&self, payload: Box<dyn std::any::Any + Send>) {
        self.handle_panic(payload);
    }

    fn handle_panic(&self, payload: Box<dyn std::any::Any + Send>) {
        let handler = self.panic_handler.lock().clone();
        match handler {
            Some(handler) => {
                // A panic inside the hook itself would corrupt scheduler
                // state; abort instead.
                let abort_guard = unwind::AbortIfPanic;
                handler(payload);
                std::mem::forget(abort_guard);
            }
            None => {
                log::error!(
                    "work contract in group {:?} failed: {}",
                    self.name.as_deref().unwrap_or("<unnamed>"),
                    payload_message(&payload)
                );
            }
        }
    }

    pub(crate) fn attach_waker(&self, sleep: &Arc<Sleep>) {
        let mut wakers = self.wakers.lock();
        wakers.retain(|waker| waker.strong_count() > 0);
        if !wakers.iter().any(|waker| waker.as_ptr() == Arc::as_ptr(sleep)) {
            wakers.push(Arc::downgrade(sleep));
        }
    }

    pub(crate) fn detach_waker(&self, sleep: &Arc<Sleep>) {
        self.wakers
            .lock()
            .retain(|waker| waker.as_ptr() != Arc::as_ptr(sleep));
    }

    fn wake_services(&self) {
        let wakers: Vec<Arc<Sleep>> = {
            let wakers = self.wakers.lock();
            wakers.iter().filter_map(Weak::upgrade).collect()
        };
        for waker in wakers {
            waker.wake_one();
        }
    }

    pub(crate) fn owner_id(&self) -> OwnerId {
        *self.owner_id.get().expect("owner id set at construction")
    }
}

impl HandleOwner for WorkContractGroup {
    fn validate(&self, index: u32, generation: u32) -> bool {
        match self.slots.get(index as usize) {
            Some(slot) => {
                let meta = slot.meta.load(Ordering::Acquire);
                generation_of(meta) == generation && state_of(meta) != state::FREE
            }
            None => false,
        }
    }
}

impl Drop for WorkContractGroup {
    fn drop(&mut self) {
        if let Some(id) = self.owner_id.get() {
            handle::unregister_owner(*id);
        }
        let leftover = self.scheduled_count() + self.executing_count();
        if leftover > 0 {
            log::debug!(
                "work contract group {:?} dropped with {} contracts outstanding",
                self.name.as_deref().unwrap_or("<unnamed>"),
                leftover
            );
        }
    }
}

impl fmt::Debug for WorkContractGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkContractGroup")
            .field("name", &self.name.as_deref().unwrap_or("<unnamed>"))
            .field("capacity", &self.capacity)
            .field("active", &self.active_count())
            .field("scheduled", &self.scheduled_count())
            .field("executing", &self.executing_count())
            .field("main_thread_scheduled", &self.main_thread_scheduled_count())
            .field("main_thread_executing", &self.main_thread_executing_count())
            .finish()
    }
}

/// A stable, non-owning name for one contract in a group.
///
/// Handles survive the contract: once the slot completes and is reused, the
/// generation no longer matches and every operation reports the staleness
/// instead of touching the successor.
#[derive(Clone)]
pub struct WorkContractHandle {
    group: Weak<WorkContractGroup>,
    index: u32,
    generation: u32,
}

impl WorkContractHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// The owning group, retained; `None` once the group is gone.
    pub fn group(&self) -> Option<Arc<WorkContractGroup>> {
        self.group.upgrade()
    }

    fn belongs_to(&self, group: &WorkContractGroup) -> bool {
        self.group.as_ptr() == group as *const WorkContractGroup
    }

    /// True while the slot still holds the contract this handle names.
    pub fn is_valid(&self) -> bool {
        match self.group.upgrade() {
            Some(group) => group.validate(self.index, self.generation),
            None => false,
        }
    }

    pub fn schedule(&self) -> ScheduleResult {
        match self.group.upgrade() {
            Some(group) => group.schedule_slot(self.index as usize, self.generation),
            None => ScheduleResult::Invalid,
        }
    }

    pub fn unschedule(&self) -> bool {
        match self.group.upgrade() {
            Some(group) => group.unschedule(self),
            None => false,
        }
    }

    /// Frees an allocated-but-never-scheduled contract.
    pub fn release(&self) -> bool {
        match self.group.upgrade() {
            Some(group) => group.release(self),
            None => false,
        }
    }

    /// The erased registry form of this handle.
    pub fn raw(&self) -> RawHandle {
        match self.group.upgrade() {
            Some(group) => RawHandle::new(group.owner_id(), self.index, self.generation),
            None => RawHandle::null(),
        }
    }
}

impl fmt::Debug for WorkContractHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "WorkContractHandle(idx={}, gen={}, live={})",
            self.index,
            self.generation,
            self.is_valid()
        )
    }
}

fn payload_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn capacity_is_honored_exactly() {
        let group = WorkContractGroup::new(3);
        assert_eq!(group.capacity(), 3);
        let handles: Vec<_> = (0..3)
            .map(|_| group.create_contract(|| {}).unwrap())
            .collect();
        assert!(matches!(
            group.create_contract(|| {}),
            Err(CreateContractError::CapacityExceeded)
        ));
        drop(handles);
    }

    #[test]
    fn schedule_is_linearizable_per_slot() {
        let group = WorkContractGroup::new(8);
        let handle = group.create_contract(|| {}).unwrap();
        assert_eq!(handle.schedule(), ScheduleResult::Scheduled);
        assert_eq!(handle.schedule(), ScheduleResult::AlreadyScheduled);
        assert_eq!(group.execute_all_background_work(), 1);
        // Slot retired; the old name is stale now.
        assert_eq!(handle.schedule(), ScheduleResult::Invalid);
        assert!(!handle.is_valid());
    }

    #[test]
    fn unschedule_returns_contract_to_allocated() {
        let ran = Arc::new(AtomicUsize::new(0));
        let group = WorkContractGroup::new(8);
        let handle = {
            let ran = Arc::clone(&ran);
            group
                .create_contract(move || {
                    ran.fetch_add(1, Ordering::Relaxed);
                })
                .unwrap()
        };
        assert_eq!(handle.schedule(), ScheduleResult::Scheduled);
        assert!(handle.unschedule());
        assert!(!handle.unschedule());
        assert_eq!(group.execute_all_background_work(), 0);
        assert_eq!(ran.load(Ordering::Relaxed), 0);
        // Still allocated; can go again.
        assert_eq!(handle.schedule(), ScheduleResult::Scheduled);
        assert_eq!(group.execute_all_background_work(), 1);
        assert_eq!(ran.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn release_frees_unscheduled_contracts() {
        let group = WorkContractGroup::new(1);
        let handle = group.create_contract(|| {}).unwrap();
        assert!(matches!(
            group.create_contract(|| {}),
            Err(CreateContractError::CapacityExceeded)
        ));
        assert!(handle.release());
        assert!(!handle.is_valid());
        assert!(group.create_contract(|| {}).is_ok());
    }

    #[test]
    fn panic_in_contract_restores_accounting() {
        let group = WorkContractGroup::new(4);
        group.set_panic_handler(|_| {});
        let handle = group.create_contract(|| panic!("boom")).unwrap();
        assert_eq!(handle.schedule(), ScheduleResult::Scheduled);
        assert_eq!(group.execute_all_background_work(), 1);
        group.wait();
        assert_eq!(group.scheduled_count(), 0);
        assert_eq!(group.executing_count(), 0);
        assert_eq!(group.active_count(), 0);
    }

    #[test]
    fn yieldable_contract_retries_until_complete() {
        let group = WorkContractGroup::new(4);
        let attempts = Arc::new(AtomicUsize::new(0));
        let handle = {
            let attempts = Arc::clone(&attempts);
            group
                .create_yieldable_contract(
                    move || {
                        if attempts.fetch_add(1, Ordering::Relaxed) < 2 {
                            WorkResult::Yield
                        } else {
                            WorkResult::Complete
                        }
                    },
                    ExecutionKind::AnyThread,
                )
                .unwrap()
        };
        assert_eq!(handle.schedule(), ScheduleResult::Scheduled);
        assert_eq!(group.execute_all_background_work(), 3);
        assert_eq!(attempts.load(Ordering::Relaxed), 3);
        group.wait();
        assert_eq!(group.active_count(), 0);
    }
}
