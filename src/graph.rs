//! Work graphs: DAGs of nodes that submit themselves into a group as their
//! dependencies clear.
//!
//! The node table is append-only while the graph is built and read-mostly
//! afterwards; `pending_deps` is the only per-node field mutated in steady
//! state. Completion of a node decrements each successor's `pending_deps`
//! exactly once, and whichever decrement reaches zero submits the successor,
//! withholds it while the graph is suspended, or parks it when the
//! group is at capacity. Yieldable nodes cooperate with the group's slot
//! re-scheduling for plain yields and with a deadline queue for timed
//! yields, so a parked node costs no CPU until its deadline passes.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};

use crate::error::{AddDependencyError, AddNodeError, CreateContractError};
use crate::group::WorkContractGroup;
use crate::job::{ExecutionKind, Work, WorkResult};
use crate::unwind;

/// Graph construction and execution tuning.
#[derive(Clone, Debug)]
pub struct WorkGraphConfig {
    /// Emit a `log` line on every node state transition.
    pub enable_events: bool,
    /// Keep a journal of node state transitions, readable through
    /// [`WorkGraph::transition_log`].
    pub enable_state_manager: bool,
    /// Submit newly ready successors immediately from the completing worker
    /// (depth-first bias). When off, successors of one completion are
    /// gathered first and submitted as a batch.
    pub enable_advanced_scheduling: bool,
    /// Preallocation hint for the node table.
    pub expected_node_count: usize,
    /// Bound on nodes parked in the deferred queues (suspension, group
    /// capacity, timed yields). A node that would overflow the bound fails.
    pub max_deferred_nodes: usize,
}

impl Default for WorkGraphConfig {
    fn default() -> Self {
        Self {
            enable_events: false,
            enable_state_manager: false,
            enable_advanced_scheduling: true,
            expected_node_count: 0,
            max_deferred_nodes: 4096,
        }
    }
}

/// Lifecycle of a graph node.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NodeState {
    Pending,
    Ready,
    Scheduled,
    Running,
    Yielded,
    Done,
    Failed,
}

mod node_state {
    pub(super) const PENDING: u8 = 0;
    pub(super) const READY: u8 = 1;
    pub(super) const SCHEDULED: u8 = 2;
    pub(super) const RUNNING: u8 = 3;
    pub(super) const YIELDED: u8 = 4;
    pub(super) const DONE: u8 = 5;
    pub(super) const FAILED: u8 = 6;
}

fn decode_state(raw: u8) -> NodeState {
    match raw {
        node_state::PENDING => NodeState::Pending,
        node_state::READY => NodeState::Ready,
        node_state::SCHEDULED => NodeState::Scheduled,
        node_state::RUNNING => NodeState::Running,
        node_state::YIELDED => NodeState::Yielded,
        node_state::DONE => NodeState::Done,
        _ => NodeState::Failed,
    }
}

/// A node that ended in failure, as reported by [`WorkGraph::wait`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailedNode {
    pub index: u32,
    pub name: String,
    pub reason: String,
}

/// Outcome of [`WorkGraph::wait`].
#[derive(Clone, Debug)]
pub struct WorkGraphResult {
    /// True when every node ran to completion.
    pub all_completed: bool,
    /// Nodes that transitioned to Done.
    pub completed: usize,
    /// Nodes that failed; their transitive successors never ran.
    pub failed: Vec<FailedNode>,
}

/// Names one node of one graph.
#[derive(Clone)]
pub struct NodeHandle {
    graph: Weak<GraphInner>,
    index: u32,
}

impl NodeHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    /// The node's current state; `None` once the graph is gone.
    pub fn state(&self) -> Option<NodeState> {
        let inner = self.graph.upgrade()?;
        let nodes = inner.nodes.read();
        nodes
            .get(self.index as usize)
            .map(|node| decode_state(node.state.load(Ordering::Acquire)))
    }

    pub fn name(&self) -> Option<String> {
        let inner = self.graph.upgrade()?;
        let nodes = inner.nodes.read();
        nodes.get(self.index as usize).map(|node| node.name.clone())
    }
}

impl fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NodeHandle(idx={}, state={:?})",
            self.index,
            self.state()
        )
    }
}

struct Node {
    name: String,
    kind: ExecutionKind,
    yieldable: bool,
    max_retries: u32,
    state: AtomicU8,
    pending_deps: AtomicU32,
    retry_count: AtomicU32,
    /// The user callable. Yieldable nodes keep theirs here across attempts
    /// so a parked node can be resubmitted; a regular node's is taken once.
    work: Mutex<Option<Work>>,
    successors: Vec<u32>,
    predecessors: Vec<u32>,
}

/// A timed-yield parking entry, min-ordered by deadline.
#[derive(PartialEq, Eq)]
struct TimedEntry {
    deadline: Instant,
    index: u32,
}

impl Ord for TimedEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.index.cmp(&other.index))
    }
}

impl PartialOrd for TimedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct GraphInner {
    group: Arc<WorkContractGroup>,
    config: WorkGraphConfig,
    nodes: RwLock<Vec<Node>>,
    executed: AtomicBool,
    suspended: AtomicBool,
    /// Nodes currently submitted into the group (scheduled or running
    /// there). The graph is quiescent when this is zero and both deferred
    /// queues are empty.
    inflight: AtomicUsize,
    done_count: AtomicUsize,
    failed: Mutex<Vec<FailedNode>>,
    /// Ready nodes withheld by suspension or group capacity.
    deferred_ready: Mutex<VecDeque<u32>>,
    /// Timed-yield parking, keyed by wake deadline.
    timed: Mutex<BinaryHeap<Reverse<TimedEntry>>>,
    transitions: Mutex<Vec<(u32, NodeState)>>,
    settle_lock: Mutex<()>,
    settle_condvar: Condvar,
    weak_self: Weak<GraphInner>,
}

/// A DAG of tasks bound to one [`WorkContractGroup`].
pub struct WorkGraph {
    inner: Arc<GraphInner>,
}

impl WorkGraph {
    pub fn new(group: &Arc<WorkContractGroup>) -> Self {
        Self::with_config(group, WorkGraphConfig::default())
    }

    pub fn with_config(group: &Arc<WorkContractGroup>, config: WorkGraphConfig) -> Self {
        let expected = config.expected_node_count;
        let inner = Arc::new_cyclic(|weak| GraphInner {
            group: Arc::clone(group),
            config,
            nodes: RwLock::new(Vec::with_capacity(expected)),
            executed: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            inflight: AtomicUsize::new(0),
            done_count: AtomicUsize::new(0),
            failed: Mutex::new(Vec::new()),
            deferred_ready: Mutex::new(VecDeque::new()),
            timed: Mutex::new(BinaryHeap::new()),
            transitions: Mutex::new(Vec::new()),
            settle_lock: Mutex::new(()),
            settle_condvar: Condvar::new(),
            weak_self: weak.clone(),
        });
        Self { inner }
    }

    /// Adds a regular [`ExecutionKind::AnyThread`] node.
    pub fn add_node<F>(&self, f: F, name: impl Into<String>) -> Result<NodeHandle, AddNodeError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.add_node_with_kind(f, name, ExecutionKind::AnyThread)
    }

    /// Adds a regular node with an explicit execution kind.
    pub fn add_node_with_kind<F>(
        &self,
        f: F,
        name: impl Into<String>,
        kind: ExecutionKind,
    ) -> Result<NodeHandle, AddNodeError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner
            .push_node(Work::Once(Box::new(f)), name.into(), kind, 0, false)
    }

    /// Adds a yieldable node. The callable may return [`WorkResult::Yield`]
    /// or [`WorkResult::YieldUntil`] to run again later; after `max_retries`
    /// yields the node fails.
    pub fn add_yieldable_node<F>(
        &self,
        f: F,
        name: impl Into<String>,
        kind: ExecutionKind,
        max_retries: u32,
    ) -> Result<NodeHandle, AddNodeError>
    where
        F: FnMut() -> WorkResult + Send + 'static,
    {
        self.inner.push_node(
            Work::Yieldable(Box::new(f)),
            name.into(),
            kind,
            max_retries,
            true,
        )
    }

    /// Adds a node depending on every handle in `predecessors`: the fan-in
    /// continuation shorthand.
    pub fn add_continuation<F>(
        &self,
        predecessors: &[NodeHandle],
        f: F,
        name: impl Into<String>,
        kind: ExecutionKind,
    ) -> Result<NodeHandle, AddNodeError>
    where
        F: FnOnce() + Send + 'static,
    {
        let node = self.add_node_with_kind(f, name, kind)?;
        for predecessor in predecessors {
            self.add_dependency(predecessor, &node)
                .map_err(|_| AddNodeError::AlreadyExecuting)?;
        }
        Ok(node)
    }

    /// Declares that `to` runs only after `from` completes. Rejects edges
    /// that would close a cycle.
    pub fn add_dependency(
        &self,
        from: &NodeHandle,
        to: &NodeHandle,
    ) -> Result<(), AddDependencyError> {
        self.inner.add_dependency(from, to)
    }

    /// Submits every node with no dependencies. Idempotent; structural
    /// mutation is rejected from the first call on.
    pub fn execute(&self) {
        GraphInner::execute(&self.inner);
    }

    /// Withholds submission of nodes that become ready. Nodes already
    /// handed to the group run to completion.
    pub fn suspend(&self) {
        self.inner.suspend();
    }

    /// Re-enables submission and submits everything withheld meanwhile.
    pub fn resume(&self) {
        GraphInner::resume(&self.inner);
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.suspended.load(Ordering::Acquire)
    }

    /// Submits parked nodes whose deadline has passed and retries nodes
    /// deferred on group capacity. Returns how many were submitted. Callers
    /// driving a graph manually (no service, no `wait`) pump this.
    pub fn process_deferred_nodes(&self) -> usize {
        GraphInner::process_deferred(&self.inner)
    }

    /// True when the graph has settled: nothing running, nothing parked,
    /// nothing left to submit.
    pub fn is_complete(&self) -> bool {
        // Promote expired timed yields first so a graph whose only remaining
        // work is past-deadline pollers keeps making progress under a plain
        // drive loop.
        GraphInner::process_deferred(&self.inner);
        self.inner.settled()
    }

    /// Blocks until the graph settles. Doubles as the timer for
    /// [`WorkResult::YieldUntil`]: the waiting thread sleeps exactly until
    /// the next parked deadline, so parked intervals cost no CPU.
    pub fn wait(&self) -> WorkGraphResult {
        GraphInner::wait(&self.inner)
    }

    pub fn node_count(&self) -> usize {
        self.inner.nodes.read().len()
    }

    /// The state-transition journal; empty unless
    /// [`WorkGraphConfig::enable_state_manager`] is set.
    pub fn transition_log(&self) -> Vec<(u32, NodeState)> {
        self.inner.transitions.lock().clone()
    }
}

impl fmt::Debug for WorkGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkGraph")
            .field("nodes", &self.node_count())
            .field("done", &self.inner.done_count.load(Ordering::Acquire))
            .field("inflight", &self.inner.inflight.load(Ordering::Acquire))
            .field("suspended", &self.is_suspended())
            .finish()
    }
}

impl GraphInner {
    fn push_node(
        &self,
        work: Work,
        name: String,
        kind: ExecutionKind,
        max_retries: u32,
        yieldable: bool,
    ) -> Result<NodeHandle, AddNodeError> {
        if self.executed.load(Ordering::Acquire) {
            return Err(AddNodeError::AlreadyExecuting);
        }
        let mut nodes = self.nodes.write();
        let index = nodes.len() as u32;
        nodes.push(Node {
            name,
            kind,
            yieldable,
            max_retries,
            state: AtomicU8::new(node_state::PENDING),
            pending_deps: AtomicU32::new(0),
            retry_count: AtomicU32::new(0),
            work: Mutex::new(Some(work)),
            successors: Vec::new(),
            predecessors: Vec::new(),
        });
        Ok(NodeHandle {
            graph: self.weak_self.clone(),
            index,
        })
    }

    fn add_dependency(
        &self,
        from: &NodeHandle,
        to: &NodeHandle,
    ) -> Result<(), AddDependencyError> {
        if self.executed.load(Ordering::Acquire) {
            return Err(AddDependencyError::AlreadyExecuting);
        }
        if !self.owns(from) || !self.owns(to) {
            return Err(AddDependencyError::ForeignNode);
        }
        if from.index == to.index {
            return Err(AddDependencyError::SelfDependency);
        }
        let mut nodes = self.nodes.write();
        let (from_index, to_index) = (from.index as usize, to.index as usize);
        if from_index >= nodes.len() || to_index >= nodes.len() {
            return Err(AddDependencyError::ForeignNode);
        }
        if nodes[to_index].predecessors.contains(&from.index) {
            return Err(AddDependencyError::DuplicateEdge);
        }
        if reaches(&nodes, to.index, from.index) {
            return Err(AddDependencyError::WouldCreateCycle);
        }
        nodes[from_index].successors.push(to.index);
        nodes[to_index].predecessors.push(from.index);
        nodes[to_index].pending_deps.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn owns(&self, handle: &NodeHandle) -> bool {
        handle.graph.as_ptr() == self as *const GraphInner
    }

    fn execute(inner: &Arc<Self>) {
        if inner.executed.swap(true, Ordering::AcqRel) {
            return;
        }
        let roots: Vec<u32> = {
            let nodes = inner.nodes.read();
            nodes
                .iter()
                .enumerate()
                .filter(|(_, node)| node.pending_deps.load(Ordering::Acquire) == 0)
                .map(|(index, _)| index as u32)
                .collect()
        };
        for index in roots {
            Self::make_ready(inner, index);
        }
        inner.signal_settle();
    }

    /// A node's dependencies have cleared: submit it, or park it while the
    /// graph is suspended or the group is full.
    fn make_ready(inner: &Arc<Self>, index: u32) {
        inner.note_transition(index, NodeState::Ready);
        if inner.suspended.load(Ordering::Acquire) {
            inner.set_state(index, node_state::READY);
            inner.park_ready(index);
        } else {
            Self::submit(inner, index);
        }
    }

    /// Hands a ready node to the group. Returns false when the group was at
    /// capacity and the node was parked instead.
    fn submit(inner: &Arc<Self>, index: u32) -> bool {
        let (kind, yieldable) = {
            let nodes = inner.nodes.read();
            let node = &nodes[index as usize];
            (node.kind, node.yieldable)
        };
        inner.inflight.fetch_add(1, Ordering::AcqRel);
        inner.set_state(index, node_state::SCHEDULED);
        inner.note_transition(index, NodeState::Scheduled);

        let contract = if yieldable {
            let shim_inner = Arc::clone(inner);
            inner.group.create_yieldable_contract(
                move || GraphInner::yieldable_attempt(&shim_inner, index),
                kind,
            )
        } else {
            let shim_inner = Arc::clone(inner);
            inner
                .group
                .create_contract_with_kind(move || GraphInner::run_once(&shim_inner, index), kind)
        };
        match contract {
            Ok(handle) => {
                let scheduled = handle.schedule();
                debug_assert_eq!(scheduled, crate::ScheduleResult::Scheduled);
                true
            }
            Err(CreateContractError::CapacityExceeded) => {
                // Park and retry when capacity frees up or the caller pumps
                // process_deferred_nodes. The queue entry must exist before
                // the in-flight count drops; otherwise a waiter waking in
                // between sees a settled graph with a node still in hand.
                inner.set_state(index, node_state::READY);
                inner.park_ready(index);
                inner.inflight.fetch_sub(1, Ordering::AcqRel);
                inner.signal_settle();
                false
            }
        }
    }

    /// Queues a ready node for later submission, failing it if the deferred
    /// bound is exhausted. Lock order is always deferred_ready, then timed.
    fn park_ready(&self, index: u32) {
        let overflow = {
            let mut deferred = self.deferred_ready.lock();
            let timed_len = self.timed.lock().len();
            if deferred.len() + timed_len >= self.config.max_deferred_nodes {
                true
            } else {
                deferred.push_back(index);
                false
            }
        };
        if overflow {
            self.overflow_deferred(index);
        }
        self.signal_settle();
    }

    fn overflow_deferred(&self, index: u32) {
        log::warn!(
            "work graph deferred queue is full ({} nodes); failing node {}",
            self.config.max_deferred_nodes,
            index
        );
        self.fail_node(index, "deferred queue full".to_string());
        self.signal_settle();
    }

    /// One attempt of a regular node, running inside a group contract.
    fn run_once(inner: &Arc<Self>, index: u32) {
        inner.set_state(index, node_state::RUNNING);
        inner.note_transition(index, NodeState::Running);
        let work = {
            let nodes = inner.nodes.read();
            let taken = nodes[index as usize].work.lock().take();
            taken
        };
        let Some(Work::Once(f)) = work else {
            debug_assert!(false, "regular node had no work");
            Self::retire(inner, index, Ok(()));
            return;
        };
        // Catch here, not in the group shim: a panicking node maps to Fail
        // and must run the graph's retirement bookkeeping.
        match unwind::halt_unwinding(f) {
            Ok(()) => Self::retire(inner, index, Ok(())),
            Err(payload) => {
                inner.group.report_failure(payload);
                Self::retire(inner, index, Err("node panicked".to_string()));
            }
        }
    }

    /// One attempt of a yieldable node. The return value tells the group
    /// what to do with the slot: `Yield` re-schedules it in place, anything
    /// else releases it.
    fn yieldable_attempt(inner: &Arc<Self>, index: u32) -> WorkResult {
        inner.set_state(index, node_state::RUNNING);
        inner.note_transition(index, NodeState::Running);
        let work = {
            let nodes = inner.nodes.read();
            let taken = nodes[index as usize].work.lock().take();
            taken
        };
        let Some(Work::Yieldable(mut f)) = work else {
            debug_assert!(false, "yieldable node had no work");
            Self::retire(inner, index, Ok(()));
            return WorkResult::Complete;
        };

        let outcome = unwind::halt_unwinding(&mut f);
        match outcome {
            Ok(WorkResult::Complete) => {
                Self::retire(inner, index, Ok(()));
                WorkResult::Complete
            }
            Ok(WorkResult::Fail(err)) => {
                Self::retire(inner, index, Err(err.to_string()));
                WorkResult::Complete
            }
            Err(payload) => {
                inner.group.report_failure(payload);
                Self::retire(inner, index, Err("node panicked".to_string()));
                WorkResult::Complete
            }
            Ok(WorkResult::Yield) => {
                if let Some(reason) = inner.spend_retry(index) {
                    Self::retire(inner, index, Err(reason));
                    return WorkResult::Complete;
                }
                inner.store_work(index, Work::Yieldable(f));
                if inner.suspended.load(Ordering::Acquire) {
                    // Withhold the re-entry instead of racing the suspension
                    // gate; resume submits it again. Park before dropping the
                    // in-flight count so quiescence is never observed with
                    // the node counted nowhere.
                    inner.set_state(index, node_state::YIELDED);
                    inner.note_transition(index, NodeState::Yielded);
                    inner.park_ready(index);
                    inner.inflight.fetch_sub(1, Ordering::AcqRel);
                    inner.signal_settle();
                    WorkResult::Complete
                } else {
                    inner.set_state(index, node_state::SCHEDULED);
                    WorkResult::Yield
                }
            }
            Ok(WorkResult::YieldUntil(deadline)) => {
                if let Some(reason) = inner.spend_retry(index) {
                    Self::retire(inner, index, Err(reason));
                    return WorkResult::Complete;
                }
                // The heap entry must exist before the in-flight count
                // drops, and every node field write must precede the park: a
                // concurrent promoter may resubmit the node the moment the
                // entry is visible.
                inner.store_work(index, Work::Yieldable(f));
                inner.set_state(index, node_state::YIELDED);
                inner.note_transition(index, NodeState::Yielded);
                inner.park_timed(index, deadline);
                inner.inflight.fetch_sub(1, Ordering::AcqRel);
                inner.signal_settle();
                WorkResult::Complete
            }
        }
    }

    /// Counts one yield against the node's budget; `Some(reason)` when the
    /// budget is exhausted.
    fn spend_retry(&self, index: u32) -> Option<String> {
        let (spent, budget) = {
            let nodes = self.nodes.read();
            let node = &nodes[index as usize];
            (
                node.retry_count.fetch_add(1, Ordering::AcqRel) + 1,
                node.max_retries,
            )
        };
        if spent >= budget {
            Some(format!("yield budget exhausted after {} attempts", spent))
        } else {
            None
        }
    }

    fn store_work(&self, index: u32, work: Work) {
        let nodes = self.nodes.read();
        *nodes[index as usize].work.lock() = Some(work);
    }

    fn park_timed(&self, index: u32, deadline: Instant) {
        let overflow = {
            let deferred_len = self.deferred_ready.lock().len();
            let mut timed = self.timed.lock();
            if timed.len() + deferred_len >= self.config.max_deferred_nodes {
                true
            } else {
                timed.push(Reverse(TimedEntry { deadline, index }));
                false
            }
        };
        if overflow {
            self.overflow_deferred(index);
        }
        // Wake any waiter so it can re-arm its timer on the new deadline.
        self.settle_condvar.notify_all();
    }

    /// Final bookkeeping for a node leaving the group: mark Done/Failed,
    /// release successors, retry capacity-parked work, then drop the
    /// in-flight count and settle if quiescent.
    fn retire(inner: &Arc<Self>, index: u32, outcome: Result<(), String>) {
        match outcome {
            Ok(()) => {
                inner.set_state(index, node_state::DONE);
                inner.note_transition(index, NodeState::Done);
                inner.done_count.fetch_add(1, Ordering::AcqRel);
                Self::release_successors(inner, index);
            }
            Err(reason) => {
                inner.fail_node(index, reason);
            }
        }
        if !inner.suspended.load(Ordering::Acquire) {
            Self::flush_deferred_ready(inner);
        }
        inner.inflight.fetch_sub(1, Ordering::AcqRel);
        inner.signal_settle();
    }

    fn fail_node(&self, index: u32, reason: String) {
        self.set_state(index, node_state::FAILED);
        self.note_transition(index, NodeState::Failed);
        let name = {
            let nodes = self.nodes.read();
            nodes[index as usize].name.clone()
        };
        if self.config.enable_events {
            log::debug!(
                target: "workcontract::graph",
                "node {} ({}) failed: {}",
                index,
                name,
                reason
            );
        }
        self.failed.lock().push(FailedNode {
            index,
            name,
            reason,
        });
    }

    /// Decrements each successor's dependency count; the decrement that
    /// reaches zero owns that successor's submission.
    fn release_successors(inner: &Arc<Self>, index: u32) {
        let successors: Vec<u32> = {
            let nodes = inner.nodes.read();
            nodes[index as usize].successors.clone()
        };
        let mut batch = Vec::new();
        for successor in successors {
            let was = {
                let nodes = inner.nodes.read();
                nodes[successor as usize]
                    .pending_deps
                    .fetch_sub(1, Ordering::AcqRel)
            };
            debug_assert!(was > 0, "pending_deps underflow");
            if was == 1 {
                if inner.config.enable_advanced_scheduling {
                    Self::make_ready(inner, successor);
                } else {
                    batch.push(successor);
                }
            }
        }
        for successor in batch {
            Self::make_ready(inner, successor);
        }
    }

    /// Retries nodes parked on group capacity. Bounded by the queue length
    /// at entry so concurrent flushers cannot chase each other's re-parks.
    ///
    /// The in-flight count is raised for the duration of the handoff:
    /// between a queue pop and the submission's own increment the node is
    /// otherwise counted nowhere, and a waiter waking in that window would
    /// read the graph as settled.
    fn flush_deferred_ready(inner: &Arc<Self>) -> usize {
        let mut submitted = 0;
        inner.inflight.fetch_add(1, Ordering::AcqRel);
        let budget = inner.deferred_ready.lock().len();
        for _ in 0..budget {
            if inner.suspended.load(Ordering::Acquire) {
                break;
            }
            let Some(index) = inner.deferred_ready.lock().pop_front() else {
                break;
            };
            if Self::submit(inner, index) {
                submitted += 1;
            } else {
                // Went straight back on CapacityExceeded; the group is full.
                break;
            }
        }
        inner.inflight.fetch_sub(1, Ordering::AcqRel);
        inner.signal_settle();
        submitted
    }

    /// Same handoff cover as [`flush_deferred_ready`].
    fn promote_expired(inner: &Arc<Self>) -> usize {
        if inner.suspended.load(Ordering::Acquire) {
            return 0;
        }
        let now = Instant::now();
        let mut promoted = 0;
        inner.inflight.fetch_add(1, Ordering::AcqRel);
        loop {
            let index = {
                let mut timed = inner.timed.lock();
                match timed.peek() {
                    Some(Reverse(entry)) if entry.deadline <= now => {
                        timed.pop().map(|Reverse(entry)| entry.index)
                    }
                    _ => None,
                }
            };
            let Some(index) = index else { break };
            if Self::submit(inner, index) {
                promoted += 1;
            }
        }
        inner.inflight.fetch_sub(1, Ordering::AcqRel);
        inner.signal_settle();
        promoted
    }

    fn process_deferred(inner: &Arc<Self>) -> usize {
        if inner.suspended.load(Ordering::Acquire) {
            return 0;
        }
        Self::promote_expired(inner) + Self::flush_deferred_ready(inner)
    }

    fn suspend(&self) {
        self.suspended.store(true, Ordering::Release);
        if self.config.enable_events {
            log::debug!(target: "workcontract::graph", "graph suspended");
        }
    }

    fn resume(inner: &Arc<Self>) {
        inner.suspended.store(false, Ordering::Release);
        if inner.config.enable_events {
            log::debug!(target: "workcontract::graph", "graph resumed");
        }
        // Cover the drained batch: the withheld nodes leave the queue before
        // their submissions raise the in-flight count.
        inner.inflight.fetch_add(1, Ordering::AcqRel);
        let withheld: Vec<u32> = inner.deferred_ready.lock().drain(..).collect();
        for index in withheld {
            Self::submit(inner, index);
        }
        inner.inflight.fetch_sub(1, Ordering::AcqRel);
        Self::promote_expired(inner);
        inner.signal_settle();
    }

    /// Quiescence: executed, nothing in the group, nothing parked.
    fn settled(&self) -> bool {
        self.executed.load(Ordering::Acquire)
            && self.inflight.load(Ordering::Acquire) == 0
            && self.deferred_ready.lock().is_empty()
            && self.timed.lock().is_empty()
    }

    fn wait(inner: &Arc<Self>) -> WorkGraphResult {
        loop {
            Self::process_deferred(inner);
            let mut guard = inner.settle_lock.lock();
            if inner.settled() {
                break;
            }
            let next_deadline = if inner.suspended.load(Ordering::Acquire) {
                None
            } else {
                let timed = inner.timed.lock().peek().map(|entry| entry.0.deadline);
                // Capacity-parked nodes have no deadline of their own; poll
                // them on a short cadence so a full group cannot strand the
                // waiter.
                let capacity_retry = if inner.deferred_ready.lock().is_empty() {
                    None
                } else {
                    Some(Instant::now() + Duration::from_millis(1))
                };
                match (timed, capacity_retry) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (deadline, None) | (None, deadline) => deadline,
                }
            };
            match next_deadline {
                // The waiter doubles as the timer for parked nodes: sleep
                // exactly until the next deadline, then promote.
                Some(deadline) => {
                    inner.settle_condvar.wait_until(&mut guard, deadline);
                }
                None => {
                    inner.settle_condvar.wait(&mut guard);
                }
            }
        }
        let failed = inner.failed.lock().clone();
        let completed = inner.done_count.load(Ordering::Acquire);
        WorkGraphResult {
            all_completed: failed.is_empty() && completed == inner.nodes.read().len(),
            completed,
            failed,
        }
    }

    fn set_state(&self, index: u32, raw: u8) {
        let nodes = self.nodes.read();
        nodes[index as usize].state.store(raw, Ordering::Release);
    }

    fn note_transition(&self, index: u32, state: NodeState) {
        if self.config.enable_events {
            log::debug!(
                target: "workcontract::graph",
                "node {} -> {:?}",
                index,
                state
            );
        }
        if self.config.enable_state_manager {
            self.transitions.lock().push((index, state));
        }
    }

    fn signal_settle(&self) {
        if self.settled() {
            let guard = self.settle_lock.lock();
            drop(guard);
            self.settle_condvar.notify_all();
        }
    }
}

/// Depth-first reachability over successor edges; used for cycle rejection
/// while the graph is quiescent under the construction lock.
fn reaches(nodes: &[Node], from: u32, target: u32) -> bool {
    let mut stack = vec![from];
    let mut visited = vec![false; nodes.len()];
    while let Some(index) = stack.pop() {
        if index == target {
            return true;
        }
        let slot = index as usize;
        if std::mem::replace(&mut visited[slot], true) {
            continue;
        }
        stack.extend_from_slice(&nodes[slot].successors);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_edges_are_rejected() {
        let group = WorkContractGroup::new(16);
        let graph = WorkGraph::new(&group);
        let a = graph.add_node(|| {}, "a").unwrap();
        let b = graph.add_node(|| {}, "b").unwrap();
        let c = graph.add_node(|| {}, "c").unwrap();
        graph.add_dependency(&a, &b).unwrap();
        graph.add_dependency(&b, &c).unwrap();
        assert_eq!(
            graph.add_dependency(&c, &a),
            Err(AddDependencyError::WouldCreateCycle)
        );
        assert_eq!(
            graph.add_dependency(&a, &a),
            Err(AddDependencyError::SelfDependency)
        );
        assert_eq!(
            graph.add_dependency(&a, &b),
            Err(AddDependencyError::DuplicateEdge)
        );
    }

    #[test]
    fn structural_mutation_is_rejected_after_execute() {
        let group = WorkContractGroup::new(16);
        let graph = WorkGraph::new(&group);
        let a = graph.add_node(|| {}, "a").unwrap();
        let b = graph.add_node(|| {}, "b").unwrap();
        graph.execute();
        assert_eq!(
            graph.add_node(|| {}, "late").unwrap_err(),
            AddNodeError::AlreadyExecuting
        );
        assert_eq!(
            graph.add_dependency(&a, &b),
            Err(AddDependencyError::AlreadyExecuting)
        );
        group.execute_all_background_work();
        assert!(graph.wait().all_completed);
    }

    #[test]
    fn foreign_handles_are_rejected() {
        let group = WorkContractGroup::new(16);
        let graph_a = WorkGraph::new(&group);
        let graph_b = WorkGraph::new(&group);
        let a = graph_a.add_node(|| {}, "a").unwrap();
        let b = graph_b.add_node(|| {}, "b").unwrap();
        assert_eq!(
            graph_a.add_dependency(&a, &b),
            Err(AddDependencyError::ForeignNode)
        );
    }

    #[test]
    fn empty_graph_settles_immediately() {
        let group = WorkContractGroup::new(16);
        let graph = WorkGraph::new(&group);
        graph.execute();
        assert!(graph.is_complete());
        let result = graph.wait();
        assert!(result.all_completed);
        assert_eq!(result.completed, 0);
    }
}
