//! Status taxonomy for the public API.
//!
//! Every fallible operation reports through one of these types; nothing is
//! silently swallowed. Callable panics never surface here; they are caught
//! at the execution boundary and routed to the installed panic hook.

use thiserror::Error;

/// Outcome of [`WorkContractGroup::schedule`](crate::WorkContractGroup::schedule).
///
/// Linearizable per slot: exactly one caller observes `Scheduled` for a given
/// (slot, generation); concurrent redundant callers observe `AlreadyScheduled`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ScheduleResult {
    /// This call published the contract; it will be selected for execution.
    Scheduled,
    /// The contract was already published (or is currently executing).
    AlreadyScheduled,
    /// The slot exists but is not in a schedulable state.
    NotScheduled,
    /// The handle is stale or names a dead owner.
    Invalid,
}

/// Outcome of adding or removing a group on a [`WorkService`](crate::WorkService).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GroupOperationStatus {
    Added,
    Exists,
    Removed,
    NotFound,
}

/// Errors from [`WorkContractGroup::create_contract`](crate::WorkContractGroup::create_contract)
/// and its variants.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum CreateContractError {
    /// Every slot is occupied; capacity is fixed at group construction.
    #[error("work contract group is at capacity")]
    CapacityExceeded,
}

/// Errors from [`WorkService::start`](crate::WorkService::start) and
/// [`WorkService::stop`](crate::WorkService::stop).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("work service is already running")]
    AlreadyRunning,
    #[error("work service is not running")]
    NotRunning,
}

/// Errors from [`WorkGraph::add_node`](crate::WorkGraph::add_node) and its
/// variants.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum AddNodeError {
    /// Nodes can only be added while the graph is under construction.
    #[error("graph has already begun executing")]
    AlreadyExecuting,
}

/// Errors from [`WorkGraph::add_dependency`](crate::WorkGraph::add_dependency).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum AddDependencyError {
    /// The edge would close a cycle; dependencies must form a DAG.
    #[error("dependency would create a cycle")]
    WouldCreateCycle,
    /// Edges cannot be added once the graph has begun executing.
    #[error("graph has already begun executing")]
    AlreadyExecuting,
    /// One of the handles does not belong to this graph.
    #[error("node handle does not belong to this graph")]
    ForeignNode,
    /// A node cannot depend on itself.
    #[error("node cannot depend on itself")]
    SelfDependency,
    /// The edge already exists; adding it twice would double-count the
    /// predecessor.
    #[error("dependency already exists")]
    DuplicateEdge,
}
