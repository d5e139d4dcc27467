//! Fine-grained, embeddable task scheduling with a deterministic
//! main-thread story.
//!
//! The crate is built from three tightly coupled subsystems:
//!
//! - [`WorkContractGroup`]: a fixed-capacity slab of schedulable work
//!   slots with lock-minimal selection. Groups support re-entrant
//!   scheduling: a contract may create and schedule further contracts into
//!   its own group while it runs, up to full capacity.
//! - [`WorkService`]: a pool of worker threads that drains one or more
//!   groups under round-robin rotation, with an explicit API for pumping
//!   main-thread-only work from the caller's thread.
//! - [`WorkGraph`]: a DAG of nodes built atop a group, with dependency
//!   ordering, cooperative yields, timed yields that park without burning
//!   CPU, and graph-level suspend/resume.
//!
//! Contracts and other managed objects are named by generational
//! [handles](RawHandle): slot reuse bumps a generation counter, so a stale
//! handle fails a 32-bit compare instead of touching the slot's new
//! occupant.
//!
//! # Scheduling a contract
//!
//! ```
//! use workcontract::WorkContractGroup;
//!
//! let group = WorkContractGroup::new(64);
//! let contract = group.create_contract(|| println!("hello from the pool")).unwrap();
//! contract.schedule();
//! group.execute_all_background_work();
//! group.wait();
//! assert_eq!(group.active_count(), 0);
//! ```
//!
//! # Driving a graph with a service
//!
//! ```
//! use workcontract::{WorkContractGroup, WorkGraph, WorkService, WorkServiceConfig};
//!
//! let service = WorkService::new(WorkServiceConfig {
//!     thread_count: 2,
//!     ..WorkServiceConfig::default()
//! });
//! let group = WorkContractGroup::new(128);
//! service.add_work_contract_group(&group);
//! service.start().unwrap();
//!
//! let graph = WorkGraph::new(&group);
//! let load = graph.add_node(|| { /* fetch */ }, "load").unwrap();
//! let parse = graph.add_node(|| { /* decode */ }, "parse").unwrap();
//! graph.add_dependency(&load, &parse).unwrap();
//! graph.execute();
//! let result = graph.wait();
//! assert!(result.all_completed);
//!
//! service.stop().unwrap();
//! ```

mod bitset;
mod error;
mod graph;
mod group;
mod handle;
mod job;
mod latch;
mod service;
mod sleep;
mod unwind;

pub use self::error::{
    AddDependencyError, AddNodeError, CreateContractError, GroupOperationStatus, ScheduleResult,
    ServiceError,
};
pub use self::graph::{
    FailedNode, NodeHandle, NodeState, WorkGraph, WorkGraphConfig, WorkGraphResult,
};
pub use self::group::{WorkContractGroup, WorkContractHandle};
pub use self::handle::{
    is_valid, register_owner, resolve_owner, unregister_owner, HandleOwner, OwnerId, RawHandle,
    TypedHandle,
};
pub use self::job::{ExecutionKind, WorkResult};
pub use self::service::{
    MainThreadWorkResult, ThreadLifecycleHandler, WorkService, WorkServiceConfig,
};

/// The type of the hook installed with
/// [`WorkContractGroup::set_panic_handler`]: observes panic payloads from
/// contract callables and [`WorkResult::Fail`] errors from yieldables.
pub type PanicHandler = dyn Fn(Box<dyn std::any::Any + Send>) + Send + Sync;

pub const VERSION_MAJOR: u32 = 0;
pub const VERSION_MINOR: u32 = 1;
pub const VERSION_PATCH: u32 = 0;
/// Bumped on breaking changes to the status-code and handle wire contract.
pub const ABI_VERSION: u32 = 1;

/// The crate version quadruple: `(major, minor, patch, abi)`.
pub fn version() -> (u32, u32, u32, u32) {
    (VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH, ABI_VERSION)
}
