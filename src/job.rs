//! Callable storage for contract slots.
//!
//! A slot's work is snapshotted out of the slab and executed from the
//! selecting thread's stack, so the boxed callable is the only allocation
//! that lives for the duration of a contract.

use std::error::Error;
use std::fmt;
use std::time::Instant;

/// Where a contract is allowed to execute.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ExecutionKind {
    /// Any worker thread, or a calling-thread drain loop.
    AnyThread,
    /// Only the caller-designated main thread; never a service worker.
    MainThread,
}

/// What a yieldable callable wants to happen next.
pub enum WorkResult {
    /// The work is finished.
    Complete,
    /// Run again soon; counts against the node's retry budget.
    Yield,
    /// Park until the monotonic deadline passes, consuming no CPU meanwhile.
    YieldUntil(Instant),
    /// The work failed; dependents are not released.
    Fail(Box<dyn Error + Send + Sync>),
}

impl fmt::Debug for WorkResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkResult::Complete => f.write_str("Complete"),
            WorkResult::Yield => f.write_str("Yield"),
            WorkResult::YieldUntil(deadline) => {
                f.debug_tuple("YieldUntil").field(deadline).finish()
            }
            WorkResult::Fail(err) => f.debug_tuple("Fail").field(&err.to_string()).finish(),
        }
    }
}

/// The callable owned by an allocated slot.
pub(crate) enum Work {
    /// Runs once and completes.
    Once(Box<dyn FnOnce() + Send + 'static>),
    /// May run repeatedly; each invocation reports a [`WorkResult`].
    Yieldable(Box<dyn FnMut() -> WorkResult + Send + 'static>),
}

impl Work {
    pub(crate) fn is_yieldable(&self) -> bool {
        matches!(self, Work::Yieldable(_))
    }
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Work::Once(_) => f.write_str("Work::Once"),
            Work::Yieldable(_) => f.write_str("Work::Yieldable"),
        }
    }
}
