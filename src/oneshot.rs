//! One-shot scheduling contract.
//!
//! A one-shot scheduler registers a closure to run exactly once at or after
//! an absolute due time, on some worker thread of its own. Registrations can
//! be cancelled on a best-effort basis before they start, and every handle
//! must be released exactly once when its owner is done with it.
//!
//! The periodic timer in [`crate::periodic`] consumes this contract; the
//! bundled [`pool::WorkerPool`] provides it.

pub mod pool;

use std::num::NonZeroU64;

use minstant::Instant;

/// A unit of work registered with a one-shot scheduler.
///
/// The closure carries its own context, so there is no separate context
/// pointer and no "null work item" to validate.
pub type WorkItem = Box<dyn FnOnce() + Send + 'static>;

/// Opaque handle to one pending registration.
///
/// Deliberately neither `Clone` nor `Copy`: [`OneShot::release_handle`]
/// consumes the handle, so releasing twice is a compile error instead of a
/// runtime contract violation.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct TaskHandle(NonZeroU64);

impl TaskHandle {
    /// Creates a handle from a provider-assigned id.
    #[must_use]
    pub const fn new(id: NonZeroU64) -> Self {
        Self(id)
    }

    /// Returns the provider-assigned id.
    #[must_use]
    pub const fn id(&self) -> NonZeroU64 {
        self.0
    }
}

/// One-shot scheduling provider.
pub trait OneShot {
    /// Registers `work` to run once at or after `due`, best effort.
    ///
    /// If `due` is already in the past the work runs as soon as a worker is
    /// available. Never fails.
    fn schedule(&self, due: Instant, work: WorkItem) -> TaskHandle;

    /// Attempts to cancel a registration that has not started yet.
    ///
    /// Returns `true` iff the pending invocation was prevented from
    /// starting. Returns `false` when the work already started or completed;
    /// in that case the registration is unaffected.
    fn cancel_scheduled(&self, handle: &TaskHandle) -> bool;

    /// Releases the bookkeeping for a handle.
    ///
    /// Has no effect on the registration's scheduling or cancellation: a
    /// still-pending registration whose handle was released runs anyway.
    fn release_handle(&self, handle: TaskHandle);
}
