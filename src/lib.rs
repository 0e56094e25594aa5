//! Self-rescheduling periodic timer on top of a one-shot scheduling
//! primitive.
//!
//! [`PeriodicTimer`] registers a wrapper closure with a [`OneShot`] provider.
//! Each time the wrapper runs it executes the user work synchronously, works
//! out the next due time (skipping period boundaries consumed by an
//! overrunning run instead of bursting missed firings) and re-registers
//! itself. [`PeriodicTimer::cancel`] blocks until no work closure is
//! executing and none ever will be again.
//!
//! The crate ships one provider, [`WorkerPool`], a small fixed pool of OS
//! worker threads draining a due-time heap. Any other provider can be
//! plugged in through the [`OneShot`] trait.

pub mod oneshot;
pub mod periodic;
mod trace;

pub use oneshot::pool::{PoolConfig, PoolScheduler, WorkerPool};
pub use oneshot::{OneShot, TaskHandle, WorkItem};
pub use periodic::{PeriodicError, PeriodicTimer};
pub use trace::init_tracing;
