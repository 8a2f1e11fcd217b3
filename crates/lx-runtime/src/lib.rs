//! Worker-pool scheduling substrate.
//!
//! A fixed set of named worker threads, each owning a single-threaded tokio
//! runtime plus a `LocalSet`. One reactor per thread, never shared: the
//! runtime's I/O driver is the platform poller, and the cross-thread
//! injection channel doubles as the wakeup breaker (sending to a parked
//! worker preempts its poll).
//!
//! Dispatch is strict-priority (`IMMEDIATE > MED > LOW`), FIFO within a
//! priority. Closures dispatched to a worker may call
//! `tokio::task::spawn_local` to pin follow-up async work to that thread;
//! this is how a compile task keeps all its state transitions on its owning
//! worker.

mod delayed;
mod pool;

pub use delayed::{DelayedHandle, PeriodicHandle};
pub use pool::{current_worker, Priority, WorkerId, WorkerPool};
