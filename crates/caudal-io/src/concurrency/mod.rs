//! Concurrency abstraction: one API, two backends.
//!
//! The engine's schedulers never know whether they run as threads in one
//! process or as forked worker processes. Everything they need crosses this
//! seam:
//!
//! - [`Semaphore`]: counting semaphore with an optional small message
//!   payload; a pipe pair in process mode, mutex + condvar in thread mode
//! - [`worker`]: spawn, join and terminate workers in either mode,
//!   including the routing policy that keeps the callback worker in the
//!   calling process when forking
//! - [`shared_mem`]: byte regions visible to all workers: anonymous shared
//!   mappings, plus System V segments attachable by id for workers spawned
//!   before the region existed
//! - [`realtime`]: best-effort `SCHED_FIFO` elevation
//! - [`fdset`]: `select` plumbing for the blocking schedulers

pub mod fdio;
pub mod fdset;
pub mod realtime;
pub mod sem;
pub mod shared_mem;
pub mod worker;

pub use sem::Semaphore;
pub use shared_mem::SharedRegion;
pub use worker::WorkerHandle;

/// Which concurrency backend the engine runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConcurrencyMode {
    /// Workers are threads; shared state lives on the heap.
    #[default]
    Threads,
    /// Workers are forked processes; shared state lives in shared memory
    /// and semaphores are pipe pairs.
    Processes,
}
