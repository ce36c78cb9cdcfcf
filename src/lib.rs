//! A user-space threading library on a simulated multiprocessor.
//!
//! Has the following properties:
//! * Preemptive scheduling on the virtual hardware (timer interrupts),
//!   cooperative inside the library's own critical sections
//! * One global FIFO run queue shared by all virtual CPUs
//! * Per-CPU idle threads that park their CPU when no work exists
//! * Cross-CPU wakeup via inter-processor interrupts
//! * FIFO hand-off mutexes and condition variables built on the scheduler
//!
//! All shared scheduler state sits behind a single "big guard" lock: a
//! process-wide spin flag combined with per-CPU interrupt masking. The
//! guard is held across context switches and released by whichever
//! thread resumes on the other side.
//!
//! ```
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! use rota::Machine;
//!
//! let machine = Machine::new(2);
//! let counter = Arc::new(AtomicUsize::new(0));
//! for _ in 0..4 {
//!     let counter = Arc::clone(&counter);
//!     machine
//!         .spawn(move || {
//!             counter.fetch_add(1, Ordering::Relaxed);
//!             rota::yield_now();
//!         })
//!         .unwrap();
//! }
//! machine.run();
//! assert_eq!(counter.load(Ordering::Relaxed), 4);
//! ```

mod context;
mod guard;
mod scheduler;
mod stack;
mod tls;

pub mod condvar;
pub mod mutex;
pub mod smp;
pub mod threads;

pub use crate::condvar::CondVar;
pub use crate::mutex::Mutex;
pub use crate::smp::{Machine, MachineConfig, MachineStats};
pub use crate::stack::DEFAULT_STACK_SIZE_BYTES;
pub use crate::threads::{spawn, yield_now, Thread, ThreadId};
pub use crate::tls::Environment;

/// The identity of a virtual CPU (an index into the machine's CPU set).
pub type CpuId = usize;

/// Failures the runtime reports to its caller.
///
/// Everything else that looks like an error is defined away: joining a
/// thread that already terminated is a no-op, and dropping a handle to
/// a running thread merely unlinks it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    /// A mutex was released by a thread that does not hold it.
    #[error("mutex released by a thread that does not hold it")]
    NotOwner,
    /// The machine is at its live-thread limit.
    #[error("too many threads")]
    TooManyThreads,
    /// The machine has halted and accepts no more work.
    #[error("machine has halted")]
    Halted,
    /// The execution context for a new thread could not be created.
    #[error("could not create an execution context")]
    SpawnFailed,
}
