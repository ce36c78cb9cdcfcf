//! Per-OS-thread bookkeeping: which machine and which virtual CPU the
//! calling context is currently executing on.
//!
//! Super meta since we use std thread-locals to implement what on real
//! hardware would live in a segment register.

use std::cell::RefCell;
use std::sync::Arc;

use crate::smp::Machine;
use crate::threads::ThreadId;
use crate::CpuId;

struct Current {
    machine: Arc<Machine>,
    cpu: CpuId,
    tid: ThreadId,
}

thread_local! {
    static CURRENT: RefCell<Option<Current>> = const { RefCell::new(None) };
}

/// Accessors for the calling thread's scheduling context.
pub struct Environment;

impl Environment {
    /// Installed by the thread-start wrapper on first dispatch.
    pub(crate) fn enter(machine: &Arc<Machine>, cpu: CpuId, tid: ThreadId) {
        CURRENT.with(|c| {
            *c.borrow_mut() = Some(Current {
                machine: Arc::clone(machine),
                cpu,
                tid,
            });
        });
    }

    /// Updated every time a context is resumed; threads migrate
    /// between CPUs across context switches.
    pub(crate) fn set_cpu(cpu: CpuId) {
        CURRENT.with(|c| {
            c.borrow_mut()
                .as_mut()
                .expect("no scheduling context on this thread")
                .cpu = cpu;
        });
    }

    /// The machine the calling thread runs on.
    ///
    /// # Panics
    /// If the calling OS thread is not a machine context.
    pub(crate) fn machine() -> Arc<Machine> {
        CURRENT.with(|c| {
            Arc::clone(
                &c.borrow()
                    .as_ref()
                    .expect("not running on a virtual cpu")
                    .machine,
            )
        })
    }

    /// `Some(cpu)` when the calling thread is a context of `machine`.
    pub(crate) fn on(machine: &Machine) -> Option<CpuId> {
        CURRENT.with(|c| {
            c.borrow().as_ref().and_then(|cur| {
                if std::ptr::eq(Arc::as_ptr(&cur.machine), machine) {
                    Some(cur.cpu)
                } else {
                    None
                }
            })
        })
    }

    /// The id of the calling thread.
    ///
    /// # Panics
    /// If the calling OS thread is not a machine context.
    pub fn tid() -> ThreadId {
        CURRENT.with(|c| {
            c.borrow()
                .as_ref()
                .expect("not running on a virtual cpu")
                .tid
        })
    }

    /// The virtual CPU the calling thread is currently executing on.
    /// Only stable while interrupts are masked; a preemption can move
    /// the thread to another CPU.
    ///
    /// # Panics
    /// If the calling OS thread is not a machine context.
    pub fn cpu_id() -> CpuId {
        CURRENT.with(|c| {
            c.borrow()
                .as_ref()
                .expect("not running on a virtual cpu")
                .cpu
        })
    }
}
