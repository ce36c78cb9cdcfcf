// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Execution contexts: the stack-switching substrate the scheduler
//! runs on.
//!
//! A context is an independent flow of control bound to its own
//! fixed-size stack. The scheduler only ever needs three operations:
//! create a context that enters a given function, hand a virtual CPU
//! to a context (`dispatch`), and give a CPU up until somebody hands
//! it back (`park`). A context switch is `dispatch` on the successor
//! followed by `park` on the caller; because every context has its own
//! hand-off slot the two halves cannot race, and dispatching a context
//! to itself simply makes the park return immediately.
//!
//! Each context is backed by a parked OS thread created with the
//! requested stack size. The backing thread never runs unless the
//! scheduler has handed it a CPU, so at any instant at most one
//! context per virtual CPU is executing.

use std::io;
use std::panic;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::stack;
use crate::CpuId;

/// Unwind payload used to tear down a parked context. Carried by
/// `resume_unwind` so the panic hook never fires for it.
pub(crate) struct ContextExit;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Slot {
    /// Not scheduled anywhere.
    Parked,
    /// Handed the given CPU; the backing thread should run.
    Dispatched(CpuId),
    /// The context is being torn down.
    Exit,
}

struct Inner {
    slot: Mutex<Slot>,
    cond: Condvar,
}

impl Inner {
    fn dispatch(&self, cpu: CpuId) {
        let mut slot = self.slot.lock().expect("context slot poisoned");
        debug_assert!(
            *slot != Slot::Exit,
            "dispatching a context that is being torn down"
        );
        *slot = Slot::Dispatched(cpu);
        self.cond.notify_one();
    }

    fn park(&self) -> CpuId {
        let mut slot = self.slot.lock().expect("context slot poisoned");
        loop {
            match *slot {
                Slot::Dispatched(cpu) => {
                    *slot = Slot::Parked;
                    return cpu;
                }
                Slot::Exit => break,
                Slot::Parked => {
                    slot = self.cond.wait(slot).expect("context slot poisoned");
                }
            }
        }
        drop(slot);
        panic::resume_unwind(Box::new(ContextExit));
    }

    fn kill(&self) {
        let mut slot = self.slot.lock().expect("context slot poisoned");
        *slot = Slot::Exit;
        self.cond.notify_one();
    }
}

/// Handle to one execution context. Clones refer to the same context.
#[derive(Clone)]
pub(crate) struct ExecContext {
    inner: Arc<Inner>,
}

impl ExecContext {
    /// Creates a context with `stack_bytes` of stack that will run
    /// `entry` once it is first dispatched. The argument to `entry` is
    /// the CPU it was dispatched on.
    pub(crate) fn spawn<F>(stack_bytes: usize, name: String, entry: F) -> io::Result<ExecContext>
    where
        F: FnOnce(CpuId) + Send + 'static,
    {
        let inner = Arc::new(Inner {
            slot: Mutex::new(Slot::Parked),
            cond: Condvar::new(),
        });
        let theirs = Arc::clone(&inner);
        thread::Builder::new()
            .name(name)
            .stack_size(stack::effective_size(stack_bytes))
            .spawn(move || {
                // Waits for the first dispatch; unwinds quietly if the
                // context is torn down before it ever ran.
                let cpu = theirs.park();
                entry(cpu);
            })?;
        Ok(ExecContext { inner })
    }

    /// Hands `cpu` to this context and wakes it.
    pub(crate) fn dispatch(&self, cpu: CpuId) {
        self.inner.dispatch(cpu);
    }

    /// Blocks the calling context until it is dispatched again.
    /// Returns the CPU it was resumed on.
    pub(crate) fn park(&self) -> CpuId {
        self.inner.park()
    }

    /// Tears the context down. A parked (or never-started) backing
    /// thread unwinds and exits; a context whose entry function has
    /// already returned ignores this.
    pub(crate) fn kill(&self) {
        self.inner.kill();
    }
}

/// True when an unwind payload is a quiet context teardown rather
/// than a real panic.
pub(crate) fn is_exit_payload(payload: &(dyn std::any::Any + Send)) -> bool {
    payload.is::<ContextExit>()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crossbeam_queue::ArrayQueue;

    use super::*;

    #[test]
    fn entry_sees_dispatch_cpu() {
        let seen: Arc<ArrayQueue<CpuId>> = Arc::new(ArrayQueue::new(1));
        let seen2 = Arc::clone(&seen);

        let ctx = ExecContext::spawn(0, "ctx-test".into(), move |cpu| {
            let _r = seen2.push(cpu);
        })
        .unwrap();

        ctx.dispatch(3);
        while seen.is_empty() {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(seen.pop(), Some(3));
    }

    #[test]
    fn kill_before_first_dispatch_is_quiet() {
        let ctx = ExecContext::spawn(0, "ctx-kill".into(), move |_| {
            panic!("must never run");
        })
        .unwrap();
        ctx.kill();
        // The backing thread unwinds on its own; nothing to observe
        // beyond the absence of the panic above.
    }
}
