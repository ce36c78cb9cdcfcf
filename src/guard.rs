// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The "big guard" lock.
//!
//! One machine-wide atomic flag combined with per-CPU interrupt
//! masking. Holding the guard means: interrupts are masked on the
//! holding CPU and no other CPU is inside a scheduler critical
//! section. Every touch of the run queues, the suspended-CPU list,
//! the last-free slot, any mutex or condvar queue and any CPU's
//! current-thread pointer happens under it.
//!
//! Acquisition order matters: interrupts are masked *before* spinning
//! on the flag. Were they left on while spinning, a timer interrupt
//! could fire mid-spin, its handler would try to take the guard on the
//! same CPU and the CPU would deadlock against itself. Release is the
//! reverse: clear the flag, then unmask.
//!
//! The guard is deliberately not a `Mutex`: it is held *across*
//! context switches. A blocking thread acquires it, switches away, and
//! whichever thread resumes on that CPU releases it from its own
//! stack. [`GuardToken::transfer`] models that hand-off; the resumed
//! side re-materializes its token with [`GuardToken::assume_held`].

use std::marker::PhantomData;
use std::mem;
use std::sync::atomic::Ordering;

use crate::smp::{Machine, Wake};
use crate::tls::Environment;
use crate::CpuId;

/// Proof that the calling thread holds the guard. Dropping it
/// releases the guard on every exit path, normal or unwinding.
///
/// `cpu` is `None` for callers that are not bound to a virtual CPU
/// (the boot path and external spawners); they take the flag but have
/// no interrupts to mask.
pub(crate) struct GuardToken<'m> {
    machine: &'m Machine,
    cpu: Option<CpuId>,
    // Guard ownership must never leave the acquiring context.
    _not_send: PhantomData<*const ()>,
}

impl<'m> GuardToken<'m> {
    /// The virtual CPU this token was taken on.
    ///
    /// # Panics
    /// If the holder is not a machine context. Scheduler operations
    /// that block or dispatch are only legal on a virtual CPU.
    pub(crate) fn cpu(&self) -> CpuId {
        self.cpu.expect("not running on a virtual cpu")
    }

    /// Hands guard ownership to the thread about to be dispatched.
    /// The flag stays set; the successor's stack already contains a
    /// pending release (or, for a fresh thread, the start wrapper
    /// performs it).
    pub(crate) fn transfer(self) {
        mem::forget(self);
    }

    /// Re-materializes the token after this thread has been resumed by
    /// `run_next` on `cpu`.
    ///
    /// # Safety
    /// The caller must actually have been handed the guard: either it
    /// was just dispatched by a context switch performed under the
    /// guard, or it re-enters from `transfer`.
    pub(crate) unsafe fn assume_held(machine: &'m Machine, cpu: CpuId) -> GuardToken<'m> {
        debug_assert!(machine.guard_flag.load(Ordering::SeqCst));
        GuardToken {
            machine,
            cpu: Some(cpu),
            _not_send: PhantomData,
        }
    }
}

impl Drop for GuardToken<'_> {
    fn drop(&mut self) {
        self.machine.guard_flag.store(false, Ordering::SeqCst);
        if let Some(cpu) = self.cpu {
            // Unmasking is a delivery point: a pending timer tick may
            // preempt right here, after the flag is already clear.
            self.machine.cpu(cpu).interrupt_enable();
        }
    }
}

impl Machine {
    /// Acquires the guard: mask interrupts on the calling CPU, then
    /// spin on the flag.
    pub(crate) fn guard(&self) -> GuardToken<'_> {
        let cpu = Environment::on(self);
        if let Some(cpu) = cpu {
            self.cpu(cpu).interrupt_disable();
        }
        while self.guard_flag.swap(true, Ordering::SeqCst) {
            core::hint::spin_loop();
        }
        GuardToken {
            machine: self,
            cpu,
            _not_send: PhantomData,
        }
    }

    /// The idle loop's unlock-and-suspend: clear the flag, then
    /// atomically re-enable interrupts and park the CPU until one is
    /// delivered. The enable and the wait happen under one lock inside
    /// the CPU, so an IPI sent between the flag store and the park is
    /// never lost.
    pub(crate) fn unlock_and_suspend(&self, token: GuardToken<'_>) -> Wake {
        let cpu = token.cpu();
        token.transfer();
        self.guard_flag.store(false, Ordering::SeqCst);
        self.cpu(cpu).interrupt_enable_suspend()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use crate::smp::Machine;

    #[test]
    fn token_drop_releases_flag() {
        let m = Machine::new(1);
        {
            let _token = m.guard();
            assert!(m.guard_flag.load(Ordering::SeqCst));
        }
        assert!(!m.guard_flag.load(Ordering::SeqCst));
        // Reacquirable after release.
        let _token = m.guard();
    }
}
