// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! A FIFO mutex for machine threads.
//!
//! Release hands the lock directly to the longest-waiting thread
//! before that thread is put back on the run queue. Without the
//! hand-off a third thread could slip in and take the lock between
//! the release and the waiter's resumption; with it, acquisition
//! order is exactly the order in which threads first called
//! [`Mutex::lock`].

use std::cell::UnsafeCell;
use std::collections::VecDeque;

use crate::guard::GuardToken;
use crate::scheduler;
use crate::smp::Machine;
use crate::threads::{Tcb, ThreadId};
use crate::tls::Environment;
use crate::Error;

struct MutexInner {
    owner: Option<ThreadId>,
    waiters: VecDeque<Box<Tcb>>,
}

/// A mutual exclusion lock. Unlike `std::sync::Mutex` this guards a
/// critical *section*, not a value, and release is explicit.
pub struct Mutex {
    inner: UnsafeCell<MutexInner>,
}

unsafe impl Send for Mutex {}
unsafe impl Sync for Mutex {}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Mutex {
    pub fn new() -> Mutex {
        Mutex {
            inner: UnsafeCell::new(MutexInner {
                owner: None,
                waiters: VecDeque::new(),
            }),
        }
    }

    #[allow(clippy::mut_from_ref)]
    fn inner(&self, _token: &GuardToken<'_>) -> &mut MutexInner {
        // SAFETY: guard held.
        unsafe { &mut *self.inner.get() }
    }

    /// Acquires the lock, blocking until it is available.
    ///
    /// # Panics
    /// If the calling OS thread is not a machine context, or on a
    /// relock attempt by the current owner (this mutex is not
    /// recursive and self-relock can only deadlock).
    pub fn lock(&self) {
        let machine = Environment::machine();
        let token = machine.guard();
        let _token = self.lock_with(&machine, token);
    }

    /// Lock body, callable with the guard already held (the condvar
    /// re-acquires through here). Returns with the guard held and the
    /// lock owned by the caller.
    pub(crate) fn lock_with<'m>(
        &self,
        machine: &'m Machine,
        token: GuardToken<'m>,
    ) -> GuardToken<'m> {
        let cpu = token.cpu();
        let me_id = machine.sched.queues(&token).current[cpu]
            .as_ref()
            .expect("locking thread is not current")
            .id;
        let inner = self.inner(&token);
        if inner.owner.is_none() {
            inner.owner = Some(me_id);
            debug_assert!(inner.waiters.is_empty());
            return token;
        }
        assert!(
            inner.owner != Some(me_id),
            "thread {} relocking a mutex it holds",
            me_id
        );
        let me = machine.sched.queues(&token).current[cpu]
            .take()
            .expect("locking thread is not current");
        let ctx = me.context.clone();
        self.inner(&token).waiters.push_back(me);
        // When control returns the releaser has already handed the
        // lock to this thread.
        let token = scheduler::run_next(machine, token, ctx);
        debug_assert_eq!(self.inner(&token).owner, Some(me_id));
        token
    }

    /// Releases the lock. Fails with [`Error::NotOwner`] when the
    /// caller does not hold it.
    pub fn unlock(&self) -> Result<(), Error> {
        let machine = Environment::machine();
        let token = machine.guard();
        self.unlock_with(&machine, &token)
    }

    /// Release body, callable with the guard already held.
    pub(crate) fn unlock_with(
        &self,
        machine: &Machine,
        token: &GuardToken<'_>,
    ) -> Result<(), Error> {
        let cpu = token.cpu();
        let me_id = machine.sched.queues(token).current[cpu]
            .as_ref()
            .expect("releasing thread is not current")
            .id;
        let inner = self.inner(token);
        if inner.owner != Some(me_id) {
            return Err(Error::NotOwner);
        }
        inner.owner = None;
        if let Some(next) = inner.waiters.pop_front() {
            // Direct hand-off; the lock never floats unowned while
            // someone is queued.
            inner.owner = Some(next.id);
            let q = machine.sched.queues(token);
            q.ready.push_back(next);
            scheduler::wakeup_one_cpu(machine, q);
        }
        debug_assert!(inner.owner.is_some() || inner.waiters.is_empty());
        Ok(())
    }
}

impl Drop for Mutex {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        assert!(inner.owner.is_none(), "mutex dropped while held");
        assert!(inner.waiters.is_empty(), "mutex dropped with waiters");
    }
}
