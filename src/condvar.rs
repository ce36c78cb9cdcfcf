//! Condition variables for machine threads.
//!
//! `wait` releases the mutex and parks the caller in FIFO order;
//! `signal` and `broadcast` move waiters back to the run queue in
//! that order. Unlike the mutex there is no hand-off: a woken waiter
//! re-competes for the mutex on its way out of `wait`. The runtime
//! never generates spurious wakeups, but callers are expected to
//! retest their predicate in a loop all the same.

use std::cell::UnsafeCell;
use std::collections::VecDeque;

use crate::guard::GuardToken;
use crate::mutex::Mutex;
use crate::scheduler;
use crate::threads::Tcb;
use crate::tls::Environment;
use crate::Error;

struct CondVarInner {
    waiters: VecDeque<Box<Tcb>>,
}

/// A condition variable.
pub struct CondVar {
    inner: UnsafeCell<CondVarInner>,
}

unsafe impl Send for CondVar {}
unsafe impl Sync for CondVar {}

impl Default for CondVar {
    fn default() -> Self {
        Self::new()
    }
}

impl CondVar {
    pub fn new() -> CondVar {
        CondVar {
            inner: UnsafeCell::new(CondVarInner {
                waiters: VecDeque::new(),
            }),
        }
    }

    #[allow(clippy::mut_from_ref)]
    fn inner(&self, _token: &GuardToken<'_>) -> &mut CondVarInner {
        // SAFETY: guard held.
        unsafe { &mut *self.inner.get() }
    }

    /// Atomically releases `mutex` and blocks until signalled, then
    /// re-acquires `mutex` before returning. Fails with
    /// [`Error::NotOwner`] when the caller does not hold `mutex`, in
    /// which case nothing changes.
    pub fn wait(&self, mutex: &Mutex) -> Result<(), Error> {
        let machine = Environment::machine();
        let token = machine.guard();
        mutex.unlock_with(&machine, &token)?;
        let cpu = token.cpu();
        let me = machine.sched.queues(&token).current[cpu]
            .take()
            .expect("waiting thread is not current");
        let ctx = me.context.clone();
        self.inner(&token).waiters.push_back(me);
        let token = scheduler::run_next(&machine, token, ctx);
        // Signalled; re-compete for the mutex like anybody else.
        let _token = mutex.lock_with(&machine, token);
        Ok(())
    }

    /// Wakes the longest-waiting thread, if any.
    pub fn signal(&self) {
        let machine = Environment::machine();
        let token = machine.guard();
        self.signal_one(&machine, &token);
    }

    /// Wakes every waiting thread, in wait order.
    pub fn broadcast(&self) {
        let machine = Environment::machine();
        let token = machine.guard();
        while self.signal_one(&machine, &token) {}
    }

    fn signal_one(&self, machine: &crate::smp::Machine, token: &GuardToken<'_>) -> bool {
        let woken = self.inner(token).waiters.pop_front();
        match woken {
            Some(thread) => {
                let q = machine.sched.queues(token);
                q.ready.push_back(thread);
                scheduler::wakeup_one_cpu(machine, q);
                true
            }
            None => false,
        }
    }
}

impl Drop for CondVar {
    fn drop(&mut self) {
        assert!(
            self.inner.get_mut().waiters.is_empty(),
            "condvar dropped with waiters"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::cell::UnsafeCell;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use crossbeam_queue::ArrayQueue;

    use super::*;
    use crate::smp::Machine;
    use crate::threads::ThreadId;

    struct UnsafeSyncCell<T: ?Sized> {
        inner: UnsafeCell<T>,
    }
    impl<T> UnsafeSyncCell<T> {
        fn new(v: T) -> Self {
            UnsafeSyncCell {
                inner: UnsafeCell::new(v),
            }
        }
    }
    unsafe impl<T: ?Sized + Send> Send for UnsafeSyncCell<T> {}
    unsafe impl<T: ?Sized + Send> Sync for UnsafeSyncCell<T> {}

    /// Scenario: a bounded buffer of one slot between a producer and
    /// a consumer, one mutex, two condvars. The consumer sees 1..=10
    /// in order.
    #[test]
    fn producer_consumer() {
        let _r = env_logger::try_init();
        let m = Machine::new(2);

        let buffer: Arc<UnsafeSyncCell<Option<i32>>> = Arc::new(UnsafeSyncCell::new(None));
        let mtx = Arc::new(Mutex::new());
        let not_full = Arc::new(CondVar::new());
        let not_empty = Arc::new(CondVar::new());
        let out: Arc<ArrayQueue<i32>> = Arc::new(ArrayQueue::new(10));

        let buffer_p = Arc::clone(&buffer);
        let mtx_p = Arc::clone(&mtx);
        let not_full_p = Arc::clone(&not_full);
        let not_empty_p = Arc::clone(&not_empty);
        m.spawn(move || {
            for i in 1..=10 {
                mtx_p.lock();
                while unsafe { (*buffer_p.inner.get()).is_some() } {
                    not_full_p.wait(&mtx_p).unwrap();
                }
                unsafe {
                    *buffer_p.inner.get() = Some(i);
                }
                not_empty_p.signal();
                mtx_p.unlock().unwrap();
            }
        })
        .unwrap();

        let out_c = Arc::clone(&out);
        m.spawn(move || {
            for _ in 0..10 {
                mtx.lock();
                let value = loop {
                    if let Some(v) = unsafe { (*buffer.inner.get()).take() } {
                        break v;
                    }
                    not_empty.wait(&mtx).unwrap();
                };
                not_full.signal();
                mtx.unlock().unwrap();
                let _r = out_c.push(value);
            }
        })
        .unwrap();

        m.run();

        let mut got = Vec::new();
        while let Some(v) = out.pop() {
            got.push(v);
        }
        assert_eq!(got, (1..=10).collect::<Vec<_>>());
    }

    /// Broadcast wakes every waiter, in the order they started
    /// waiting.
    #[test]
    fn broadcast_wakes_in_wait_order() {
        let _r = env_logger::try_init();
        let m = Machine::new(1);

        let mtx = Arc::new(Mutex::new());
        let cv = Arc::new(CondVar::new());
        let waiting = Arc::new(AtomicUsize::new(0));
        let woken: Arc<ArrayQueue<ThreadId>> = Arc::new(ArrayQueue::new(3));

        let mtx_main = Arc::clone(&mtx);
        let cv_main = Arc::clone(&cv);
        let waiting_main = Arc::clone(&waiting);
        let woken_main = Arc::clone(&woken);
        m.spawn(move || {
            for _ in 0..3 {
                let mtx = Arc::clone(&mtx_main);
                let cv = Arc::clone(&cv_main);
                let waiting = Arc::clone(&waiting_main);
                let woken = Arc::clone(&woken_main);
                crate::spawn(move || {
                    mtx.lock();
                    waiting.fetch_add(1, Ordering::SeqCst);
                    cv.wait(&mtx).unwrap();
                    let _r = woken.push(crate::Environment::tid());
                    mtx.unlock().unwrap();
                })
                .unwrap();
            }

            while waiting_main.load(Ordering::SeqCst) < 3 {
                crate::yield_now();
            }
            cv_main.broadcast();
        })
        .unwrap();

        m.run();

        // Waiters were spawned, ran and queued in ascending thread-id
        // order; broadcast must wake them the same way.
        let mut got = Vec::new();
        while let Some(tid) = woken.pop() {
            got.push(tid);
        }
        assert_eq!(got.len(), 3);
        assert!(got.windows(2).all(|w| w[0] < w[1]), "woken out of order");
    }

    #[test]
    fn signal_without_waiters_is_a_noop() {
        let _r = env_logger::try_init();
        let m = Machine::new(1);
        let cv = Arc::new(CondVar::new());
        m.spawn(move || {
            cv.signal();
            cv.broadcast();
        })
        .unwrap();
        m.run();
    }

    #[test]
    fn wait_without_the_mutex_fails() {
        let _r = env_logger::try_init();
        let m = Machine::new(1);
        let result: Arc<ArrayQueue<Result<(), Error>>> = Arc::new(ArrayQueue::new(1));
        let result2 = Arc::clone(&result);
        m.spawn(move || {
            let mtx = Mutex::new();
            let cv = CondVar::new();
            let _r = result2.push(cv.wait(&mtx));
        })
        .unwrap();
        m.run();
        assert_eq!(result.pop(), Some(Err(Error::NotOwner)));
    }
}
