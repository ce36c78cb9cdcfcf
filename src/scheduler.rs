//! The core logic of the scheduler.
//!
//! Has the following properties:
//! * One global FIFO of runnable threads, shared by every CPU
//! * A FIFO of parked idle threads and a FIFO of suspended CPUs
//! * Pull-based wakeup: whoever makes a thread runnable sends one IPI
//!   to one suspended CPU; the woken idle loop does the queue work
//! * A single-slot "last free" hand-off so a terminating thread's
//!   storage is reclaimed by its successor, never by itself
//!
//! Thread objects move *between* the containers here: a thread is
//! owned by exactly one of {some CPU's current slot, ready, idle, a
//! mutex or condvar wait queue, some thread's join list, last-free}
//! at any instant. All of it sits behind the machine's guard; the
//! token threaded through these functions is the proof.

use std::collections::VecDeque;

use log::trace;

use crate::context::ExecContext;
use crate::guard::GuardToken;
use crate::smp::{Machine, Wake};
use crate::threads::{Tcb, ThreadKind};
use crate::tls::Environment;
use crate::CpuId;

pub(crate) struct SchedQueues {
    /// Runnable user threads, FIFO.
    pub(crate) ready: VecDeque<Box<Tcb>>,
    /// Parked idle threads waiting for their turn to idle a CPU.
    pub(crate) idle: VecDeque<Box<Tcb>>,
    /// CPUs that have parked themselves waiting for work.
    pub(crate) suspended: VecDeque<CpuId>,
    /// Terminated thread awaiting reclamation by the next dispatch.
    pub(crate) last_free: Option<Box<Tcb>>,
    /// What each CPU is running right now.
    pub(crate) current: Vec<Option<Box<Tcb>>>,
    /// Live user threads; the machine halts when this hits zero.
    pub(crate) live_user: usize,
}

/// All scheduler queues behind one cell. Access requires the guard
/// token, which is what makes the `unsafe impl`s below sound.
pub(crate) struct SchedState {
    inner: core::cell::UnsafeCell<SchedQueues>,
}

unsafe impl Send for SchedState {}
unsafe impl Sync for SchedState {}

impl SchedState {
    pub(crate) fn new(ncpus: usize) -> SchedState {
        let mut current = Vec::with_capacity(ncpus);
        current.resize_with(ncpus, || None);
        SchedState {
            inner: core::cell::UnsafeCell::new(SchedQueues {
                ready: VecDeque::new(),
                idle: VecDeque::new(),
                suspended: VecDeque::new(),
                last_free: None,
                current,
                live_user: 0,
            }),
        }
    }

    /// The queues. Callers must not overlap two live borrows; take the
    /// reference, use it, and re-take it after anything that may
    /// reenter the scheduler.
    #[allow(clippy::mut_from_ref)]
    pub(crate) fn queues<'a>(&'a self, _token: &'a GuardToken<'_>) -> &'a mut SchedQueues {
        // SAFETY: the guard token proves the big lock is held, and the
        // guard serializes every accessor machine-wide.
        unsafe { &mut *self.inner.get() }
    }
}

/// Pops the successor (ready head, else idle head), records it as
/// `cpu`'s current thread and returns its context.
fn take_next(machine: &Machine, token: &GuardToken<'_>, cpu: CpuId) -> ExecContext {
    let q = machine.sched.queues(token);
    let next = q
        .ready
        .pop_front()
        .or_else(|| q.idle.pop_front())
        .expect("ready and idle both empty; the idle invariant is broken");
    trace!("cpu {} dispatches thread {}", cpu, next.id);
    if matches!(next.kind, ThreadKind::User) {
        machine.cpu(cpu).count_user_dispatch();
    }
    let ctx = next.context.clone();
    q.current[cpu] = Some(next);
    ctx
}

/// Drops whatever sits in the last-free slot. Runs on every dispatch
/// before control returns to user code, so a terminated thread's
/// storage is gone before anything else happens on this CPU.
pub(crate) fn reclaim_last_free(machine: &Machine, token: &GuardToken<'_>) {
    let dead = machine.sched.queues(token).last_free.take();
    if let Some(dead) = dead {
        trace!("reclaiming thread {}", dead.id);
        drop(dead);
    }
}

/// Switches this CPU to the next runnable thread.
///
/// Called with the guard held by a thread that has already moved
/// itself out of the CPU's current slot (into ready, a wait queue, or
/// the last-free slot). The guard travels with the CPU; when the
/// caller is eventually dispatched again this returns a fresh token,
/// with the last-free slot already reclaimed.
pub(crate) fn run_next<'m>(
    machine: &'m Machine,
    token: GuardToken<'m>,
    old: ExecContext,
) -> GuardToken<'m> {
    let cpu = token.cpu();
    debug_assert!(
        !machine.cpu(cpu).interrupts_enabled(),
        "guard held with interrupts unmasked"
    );
    let next = take_next(machine, &token, cpu);
    token.transfer();
    // Dispatch-then-park: if `next` is this very context the park
    // consumes the dispatch immediately and we never block.
    next.dispatch(cpu);
    let resumed_on = old.park();

    Environment::set_cpu(resumed_on);
    // SAFETY: we were dispatched by a context switch performed under
    // the guard; ownership of it rides with the CPU.
    let token = unsafe { GuardToken::assume_held(machine, resumed_on) };
    reclaim_last_free(machine, &token);
    token
}

/// `run_next` for a thread that will never resume: dispatches the
/// successor without parking. The caller's context unwinds out of its
/// start wrapper and exits.
pub(crate) fn run_next_final(machine: &Machine, token: GuardToken<'_>) {
    let cpu = token.cpu();
    let next = take_next(machine, &token, cpu);
    token.transfer();
    next.dispatch(cpu);
}

/// First dispatch on a freshly booted CPU. The caller's guard travels
/// to the dispatched thread; its start wrapper releases it.
pub(crate) fn dispatch_first(machine: &Machine, token: GuardToken<'_>, cpu: CpuId) {
    let next = take_next(machine, &token, cpu);
    token.transfer();
    next.dispatch(cpu);
}

/// If there is work and a parked CPU, wake exactly one. Every action
/// that makes a thread runnable calls this exactly once.
///
/// A CPU woken by a timer rather than an IPI can leave a stale entry
/// in `suspended`; the IPI a later wakeup sends to that busy CPU is
/// absorbed by the empty IPI handler.
pub(crate) fn wakeup_one_cpu(machine: &Machine, q: &mut SchedQueues) {
    if !q.ready.is_empty() {
        if let Some(cpu) = q.suspended.pop_front() {
            machine.send_ipi(cpu);
        }
    }
}

/// Body of every idle thread.
///
/// Park protocol: queue self on `idle`, hand the CPU to whoever has
/// work, and when control comes back (meaning nothing was runnable)
/// put the CPU on `suspended` and sleep until an interrupt. Returns
/// only when the machine halts.
pub(crate) fn idle_loop() {
    let machine = Environment::machine();
    loop {
        let token = machine.guard();
        let cpu = token.cpu();
        let me = machine.sched.queues(&token).current[cpu]
            .take()
            .expect("idle thread is not current");
        let ctx = me.context.clone();
        machine.sched.queues(&token).idle.push_back(me);

        let token = run_next(&machine, token, ctx);

        // Nothing runnable for this CPU; park it.
        let cpu = token.cpu();
        trace!("cpu {} suspending", cpu);
        machine.sched.queues(&token).suspended.push_back(cpu);
        match machine.unlock_and_suspend(token) {
            Wake::Halted => return,
            Wake::Interrupted => {}
        }
    }
}

/// Timer interrupt: preempt the current thread if anyone else is
/// waiting to run. A CPU whose ready view is empty keeps its thread;
/// there is nothing better to switch to.
pub(crate) fn timer_interrupt() {
    let machine = Environment::machine();
    let token = machine.guard();
    let cpu = token.cpu();
    let q = machine.sched.queues(&token);
    if q.ready.is_empty() {
        return;
    }
    let me = q.current[cpu].take().expect("no current thread");
    trace!("cpu {} preempts thread {}", cpu, me.id);
    let ctx = me.context.clone();
    q.ready.push_back(me);
    let _token = run_next(&machine, token, ctx);
}

/// IPI handler. Intentionally empty: the wake itself makes
/// `interrupt_enable_suspend` return, and the idle loop that called it
/// does the actual rescheduling work.
pub(crate) fn ipi_interrupt() {}

/// Drops everything still owned by the scheduler. Only legal once no
/// CPU is executing (after halt, or before boot): parked contexts are
/// torn down as their thread objects drop.
pub(crate) fn reap(machine: &Machine, token: &GuardToken<'_>) {
    let q = machine.sched.queues(token);
    q.ready.clear();
    q.idle.clear();
    q.suspended.clear();
    q.last_free = None;
    for slot in q.current.iter_mut() {
        *slot = None;
    }
}

#[cfg(test)]
mod tests {
    use std::cell::UnsafeCell;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use crossbeam_queue::ArrayQueue;

    use crate::smp::Machine;
    use crate::threads::ThreadId;
    use crate::tls::Environment;
    use crate::Mutex;

    // Sync wrapper for a counter that the machine's own mutex
    // protects; the test asserts the protection worked.
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

    /// Three threads on one CPU, each bumping a shared counter 100
    /// times with a yield after every bump. The counter lands on 300
    /// and the dispatch log is a strict FIFO rotation.
    #[test]
    fn single_cpu_yield_round() {
        let _r = env_logger::try_init();
        let m = Machine::new(1);

        let counter: Arc<UnsafeSyncCell<usize>> = Arc::new(UnsafeSyncCell::new(0));
        let order: Arc<ArrayQueue<ThreadId>> = Arc::new(ArrayQueue::new(300));
        let mtx = Arc::new(Mutex::new());

        for _ in 0..3 {
            let counter = Arc::clone(&counter);
            let order = Arc::clone(&order);
            let mtx = Arc::clone(&mtx);
            m.spawn(move || {
                for _ in 0..100 {
                    mtx.lock();
                    unsafe {
                        *counter.inner.get() += 1;
                    }
                    let _r = order.push(Environment::tid());
                    mtx.unlock().unwrap();
                    crate::yield_now();
                }
            })
            .unwrap();
        }

        m.run();

        assert_eq!(unsafe { *counter.inner.get() }, 300);
        assert_eq!(order.len(), 300);
        let mut log = Vec::with_capacity(300);
        while let Some(tid) = order.pop() {
            log.push(tid);
        }
        // One CPU and a yield per bump: the rotation established by
        // the first three dispatches repeats to the end.
        assert_ne!(log[0], log[1]);
        assert_ne!(log[1], log[2]);
        assert_ne!(log[0], log[2]);
        for (i, tid) in log.iter().enumerate() {
            assert_eq!(*tid, log[i % 3], "unfair interleave at slot {}", i);
        }
    }

    /// A seed thread on a four-CPU machine fans out 16 workers and
    /// joins them all. Every CPU ends up dispatching user threads, and
    /// join returns only after the workers are done.
    #[test]
    fn multi_cpu_fanout_join() {
        let _r = env_logger::try_init();
        const CPUS: usize = 4;
        const WORKERS: usize = 16;

        let m = Machine::new(CPUS);
        let seen: Arc<Vec<AtomicBool>> =
            Arc::new((0..CPUS).map(|_| AtomicBool::new(false)).collect());
        let stop = Arc::new(AtomicBool::new(false));
        let done = Arc::new(AtomicBool::new(false));
        let started: Arc<ArrayQueue<ThreadId>> = Arc::new(ArrayQueue::new(WORKERS));

        let seen_main = Arc::clone(&seen);
        let stop_main = Arc::clone(&stop);
        let done_main = Arc::clone(&done);
        let started_main = Arc::clone(&started);
        m.spawn(move || {
            let mut workers = Vec::with_capacity(WORKERS);
            for _ in 0..WORKERS {
                let seen = Arc::clone(&seen_main);
                let stop = Arc::clone(&stop_main);
                let started = Arc::clone(&started_main);
                let handle = crate::spawn(move || {
                    let _r = started.push(Environment::tid());
                    // Keep the ready queue populated until every CPU
                    // has provably run user work; with more workers
                    // than CPUs no CPU can park in the meantime.
                    while !stop.load(Ordering::SeqCst) {
                        seen[Environment::cpu_id()].store(true, Ordering::SeqCst);
                        crate::yield_now();
                    }
                })
                .unwrap();
                workers.push(handle);
            }

            while !seen_main.iter().all(|s| s.load(Ordering::SeqCst)) {
                crate::yield_now();
            }
            stop_main.store(true, Ordering::SeqCst);

            for handle in &workers {
                handle.join();
            }
            // A second join on a finished thread returns immediately.
            for handle in &workers {
                handle.join();
            }
            done_main.store(true, Ordering::SeqCst);
        })
        .unwrap();

        m.run();

        assert!(done.load(Ordering::SeqCst), "main joined all workers");
        assert_eq!(started.len(), WORKERS, "all workers ran");
        for (cpu, s) in seen.iter().enumerate() {
            assert!(s.load(Ordering::SeqCst), "cpu {} never ran a worker", cpu);
        }
        let stats = m.stats();
        for (cpu, n) in stats.user_dispatches.iter().enumerate() {
            assert!(*n >= 1, "cpu {} reports no user dispatches", cpu);
        }
    }
}
