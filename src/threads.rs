//! Thread objects, the thread-start wrapper and the user-facing
//! handle.
//!
//! A thread's storage is owned by the runtime, never by its handle:
//! it moves between the scheduler's containers while the thread lives
//! and is reclaimed through the last-free slot after it terminates.
//! The handle and the thread share one `JoinState`; terminating marks
//! it done, which is what makes a later `join` return immediately.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use log::{error, trace};

use crate::context::{self, ExecContext};
use crate::guard::GuardToken;
use crate::scheduler;
use crate::smp::Machine;
use crate::tls::Environment;
use crate::{CpuId, Error};

/// The id of a thread. Ids are allocated monotonically and never
/// reused.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ThreadId(pub usize);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ThreadKind {
    User,
    Idle,
}

/// The thread object the scheduler moves between its containers.
pub(crate) struct Tcb {
    pub(crate) id: ThreadId,
    pub(crate) kind: ThreadKind,
    pub(crate) context: ExecContext,
    pub(crate) join: Arc<JoinState>,
}

impl Drop for Tcb {
    fn drop(&mut self) {
        // For a terminated thread this is a no-op; for a thread
        // reaped out of a queue it unwinds the parked context.
        self.context.kill();
    }
}

struct JoinInner {
    done: bool,
    waiters: VecDeque<Box<Tcb>>,
}

/// Termination state shared between a thread and its handle, guard
/// protected like everything else the scheduler touches.
pub(crate) struct JoinState {
    inner: UnsafeCell<JoinInner>,
}

unsafe impl Send for JoinState {}
unsafe impl Sync for JoinState {}

impl JoinState {
    fn new() -> JoinState {
        JoinState {
            inner: UnsafeCell::new(JoinInner {
                done: false,
                waiters: VecDeque::new(),
            }),
        }
    }

    pub(crate) fn is_done(&self, _token: &GuardToken<'_>) -> bool {
        // SAFETY: guard held.
        unsafe { (*self.inner.get()).done }
    }

    pub(crate) fn push_waiter(&self, _token: &GuardToken<'_>, waiter: Box<Tcb>) {
        // SAFETY: guard held.
        unsafe { (*self.inner.get()).waiters.push_back(waiter) }
    }

    /// Marks the thread done and hands back everyone waiting on it.
    pub(crate) fn finish(&self, _token: &GuardToken<'_>) -> VecDeque<Box<Tcb>> {
        // SAFETY: guard held.
        let inner = unsafe { &mut *self.inner.get() };
        inner.done = true;
        std::mem::take(&mut inner.waiters)
    }
}

/// Builds a thread object whose context enters the start wrapper on
/// first dispatch. No scheduler state is touched here; the caller
/// enqueues the result under the guard.
pub(crate) fn build_tcb<F>(
    machine: &Arc<Machine>,
    kind: ThreadKind,
    f: F,
) -> Result<Box<Tcb>, Error>
where
    F: FnOnce() + Send + 'static,
{
    let id = ThreadId(machine.next_tid());
    let name = match kind {
        ThreadKind::User => format!("rota-thread-{}", id),
        ThreadKind::Idle => format!("rota-idle-{}", id),
    };
    let m = Arc::clone(machine);
    let context = ExecContext::spawn(machine.stack_size(), name, move |cpu| {
        thread_start(m, id, kind, f, cpu)
    })
    .map_err(|e| {
        error!("context creation failed: {}", e);
        Error::SpawnFailed
    })?;
    Ok(Box::new(Tcb {
        id,
        kind,
        context,
        join: Arc::new(JoinState::new()),
    }))
}

/// Every thread begins and ends here.
///
/// Entered via a dispatch, so the guard is held: reclaim the previous
/// last-free entry, release the guard, and only then run user code.
/// On the way out, wake the joiners, mark the join state done,
/// deposit self in the last-free slot and dispatch a successor. This
/// context never runs again.
fn thread_start<F>(machine: Arc<Machine>, id: ThreadId, kind: ThreadKind, f: F, cpu: CpuId)
where
    F: FnOnce() + Send + 'static,
{
    Environment::enter(&machine, cpu, id);
    {
        // SAFETY: a fresh thread is only ever entered through a
        // dispatch performed under the guard.
        let token = unsafe { GuardToken::assume_held(&machine, cpu) };
        scheduler::reclaim_last_free(&machine, &token);
    }
    // Token dropped: guard released, interrupts on. User code runs
    // under normal conditions from here.

    trace!("thread {} started", id);
    let result = panic::catch_unwind(AssertUnwindSafe(f));
    if let Err(payload) = result {
        if context::is_exit_payload(payload.as_ref()) {
            panic::resume_unwind(payload);
        }
        error!("thread {} panicked; terminating it", id);
    }

    if kind == ThreadKind::Idle {
        // Idle loops return exactly once, when the machine halts.
        machine.note_parked(Environment::cpu_id());
        return;
    }

    let token = machine.guard();
    let cpu = token.cpu();
    let me = machine.sched.queues(&token).current[cpu]
        .take()
        .expect("terminating thread is not current");
    trace!("thread {} terminating", id);

    let mut waiters = me.join.finish(&token);
    while let Some(waiter) = waiters.pop_front() {
        let q = machine.sched.queues(&token);
        q.ready.push_back(waiter);
        scheduler::wakeup_one_cpu(&machine, q);
    }

    {
        let q = machine.sched.queues(&token);
        debug_assert!(q.last_free.is_none(), "two threads in the last-free slot");
        q.last_free = Some(me);
        q.live_user -= 1;
        if q.live_user == 0 {
            machine.begin_halt();
        }
    }
    scheduler::run_next_final(&machine, token);
    // The successor owns the CPU; this context unwinds and exits.
}

/// A handle to a running (or finished) thread.
///
/// The handle owns nothing: dropping it merely detaches it, the
/// thread runs to completion and its storage is reclaimed by the
/// runtime either way.
pub struct Thread {
    id: ThreadId,
    machine: Arc<Machine>,
    join: Arc<JoinState>,
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Thread#{}", self.id.0)
    }
}

impl Thread {
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Blocks the calling thread until this thread has terminated.
    /// Returns immediately if it already has. Several threads may
    /// join the same target; all of them are woken on termination.
    ///
    /// # Panics
    /// If the target is still running and the calling OS thread is
    /// not a context of the same machine.
    pub fn join(&self) {
        let token = self.machine.guard();
        if self.join.is_done(&token) {
            return;
        }
        let cpu = token.cpu();
        let me = self.machine.sched.queues(&token).current[cpu]
            .take()
            .expect("joining thread is not current");
        let ctx = me.context.clone();
        self.join.push_waiter(&token, me);
        let _token = scheduler::run_next(&self.machine, token, ctx);
    }
}

impl Machine {
    /// Creates a thread running `f` and makes it runnable. If any CPU
    /// is parked, one is woken by IPI to pick it up.
    ///
    /// Legal both from threads already on the machine and from
    /// outside (before `run`, or while the machine is running).
    pub fn spawn<F>(self: &Arc<Self>, f: F) -> Result<Thread, Error>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_halted() {
            return Err(Error::Halted);
        }
        let tcb = build_tcb(self, ThreadKind::User, f)?;
        let id = tcb.id;
        let join = Arc::clone(&tcb.join);

        let mut tcb = Some(tcb);
        let verdict = {
            let token = self.guard();
            if self.is_halted() {
                Err(Error::Halted)
            } else {
                let q = self.sched.queues(&token);
                if q.live_user >= Machine::MAX_THREADS {
                    Err(Error::TooManyThreads)
                } else {
                    q.live_user += 1;
                    q.ready.push_back(tcb.take().expect("thread enqueued twice"));
                    scheduler::wakeup_one_cpu(self, q);
                    Ok(())
                }
            }
        };
        // A rejected thread object is dropped here, outside the guard.
        verdict?;
        Ok(Thread {
            id,
            machine: Arc::clone(self),
            join,
        })
    }
}

/// Spawns a thread on the machine the caller is running on.
///
/// # Panics
/// If the calling OS thread is not a machine context.
pub fn spawn<F>(f: F) -> Result<Thread, Error>
where
    F: FnOnce() + Send + 'static,
{
    Environment::machine().spawn(f)
}

/// Gives up the CPU if any other thread is waiting for it; a no-op
/// otherwise.
///
/// # Panics
/// If the calling OS thread is not a machine context.
pub fn yield_now() {
    let machine = Environment::machine();
    let token = machine.guard();
    let cpu = token.cpu();
    let q = machine.sched.queues(&token);
    if q.ready.is_empty() {
        return;
    }
    let me = q.current[cpu].take().expect("yielding thread is not current");
    let ctx = me.context.clone();
    q.ready.push_back(me);
    let _token = scheduler::run_next(&machine, token, ctx);
}
