// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The cooperative scheduler: runnable queue, run-token handoff, and `throw`.
//!
//! Tasks in this crate each run on a dedicated OS thread, but at most one
//! thread is ever allowed to execute user code at a time. That exclusivity is
//! enforced by a per-task "run token": a task's thread blocks on its own
//! [`Park`] until the scheduler grants it the token, and releases the token to
//! the next runnable task before blocking again. This reproduces the
//! single-threaded appearance and pass-the-torch rendezvous semantics of a
//! classic tasklet scheduler on top of ordinary OS threads.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::reactor::Reactor;
use crate::task::TaskRef;

/// A pending asynchronous interruption delivered to a task via [`Runtime::throw`].
#[derive(Debug, Clone, Copy)]
pub(crate) enum Pending {
    /// Cooperative kill; the next suspension point panics with [`crate::task::KillSignal`].
    Kill,
    /// A timeout fired while the task was blocked; the next suspension point
    /// returns [`crate::error::TimeoutError`] instead of panicking.
    Timeout,
}

/// A type-erased handle to whatever a task is currently blocked on (always a
/// [`crate::channel::Channel`]), so `throw` can evict it from that channel's
/// wait queue.
///
/// This is a raw pointer rather than `Weak<dyn Trait>` because the channel is
/// typically a stack-local value owned by the blocking call's own frame: that
/// frame is guaranteed to still be parked on this task's OS thread for as
/// long as `blocked_on` holds the handle, so the pointee is never dangling
/// while the handle exists.
pub(crate) struct BlockedOn {
    ptr: *const (),
    cancel: unsafe fn(*const (), &TaskRef),
}

// Safety: `ptr` is only ever dereferenced by `cancel`, which the channel that
// produced this handle promises is safe to call from any thread while the
// channel's owning call frame remains parked.
unsafe impl Send for BlockedOn {}
unsafe impl Sync for BlockedOn {}

impl BlockedOn {
    pub(crate) fn new<T>(chan: &T, cancel: unsafe fn(*const (), &TaskRef)) -> Self {
        Self {
            ptr: std::ptr::from_ref(chan).cast::<()>(),
            cancel,
        }
    }

    pub(crate) fn cancel(&self, task: &TaskRef) {
        // Safety: see the struct-level safety comment.
        unsafe { (self.cancel)(self.ptr, task) }
    }
}

/// Per-task run-token: a task's thread parks here until granted its turn.
#[derive(Debug)]
pub(crate) struct Park {
    may_run: Mutex<bool>,
    cond: Condvar,
}

impl Park {
    fn new(may_run: bool) -> Self {
        Self {
            may_run: Mutex::new(may_run),
            cond: Condvar::new(),
        }
    }

    /// Blocks the calling thread until granted the run token.
    pub(crate) fn wait_for_turn(&self) {
        let mut guard = self.may_run.lock();
        while !*guard {
            self.cond.wait(&mut guard);
        }
    }

    /// Grants the run token, waking the owning thread if it is parked.
    pub(crate) fn grant(&self) {
        let mut guard = self.may_run.lock();
        *guard = true;
        self.cond.notify_one();
    }

    /// Revokes the run token. Called by a task on itself before yielding.
    fn revoke(&self) {
        *self.may_run.lock() = false;
    }
}

impl Default for Park {
    fn default() -> Self {
        Self::new(false)
    }
}

pub(crate) fn new_park(may_run: bool) -> Park {
    Park::new(may_run)
}

struct State {
    runnable: VecDeque<TaskRef>,
}

/// The single, process-wide scheduler/reactor pair created by [`crate::dispatch::dispatch`].
pub(crate) struct Runtime {
    state: Mutex<State>,
    pub(crate) reactor: Reactor,
}

static ACTIVE: AtomicBool = AtomicBool::new(false);
static CURRENT: Mutex<Option<&'static Runtime>> = Mutex::new(None);

/// Installs the process-wide runtime for the duration of one
/// [`crate::dispatch::dispatch`] call.
///
/// Only one dispatcher may be *active* at a time (matching the "process-wide
/// scheduler singleton" design note); once that dispatcher's `dispatch` call
/// returns, [`uninstall`] clears the slot so a later call can install a fresh
/// one. Each installation leaks its `Runtime` allocation — acceptable given
/// a process normally dispatches once in its lifetime.
///
/// # Panics
/// Panics if a dispatcher is already active in this process.
pub(crate) fn install(reactor: Reactor) -> &'static Runtime {
    if ACTIVE.swap(true, Ordering::SeqCst) {
        panic!("a tasklet dispatcher is already running in this process");
    }
    let rt: &'static Runtime = Box::leak(Box::new(Runtime {
        state: Mutex::new(State {
            runnable: VecDeque::new(),
        }),
        reactor,
    }));
    *CURRENT.lock() = Some(rt);
    rt
}

/// Clears the active runtime slot once its `dispatch` call has returned.
pub(crate) fn uninstall() {
    *CURRENT.lock() = None;
    ACTIVE.store(false, Ordering::SeqCst);
}

/// Returns the process-wide runtime.
///
/// # Panics
/// Panics if no dispatcher has been started via [`crate::dispatch::dispatch`].
pub(crate) fn runtime() -> &'static Runtime {
    CURRENT
        .lock()
        .as_ref()
        .copied()
        .expect("no tasklet runtime is running: call tasklet::dispatch() first")
}

pub(crate) fn is_running() -> bool {
    ACTIVE.load(Ordering::SeqCst)
}

impl Runtime {
    /// Enqueues a newly created task at the tail of the runnable queue.
    pub(crate) fn append(&self, task: TaskRef) {
        tracing::trace!(task = %task.id(), "scheduler: append");
        self.state.lock().runnable.push_back(task);
    }

    /// Number of currently runnable tasks.
    pub(crate) fn runcount(&self) -> usize {
        self.state.lock().runnable.len()
    }

    /// Rotates the calling task to the tail of the runnable queue and
    /// switches to whatever is now at the head. A no-op if fewer than two
    /// tasks are runnable.
    ///
    /// Deliberately locates the caller by identity rather than assuming it
    /// sits at the head: `throw` may have reordered the queue to prioritize
    /// a killed or timed-out task ahead of whoever is currently running.
    pub(crate) fn schedule(&self) {
        let me = crate::task::current();
        let next = {
            let mut state = self.state.lock();
            if state.runnable.len() <= 1 {
                return;
            }
            if let Some(pos) = state.runnable.iter().position(|t| Arc::ptr_eq(t.inner(), me.inner())) {
                let cur = state.runnable.remove(pos).expect("position just found");
                state.runnable.push_back(cur);
            }
            state.runnable.front().cloned()
        };
        if let Some(next) = next {
            self.switch_to(&next);
        }
    }

    /// Switches away from the calling task, which the caller has *already*
    /// removed from the runnable queue (because it just became blocked).
    /// Drives the reactor if nothing else is runnable.
    pub(crate) fn schedule_block(&self) {
        loop {
            let next = self.state.lock().runnable.front().cloned();
            match next {
                Some(next) => return self.switch_to(&next),
                None => {
                    // Nothing runnable: the only way forward is for the
                    // reactor to deliver a wakeup onto some channel, making
                    // a task runnable again. Run it inline on this thread,
                    // since by construction no other thread holds the token.
                    if !self.reactor.turn_blocking() {
                        panic!(
                            "deadlock: no runnable tasks and the reactor has no pending registrations"
                        );
                    }
                }
            }
        }
    }

    /// Places `next` at the head of the runnable queue and switches to it,
    /// used by the channel rendezvous fast path (pass-the-torch).
    pub(crate) fn switch_to_head(&self, next: &TaskRef) {
        {
            let mut state = self.state.lock();
            state.runnable.retain(|t| !Arc::ptr_eq(t.inner(), next.inner()));
            state.runnable.push_front(next.clone());
        }
        self.schedule();
    }

    /// Hands the run token to `next` without blocking the caller; used when
    /// a task's body has finished and its thread is about to terminate.
    pub(crate) fn retire(&self, task: &TaskRef) {
        let mut state = self.state.lock();
        state.runnable.retain(|t| !Arc::ptr_eq(t.inner(), task.inner()));
        if let Some(next) = state.runnable.front().cloned() {
            drop(state);
            next.park().grant();
        }
    }

    /// Removes `task` from the runnable queue without granting anyone the
    /// token; used only when the caller will separately re-grant (e.g. `throw`).
    pub(crate) fn remove(&self, task: &TaskRef) {
        self.state.lock().runnable.retain(|t| !Arc::ptr_eq(t.inner(), task.inner()));
    }

    /// Delivers `pending` to `target` at its next resumption: evicts it from
    /// whatever it is blocked on (if anything), and places it at the head of
    /// the runnable queue so it observes the interruption promptly.
    pub(crate) fn throw(&self, target: &TaskRef, pending: Pending) {
        if target.is_done() {
            return;
        }

        if let Some(blocked_on) = target.take_blocked_on() {
            blocked_on.cancel(target);
        }

        {
            let mut state = self.state.lock();
            state.runnable.retain(|t| !Arc::ptr_eq(t.inner(), target.inner()));
            state.runnable.push_front(target.clone());
        }
        target.set_pending(pending);

        // `target`'s thread is parked on its own run-token condvar (either
        // freshly spawned or previously blocked) and only resumes once some
        // currently-running task's next suspension point switches to it.
        // Placing it at the head above guarantees that happens at the very
        // next switch, matching "kill takes effect at the next resumption"
        // without letting two tasks' user code run concurrently.
    }

    pub(crate) fn switch_to(&self, next: &TaskRef) {
        let me = crate::task::current();
        if Arc::ptr_eq(me.inner(), next.inner()) {
            return;
        }
        tracing::trace!(from = %me.id(), to = %next.id(), "scheduler: switch");
        me.park().revoke();
        next.park().grant();
        me.park().wait_for_turn();
    }
}
