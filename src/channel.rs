// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Zero-buffered rendezvous channel with pass-the-torch scheduling.
//!
//! A [`Channel<T>`] has no buffer: a `send` only completes once a `receive`
//! is ready to take the value (or vice versa). The `balance` is positive
//! while senders are queued, negative while receivers are queued, and the
//! magnitude always equals the queue length.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex};

use parking_lot::Mutex;

use crate::error::{Closed, RecvError};
use crate::reactor::arm_timeout;
use crate::scheduler::{runtime, BlockedOn};
use crate::task::{self, check_pending, TaskRef};

/// What actually gets handed across the rendezvous: either the value itself
/// or an application exception injected via [`Channel::send_exception`].
pub(crate) enum Transfer<T> {
    Value(T),
    Exception(crate::error::TaskletError),
}

struct Slot<T>(StdMutex<Option<Transfer<T>>>);

impl<T> Slot<T> {
    fn empty() -> Arc<Self> {
        Arc::new(Self(StdMutex::new(None)))
    }
    fn put(&self, v: Transfer<T>) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = Some(v);
    }
    fn take(&self) -> Option<Transfer<T>> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

struct Waiter<T> {
    task: TaskRef,
    slot: Arc<Slot<T>>,
}

enum Role {
    Senders,
    Receivers,
}

struct State<T> {
    queue: VecDeque<Waiter<T>>,
    role: Option<Role>,
}

/// A rendezvous channel. See the module docs for the balance/queue invariant.
pub struct Channel<T> {
    state: Mutex<State<T>>,
}

impl<T: Send + 'static> Default for Channel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Channel<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                role: None,
            }),
        }
    }

    /// Current signed balance: positive = waiting senders, negative = waiting receivers.
    #[must_use]
    pub fn balance(&self) -> i64 {
        let state = self.state.lock();
        match state.role {
            None => 0,
            Some(Role::Senders) => i64::try_from(state.queue.len()).unwrap_or(i64::MAX),
            Some(Role::Receivers) => -i64::try_from(state.queue.len()).unwrap_or(i64::MAX),
        }
    }

    #[must_use]
    pub fn has_receiver(&self) -> bool {
        self.balance() < 0
    }

    #[must_use]
    pub fn has_sender(&self) -> bool {
        self.balance() > 0
    }

    /// Sends `v`, blocking until a receiver rendezvouses or `timeout` elapses.
    /// A negative `timeout` means "use the ambient [`crate::timeout`] deadline".
    pub fn send(&self, v: T, timeout: f64) -> Result<(), RecvError> {
        self.transfer(Transfer::Value(v), timeout)
    }

    /// Sends an application exception instead of a value; the receiver's
    /// `receive` call returns `Err(RecvError::Exception(..))`.
    pub fn send_exception(&self, cause: crate::error::TaskletError, timeout: f64) -> Result<(), RecvError> {
        self.transfer(Transfer::Exception(cause), timeout)
    }

    fn transfer(&self, v: Transfer<T>, timeout: f64) -> Result<(), RecvError> {
        let me = task::current();
        let mut state = self.state.lock();
        if matches!(state.role, Some(Role::Receivers)) && !state.queue.is_empty() {
            // A receiver is already waiting: hand it the value directly and
            // let it run next (pass-the-torch), while we move to the tail.
            let waiter = state.queue.pop_front().expect("non-empty checked above");
            if state.queue.is_empty() {
                state.role = None;
            }
            drop(state);
            waiter.slot.put(v);
            runtime().switch_to_head(&waiter.task);
            return Ok(());
        }

        // No receiver yet: before blocking, an already-expired deadline fails
        // immediately without registering with the reactor at all.
        let effective = effective_timeout(timeout);
        if effective == Some(0.0) {
            return Err(RecvError::Timeout(crate::error::TimeoutError));
        }

        state.role = Some(Role::Senders);
        let slot = Slot::empty();
        slot.put(v);
        state.queue.push_back(Waiter {
            task: me.clone(),
            slot: slot.clone(),
        });
        me.set_blocked_on(Some(self.blocked_on_handle()));
        drop(state);

        let _guard = effective.map(|secs| arm_timeout(&me, secs));
        runtime().remove(&me);
        runtime().schedule_block();
        me.set_blocked_on(None);
        check_pending().map_err(RecvError::from)?;
        Ok(())
    }

    /// Receives a value, blocking until a sender rendezvouses or `timeout` elapses.
    pub fn receive(&self, timeout: f64) -> Result<T, RecvError> {
        let me = task::current();
        let mut state = self.state.lock();
        if matches!(state.role, Some(Role::Senders)) && !state.queue.is_empty() {
            let waiter = state.queue.pop_front().expect("non-empty checked above");
            if state.queue.is_empty() {
                state.role = None;
            }
            drop(state);
            // Taking from a sender does not switch; the sender is simply
            // appended to the tail to run later.
            runtime().append(waiter.task.clone());
            return match waiter.slot.take().expect("sender always fills its slot") {
                Transfer::Value(v) => Ok(v),
                Transfer::Exception(e) => Err(RecvError::Exception(e)),
            };
        }

        let effective = effective_timeout(timeout);
        if effective == Some(0.0) {
            return Err(RecvError::Timeout(crate::error::TimeoutError));
        }

        state.role = Some(Role::Receivers);
        let slot = Slot::empty();
        state.queue.push_back(Waiter {
            task: me.clone(),
            slot: slot.clone(),
        });
        me.set_blocked_on(Some(self.blocked_on_handle()));
        drop(state);

        let _guard = effective.map(|secs| arm_timeout(&me, secs));
        runtime().remove(&me);
        runtime().schedule_block();
        me.set_blocked_on(None);
        check_pending().map_err(RecvError::from)?;

        match slot.take() {
            Some(Transfer::Value(v)) => Ok(v),
            Some(Transfer::Exception(e)) => Err(RecvError::Exception(e)),
            None => Err(RecvError::Closed(Closed(()))),
        }
    }

    /// Builds a type-erased handle so `throw` can call back into
    /// [`Channel::cancel_waiter`] for this exact channel instance. Safe
    /// because the caller only stores this handle on a task for the
    /// duration that task is parked inside this very function's stack frame.
    fn blocked_on_handle(&self) -> BlockedOn {
        unsafe fn cancel<T: Send + 'static>(ptr: *const (), task: &TaskRef) {
            // Safety: see `blocked_on_handle`'s doc comment.
            let chan = unsafe { &*ptr.cast::<Channel<T>>() };
            chan.cancel_waiter(task);
        }
        BlockedOn::new(self, cancel::<T>)
    }

    /// Removes `task` from this channel's wait queue (used by `throw` on a
    /// kill or timeout) and restores the balance invariant.
    pub(crate) fn cancel_waiter(&self, task: &TaskRef) {
        let mut state = self.state.lock();
        if let Some(pos) = state.queue.iter().position(|w| w.task.same(task)) {
            state.queue.remove(pos);
            if state.queue.is_empty() {
                state.role = None;
            }
        }
    }
}

pub(crate) fn effective_timeout(explicit: f64) -> Option<f64> {
    if explicit >= 0.0 {
        Some(explicit)
    } else {
        let ambient = crate::timeout::current();
        if ambient >= 0.0 {
            Some(ambient)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    // Exercised end-to-end under a running dispatcher in `tests/`; a bare
    // `Channel` cannot usefully be driven outside a scheduled task.
}
