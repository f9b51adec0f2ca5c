// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-task mailbox: a FIFO of message envelopes with a blocking pop.
//!
//! Data and waiting are deliberately separated, following this crate's own
//! `Channel`/`Completion` split: the queue itself is a plain locked deque,
//! while a single pending-receiver slot drives the blocking wakeup so the
//! scheduler only ever parks/resumes a task at a well-defined suspension
//! point.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::error::RecvError;
use crate::message::Envelope;
use crate::reactor::arm_timeout;
use crate::scheduler::runtime;
use crate::task::{self, check_pending};

/// A task's inbox. Any task may [`Mailbox::append`]; only the owning task is
/// expected to [`Mailbox::popleft`], though nothing enforces that convention.
pub struct Mailbox {
    queue: Mutex<VecDeque<Envelope>>,
    waiter: Mutex<Option<task::TaskRef>>,
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Mailbox {
    #[must_use]
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            waiter: Mutex::new(None),
        }
    }

    /// Appends `env`, waking a blocked receiver if one is parked.
    pub fn append(&self, env: Envelope) {
        self.queue.lock().push_back(env);
        if let Some(w) = self.waiter.lock().take() {
            runtime().append(w);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pops the oldest envelope, blocking until one arrives or `timeout`
    /// elapses. A negative `timeout` defers to the ambient deadline.
    ///
    /// # Errors
    /// Returns [`RecvError::Timeout`] if the deadline elapses first.
    pub fn popleft(&self, timeout: f64) -> Result<Envelope, RecvError> {
        loop {
            if let Some(env) = self.queue.lock().pop_front() {
                return Ok(env);
            }

            let effective = if timeout >= 0.0 {
                Some(timeout)
            } else {
                let ambient = crate::timeout::current();
                (ambient >= 0.0).then_some(ambient)
            };
            if effective == Some(0.0) {
                return Err(RecvError::Timeout(crate::error::TimeoutError));
            }

            let me = task::current();
            *self.waiter.lock() = Some(me.clone());
            let _guard = effective.map(|secs| arm_timeout(&me, secs));
            runtime().remove(&me);
            runtime().schedule_block();
            *self.waiter.lock() = None;
            check_pending()?;
            // Spurious wake (e.g. a racing timeout) falls through to recheck the queue.
        }
    }
}
