// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Public readiness-event handles built on the reactor's fd/signal/timer
//! registrations: [`FdEvent`], [`SignalEvent`], [`TimerEvent`].

use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::Interest;
use parking_lot::Mutex;

use crate::channel::{effective_timeout, Channel};
use crate::error::{Closed, Failure, RecvError, TaskletError, TimeoutError};
use crate::scheduler::runtime;

use super::{Reactor, SignalHandle, TimerHandle};

/// Which readiness direction an [`FdEvent`] watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Readable,
    Writable,
    Both,
}

impl Direction {
    fn to_interest(self) -> Interest {
        match self {
            Direction::Readable => Interest::READABLE,
            Direction::Writable => Interest::WRITABLE,
            Direction::Both => Interest::READABLE.add(Interest::WRITABLE),
        }
    }
}

/// A readiness registration on a raw file descriptor.
///
/// Constructing an `FdEvent` registers nothing by itself; each call to
/// [`FdEvent::wait`] arms a fresh one-shot registration (plus a timer if a
/// deadline applies) and disarms both on every exit path, so a late fire
/// after the call returns is a no-op.
pub struct FdEvent {
    fd: RawFd,
    direction: Direction,
    closed: Arc<AtomicBool>,
}

impl FdEvent {
    #[must_use]
    pub fn new(fd: RawFd, direction: Direction) -> Self {
        Self {
            fd,
            direction,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Blocks the calling task until this descriptor becomes ready or
    /// `timeout` elapses (a negative `timeout` defers to the ambient
    /// [`crate::timeout`] deadline). `channel` lets the caller supply its own
    /// rendezvous channel; when `None`, a private one is used for this call.
    ///
    /// # Errors
    /// Returns [`RecvError::Timeout`] if the deadline elapses first, or
    /// [`RecvError::Closed`] if the event was [closed](FdEvent::close) before
    /// this call.
    pub fn wait(&self, channel: Option<Arc<Channel<()>>>, timeout: f64) -> Result<(), RecvError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RecvError::Closed(Closed(())));
        }

        let channel = channel.unwrap_or_else(|| Arc::new(Channel::new()));
        let effective = effective_timeout(timeout);
        if effective == Some(0.0) {
            return Err(RecvError::Timeout(TimeoutError));
        }

        let readiness = channel.clone();
        let handle = runtime()
            .reactor
            .register_fd(
                self.fd,
                self.direction.to_interest(),
                Box::new(move || {
                    let _ = readiness.send((), 0.0);
                }),
            )
            .expect("failed to register fd with the reactor");

        let timer = effective.map(|secs| {
            let timeout_chan = channel.clone();
            let me = crate::task::current();
            let reactor: &'static Reactor = &runtime().reactor;
            reactor.arm_timer(
                Duration::from_secs_f64(secs),
                Box::new(move || {
                    let cause = TaskletError::new(Failure::Error("fd wait timed out".into()), me.id());
                    let _ = timeout_chan.send_exception(cause, 0.0);
                }),
            )
        });

        let result = channel.receive(-1.0);
        drop(timer);
        runtime().reactor.deregister_fd(&handle);
        result
    }

    /// Marks the event closed; any `wait` call in progress still completes
    /// (on readiness, timeout, or close) but a later `wait` fails immediately.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

/// A handler for a POSIX signal, delivered on the scheduler thread.
pub struct SignalEvent {
    handle: Option<SignalHandle<'static>>,
}

impl SignalEvent {
    /// Installs `callback` for `signo`. When `persistent`, the registration
    /// stays armed after firing; otherwise it fires at most once.
    ///
    /// # Errors
    /// Returns an error if the signal cannot be added to the reactor's mask.
    pub fn new<F>(signo: i32, callback: F, persistent: bool) -> io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let reactor: &'static Reactor = &runtime().reactor;
        let handle = reactor.register_signal(signo, persistent, Box::new(callback))?;
        Ok(Self { handle: Some(handle) })
    }

    /// Removes the registration; a fire already in flight still runs.
    pub fn close(&mut self) {
        self.handle.take();
    }
}

/// A one-shot or periodic timer, delivered on the scheduler thread.
pub struct TimerEvent {
    handle: Arc<Mutex<Option<TimerHandle<'static>>>>,
    closed: Arc<AtomicBool>,
}

impl TimerEvent {
    /// Installs `callback` to run after `duration`. When `persistent`, it
    /// re-arms itself for another `duration` after each firing.
    #[must_use]
    pub fn new<F>(duration: Duration, callback: F, persistent: bool) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let closed = Arc::new(AtomicBool::new(false));
        let slot: Arc<Mutex<Option<TimerHandle<'static>>>> = Arc::new(Mutex::new(None));
        let cb: Arc<Mutex<Box<dyn FnMut() + Send>>> = Arc::new(Mutex::new(Box::new(callback)));
        let first = Self::arm(duration, persistent, cb, closed.clone(), slot.clone());
        *slot.lock() = Some(first);
        Self { handle: slot, closed }
    }

    fn arm(
        duration: Duration,
        persistent: bool,
        cb: Arc<Mutex<Box<dyn FnMut() + Send>>>,
        closed: Arc<AtomicBool>,
        slot: Arc<Mutex<Option<TimerHandle<'static>>>>,
    ) -> TimerHandle<'static> {
        let reactor: &'static Reactor = &runtime().reactor;
        reactor.arm_timer(
            duration,
            Box::new(move || {
                if closed.load(Ordering::Acquire) {
                    return;
                }
                (*cb.lock())();
                if persistent && !closed.load(Ordering::Acquire) {
                    let next = Self::arm(duration, persistent, cb.clone(), closed.clone(), slot.clone());
                    *slot.lock() = Some(next);
                }
            }),
        )
    }

    /// Cancels the timer; a fire already in flight still runs but will not re-arm.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.handle.lock().take();
    }
}
