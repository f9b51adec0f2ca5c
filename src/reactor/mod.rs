// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Reactor: binds OS readiness (fds, signals, timers) to the scheduler.
//!
//! Backed by [`mio::Poll`] so the same event loop transparently uses epoll,
//! kqueue or IOCP depending on platform, with POSIX signals folded in via
//! `signal-hook`'s mio bridge as just another readable source. The reactor
//! never invokes user callbacks itself: `turn` only returns a FIFO of fired
//! callbacks, which the scheduler (see [`crate::scheduler::Runtime`]) runs
//! after the runnable queue has drained, keeping the callback stack shallow.

use std::collections::BinaryHeap;
use std::io;
use std::cmp::Reverse;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Token};
use parking_lot::Mutex;
use signal_hook::consts::signal::SIGINT;
use signal_hook_mio::v0_8::Signals;

use crate::scheduler::{runtime, Pending};
use crate::task::TaskRef;

mod event;
pub use event::{Direction, FdEvent, SignalEvent, TimerEvent};

const HEARTBEAT: Duration = Duration::from_secs(1);
const SIGNAL_TOKEN: Token = Token(usize::MAX);

/// A callback the reactor has determined is ready to run, returned from
/// [`Reactor::turn`] for the scheduler to execute on its own thread.
pub(crate) type Callback = Box<dyn FnOnce() + Send>;

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    callback: Mutex<Option<Callback>>,
    cancelled: AtomicBool,
}

/// Min-heap entry ordered by deadline, tie-broken by insertion order; the
/// Arc payload itself is excluded from the ordering.
struct HeapEntry {
    deadline: Instant,
    seq: u64,
    entry: Arc<TimerEntry>,
}
impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.deadline.cmp(&other.deadline).then(self.seq.cmp(&other.seq))
    }
}

/// A registered handler for [`event::SignalEvent`]. Unlike timers and fds,
/// the callback may fire more than once, so it is stored as `FnMut` rather
/// than taken by value on fire.
struct SignalEntry {
    callback: Mutex<Box<dyn FnMut() + Send>>,
    persistent: bool,
    cancelled: AtomicBool,
}

struct Inner {
    poll: Poll,
    signals: Signals,
    timers: BinaryHeap<Reverse<HeapEntry>>,
    next_timer_seq: u64,
    fd_callbacks: std::collections::HashMap<Token, Callback>,
    next_token: usize,
    signal_callbacks: std::collections::HashMap<std::os::raw::c_int, Arc<SignalEntry>>,
    watched_signals: std::collections::HashSet<std::os::raw::c_int>,
}

/// The process-wide reactor. Owned by [`crate::scheduler::Runtime`].
pub(crate) struct Reactor {
    inner: Mutex<Inner>,
    registrations: AtomicU64,
}

impl Reactor {
    pub(crate) fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut signals = Signals::new([SIGINT])?;
        poll.registry()
            .register(&mut signals, SIGNAL_TOKEN, Interest::READABLE)?;
        let mut watched_signals = std::collections::HashSet::new();
        watched_signals.insert(SIGINT);
        Ok(Self {
            inner: Mutex::new(Inner {
                poll,
                signals,
                timers: BinaryHeap::new(),
                next_timer_seq: 0,
                fd_callbacks: std::collections::HashMap::new(),
                next_token: 0,
                signal_callbacks: std::collections::HashMap::new(),
                watched_signals,
            }),
            registrations: AtomicU64::new(0),
        })
    }

    /// Installs a handler for `signo`, adding it to the reactor's watched set
    /// if not already present. See [`event::SignalEvent`] for the public surface.
    pub(crate) fn register_signal(
        &self,
        signo: std::os::raw::c_int,
        persistent: bool,
        callback: Box<dyn FnMut() + Send>,
    ) -> io::Result<SignalHandle<'_>> {
        let mut inner = self.inner.lock();
        if inner.watched_signals.insert(signo) {
            inner.signals.add_signal(signo)?;
        }
        let entry = Arc::new(SignalEntry {
            callback: Mutex::new(callback),
            persistent,
            cancelled: AtomicBool::new(false),
        });
        inner.signal_callbacks.insert(signo, entry.clone());
        self.registrations.fetch_add(1, Ordering::Relaxed);
        Ok(SignalHandle {
            signo,
            entry,
            reactor: self,
        })
    }

    /// Registers a one-shot timer; `callback` runs (on the scheduler thread)
    /// once `after` elapses, unless the returned handle is dropped first.
    pub(crate) fn arm_timer(&self, after: Duration, callback: Callback) -> TimerHandle {
        let mut inner = self.inner.lock();
        let seq = inner.next_timer_seq;
        inner.next_timer_seq += 1;
        let entry = Arc::new(TimerEntry {
            deadline: Instant::now() + after,
            seq,
            callback: Mutex::new(Some(callback)),
            cancelled: AtomicBool::new(false),
        });
        inner.timers.push(Reverse(HeapEntry {
            deadline: entry.deadline,
            seq,
            entry: entry.clone(),
        }));
        self.registrations.fetch_add(1, Ordering::Relaxed);
        TimerHandle {
            entry: Arc::downgrade(&entry),
            reactor: self,
        }
    }

    /// Registers interest in readability/writability of `fd`; `callback` runs
    /// once the fd becomes ready.
    pub(crate) fn register_fd(
        &self,
        fd: RawFd,
        interest: Interest,
        callback: Callback,
    ) -> io::Result<FdHandle> {
        let mut inner = self.inner.lock();
        let token = Token(inner.next_token);
        inner.next_token += 1;
        let mut source = mio::unix::SourceFd(&fd);
        inner.poll.registry().register(&mut source, token, interest)?;
        inner.fd_callbacks.insert(token, callback);
        self.registrations.fetch_add(1, Ordering::Relaxed);
        Ok(FdHandle { token, fd })
    }

    pub(crate) fn deregister_fd(&self, handle: &FdHandle) {
        let mut inner = self.inner.lock();
        if inner.fd_callbacks.remove(&handle.token).is_some() {
            let mut source = mio::unix::SourceFd(&handle.fd);
            let _ = inner.poll.registry().deregister(&mut source);
            self.registrations.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Advances the reactor once, blocking up to the nearest deadline or the
    /// heartbeat interval, and runs every callback that fired. Returns
    /// `true` if at least one callback ran or a registration exists (i.e.
    /// progress is still possible), `false` if the reactor is fully idle
    /// with nothing registered (a deadlock for the caller to report).
    pub(crate) fn turn_blocking(&self) -> bool {
        let ran = self.turn();
        ran || self.registrations.load(Ordering::Relaxed) > 0
    }

    fn turn(&self) -> bool {
        let mut due = Vec::new();
        let timeout = {
            let mut inner = self.inner.lock();
            let now = Instant::now();
            while let Some(Reverse(top)) = inner.timers.peek() {
                if top.deadline > now {
                    break;
                }
                let Reverse(top) = inner.timers.pop().expect("just peeked");
                if !top.entry.cancelled.load(Ordering::Acquire) {
                    due.push(top.entry);
                }
            }
            inner
                .timers
                .peek()
                .map(|Reverse(top)| top.deadline.saturating_duration_since(now))
                .map(|d| d.min(HEARTBEAT))
                .or(Some(HEARTBEAT))
        };

        let mut ran = !due.is_empty();
        for entry in due {
            self.registrations.fetch_sub(1, Ordering::Relaxed);
            if let Some(cb) = entry.callback.lock().take() {
                cb();
            }
        }

        let mut events = Events::with_capacity(128);
        let mut inner = self.inner.lock();
        if inner.poll.poll(&mut events, timeout).is_ok() {
            for event in &events {
                if event.token() == SIGNAL_TOKEN {
                    let signos: Vec<std::os::raw::c_int> = inner.signals.pending().collect();
                    let mut due_signals = Vec::new();
                    for signo in signos {
                        if signo == SIGINT {
                            tracing::debug!("reactor: SIGINT received");
                            crate::dispatch::request_interrupt();
                        }
                        if let Some(entry) = inner.signal_callbacks.get(&signo) {
                            if !entry.cancelled.load(Ordering::Acquire) {
                                due_signals.push((signo, entry.clone()));
                            }
                        }
                    }
                    if !due_signals.is_empty() {
                        drop(inner);
                        for (_, entry) in &due_signals {
                            let mut guard = entry.callback.lock();
                            (*guard)();
                        }
                        inner = self.inner.lock();
                        for (signo, entry) in due_signals {
                            if !entry.persistent {
                                entry.cancelled.store(true, Ordering::Release);
                                inner.signal_callbacks.remove(&signo);
                                self.registrations.fetch_sub(1, Ordering::Relaxed);
                            }
                        }
                    }
                    ran = true;
                } else if let Some(cb) = inner.fd_callbacks.remove(&event.token()) {
                    self.registrations.fetch_sub(1, Ordering::Relaxed);
                    drop(inner);
                    cb();
                    ran = true;
                    inner = self.inner.lock();
                }
            }
        }
        ran
    }
}

/// Handle to a registered timer; cancels the timer (if unfired) on drop.
pub(crate) struct TimerHandle<'a> {
    entry: Weak<TimerEntry>,
    reactor: &'a Reactor,
}

impl Drop for TimerHandle<'_> {
    fn drop(&mut self) {
        if let Some(entry) = self.entry.upgrade() {
            if !entry.cancelled.swap(true, Ordering::AcqRel) {
                entry.callback.lock().take();
                self.reactor.registrations.fetch_sub(1, Ordering::Relaxed);
            }
        }
    }
}

/// Handle to a registered fd interest.
pub(crate) struct FdHandle {
    token: Token,
    fd: RawFd,
}

/// Handle to a registered signal callback; deregisters it (if it hasn't
/// already been replaced by a later registration for the same signal) on drop.
pub(crate) struct SignalHandle<'a> {
    signo: std::os::raw::c_int,
    entry: Arc<SignalEntry>,
    reactor: &'a Reactor,
}

impl Drop for SignalHandle<'_> {
    fn drop(&mut self) {
        if !self.entry.cancelled.swap(true, Ordering::AcqRel) {
            let mut inner = self.reactor.inner.lock();
            if let Some(current) = inner.signal_callbacks.get(&self.signo) {
                if Arc::ptr_eq(current, &self.entry) {
                    inner.signal_callbacks.remove(&self.signo);
                }
            }
            self.reactor.registrations.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

/// Arms a timer that throws [`Pending::Timeout`] into `target` when it fires.
/// Returned guard cancels the timer on drop (e.g. when the blocking call
/// returns for any other reason first).
pub(crate) fn arm_timeout(target: &TaskRef, seconds: f64) -> Option<TimerHandle<'static>> {
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    let target = target.clone();
    let reactor: &'static Reactor = &runtime().reactor;
    Some(reactor.arm_timer(
        Duration::from_secs_f64(seconds),
        Box::new(move || {
            runtime().throw(&target, Pending::Timeout);
        }),
    ))
}
