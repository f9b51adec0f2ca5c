// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Tasks: the unit of cooperative execution.
//!
//! Each [`Task`] owns a dedicated OS thread for its entire lifetime but, per
//! the run-token design in [`crate::scheduler`], only runs user code while
//! holding that token. `TaskRef` (an `Arc<TaskData>`) is the non-generic
//! handle used for scheduling, parent/child bookkeeping and `kill`;
//! [`JoinHandle<R>`] is the typed handle returned by [`spawn`].

mod builder;
mod id;

pub use builder::Builder;
pub use id::Id;

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{Failure, JoinError, TaskletError, TimeoutError};
use crate::mailbox::Mailbox;
use crate::reactor::arm_timeout;
use crate::scheduler::{new_park, runtime, BlockedOn, Park, Pending};

/// Marker type used to unwind a killed task's stack. Caught only by the task
/// boundary's own `catch_unwind`, never by ordinary user error handling.
pub(crate) struct KillSignal;

enum Outcome {
    Value(Box<dyn Any + Send>),
    Failure(Failure),
}

/// Tracks everyone currently blocked waiting for this task to finish, so
/// `join`/`join_all`/`join_children` can rendezvous with completion without
/// going through a data-carrying [`crate::channel::Channel`].
struct Completion {
    done: Mutex<bool>,
    waiters: Mutex<Vec<TaskRef>>,
}

impl Completion {
    fn new() -> Self {
        Self {
            done: Mutex::new(false),
            waiters: Mutex::new(Vec::new()),
        }
    }

    fn wait(&self, timeout: f64) -> Result<(), TimeoutError> {
        if *self.done.lock() {
            return Ok(());
        }
        let me = current();
        {
            let mut waiters = self.waiters.lock();
            if *self.done.lock() {
                return Ok(());
            }
            waiters.push(me.clone());
        }
        let effective = if timeout >= 0.0 {
            Some(timeout)
        } else {
            let ambient = crate::timeout::current();
            (ambient >= 0.0).then_some(ambient)
        };
        let _guard = effective.map(|secs| arm_timeout(&me, secs));
        runtime().remove(&me);
        runtime().schedule_block();
        self.waiters.lock().retain(|w| !w.same(&me));
        check_pending().map_err(|_| TimeoutError)?;
        Ok(())
    }

    fn complete(&self) {
        *self.done.lock() = true;
        let waiters = std::mem::take(&mut *self.waiters.lock());
        for w in waiters {
            runtime().append(w);
        }
    }
}

pub(crate) struct TaskData {
    id: Id,
    name: String,
    daemon: bool,
    parent: Option<Weak<TaskData>>,
    children: Mutex<Vec<TaskRef>>,
    park: Park,
    pending: Mutex<Option<Pending>>,
    blocked_on: Mutex<Option<BlockedOn>>,
    outcome: Mutex<Option<Outcome>>,
    completion: Completion,
    mailbox: Mailbox,
}

/// A handle to a running or finished task, used for scheduling and for
/// parent/child/kill bookkeeping. Does not know the task's result type; see
/// [`JoinHandle`] for that.
#[derive(Clone)]
pub struct TaskRef(Arc<TaskData>);

impl TaskRef {
    pub(crate) fn inner(&self) -> &Arc<TaskData> {
        &self.0
    }

    pub(crate) fn same(&self, other: &TaskRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn park(&self) -> &Park {
        &self.0.park
    }

    #[must_use]
    pub fn id(&self) -> Id {
        self.0.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.0.name
    }

    #[must_use]
    pub fn is_daemon(&self) -> bool {
        self.0.daemon
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        *self.0.completion.done.lock()
    }

    #[must_use]
    pub fn parent(&self) -> Option<TaskRef> {
        self.0.parent.as_ref()?.upgrade().map(TaskRef)
    }

    #[must_use]
    pub fn children(&self) -> Vec<TaskRef> {
        self.0.children.lock().clone()
    }

    #[must_use]
    pub fn mailbox(&self) -> &Mailbox {
        &self.0.mailbox
    }

    pub(crate) fn set_pending(&self, p: Pending) {
        *self.0.pending.lock() = Some(p);
    }

    pub(crate) fn set_blocked_on(&self, handle: Option<BlockedOn>) {
        *self.0.blocked_on.lock() = handle;
    }

    pub(crate) fn take_blocked_on(&self) -> Option<BlockedOn> {
        self.0.blocked_on.lock().take()
    }

    fn attach_child(&self, child: TaskRef) {
        self.0.children.lock().push(child);
    }

    fn detach_child(&self, child: &TaskRef) {
        self.0.children.lock().retain(|c| !c.same(child));
    }

    /// Pre-order walk of the task tree rooted at `self`, yielding `(task, depth)`.
    #[must_use]
    pub fn walk(&self) -> Vec<(TaskRef, usize)> {
        fn go(t: &TaskRef, depth: usize, out: &mut Vec<(TaskRef, usize)>) {
            out.push((t.clone(), depth));
            for c in t.children() {
                go(&c, depth + 1, out);
            }
        }
        let mut out = Vec::new();
        go(self, 0, &mut out);
        out
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("daemon", &self.is_daemon())
            .finish()
    }
}

thread_local! {
    static CURRENT: RefCell<Option<TaskRef>> = const { RefCell::new(None) };
}

/// The task running on the calling thread.
///
/// # Panics
/// Panics if called from a thread that isn't a tasklet task (i.e. outside
/// [`crate::dispatch::dispatch`]).
#[must_use]
pub fn current() -> TaskRef {
    CURRENT.with(|c| {
        c.borrow()
            .clone()
            .expect("tasklet::task::current() called outside a running task")
    })
}

fn set_current(task: TaskRef) {
    CURRENT.with(|c| *c.borrow_mut() = Some(task));
}

/// Checks for (and consumes) a pending `throw`. Returns `Err(TimeoutError)`
/// for a timeout; panics with [`KillSignal`] for a kill, unwinding straight
/// to the task boundary.
pub(crate) fn check_pending() -> Result<(), TimeoutError> {
    let me = current();
    let pending = me.0.pending.lock().take();
    match pending {
        None => Ok(()),
        Some(Pending::Timeout) => Err(TimeoutError),
        Some(Pending::Kill) => panic::panic_any(KillSignal),
    }
}

/// A typed handle to a spawned task's eventual result, analogous to
/// [`std::thread::JoinHandle`].
pub struct JoinHandle<R> {
    task: TaskRef,
    _marker: std::marker::PhantomData<fn() -> R>,
}

impl<R: Send + 'static> JoinHandle<R> {
    /// The underlying task handle (for `kill`, tree walks, etc).
    #[must_use]
    pub fn task(&self) -> &TaskRef {
        &self.task
    }

    /// Blocks until the task finishes, returning its value or a [`JoinError`].
    ///
    /// # Errors
    /// Returns [`JoinError`] if the task panicked, failed, or was killed; a
    /// bare [`TimeoutError`] surfaces as a kind of join failure via `-1`
    /// only when `timeout >= 0` and it elapses first.
    pub fn join(&self, timeout: f64) -> Result<R, JoinError> {
        join_task(&self.task, timeout).map(|outcome| {
            *outcome
                .downcast::<R>()
                .expect("JoinHandle<R> always stores an R outcome")
        })
    }
}

fn join_task(task: &TaskRef, timeout: f64) -> Result<Box<dyn Any + Send>, JoinError> {
    if !task.is_done() {
        task.0
            .completion
            .wait(timeout)
            .map_err(|_| JoinError(TaskletError::new(Failure::Error("join timed out".into()), task.id())))?;
    }
    match task.0.outcome.lock().take() {
        Some(Outcome::Value(v)) => Ok(v),
        Some(Outcome::Failure(f)) => Err(JoinError(TaskletError::new(f, task.id()))),
        None => Err(JoinError(TaskletError::new(
            Failure::Error("task result already consumed".into()),
            task.id(),
        ))),
    }
}

/// Joins every task in `tasks`, preserving order; each slot holds either the
/// value or the join failure for that task.
///
/// # Errors
/// Propagates a [`JoinError`] carrying `Failure::Killed` immediately if any
/// constituent join observes a kill (kill is not collectible, per the
/// runtime's design notes).
pub fn join_all<R: Send + 'static>(
    handles: &[JoinHandle<R>],
    timeout: f64,
) -> Result<Vec<Result<R, JoinError>>, JoinError> {
    let mut remaining = timeout;
    let start = std::time::Instant::now();
    let mut out = Vec::with_capacity(handles.len());
    for h in handles {
        let this_timeout = if remaining >= 0.0 { remaining } else { -1.0 };
        let r = h.join(this_timeout);
        if let Err(e) = &r {
            if e.is_killed() {
                return Err(e.clone());
            }
        }
        out.push(r);
        if remaining >= 0.0 {
            remaining = (timeout - start.elapsed().as_secs_f64()).max(0.0);
        }
    }
    Ok(out)
}

/// Joins every non-daemon child of the current task, snapshotted at call time.
///
/// # Errors
/// See [`join_all`].
pub fn join_children(timeout: f64) -> Result<(), JoinError> {
    let children: Vec<TaskRef> = current()
        .children()
        .into_iter()
        .filter(|c| !c.is_daemon())
        .collect();
    let mut remaining = timeout;
    let start = std::time::Instant::now();
    for c in children {
        let this_timeout = if remaining >= 0.0 { remaining } else { -1.0 };
        join_task(&c, this_timeout)?;
        if remaining >= 0.0 {
            remaining = (timeout - start.elapsed().as_secs_f64()).max(0.0);
        }
    }
    Ok(())
}

/// Delivers a cooperative kill to `task`, routed through `throw`.
pub fn kill(task: &TaskRef) {
    runtime().throw(task, Pending::Kill);
}

/// Blocks the current task for `seconds`. `0.0` is a pure yield.
pub fn sleep(seconds: f64) {
    if seconds <= 0.0 {
        return yield_now();
    }
    let me = current();
    let _guard = arm_timeout(&me, seconds);
    runtime().remove(&me);
    runtime().schedule_block();
    // A fired sleep timer throws Pending::Timeout, which `check_pending`
    // would otherwise surface as an error; sleeping-out its own timeout is
    // the expected, successful outcome, so swallow exactly that case.
    let _ = check_pending();
}

/// Yields the current task, guaranteeing at least one reactor poll before
/// resumption so I/O readiness is not starved by CPU-bound loops.
pub fn yield_now() {
    runtime().schedule();
}

/// Installs `obj` into the root task and starts the dispatcher's main task.
pub(crate) fn spawn_root() -> TaskRef {
    let data = Arc::new(TaskData {
        id: Id::ROOT,
        name: "main".to_string(),
        daemon: false,
        parent: None,
        children: Mutex::new(Vec::new()),
        park: new_park(true),
        pending: Mutex::new(None),
        blocked_on: Mutex::new(None),
        outcome: Mutex::new(None),
        completion: Completion::new(),
        mailbox: Mailbox::new(),
    });
    let task = TaskRef(data);
    set_current(task.clone());
    runtime().append(task.clone());
    task
}

/// Internal: builds and starts a task; see [`Builder`] for the public surface.
pub(crate) fn spawn<F, R>(name: String, daemon: bool, f: F) -> JoinHandle<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let parent = current();
    let data = Arc::new(TaskData {
        id: Id::next(),
        name,
        daemon,
        parent: if daemon { None } else { Some(Arc::downgrade(parent.inner())) },
        children: Mutex::new(Vec::new()),
        park: new_park(false),
        pending: Mutex::new(None),
        blocked_on: Mutex::new(None),
        outcome: Mutex::new(None),
        completion: Completion::new(),
        mailbox: Mailbox::new(),
    });
    let task = TaskRef(data);
    if !daemon {
        parent.attach_child(task.clone());
    }

    let body_task = task.clone();
    let body_parent = (!daemon).then(|| parent.clone());
    std::thread::Builder::new()
        .name(task.name().to_string())
        .spawn(move || run_body(body_task, body_parent, f))
        .expect("failed to spawn OS thread backing a tasklet task");

    runtime().append(task.clone());

    JoinHandle {
        task,
        _marker: std::marker::PhantomData,
    }
}

fn run_body<F, R>(task: TaskRef, parent: Option<TaskRef>, f: F)
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    set_current(task.clone());
    task.park().wait_for_turn();

    tracing::trace_span!("task", task.id = %task.id(), task.name = %task.name()).in_scope(|| {
        let result = panic::catch_unwind(AssertUnwindSafe(f));
        let outcome = match result {
            Ok(v) => Outcome::Value(Box::new(v)),
            Err(payload) => {
                if payload.downcast_ref::<KillSignal>().is_some() {
                    Outcome::Failure(Failure::Killed)
                } else {
                    let msg = describe_panic(&payload);
                    tracing::error!(task.id = %task.id(), error = %msg, "task panicked");
                    Outcome::Failure(Failure::Error(msg))
                }
            }
        };

        *task.0.outcome.lock() = Some(outcome);
        if let Some(parent) = &parent {
            parent.detach_child(&task);
        }
        task.0.completion.complete();
    });

    runtime().retire(&task);
}

fn describe_panic(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Spawns a task that sleeps `after` seconds, then runs `f`.
pub fn later<F, R>(after: f64, name: impl Into<String>, daemon: bool, f: F) -> JoinHandle<R>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    Builder::new(name).daemon(daemon).spawn(move || {
        sleep(after);
        f()
    })
}

/// Spawns a task that calls `f` repeatedly forever. A failure is logged and
/// followed by a cool-down before the loop continues, avoiding a tight
/// failure storm; a kill stops the loop.
pub fn loop_with<F>(name: impl Into<String>, daemon: bool, mut f: F) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    const FAILURE_COOLDOWN: Duration = Duration::from_secs(1);
    Builder::new(name).daemon(daemon).spawn(move || loop {
        let result = panic::catch_unwind(AssertUnwindSafe(&mut f));
        if let Err(payload) = result {
            if payload.downcast_ref::<KillSignal>().is_some() {
                panic::resume_unwind(payload);
            }
            tracing::error!(error = %describe_panic(&payload), "loop_with iteration failed");
            std::thread::sleep(FAILURE_COOLDOWN);
        }
    })
}

/// Spawns a task that invokes `f` every `period` seconds.
/// If `immediate`, the first invocation happens before the first sleep.
pub fn interval<F>(
    period: f64,
    immediate: bool,
    name: impl Into<String>,
    daemon: bool,
    mut f: F,
) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    Builder::new(name).daemon(daemon).spawn(move || {
        if immediate {
            invoke_logged(&mut f);
        }
        loop {
            sleep(period);
            invoke_logged(&mut f);
        }
    })
}

/// Spawns a task invoking `f` at approximately `rate` times per second,
/// adapting the sleep interval with an exponentially smoothed error term
/// bounded within `[0.5T, 1.5T]` where `T = 1 / rate`.
pub fn rate<F>(rate_hz: f64, name: impl Into<String>, daemon: bool, mut f: F) -> JoinHandle<()>
where
    F: FnMut() + Send + 'static,
{
    let target = 1.0 / rate_hz;
    Builder::new(name).daemon(daemon).spawn(move || {
        let mut interval = target;
        loop {
            let start = std::time::Instant::now();
            invoke_logged(&mut f);
            let elapsed = start.elapsed().as_secs_f64();
            let error = target - elapsed;
            interval = (interval + 0.5 * error).clamp(0.5 * target, 1.5 * target);
            sleep(interval);
        }
    })
}

/// Spawns a task that perpetually drains its own mailbox into `f(envelope)`.
pub fn receiver<F>(name: impl Into<String>, daemon: bool, mut f: F) -> JoinHandle<()>
where
    F: FnMut(crate::message::Envelope) + Send + 'static,
{
    Builder::new(name).daemon(daemon).spawn(move || loop {
        let me = current();
        match me.mailbox().popleft(-1.0) {
            Ok(env) => f(env),
            Err(_) => continue,
        }
    })
}

fn invoke_logged<F: FnMut()>(f: &mut F) {
    let result = panic::catch_unwind(AssertUnwindSafe(f));
    if let Err(payload) = result {
        if payload.downcast_ref::<KillSignal>().is_some() {
            panic::resume_unwind(payload);
        }
        tracing::error!(error = %describe_panic(&payload), "periodic task iteration failed");
    }
}
