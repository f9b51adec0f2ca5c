// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Error taxonomy for the scheduler, channels, mailboxes and the dispatcher.
//!
//! Mirrors the hand-rolled style used throughout this crate's ambient stack:
//! closed enums with manual [`fmt::Display`] and [`std::error::Error`] impls
//! rather than a derive macro, so every variant's wording is deliberate.

use std::fmt;

use crate::task::Id;

/// Raised by any blocking primitive whose effective deadline has expired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutError;

impl fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("operation timed out")
    }
}

impl std::error::Error for TimeoutError {}

/// Cooperative kill signal delivered via [`crate::task::kill`].
///
/// This unwinds the target task's stack with guaranteed cleanup. It is
/// deliberately a distinct type from [`TaskletError`] so that ordinary
/// `catch`-style error handling in user code does not accidentally swallow
/// a kill request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskletExit;

impl fmt::Display for TaskletExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("tasklet was killed")
    }
}

impl std::error::Error for TaskletExit {}

/// The reason a task's body stopped without producing a value.
#[derive(Debug, Clone)]
pub enum Failure {
    /// The task panicked or returned an application error.
    Error(String),
    /// The task was killed via [`crate::task::kill`].
    Killed,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Error(msg) => write!(f, "{msg}"),
            Failure::Killed => f.write_str("killed"),
        }
    }
}

/// A failure captured at a task's boundary, tagged with which task produced it.
#[derive(Debug, Clone)]
pub struct TaskletError {
    cause: Failure,
    tasklet: Id,
}

impl TaskletError {
    /// Builds a failure to report via [`crate::channel::Channel::send_exception`]
    /// or to return from a task body.
    #[must_use]
    pub fn new(cause: Failure, tasklet: Id) -> Self {
        Self { cause, tasklet }
    }

    /// The task that produced this failure.
    #[must_use]
    pub fn tasklet(&self) -> Id {
        self.tasklet
    }

    /// The underlying reason for the failure.
    #[must_use]
    pub fn cause(&self) -> &Failure {
        &self.cause
    }

    #[must_use]
    pub fn is_killed(&self) -> bool {
        matches!(self.cause, Failure::Killed)
    }
}

impl fmt::Display for TaskletError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tasklet {} failed: {}", self.tasklet, self.cause)
    }
}

impl std::error::Error for TaskletError {}

/// Raised from [`crate::task::Task::join`] when the joined task failed or was killed.
///
/// A subtype of [`TaskletError`] in spirit: it carries the same payload but is
/// its own type so callers can match on it specifically at a join point.
#[derive(Debug, Clone)]
pub struct JoinError(pub(crate) TaskletError);

impl JoinError {
    #[must_use]
    pub fn tasklet(&self) -> Id {
        self.0.tasklet()
    }

    #[must_use]
    pub fn cause(&self) -> &Failure {
        self.0.cause()
    }

    #[must_use]
    pub fn is_killed(&self) -> bool {
        self.0.is_killed()
    }
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "join failed: {}", self.0)
    }
}

impl std::error::Error for JoinError {}

impl From<JoinError> for TaskletError {
    fn from(e: JoinError) -> Self {
        e.0
    }
}

/// Raised by channel or mailbox operations on a peer that has gone away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Closed(pub(crate) ());

impl fmt::Display for Closed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("channel closed")
    }
}

impl std::error::Error for Closed {}

/// Outcome of a blocking rendezvous: either the transferred value, a
/// cooperative timeout, or an application exception sent via
/// [`crate::channel::Channel::send_exception`].
#[derive(Debug)]
pub enum RecvError {
    Timeout(TimeoutError),
    Closed(Closed),
    Exception(TaskletError),
}

impl fmt::Display for RecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecvError::Timeout(e) => write!(f, "{e}"),
            RecvError::Closed(e) => write!(f, "{e}"),
            RecvError::Exception(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for RecvError {}

impl From<TimeoutError> for RecvError {
    fn from(e: TimeoutError) -> Self {
        RecvError::Timeout(e)
    }
}

impl From<Closed> for RecvError {
    fn from(e: Closed) -> Self {
        RecvError::Closed(e)
    }
}
