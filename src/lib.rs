// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A cooperatively scheduled lightweight task runtime with rendezvous
//! channels, mailbox messaging and a reactor-backed event loop.
//!
//! Tasks are cheap, independently-stacked units of execution coordinated by
//! a single logical scheduler: at any instant exactly one task's user code
//! runs, switching only at well-defined suspension points (channel
//! send/receive, sleep, join, mailbox receive, I/O wait). See [`dispatch`]
//! for the process entry point.

pub mod channel;
pub mod dispatch;
pub mod error;
pub mod mailbox;
pub mod message;
pub mod reactor;
pub(crate) mod scheduler;
pub mod task;
pub mod task_local;
pub mod timeout;

pub use dispatch::{dispatch, quit, Config, ExitCode};
pub use task::{
    current as current_task, join_all, join_children, kill, sleep, yield_now, JoinHandle, TaskRef,
};

/// Re-exported so application code can write `tasklet::Task::builder(...)`-style calls.
pub mod prelude {
    pub use crate::channel::Channel;
    pub use crate::dispatch::{dispatch, quit, Config, ExitCode};
    pub use crate::error::{Failure, JoinError, TaskletError, TaskletExit, TimeoutError};
    pub use crate::mailbox::Mailbox;
    pub use crate::message::{call, send, Envelope, Tag};
    pub use crate::reactor::{Direction, FdEvent, SignalEvent, TimerEvent};
    pub use crate::task::{
        self, current, join_all, join_children, kill, sleep, yield_now, Builder, Id, JoinHandle,
    };
    pub use crate::task_local::{TaskInstance, TaskLocal};
}
