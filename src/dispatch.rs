// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Process entry point: installs signal handling, a heartbeat timer, seeds
//! the root task, and drives the main loop until quit.

use std::sync::atomic::{AtomicU8, Ordering};

use clap::Parser;

use crate::scheduler::runtime;

/// Process exit codes reported by the dispatch loop on shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExitCode {
    Ok = 0,
    Error = 1,
    Sigint = 127,
    Timeout = 128,
}

impl ExitCode {
    #[must_use]
    pub fn code(self) -> i32 {
        self as i32
    }
}

static REQUESTED_EXIT: AtomicU8 = AtomicU8::new(u8::MAX);
static STATE: AtomicU8 = AtomicU8::new(0); // 0 = Running, 1 = Quitting

/// Configuration recognized by the `tasklet-dispatch` binary, layered from
/// CLI flags and `TASKLET_*` environment variables via `clap`.
#[derive(Debug, Clone, Parser)]
#[command(name = "tasklet-dispatch", about = "Run a tasklet dispatcher")]
pub struct Config {
    /// Enable a startup/shutdown timing summary for the dispatch loop.
    #[arg(long, env = "TASKLET_PROFILE")]
    pub profile: bool,

    /// Diagnostic no-op flag retained for compatibility with the source runtime.
    #[arg(long, env = "TASKLET_NOGC")]
    pub nogc: bool,

    /// Diagnostic no-op flag retained for compatibility with the source runtime.
    #[arg(long, env = "TASKLET_LEAK")]
    pub leak: bool,

    /// Print the reactor backend identity and exit.
    #[arg(long)]
    pub version: bool,
}

/// Requests a graceful shutdown with the given exit code.
pub fn quit(code: ExitCode) {
    REQUESTED_EXIT.store(code as u8, Ordering::SeqCst);
    STATE.store(1, Ordering::SeqCst);
}

pub(crate) fn request_interrupt() {
    quit(ExitCode::Sigint);
}

fn is_quitting() -> bool {
    STATE.load(Ordering::SeqCst) == 1
}

/// Runs the dispatcher to completion: installs the reactor, optionally
/// schedules `f` as the root task, then loops `schedule()`/`reactor.turn()`
/// until [`quit`] is called or the root task (and all non-daemon
/// descendants) finish.
///
/// # Panics
/// Panics if a dispatcher is already running in this process, or if the
/// reactor backend fails to initialize.
pub fn dispatch<F>(config: &Config, f: Option<F>) -> ExitCode
where
    F: FnOnce() + Send + 'static,
{
    if config.version {
        println!("tasklet-dispatch (reactor backend: mio)");
        return ExitCode::Ok;
    }

    STATE.store(0, Ordering::SeqCst);
    REQUESTED_EXIT.store(u8::MAX, Ordering::SeqCst);
    if config.nogc {
        tracing::info!("--nogc is a no-op in this runtime, retained for compatibility");
    }
    if config.leak {
        tracing::info!("--leak is a no-op in this runtime, retained for compatibility");
    }

    let start = config.profile.then(std::time::Instant::now);

    let reactor = crate::reactor::Reactor::new().expect("failed to initialize reactor backend");
    let rt = crate::scheduler::install(reactor);
    let _root = crate::task::spawn_root();

    if let Some(f) = f {
        crate::task::Builder::new("init").spawn(f);
    }

    loop {
        while rt.runcount() > 1 {
            rt.schedule();
            if is_quitting() {
                break;
            }
        }
        if is_quitting() {
            break;
        }
        if !rt.reactor.turn_blocking() {
            tracing::debug!("dispatch: no other runnable tasks and nothing pending, exiting");
            break;
        }
        if is_quitting() {
            break;
        }
    }

    if let Some(start) = start {
        tracing::info!(elapsed = ?start.elapsed(), "dispatch loop finished");
    }

    crate::scheduler::uninstall();

    match REQUESTED_EXIT.load(Ordering::SeqCst) {
        v if v == ExitCode::Sigint as u8 => ExitCode::Sigint,
        v if v == ExitCode::Timeout as u8 => ExitCode::Timeout,
        v if v == ExitCode::Error as u8 => ExitCode::Error,
        v if v == ExitCode::Ok as u8 => ExitCode::Ok,
        _ => ExitCode::Ok,
    }
}
