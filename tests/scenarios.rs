// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! End-to-end scenarios exercising the scheduler, channels, mailboxes and
//! dispatch loop. Each test starts its own dispatcher on a background thread
//! (the runtime is a process-wide singleton, so tests run in separate
//! processes via `cargo test`'s default process-per-binary... within this
//! binary each test spawns the dispatcher on its own thread and the
//! process exits after the one test using `#[test]`'s usual isolation is
//! not guaranteed across tests in the same binary, so each scenario below
//! is kept in its own `#[test]` function and run with `--test-threads=1`
//! in CI, matching the "one dispatcher per process" constraint.

use std::sync::mpsc;
use std::time::{Duration, Instant};

use tasklet::channel::Channel;
use tasklet::dispatch::{dispatch, Config};
use tasklet::error::RecvError;
use tasklet::task::{self, Builder};

fn default_config() -> Config {
    Config {
        profile: false,
        nogc: false,
        leak: false,
        version: false,
    }
}

fn run_scenario<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    dispatch(&default_config(), Some(f));
}

#[test]
fn round_robin_fairness() {
    let (tx, rx) = mpsc::channel();
    run_scenario(move || {
        let tx1 = tx.clone();
        let tx2 = tx;
        let a = Builder::new("a").spawn(move || {
            for i in 0..10u32 {
                tx1.send((1u32, i)).unwrap();
                task::yield_now();
            }
        });
        let b = Builder::new("b").spawn(move || {
            for i in 0..10u32 {
                tx2.send((2u32, i)).unwrap();
                task::yield_now();
            }
        });
        let _ = a.join(-1.0);
        let _ = b.join(-1.0);
        tasklet::quit(tasklet::ExitCode::Ok);
    });

    let observed: Vec<(u32, u32)> = rx.into_iter().collect();
    assert_eq!(observed.len(), 20);
    // Both tasks make progress in lock-step, neither starves the other.
    let last_a = observed.iter().rposition(|(id, _)| *id == 1).unwrap();
    let first_b = observed.iter().position(|(id, _)| *id == 2).unwrap();
    assert!(first_b <= last_a + 1);
}

#[test]
fn channel_exception_transfer() {
    #[derive(Debug)]
    struct TestError(&'static str);

    let (tx, rx) = mpsc::channel();
    run_scenario(move || {
        let chan: &'static Channel<bool> = Box::leak(Box::new(Channel::new()));
        let child = Builder::new("child").spawn(move || {
            let first = chan.receive(-1.0);
            let second = chan.receive(-1.0);
            (first, second)
        });

        task::yield_now();
        chan.send(true, -1.0).unwrap();
        let cause = tasklet::error::TaskletError::new(
            tasklet::error::Failure::Error("x".to_string()),
            task::current().id(),
        );
        chan.send_exception(cause, -1.0).unwrap();

        let (first, second) = child.join(-1.0).unwrap();
        tx.send((first.is_ok(), matches!(second, Err(RecvError::Exception(_)))))
            .unwrap();
        tasklet::quit(tasklet::ExitCode::Ok);
        let _ = TestError("unused");
    });

    let (first_ok, second_was_exception) = rx.recv().unwrap();
    assert!(first_ok);
    assert!(second_was_exception);
}

#[test]
fn kill_on_blocked_receive() {
    let (tx, rx) = mpsc::channel();
    run_scenario(move || {
        let chan: &'static Channel<u32> = Box::leak(Box::new(Channel::new()));
        let child = Builder::new("child").spawn(move || chan.receive(-1.0));

        task::yield_now();
        task::yield_now();
        tasklet::kill(child.task());
        let result = child.join(-1.0);
        tx.send((result.is_err(), chan.balance())).unwrap();
        tasklet::quit(tasklet::ExitCode::Ok);
    });

    let (was_killed, balance_after) = rx.recv().unwrap();
    assert!(was_killed);
    assert_eq!(balance_after, 0);
}

#[test]
fn timeout_stack_arithmetic() {
    let (tx, rx) = mpsc::channel();
    run_scenario(move || {
        let _outer = tasklet::timeout::push(30.0);
        task::sleep(1.0);
        let inner_before = {
            let _inner = tasklet::timeout::push(5.0);
            tasklet::timeout::current()
        };
        let after_inner_pop = tasklet::timeout::current();
        tx.send((inner_before, after_inner_pop)).unwrap();
        tasklet::quit(tasklet::ExitCode::Ok);
    });

    let (inner_before, after_inner_pop) = rx.recv().unwrap();
    assert!((inner_before - 5.0).abs() < 1.0);
    assert!((after_inner_pop - 29.0).abs() < 1.0);
}

#[test]
fn synchronous_call_with_timeout() {
    struct Sleep;
    impl tasklet::message::Tag for Sleep {}

    let (tx, rx) = mpsc::channel();
    run_scenario(move || {
        let handler = Builder::new("handler").spawn(move || loop {
            let env = task::current().mailbox().popleft(-1.0);
            let Ok(env) = env else { continue };
            if env.matches::<Sleep>() {
                let (secs, reply): (f64, _) = env.payload();
                task::sleep(secs);
                if let Some(reply) = reply {
                    reply.reply(());
                }
            }
        });

        let start = Instant::now();
        let result: Result<(), _> =
            tasklet::message::call::<Sleep, f64, ()>(handler.task(), 2.0, 1.0);
        tx.send((result.is_err(), start.elapsed())).unwrap();

        // Let the handler's sleep(2.0) finish and its now-receiverless reply
        // become a no-op.
        task::sleep(3.0);
        tasklet::kill(handler.task());
        tasklet::quit(tasklet::ExitCode::Ok);
    });

    let (timed_out, elapsed) = rx.recv().unwrap();
    assert!(timed_out);
    assert!(elapsed < Duration::from_millis(1500));
}

#[test]
fn reactor_timer_wakes_sleeping_task() {
    let (tx, rx) = mpsc::channel();
    run_scenario(move || {
        let start = Instant::now();
        let timer_task = Builder::new("timer").spawn(move || {
            task::sleep(2.0);
        });
        task::sleep(4.0);
        let _ = timer_task.join(-1.0);
        tx.send(start.elapsed()).unwrap();
        tasklet::quit(tasklet::ExitCode::Ok);
    });

    let elapsed = rx.recv().unwrap();
    assert!(elapsed >= Duration::from_secs(4));
    assert!(elapsed < Duration::from_millis(4200));
}
