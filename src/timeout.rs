// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-task timeout stack.
//!
//! Every task in this runtime owns a dedicated OS thread for its lifetime
//! (see the run-token design in [`crate::scheduler`]), so the stack can live
//! in thread-local storage without any extra task-keyed indirection.

use std::cell::RefCell;
use std::time::{Duration, Instant};

thread_local! {
    static STACK: RefCell<Vec<Instant>> = const { RefCell::new(Vec::new()) };
}

/// Pushes a new relative deadline, clamped to the tightest deadline already
/// on the stack so effective deadlines are monotonically non-increasing.
///
/// Returns a [`Guard`] that must be dropped (or `.pop()`'d explicitly) to
/// restore the previous deadline; see [`scoped`] for the common case.
#[must_use = "dropping the guard immediately pops the deadline back off"]
pub fn push(seconds: f64) -> Guard {
    let requested = if seconds.is_finite() && seconds >= 0.0 {
        Some(Instant::now() + Duration::from_secs_f64(seconds))
    } else {
        None
    };

    STACK.with(|stack| {
        let mut stack = stack.borrow_mut();
        let effective = match (requested, stack.last().copied()) {
            (Some(r), Some(parent)) => r.min(parent),
            (Some(r), None) => r,
            (None, Some(parent)) => parent,
            (None, None) => {
                stack.push(far_future());
                return Guard { _private: () };
            }
        };
        stack.push(effective);
        Guard { _private: () }
    })
}

fn far_future() -> Instant {
    // A deadline effectively indistinguishable from "no deadline" for the
    // purposes of this stack; `current()` special-cases an empty stack
    // instead of relying on this value's magnitude.
    Instant::now() + Duration::from_secs(60 * 60 * 24 * 365 * 10)
}

/// Pops the most recently pushed deadline. Panics if the stack is empty;
/// every `pop` must be paired with a preceding `push`.
pub fn pop() {
    STACK.with(|stack| {
        let popped = stack.borrow_mut().pop();
        assert!(popped.is_some(), "timeout::pop() called on an empty stack");
    });
}

/// Remaining seconds until the current effective deadline, or `-1.0` if no
/// deadline is in effect.
#[must_use]
pub fn current() -> f64 {
    STACK.with(|stack| match stack.borrow().last() {
        None => -1.0,
        Some(deadline) => {
            let now = Instant::now();
            if *deadline <= now {
                0.0
            } else {
                (*deadline - now).as_secs_f64()
            }
        }
    })
}

/// RAII handle returned by [`push`]; pops the deadline on drop.
#[derive(Debug)]
pub struct Guard {
    _private: (),
}

impl Drop for Guard {
    fn drop(&mut self) {
        pop();
    }
}

/// Runs `f` with `seconds` pushed as the effective deadline, guaranteeing the
/// stack is popped on every exit path including panics.
pub fn scoped<R>(seconds: f64, f: impl FnOnce() -> R) -> R {
    let _guard = push(seconds);
    f()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_deadlines_are_monotonically_non_increasing() {
        assert_eq!(current(), -1.0);
        {
            let _outer = push(30.0);
            assert!((current() - 30.0).abs() < 0.5);
            {
                let _inner = push(5.0);
                assert!((current() - 5.0).abs() < 0.5);
            }
            assert!((current() - 30.0).abs() < 0.5);
        }
        assert_eq!(current(), -1.0);
    }

    #[test]
    fn a_looser_inner_deadline_is_clamped_to_the_parent() {
        let _outer = push(1.0);
        let _inner = push(30.0);
        assert!(current() <= 1.0);
    }
}
