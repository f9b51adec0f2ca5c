// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Fluent task construction: configure name and daemon status before spawning.

use super::{spawn, JoinHandle};

/// Builds a task without starting it; call [`Builder::spawn`] to enqueue and run it.
pub struct Builder {
    name: String,
    daemon: bool,
}

impl Builder {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            daemon: false,
        }
    }

    /// Marks the task as a daemon: it is not attached to its creator as a
    /// child and is not awaited by [`super::join_children`].
    #[must_use]
    pub fn daemon(mut self, daemon: bool) -> Self {
        self.daemon = daemon;
        self
    }

    /// Starts `f` as a new task, returning a handle to its eventual result.
    pub fn spawn<F, R>(self, f: F) -> JoinHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        spawn(self.name, self.daemon, f)
    }
}
