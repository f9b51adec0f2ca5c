// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Task-scoped attribute storage: [`TaskLocal`] (a bag of values) and
//! [`TaskInstance`] (a single scoped binding), both keyed weakly on the
//! owning task so a finished task's entries are reclaimed without an
//! explicit sweep.

use std::sync::Arc;

use parking_lot::Mutex;
use weak_table::WeakHashMap;

use crate::task::{self, TaskData, TaskRef};

fn task_key(task: &TaskRef) -> std::sync::Weak<TaskData> {
    Arc::downgrade(task.inner())
}

/// A per-task attribute bag. Reads miss with `None` unless `recursive`, in
/// which case lookup walks up `parent()` links until a hit or the root.
pub struct TaskLocal<T> {
    recursive: bool,
    storage: Mutex<WeakHashMap<std::sync::Weak<TaskData>, T>>,
}

impl<T: Clone> TaskLocal<T> {
    #[must_use]
    pub fn new(recursive: bool) -> Self {
        Self {
            recursive,
            storage: Mutex::new(WeakHashMap::new()),
        }
    }

    /// Sets the current task's entry.
    pub fn set(&self, value: T) {
        let key = task_key(&task::current());
        self.storage.lock().insert(key, value);
    }

    /// Removes the current task's entry, if any.
    pub fn unset(&self) {
        let key = task_key(&task::current());
        self.storage.lock().remove(&key);
    }

    /// Reads the value bound to the current task, walking up the parent
    /// chain if `recursive` and the current task has no entry of its own.
    #[must_use]
    pub fn get(&self) -> Option<T> {
        let mut cursor = Some(task::current());
        loop {
            let t = cursor.take()?;
            let key = task_key(&t);
            if let Some(v) = self.storage.lock().get(&key) {
                return Some(v.clone());
            }
            if !self.recursive {
                return None;
            }
            cursor = t.parent();
        }
    }
}

/// A single scoped binding per task, with guaranteed `unset()` on scope exit.
pub struct TaskInstance<T> {
    inner: TaskLocal<T>,
}

impl<T: Clone> TaskInstance<T> {
    #[must_use]
    pub fn new(recursive: bool) -> Self {
        Self {
            inner: TaskLocal::new(recursive),
        }
    }

    /// Binds `value` for the duration of the returned guard.
    #[must_use = "the binding is removed as soon as the guard is dropped"]
    pub fn set(&self, value: T) -> InstanceGuard<'_, T> {
        self.inner.set(value);
        InstanceGuard { owner: self }
    }

    #[must_use]
    pub fn get(&self) -> Option<T> {
        self.inner.get()
    }
}

/// RAII guard returned by [`TaskInstance::set`]; unsets the binding on drop.
pub struct InstanceGuard<'a, T> {
    owner: &'a TaskInstance<T>,
}

impl<T: Clone> Drop for InstanceGuard<'_, T> {
    fn drop(&mut self) {
        self.owner.inner.unset();
    }
}
