//! Mutex-guarded queue shared between socket tasks and the main loop.
//!
//! Every operation locks, runs against the underlying `VecDeque` and
//! unlocks again; no reference to the queue ever leaves the lock.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

pub struct SharedQueue<T> {
    inner: Arc<Mutex<VecDeque<T>>>,
}

impl<T> Clone for SharedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for SharedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedQueue").field("len", &self.len()).finish()
    }
}

impl<T> Default for SharedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SharedQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    // A panic while holding the lock cannot leave a VecDeque half-updated,
    // so a poisoned lock is still safe to use.
    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Runs `f` against the queue while holding the lock
    pub fn with<R>(&self, f: impl FnOnce(&mut VecDeque<T>) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn push(&self, item: T) {
        self.lock().push_back(item);
    }

    pub fn pop(&self) -> Option<T> {
        self.lock().pop_front()
    }

    /// Removes and returns the oldest item matching `predicate`
    pub fn take_first(&self, predicate: impl Fn(&T) -> bool) -> Option<T> {
        self.with(|queue| {
            let index = queue.iter().position(|item| predicate(item))?;
            queue.remove(index)
        })
    }

    /// Removes every item matching `predicate`, returning how many were removed
    pub fn discard(&self, predicate: impl Fn(&T) -> bool) -> usize {
        self.with(|queue| {
            let before = queue.len();
            queue.retain(|item| !predicate(item));
            before - queue.len()
        })
    }

    /// Empties the queue, returning the items in arrival order
    pub fn drain(&self) -> Vec<T> {
        self.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
