// src/task.rs
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tenant key under which sandbox tasks and listeners are scoped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub u64);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic task id source.
#[derive(Debug, Default)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    pub fn starting_at(first: u64) -> Self {
        Self { next: AtomicU64::new(first) }
    }

    pub fn next_id(&self) -> TaskId {
        TaskId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone)]
enum Slot<T> {
    Pending,
    Done(T),
    /// The producer died for a reason the executor did not originate.
    Broken(String),
}

/// Write-once result cell shared between a producer and any number of
/// blocking readers.
#[derive(Debug)]
pub struct Completion<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

impl<T: Clone> Completion<T> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { slot: Mutex::new(Slot::Pending), ready: Condvar::new() })
    }

    pub fn done(value: T) -> Arc<Self> {
        Arc::new(Self { slot: Mutex::new(Slot::Done(value)), ready: Condvar::new() })
    }

    /// First writer wins; returns false when the value was already set.
    pub fn complete(&self, value: T) -> bool {
        self.fill(Slot::Done(value))
    }

    pub fn break_with(&self, reason: impl Into<String>) -> bool {
        self.fill(Slot::Broken(reason.into()))
    }

    pub fn is_done(&self) -> bool {
        !matches!(*self.lock(), Slot::Pending)
    }

    fn fill(&self, value: Slot<T>) -> bool {
        let mut slot = self.lock();
        if !matches!(*slot, Slot::Pending) {
            return false;
        }
        *slot = value;
        self.ready.notify_all();
        true
    }

    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait(&self, deadline: Option<Instant>) -> Option<T> {
        let mut slot = self.lock();
        loop {
            match &*slot {
                Slot::Done(value) => return Some(value.clone()),
                Slot::Broken(reason) => panic!("task result abandoned: {}", reason),
                Slot::Pending => {}
            }
            slot = match deadline {
                None => self.ready.wait(slot).unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    self.ready
                        .wait_timeout(slot, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }
}

/// Handle to an in-flight or finished execution.
#[derive(Debug, Clone)]
pub struct Task<T> {
    id: TaskId,
    completion: Arc<Completion<T>>,
}

impl<T: Clone> Task<T> {
    pub fn new(id: TaskId, completion: Arc<Completion<T>>) -> Self {
        Self { id, completion }
    }

    pub fn ready(id: TaskId, value: T) -> Self {
        Self::new(id, Completion::done(value))
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Blocks until the result is available.
    ///
    /// Panics if the producing side failed internally; that is a bug in the
    /// executor, not an execution outcome.
    pub fn get(&self) -> T {
        match self.completion.wait(None) {
            Some(value) => value,
            None => unreachable!("wait without deadline returned early"),
        }
    }

    pub fn get_timeout(&self, timeout: Duration) -> Option<T> {
        self.completion.wait(Some(Instant::now() + timeout))
    }

    pub fn try_get(&self) -> Option<T> {
        if self.completion.is_done() { self.completion.wait(Some(Instant::now())) } else { None }
    }

    pub fn is_done(&self) -> bool {
        self.completion.is_done()
    }
}
