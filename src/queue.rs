//! Fixed-capacity thread-safe FIFO shared by the worker pool (`workers.rs`)
//! and the database handle pool (`pools::db`). One mutex, two condition
//! variables: `not_full` wakes blocked pushers, `not_empty` wakes blocked
//! poppers. Mirrors the queue `proxy_log` keeps privately for its drain
//! thread, pulled out here as the generic, reusable version spec component A
//! names separately from the log pipeline's own copy.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::CleanError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidArgument;

impl std::fmt::Display for InvalidArgument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "queue capacity must be > 0")
    }
}

impl std::error::Error for InvalidArgument {}

impl From<InvalidArgument> for CleanError {
    fn from(e: InvalidArgument) -> Self {
        CleanError(Box::new(e))
    }
}

struct Inner<T> {
    items: VecDeque<T>,
    capacity: usize,
    closed: bool,
}

/// A bounded blocking queue. `push` blocks while full, `pop` blocks while
/// empty; `pop_timed` gives up after a deadline without touching the queue.
pub struct BoundedQueue<T> {
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Result<Self, InvalidArgument> {
        if capacity == 0 {
            return Err(InvalidArgument);
        }
        Ok(Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                capacity,
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        })
    }

    /// Blocks while the queue is full. Returns `false` without enqueuing if
    /// the queue has been `close()`d (used for pool shutdown).
    pub fn push(&self, item: T) -> bool {
        let mut guard = self.inner.lock().unwrap();
        while guard.items.len() >= guard.capacity && !guard.closed {
            guard = self.not_full.wait(guard).unwrap();
        }
        if guard.closed {
            return false;
        }
        guard.items.push_back(item);
        self.not_empty.notify_one();
        true
    }

    /// Non-blocking push: returns `item` back immediately if full or closed
    /// instead of waiting, matching the worker pool's `append` contract
    /// (§4.E) — the caller gets its job back to fall back on, rather than
    /// losing whatever it captured.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        let mut guard = self.inner.lock().unwrap();
        if guard.items.len() >= guard.capacity || guard.closed {
            return Err(item);
        }
        guard.items.push_back(item);
        self.not_empty.notify_one();
        Ok(())
    }

    pub fn pop(&self) -> Option<T> {
        let mut guard = self.inner.lock().unwrap();
        loop {
            if let Some(item) = guard.items.pop_front() {
                self.not_full.notify_one();
                return Some(item);
            }
            if guard.closed {
                return None;
            }
            guard = self.not_empty.wait(guard).unwrap();
        }
    }

    /// Returns `None` on timeout without modifying the queue.
    pub fn pop_timed(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock().unwrap();
        loop {
            if let Some(item) = guard.items.pop_front() {
                self.not_full.notify_one();
                return Some(item);
            }
            if guard.closed {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (g, timeout_result) = self
                .not_empty
                .wait_timeout(guard, deadline - now)
                .unwrap();
            guard = g;
            if timeout_result.timed_out() && guard.items.is_empty() {
                return None;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        let guard = self.inner.lock().unwrap();
        guard.items.len() >= guard.capacity
    }

    pub fn clear(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.items.clear();
        self.not_full.notify_all();
    }

    /// Wakes every blocked pusher/popper; subsequent `push` is a no-op and
    /// `pop`/`pop_timed` drain what remains then return `None`.
    pub fn close(&self) {
        let mut guard = self.inner.lock().unwrap();
        guard.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn zero_capacity_rejected() {
        assert!(BoundedQueue::<i32>::new(0).is_err());
    }

    #[test]
    fn push_pop_fifo() {
        let q = BoundedQueue::new(4).unwrap();
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn pop_timed_times_out_on_empty() {
        let q: BoundedQueue<i32> = BoundedQueue::new(2).unwrap();
        let start = Instant::now();
        let got = q.pop_timed(Duration::from_millis(20));
        assert!(got.is_none());
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn try_push_fails_when_full() {
        let q = BoundedQueue::new(1).unwrap();
        assert!(q.try_push(1).is_ok());
        assert_eq!(q.try_push(2), Err(2));
    }

    #[test]
    fn push_blocks_until_space_freed() {
        let q = Arc::new(BoundedQueue::new(1).unwrap());
        q.push(1);
        let q2 = Arc::clone(&q);
        let handle = thread::spawn(move || {
            q2.push(2);
        });
        thread::sleep(Duration::from_millis(20));
        assert_eq!(q.pop(), Some(1));
        handle.join().unwrap();
        assert_eq!(q.pop(), Some(2));
    }

    #[test]
    fn close_wakes_blocked_pop() {
        let q: Arc<BoundedQueue<i32>> = Arc::new(BoundedQueue::new(1).unwrap());
        let q2 = Arc::clone(&q);
        let handle = thread::spawn(move || q2.pop());
        thread::sleep(Duration::from_millis(20));
        q.close();
        assert_eq!(handle.join().unwrap(), None);
    }
}
