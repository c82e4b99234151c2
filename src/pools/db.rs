//! Fixed-size pool of pre-opened database handles (§4.D). The concrete
//! adapter (real driver, connection string, query execution) is an external
//! collaborator per spec §6 ("a blocking database handle source"); this
//! module owns only the pooling discipline — eager open at init, blocking
//! acquire/release on a condition variable, `destroy` closing every handle.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{CleanError, Result};

/// What the pool pools. Implementors open a handle eagerly (`open`) and
/// close it eagerly (`close`); both may fail, and an `open` failure at
/// pool-init time is an `InitError` (spec §7 "Initialization error: fatal").
pub trait DbHandle: Sized + Send {
    fn open() -> std::io::Result<Self>;
    fn close(self) {}
}

/// An in-memory fixture handle standing in for a real driver: a fixed
/// `username -> password` table, matching S3's "fixture DB containing
/// `alice` / `xyz`". Good enough for the login/register handlers and for
/// tests; a real deployment swaps this for an adapter behind the same
/// `DbHandle` trait.
#[derive(Debug, Clone)]
pub struct FixtureDbHandle {
    users: std::collections::HashMap<String, String>,
}

impl FixtureDbHandle {
    pub fn check_login(&self, username: &str, password: &str) -> bool {
        self.users.get(username).is_some_and(|p| p == password)
    }

    pub fn register(&mut self, username: &str, password: &str) -> bool {
        if self.users.contains_key(username) {
            return false;
        }
        self.users.insert(username.to_string(), password.to_string());
        true
    }
}

impl DbHandle for FixtureDbHandle {
    fn open() -> std::io::Result<Self> {
        let mut users = std::collections::HashMap::new();
        users.insert("alice".to_string(), "xyz".to_string());
        Ok(Self { users })
    }
}

struct Inner<H> {
    free: Vec<H>,
    in_use: usize,
    max: usize,
}

/// Default acquire timeout (DESIGN.md §"DB acquire timeout"): bounded so a
/// worker thread degrades to a 503 instead of hanging forever. The spec's
/// source disagreed with itself (10µs in one place, unbounded in another);
/// `acquire_blocking` keeps the unbounded option available explicitly.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_millis(50);

pub struct DbPool<H> {
    inner: Mutex<Inner<H>>,
    available: Condvar,
}

impl<H: DbHandle> DbPool<H> {
    /// Eagerly opens `max` handles. Fails with the first open error.
    pub fn new(max: usize) -> Result<Self> {
        let mut free = Vec::with_capacity(max);
        for _ in 0..max {
            free.push(H::open().map_err(CleanError::from)?);
        }
        Ok(Self {
            inner: Mutex::new(Inner {
                free,
                in_use: 0,
                max,
            }),
            available: Condvar::new(),
        })
    }

    /// Blocks until a handle is free, bounded by `DEFAULT_ACQUIRE_TIMEOUT`.
    /// Returns `None` on timeout; callers must tolerate that (spec §4.D).
    pub fn acquire(&self) -> Option<PooledHandle<'_, H>> {
        self.acquire_timeout(DEFAULT_ACQUIRE_TIMEOUT)
    }

    pub fn acquire_timeout(&self, timeout: Duration) -> Option<PooledHandle<'_, H>> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.inner.lock().unwrap();
        loop {
            if let Some(handle) = guard.free.pop() {
                guard.in_use += 1;
                return Some(PooledHandle {
                    pool: self,
                    handle: Some(handle),
                });
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (g, _) = self.available.wait_timeout(guard, deadline - now).unwrap();
            guard = g;
        }
    }

    /// Never times out. Kept as the explicit opt-in for callers that must
    /// not fail (DESIGN.md decision on the source's acquire-timeout quirk).
    pub fn acquire_blocking(&self) -> PooledHandle<'_, H> {
        let mut guard = self.inner.lock().unwrap();
        loop {
            if let Some(handle) = guard.free.pop() {
                guard.in_use += 1;
                return PooledHandle {
                    pool: self,
                    handle: Some(handle),
                };
            }
            guard = self.available.wait(guard).unwrap();
        }
    }

    fn release(&self, handle: H) {
        let mut guard = self.inner.lock().unwrap();
        guard.free.push(handle);
        guard.in_use -= 1;
        self.available.notify_one();
    }

    pub fn free_count(&self) -> usize {
        self.inner.lock().unwrap().free.len()
    }

    pub fn in_use_count(&self) -> usize {
        self.inner.lock().unwrap().in_use
    }

    pub fn max(&self) -> usize {
        self.inner.lock().unwrap().max
    }

    /// Closes every handle, free and in-use alike. The pool is unusable
    /// afterwards; callers own making sure no task still holds one out.
    pub fn destroy(self) {
        let inner = self.inner.into_inner().unwrap();
        for handle in inner.free {
            handle.close();
        }
    }
}

/// RAII guard: releases the handle back to its pool on drop, guaranteeing
/// `acquire`/`release` pairs balance even on an early return or panic
/// (spec §8 invariant 3, restated for this pool).
pub struct PooledHandle<'p, H: DbHandle> {
    pool: &'p DbPool<H>,
    handle: Option<H>,
}

impl<'p, H: DbHandle> std::ops::Deref for PooledHandle<'p, H> {
    type Target = H;
    fn deref(&self) -> &H {
        self.handle.as_ref().unwrap()
    }
}

impl<'p, H: DbHandle> std::ops::DerefMut for PooledHandle<'p, H> {
    fn deref_mut(&mut self) -> &mut H {
        self.handle.as_mut().unwrap()
    }
}

impl<'p, H: DbHandle> Drop for PooledHandle<'p, H> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.release(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn eager_open_and_free_plus_in_use_invariant() {
        let pool: DbPool<FixtureDbHandle> = DbPool::new(3).unwrap();
        assert_eq!(pool.free_count(), 3);
        assert_eq!(pool.in_use_count(), 0);
        let h = pool.acquire().unwrap();
        assert_eq!(pool.free_count() + pool.in_use_count(), pool.max());
        assert!(h.check_login("alice", "xyz"));
        drop(h);
        assert_eq!(pool.free_count(), 3);
    }

    #[test]
    fn acquire_blocks_until_release() {
        let pool = Arc::new(DbPool::<FixtureDbHandle>::new(1).unwrap());
        let h = pool.acquire().unwrap();
        let pool2 = Arc::clone(&pool);
        let handle = thread::spawn(move || pool2.acquire_blocking());
        thread::sleep(Duration::from_millis(20));
        drop(h);
        let _h2 = handle.join().unwrap();
        assert_eq!(pool.in_use_count(), 1);
    }

    #[test]
    fn acquire_times_out_when_exhausted() {
        let pool: DbPool<FixtureDbHandle> = DbPool::new(1).unwrap();
        let _held = pool.acquire().unwrap();
        let missed = pool.acquire_timeout(Duration::from_millis(10));
        assert!(missed.is_none());
    }

    #[test]
    fn register_rejects_duplicate_username() {
        let mut h = FixtureDbHandle::open().unwrap();
        assert!(h.register("carol", "pw"));
        assert!(!h.register("carol", "other"));
    }
}
