//! Pool of reusable per-connection objects (§4.J). The raw socket a fresh
//! `accept` hands back obviously can't be pooled, but the heap-allocated
//! state each connection carries — header maps, parse buffers, the pending
//! write buffer — churns an allocation per connection unless it is. This
//! pools that state: `HttpConnection` borrows one on accept via
//! [`ConnectionPool::acquire`] and returns it through the guard's `Drop` when
//! the connection closes.

use std::sync::Mutex;

/// Types the connection pool knows how to recycle. `pool_reset` runs once,
/// right before the object goes back on the free list, so a connection that
/// forgets to clear something itself still can't leak state into the next
/// accept.
pub trait PoolReset: Default {
    fn pool_reset(&mut self);
}

pub const MAX_POOL_SIZE: usize = 10_000;

struct Inner<T> {
    free: Vec<T>,
    in_use: usize,
}

pub struct ConnectionPool<T> {
    inner: Mutex<Inner<T>>,
    max_size: usize,
}

impl<T: PoolReset> ConnectionPool<T> {
    pub fn new() -> Self {
        Self::with_capacity(MAX_POOL_SIZE)
    }

    pub fn with_capacity(max_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                free: Vec::new(),
                in_use: 0,
            }),
            max_size,
        }
    }

    /// Pops a reset object off the free list, or builds a fresh `T::default()`
    /// if the pool is currently empty.
    pub fn acquire(self: &std::sync::Arc<Self>) -> Pooled<T> {
        let mut inner = self.inner.lock().unwrap();
        let item = inner.free.pop().unwrap_or_default();
        inner.in_use += 1;
        Pooled {
            pool: std::sync::Arc::clone(self),
            item: Some(item),
        }
    }

    pub fn free_count(&self) -> usize {
        self.inner.lock().unwrap().free.len()
    }

    pub fn in_use_count(&self) -> usize {
        self.inner.lock().unwrap().in_use
    }
}

impl<T: PoolReset> Default for ConnectionPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII handle: `Deref`/`DerefMut` to the pooled object, returns it to the
/// pool (reset first) on drop. Discarded instead of pooled if the pool is
/// already at `MAX_POOL_SIZE` entries (in-use count is unaffected either way
/// — it only tracks how many guards are currently live).
pub struct Pooled<T: PoolReset> {
    pool: std::sync::Arc<ConnectionPool<T>>,
    item: Option<T>,
}

impl<T: PoolReset> std::ops::Deref for Pooled<T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.item.as_ref().unwrap()
    }
}

impl<T: PoolReset> std::ops::DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().unwrap()
    }
}

impl<T: PoolReset> Drop for Pooled<T> {
    fn drop(&mut self) {
        let Some(mut item) = self.item.take() else {
            return;
        };
        let mut inner = self.pool.inner.lock().unwrap();
        inner.in_use -= 1;
        if inner.free.len() < self.pool.max_size {
            item.pool_reset();
            inner.free.push(item);
        }
    }
}

impl PoolReset for crate::http::HttpRequest {
    fn pool_reset(&mut self) {
        *self = crate::http::HttpRequest::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::HttpRequest;
    use std::sync::Arc;

    #[test]
    fn acquire_release_invariant_holds() {
        let pool = Arc::new(ConnectionPool::<HttpRequest>::new());
        assert_eq!(pool.in_use_count(), 0);
        {
            let a = pool.acquire();
            let b = pool.acquire();
            assert_eq!(pool.in_use_count(), 2);
            drop(a);
            drop(b);
        }
        assert_eq!(pool.in_use_count(), 0);
        assert_eq!(pool.free_count(), 2);
    }

    #[test]
    fn reused_object_is_reset() {
        let pool = Arc::new(ConnectionPool::<HttpRequest>::new());
        {
            let mut req = pool.acquire();
            req.url = "/dirty".to_string();
            req.headers.insert("x".into(), "y".into());
        }
        let req = pool.acquire();
        assert_eq!(req.url, "");
        assert!(req.headers.is_empty());
    }

    #[test]
    fn respects_capacity_cap() {
        let pool = Arc::new(ConnectionPool::<HttpRequest>::with_capacity(1));
        let a = pool.acquire();
        let b = pool.acquire();
        drop(a);
        drop(b);
        assert_eq!(pool.free_count(), 1);
    }
}
