//! Ordered (deadline, entry) set with O(log n) insert/adjust/remove, used by
//! each sub-reactor to evict idle connections (§4.C, §5 "Idle connection
//! timeout"). Entries fire through `tick()`'s two-phase collect-then-call:
//! due entries are drained from the map under the lock, the lock is
//! released, and only then are callbacks invoked, so a callback that
//! re-enters the manager (e.g. by re-arming its own timer) never deadlocks.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Opaque handle identifying a timer entry, stable across `adjust`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

struct Inner<O> {
    /// (deadline, insertion-seq) -> (TimerId, owner). BTreeMap keeps
    /// non-decreasing deadline order; ties break by insertion order via the
    /// monotonically increasing `seq` half of the key.
    by_deadline: BTreeMap<(Instant, u64), (TimerId, O)>,
    /// TimerId -> its current key, so `adjust`/`remove` can erase the old
    /// entry in O(log n) instead of scanning the map.
    index: HashMap<TimerId, (Instant, u64)>,
    next_id: u64,
    next_seq: u64,
}

/// Per-sub-reactor timer manager. `O` is the owner payload carried alongside
/// each deadline (e.g. a connection `Token` plus a generation counter, so a
/// fired callback can tell a stale timer from a live one after the slot was
/// reused).
pub struct TimerManager<O> {
    inner: Mutex<Inner<O>>,
}

impl<O: Clone> TimerManager<O> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                by_deadline: BTreeMap::new(),
                index: HashMap::new(),
                next_id: 0,
                next_seq: 0,
            }),
        }
    }

    /// Arms a new timer and returns its id.
    pub fn add(&self, deadline: Instant, owner: O) -> TimerId {
        let mut inner = self.inner.lock().unwrap();
        let id = TimerId(inner.next_id);
        inner.next_id += 1;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.by_deadline.insert((deadline, seq), (id, owner));
        inner.index.insert(id, (deadline, seq));
        id
    }

    pub fn add_from_now(&self, ttl: Duration, owner: O) -> TimerId {
        self.add(Instant::now() + ttl, owner)
    }

    /// Moves `id`'s deadline, preserving the owner payload. No-op if `id`
    /// was already removed or fired.
    pub fn adjust(&self, id: TimerId, new_deadline: Instant) {
        let mut inner = self.inner.lock().unwrap();
        let Some(old_key) = inner.index.get(&id).copied() else {
            return;
        };
        let Some((_, owner)) = inner.by_deadline.remove(&old_key) else {
            return;
        };
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.by_deadline.insert((new_deadline, seq), (id, owner));
        inner.index.insert(id, (new_deadline, seq));
    }

    pub fn adjust_from_now(&self, id: TimerId, ttl: Duration) {
        self.adjust(id, Instant::now() + ttl);
    }

    /// Cancels `id`. No-op if already fired or unknown.
    pub fn remove(&self, id: TimerId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(key) = inner.index.remove(&id) {
            inner.by_deadline.remove(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().by_deadline.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Collects every entry with `deadline <= now` and returns them in
    /// non-decreasing deadline order (ties in insertion order), already
    /// unregistered from the manager. Callers invoke their callbacks on the
    /// returned list *after* this call returns, with the lock released.
    pub fn tick(&self) -> Vec<(TimerId, O)> {
        self.tick_at(Instant::now())
    }

    pub fn tick_at(&self, now: Instant) -> Vec<(TimerId, O)> {
        let mut inner = self.inner.lock().unwrap();
        let due: Vec<(Instant, u64)> = inner
            .by_deadline
            .range(..=(now, u64::MAX))
            .map(|(k, _)| *k)
            .collect();
        let mut fired = Vec::with_capacity(due.len());
        for key in due {
            if let Some((id, owner)) = inner.by_deadline.remove(&key) {
                inner.index.remove(&id);
                fired.push((id, owner));
            }
        }
        fired
    }
}

impl<O: Clone> Default for TimerManager<O> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_in_deadline_order() {
        let tm: TimerManager<&'static str> = TimerManager::new();
        let base = Instant::now();
        tm.add(base + Duration::from_millis(30), "c");
        tm.add(base + Duration::from_millis(10), "a");
        tm.add(base + Duration::from_millis(20), "b");

        let fired = tm.tick_at(base + Duration::from_millis(25));
        let owners: Vec<&str> = fired.into_iter().map(|(_, o)| o).collect();
        assert_eq!(owners, vec!["a", "b"]);
        assert_eq!(tm.len(), 1);
    }

    #[test]
    fn ties_break_by_insertion_order() {
        let tm: TimerManager<i32> = TimerManager::new();
        let deadline = Instant::now();
        tm.add(deadline, 1);
        tm.add(deadline, 2);
        tm.add(deadline, 3);
        let fired = tm.tick_at(deadline);
        let owners: Vec<i32> = fired.into_iter().map(|(_, o)| o).collect();
        assert_eq!(owners, vec![1, 2, 3]);
    }

    #[test]
    fn adjust_moves_deadline_without_changing_id() {
        let tm: TimerManager<i32> = TimerManager::new();
        let base = Instant::now();
        let id = tm.add(base + Duration::from_millis(5), 42);
        tm.adjust(id, base + Duration::from_millis(50));
        assert!(tm.tick_at(base + Duration::from_millis(10)).is_empty());
        let fired = tm.tick_at(base + Duration::from_millis(60));
        assert_eq!(fired, vec![(id, 42)]);
    }

    #[test]
    fn remove_cancels_before_fire() {
        let tm: TimerManager<i32> = TimerManager::new();
        let base = Instant::now();
        let id = tm.add(base, 1);
        tm.remove(id);
        assert!(tm.is_empty());
        assert!(tm.tick_at(base).is_empty());
    }

    #[test]
    fn index_and_map_sizes_stay_equal() {
        let tm: TimerManager<i32> = TimerManager::new();
        let base = Instant::now();
        let a = tm.add(base, 1);
        let _b = tm.add(base + Duration::from_secs(1), 2);
        tm.adjust(a, base + Duration::from_millis(500));
        tm.remove(a);
        assert_eq!(tm.inner.lock().unwrap().by_deadline.len(), 1);
        assert_eq!(tm.inner.lock().unwrap().index.len(), 1);
    }
}
