//! Software timer queue keyed by a monotonic millisecond clock.
//!
//! The queue owns plain payload values instead of callbacks so the owner can
//! dispatch them with full `&mut self` access. Entries due at the same
//! instant pop in insertion order.

use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

struct Entry<T> {
    /// 0 for one-shot timers.
    interval: u64,
    payload: T,
}

pub struct TimerQueue<T> {
    queue: BTreeMap<(u64, u64), Entry<T>>,
    // handle id -> fire time, so cancel does not scan
    index: HashMap<u64, u64>,
    next_id: u64,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self {
            queue: BTreeMap::new(),
            index: HashMap::new(),
            next_id: 1,
        }
    }
}

impl<T: Clone> TimerQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire `payload` at `now + delay`, then every `interval` ms if non-zero.
    pub fn schedule(&mut self, now: u64, delay: u64, interval: u64, payload: T) -> TimerHandle {
        let id = self.next_id;
        self.next_id += 1;
        let at = now.saturating_add(delay);
        self.queue.insert((at, id), Entry { interval, payload });
        self.index.insert(id, at);
        TimerHandle(id)
    }

    /// Returns false if the timer already fired (one-shot) or was cancelled.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        match self.index.remove(&handle.0) {
            Some(at) => self.queue.remove(&(at, handle.0)).is_some(),
            None => false,
        }
    }

    pub fn is_scheduled(&self, handle: TimerHandle) -> bool {
        self.index.contains_key(&handle.0)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.queue.keys().next().map(|&(at, _)| at)
    }

    /// Milliseconds until the earliest entry is due; 0 if one is overdue.
    pub fn next_timeout(&self, now: u64) -> Option<u64> {
        self.next_deadline().map(|at| at.saturating_sub(now))
    }

    /// Remove and return the earliest entry due at or before `now`.
    /// Periodic entries are re-armed before being returned, so cancelling
    /// the handle while handling the payload stops them.
    pub fn pop_due(&mut self, now: u64) -> Option<(TimerHandle, T)> {
        let (&(at, id), _) = self.queue.iter().next()?;
        if at > now {
            return None;
        }
        let entry = self.queue.remove(&(at, id))?;
        if entry.interval == 0 {
            self.index.remove(&id);
            return Some((TimerHandle(id), entry.payload));
        }
        // after a stall, skip missed periods instead of firing a burst
        let mut next = at.saturating_add(entry.interval);
        if next <= now {
            next = now.saturating_add(entry.interval);
        }
        let payload = entry.payload.clone();
        self.queue.insert((next, id), entry);
        self.index.insert(id, next);
        Some((TimerHandle(id), payload))
    }

    /// Fire every due entry through `f`, which may schedule or cancel on the
    /// queue it is handed. Returns the delay until the next entry.
    pub fn tick<F>(&mut self, now: u64, mut f: F) -> Option<u64>
    where
        F: FnMut(&mut Self, TimerHandle, T),
    {
        while let Some((handle, payload)) = self.pop_due(now) {
            f(self, handle, payload);
        }
        self.next_timeout(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_deadlines_fire_in_insertion_order() {
        let mut q = TimerQueue::new();
        q.schedule(0, 10, 0, "a");
        q.schedule(0, 5, 0, "first");
        q.schedule(0, 10, 0, "b");
        let mut fired = Vec::new();
        let next = q.tick(10, |_, _, p| fired.push(p));
        assert_eq!(fired, vec!["first", "a", "b"]);
        assert_eq!(next, None);
    }

    #[test]
    fn callback_can_reschedule_itself() {
        let mut q = TimerQueue::new();
        q.schedule(0, 100, 0, 3u32);
        let mut fired = Vec::new();
        let mut now = 100;
        while let Some(delay) = q.tick(now, |q, _, left| {
            fired.push(left);
            if left > 0 {
                q.schedule(now, 50, 0, left - 1);
            }
        }) {
            now += delay;
        }
        assert_eq!(fired, vec![3, 2, 1, 0]);
        assert_eq!(now, 250);
    }

    #[test]
    fn periodic_timer_rearms_and_can_be_cancelled_from_callback() {
        let mut q = TimerQueue::new();
        let h = q.schedule(0, 10, 10, ());
        let mut count = 0;
        for now in [10, 20, 30] {
            q.tick(now, |q, handle, _| {
                count += 1;
                if count == 3 {
                    assert!(q.cancel(handle));
                }
            });
        }
        assert_eq!(count, 3);
        assert!(!q.is_scheduled(h));
        assert!(q.is_empty());
    }

    #[test]
    fn double_cancel_is_a_noop() {
        let mut q = TimerQueue::new();
        let h = q.schedule(0, 10, 0, ());
        assert!(q.cancel(h));
        assert!(!q.cancel(h));
        assert_eq!(q.next_timeout(0), None);
    }

    #[test]
    fn next_timeout_reports_overdue_as_zero() {
        let mut q = TimerQueue::new();
        q.schedule(100, 20, 0, ());
        assert_eq!(q.next_timeout(110), Some(10));
        assert_eq!(q.next_timeout(500), Some(0));
    }
}
