//! Counter: one key's rolling total, decayed by its own scheduled tasks.

use core::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::scheduler::Schedule;

/// The capability set of a rolling counter.
pub trait Count {
    /// Add `amount` now and retract it once the window has elapsed.
    /// A zero amount is a no-op.
    fn increment(&self, amount: i64);

    /// The current rolling total.
    fn value(&self) -> i64;
}

/// What a counter needs from the map that owns it.
pub(crate) trait Owner<K>: Send + Sync {
    fn window(&self) -> Duration;
    fn scheduler(&self) -> &dyn Schedule;
    /// Drop the entry for `key` if it is still `counter` and still zero.
    fn remove(&self, key: &K, counter: &Counter<K>);
}

/// Thread-safe rolling counter bound to one key of a `CounterMap`.
///
/// All mutation is atomic; no lock is taken here. Each increment schedules
/// its own compensating decrement, so N increments produce N decays.
pub struct Counter<K> {
    value: AtomicI64,
    key: K,
    owner: Weak<dyn Owner<K>>,
    this: Weak<Counter<K>>,
}

impl<K> Counter<K>
where
    K: Send + Sync + 'static,
{
    pub(crate) fn new(key: K, owner: Weak<dyn Owner<K>>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            value: AtomicI64::new(0),
            key,
            owner,
            this: this.clone(),
        })
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    /// Apply `amount` without scheduling its decay. Returns false for zero.
    #[inline]
    pub(crate) fn add(&self, amount: i64) -> bool {
        if amount == 0 {
            return false;
        }
        self.value.fetch_add(amount, Ordering::AcqRel);
        true
    }

    /// Schedule the retraction of an `amount` previously applied with `add`.
    pub(crate) fn schedule_decay(&self, amount: i64) {
        let (Some(owner), Some(this)) = (self.owner.upgrade(), self.this.upgrade()) else {
            // Map already gone; nothing will ever read this counter again.
            return;
        };
        owner
            .scheduler()
            .schedule(owner.window(), Box::new(move || this.decay(amount)));
    }

    fn decay(&self, amount: i64) {
        let remaining = self
            .value
            .fetch_sub(amount, Ordering::AcqRel)
            .wrapping_sub(amount);
        if remaining == 0 {
            if let Some(owner) = self.owner.upgrade() {
                owner.remove(&self.key, self);
            }
        }
    }
}

impl<K> Count for Counter<K>
where
    K: Send + Sync + 'static,
{
    fn increment(&self, amount: i64) {
        if self.add(amount) {
            self.schedule_decay(amount);
        }
    }

    #[inline]
    fn value(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }
}

impl<K: fmt::Debug> fmt::Debug for Counter<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Counter")
            .field("key", &self.key)
            .field("value", &self.value.load(Ordering::Acquire))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ManualScheduler;
    use parking_lot::Mutex;

    // Stand-in owner that records removal requests instead of owning a map.
    struct RecordingOwner {
        window: Duration,
        scheduler: ManualScheduler,
        removed: Mutex<Vec<(&'static str, i64)>>,
    }

    impl Owner<&'static str> for RecordingOwner {
        fn window(&self) -> Duration {
            self.window
        }
        fn scheduler(&self) -> &dyn Schedule {
            &self.scheduler
        }
        fn remove(&self, key: &&'static str, counter: &Counter<&'static str>) {
            self.removed.lock().push((*key, counter.value()));
        }
    }

    fn owner() -> Arc<RecordingOwner> {
        Arc::new(RecordingOwner {
            window: Duration::from_millis(10),
            scheduler: ManualScheduler::new(),
            removed: Mutex::new(Vec::new()),
        })
    }

    fn counter(owner: &Arc<RecordingOwner>) -> Arc<Counter<&'static str>> {
        let weak: Weak<dyn Owner<&'static str>> = Arc::downgrade(owner) as Weak<RecordingOwner>;
        Counter::new("k", weak)
    }

    #[test]
    fn zero_amount_is_a_true_noop() {
        let o = owner();
        let c = counter(&o);
        c.increment(0);
        assert_eq!(c.value(), 0);
        assert_eq!(o.scheduler.pending(), 0);
        o.scheduler.advance(Duration::from_secs(1));
        assert!(o.removed.lock().is_empty());
    }

    #[test]
    fn each_increment_decays_independently() {
        let o = owner();
        let c = counter(&o);
        c.increment(2);
        o.scheduler.advance(Duration::from_millis(4));
        c.increment(3);
        assert_eq!(c.value(), 5);
        assert_eq!(o.scheduler.pending(), 2);

        o.scheduler.advance(Duration::from_millis(6));
        assert_eq!(c.value(), 3);
        assert!(o.removed.lock().is_empty());

        o.scheduler.advance(Duration::from_millis(4));
        assert_eq!(c.value(), 0);
        assert_eq!(*o.removed.lock(), vec![("k", 0)]);
    }

    #[test]
    fn pending_decay_keeps_counter_alive() {
        let o = owner();
        let c = counter(&o);
        c.increment(1);
        let weak_counter = Arc::downgrade(&c);
        drop(c);
        // The pending decay keeps the counter alive.
        assert!(weak_counter.upgrade().is_some());
        o.scheduler.advance(Duration::from_millis(10));
        assert!(weak_counter.upgrade().is_none());
        assert_eq!(*o.removed.lock(), vec![("k", 0)]);
    }

    #[test]
    fn increment_after_owner_dropped_does_not_schedule() {
        let o = owner();
        let c = counter(&o);
        let weak = Arc::downgrade(&o);
        drop(o);
        assert!(weak.upgrade().is_none());
        c.increment(4);
        assert_eq!(c.value(), 4);
    }
}
