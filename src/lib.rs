//! expiring-hash-counter: a concurrent counting map whose increments
//! retract themselves after a fixed window.
//!
//! Each key reads as "how much was counted in the last `window`". There
//! is no sweep pass: every increment schedules its own compensating
//! decrement, and a key whose total decays to exactly zero removes itself.
//!
//! Internal Design:
//!
//! Layers
//! - `Schedule`: one-shot delayed tasks. `TimerThread` (one OS thread per
//!   map) in production, `ManualScheduler` (virtual time) in tests.
//! - `Counter<K>`: an `AtomicI64` bound to one key. Lock-free; each
//!   increment schedules exactly one decay of the same amount, and a decay
//!   that lands on zero asks the owning map to remove the key.
//! - `CounterMap<K, S>`: owns `K -> Arc<Counter<K>>` behind a
//!   `parking_lot::RwLock` and exposes the API.
//!
//! Locking
//! - Bumping an existing key only needs the read lock; the atomic add runs
//!   under it so a removal (write lock) cannot slip in between lookup and
//!   add. Creating a key takes the write lock and re-checks before
//!   inserting (double-checked creation).
//! - Removal takes the write lock and deletes only if the stored counter is
//!   the one that decayed and its value is still zero.
//! - Timer registration and caller code never run under the map lock.
//!
//! Ownership
//! - The map owns counters through `Arc`; counters point back at the map
//!   through a `Weak`, so there is no cycle. A pending decay holds its own
//!   `Arc<Counter>` and still fires correctly after the entry is gone.
//! - Dropping the last `CounterMap` handle stops its timer thread; pending
//!   decays are discarded with it.
//!
//! Snapshots
//! - `snapshot()` returns an RAII guard over the read lock. The key set is
//!   frozen while it lives; values are not. Holding it blocks creation and
//!   removal, so keep it short. In debug builds, incrementing a map from a
//!   thread that holds its snapshot panics instead of deadlocking.
//!
//! Notes and non-goals
//! - Counts are `i64`. Mixed-sign amounts are accepted; an intermediate
//!   decay that lands on zero still removes the key.
//! - No persistence, no per-event history, no cancellation of decays.

use std::time::Duration;

mod counter;
mod counter_map;
mod error;
mod reentrancy;
pub mod scheduler;

// Public surface
pub use counter::{Count, Counter};
pub use counter_map::{CounterMap, Snapshot};
pub use error::{Error, Result};
pub use scheduler::{ManualScheduler, Schedule, TimerThread};

#[derive(Clone, Debug)]
pub struct Config {
    /// How long each increment stays counted.
    pub window: Duration,
    pub timer_thread_name: String,
}

impl Config {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.window.is_zero() {
            return Err(Error::InvalidWindow(self.window));
        }
        if self.timer_thread_name.contains('\0') {
            return Err(Error::InvalidThreadName(self.timer_thread_name.clone()));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            timer_thread_name: "ehc-decay".to_owned(),
        }
    }
}
