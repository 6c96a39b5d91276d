//! CounterMap: key -> rolling counter, with lazy creation and
//! decay-driven removal under a reader/writer lock.

use core::borrow::Borrow;
use core::hash::{BuildHasher, Hash};
use std::collections::hash_map::RandomState;
use std::sync::{Arc, Weak};
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::{RwLock, RwLockReadGuard};

use crate::counter::{Count, Counter, Owner};
use crate::error::{Error, Result};
use crate::reentrancy::{self, ReadMarker};
use crate::scheduler::{Schedule, TimerThread};
use crate::Config;

type Entries<K, S> = HashMap<K, Arc<Counter<K>>, S>;

struct Inner<K, S> {
    // Write lock to insert/remove entries; read lock to look up or to
    // bump a counter that is already present.
    entries: RwLock<Entries<K, S>>,
    window: Duration,
    scheduler: Arc<dyn Schedule>,
    this: Weak<Inner<K, S>>,
}

/// Expiring hash counter. Every increment of a key is retracted again
/// once `window` has elapsed, so each key reads as "how much was counted
/// in the last `window`". Keys whose total decays to zero disappear.
///
/// Cloning yields another handle to the same map.
pub struct CounterMap<K, S = RandomState> {
    inner: Arc<Inner<K, S>>,
}

impl<K, S> Clone for CounterMap<K, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> CounterMap<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// Create a map with the given window and its own timer thread.
    /// A zero window is rejected with [`Error::InvalidWindow`].
    pub fn new(window: Duration) -> Result<Self> {
        Self::with_config(Config::new(window))
    }

    pub fn with_config(config: Config) -> Result<Self> {
        Self::with_hasher(config, RandomState::new())
    }

    /// Create a map whose decays are driven by `scheduler` instead of a
    /// dedicated timer thread.
    pub fn with_scheduler(window: Duration, scheduler: Arc<dyn Schedule>) -> Result<Self> {
        check_window(window)?;
        Ok(Self::build(window, scheduler, RandomState::new()))
    }
}

fn check_window(window: Duration) -> Result<()> {
    if window.is_zero() {
        return Err(Error::InvalidWindow(window));
    }
    Ok(())
}

impl<K, S> CounterMap<K, S>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    S: BuildHasher + Send + Sync + 'static,
{
    pub fn with_hasher(config: Config, hasher: S) -> Result<Self> {
        config.validate()?;
        let timer = TimerThread::spawn(&config.timer_thread_name)?;
        Ok(Self::build(config.window, Arc::new(timer), hasher))
    }

    fn build(window: Duration, scheduler: Arc<dyn Schedule>, hasher: S) -> Self {
        Self {
            inner: Arc::new_cyclic(|this| Inner {
                entries: RwLock::new(HashMap::with_hasher(hasher)),
                window,
                scheduler,
                this: this.clone(),
            }),
        }
    }

    fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    pub fn window(&self) -> Duration {
        self.inner.window
    }

    /// Count one occurrence of `key`.
    #[inline]
    pub fn increment(&self, key: K) {
        self.increment_by(key, 1)
    }

    /// Add `amount` to `key`, creating its counter if needed. The amount is
    /// retracted again after the window. A zero amount does nothing.
    ///
    /// # Panics
    ///
    /// In debug builds, if the calling thread holds a [`Snapshot`] of this
    /// map (which would otherwise deadlock).
    pub fn increment_by(&self, key: K, amount: i64) {
        if amount == 0 {
            return;
        }
        reentrancy::assert_not_reading(self.id());
        loop {
            // Fast path: the add happens under the read lock so a concurrent
            // remove (which needs the write lock) cannot interleave with it.
            let entries = self.inner.entries.read();
            if let Some(counter) = entries.get(&key) {
                let counter = Arc::clone(counter);
                counter.add(amount);
                drop(entries);
                counter.schedule_decay(amount);
                return;
            }
            drop(entries);

            match self.create(key.clone(), amount) {
                Some(counter) => {
                    log::trace!("created counter, {} key(s) tracked", self.len());
                    counter.schedule_decay(amount);
                    return;
                }
                // Someone created it while we waited for the write lock.
                None => continue,
            }
        }
    }

    /// Insert a fresh counter for `key` with `amount` already applied, or
    /// return `None` if the key is present. The add lands under the write
    /// lock; once it is released other writers and decays can reach the
    /// counter, so it must already be non-zero by then.
    fn create(&self, key: K, amount: i64) -> Option<Arc<Counter<K>>> {
        let mut entries = self.inner.entries.write();
        if entries.contains_key(&key) {
            return None;
        }
        let counter = Counter::new(key.clone(), self.inner.owner());
        counter.add(amount);
        entries.insert(key, Arc::clone(&counter));
        Some(counter)
    }

    /// Take a structurally consistent view of the map. The read lock is
    /// held until the snapshot is dropped; writers that need to create or
    /// remove entries wait until then.
    pub fn snapshot(&self) -> Snapshot<'_, K, S> {
        let marker = reentrancy::enter_read(self.id());
        Snapshot {
            entries: self.inner.entries.read(),
            _marker: marker,
        }
    }

    /// Current rolling total for `key`, if it is tracked.
    pub fn get<Q>(&self, key: &Q) -> Option<i64>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.inner.entries.read().get(key).map(|c| c.value())
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.inner.entries.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.read().is_empty()
    }

    /// Decays scheduled but not yet fired.
    pub fn pending_decays(&self) -> usize {
        self.inner.scheduler.pending()
    }
}

impl<K, S> Inner<K, S>
where
    K: Eq + Hash + Send + Sync + 'static,
    S: BuildHasher + Send + Sync + 'static,
{
    fn owner(&self) -> Weak<dyn Owner<K>> {
        self.this.clone()
    }
}

impl<K, S> Owner<K> for Inner<K, S>
where
    K: Eq + Hash + Send + Sync + 'static,
    S: BuildHasher + Send + Sync + 'static,
{
    fn window(&self) -> Duration {
        self.window
    }

    fn scheduler(&self) -> &dyn Schedule {
        self.scheduler.as_ref()
    }

    fn remove(&self, key: &K, counter: &Counter<K>) {
        let mut entries = self.entries.write();
        // An increment may have landed between the decay reaching zero and
        // this write lock; only a settled zero of this same counter goes.
        let settled = entries
            .get(key)
            .map_or(false, |c| core::ptr::eq(Arc::as_ptr(c), counter) && c.value() == 0);
        if settled {
            entries.remove(key);
            log::trace!("removed settled counter, {} key(s) tracked", entries.len());
        } else {
            log::trace!("skipped removal, counter was revived or replaced");
        }
    }
}

/// Read view returned by [`CounterMap::snapshot`]. Holds the map's read
/// lock; no entry is added or removed while it lives, though counter values
/// keep moving.
pub struct Snapshot<'a, K, S = RandomState> {
    entries: RwLockReadGuard<'a, Entries<K, S>>,
    _marker: ReadMarker,
}

impl<'a, K, S> Snapshot<'a, K, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.entries.contains_key(key)
    }

    /// The counter for `key`, borrowed for as long as the snapshot lives.
    pub fn counter<Q>(&self, key: &Q) -> Option<&Counter<K>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.entries.get(key).map(|c| c.as_ref())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &Counter<K>)> + '_ {
        self.entries.iter().map(|(k, c)| (k, c.as_ref()))
    }
}

impl<'a, K, S> Snapshot<'a, K, S>
where
    K: Eq + Hash + Send + Sync + 'static,
    S: BuildHasher,
{
    pub fn get<Q>(&self, key: &Q) -> Option<i64>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.entries.get(key).map(|c| c.value())
    }

    /// Key and current value of every entry.
    pub fn values(&self) -> impl Iterator<Item = (&K, i64)> + '_ {
        self.entries.iter().map(|(k, c)| (k, c.value()))
    }

    /// Copy the current values out, so the lock can be released.
    pub fn to_map(&self) -> std::collections::HashMap<K, i64>
    where
        K: Clone,
    {
        self.values().map(|(k, v)| (k.clone(), v)).collect()
    }
}
