//! Debug-only guard against writing through a map while the same thread
//! still holds a snapshot of it.
//!
//! A held `Snapshot` owns the map's read lock; an increment from the same
//! thread would wait for the write lock (or behind a queued writer) forever.
//! In debug builds each thread records which maps it is reading and
//! `assert_not_reading` turns that self-deadlock into a panic. In release
//! builds this compiles to a zero-cost no-op.

use core::marker::PhantomData;

#[cfg(debug_assertions)]
use std::cell::RefCell;

#[cfg(debug_assertions)]
thread_local! {
    static READING: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// RAII marker returned by [`enter_read`]; one per live snapshot.
#[derive(Debug)]
pub struct ReadMarker {
    #[cfg(debug_assertions)]
    owner: usize,
    // Must be dropped on the thread that created it.
    _nosend: PhantomData<*mut ()>,
}

/// Record that the current thread holds a read view of map `owner`.
#[inline]
pub fn enter_read(owner: usize) -> ReadMarker {
    #[cfg(debug_assertions)]
    {
        READING.with(|r| r.borrow_mut().push(owner));
        ReadMarker {
            owner,
            _nosend: PhantomData,
        }
    }

    #[cfg(not(debug_assertions))]
    {
        let _ = owner;
        ReadMarker {
            _nosend: PhantomData,
        }
    }
}

/// Panics in debug builds if the current thread holds a read view of `owner`.
#[inline]
pub fn assert_not_reading(owner: usize) {
    #[cfg(debug_assertions)]
    {
        let held = READING.with(|r| r.borrow().contains(&owner));
        assert!(
            !held,
            "reentrancy detected: increment while this thread holds a snapshot of the same map"
        );
    }

    #[cfg(not(debug_assertions))]
    {
        let _ = owner;
    }
}

impl Drop for ReadMarker {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        {
            let owner = self.owner;
            // try_with: the thread-local may already be gone during thread teardown.
            let _ = READING.try_with(|r| {
                let mut held = r.borrow_mut();
                if let Some(pos) = held.iter().rposition(|&o| o == owner) {
                    held.swap_remove(pos);
                }
            });
        }
    }
}
