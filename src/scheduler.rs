//! One-shot delayed tasks: the timer service that fires decays.
//!
//! `Schedule` is the seam between a map and whatever runs its decays.
//! `TimerThread` is the production implementation: one named OS thread
//! per map, sleeping on a condvar until the earliest deadline.
//! `ManualScheduler` runs on virtual time and only fires when told to,
//! which makes decay ordering deterministic in tests and benches.

use core::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::error::Result;

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A service that runs tasks once, some time in the future.
pub trait Schedule: Send + Sync {
    /// Run `task` once, no earlier than `delay` from now, off the calling thread.
    /// A delay whose deadline the clock cannot represent never fires; the
    /// task is dropped without running.
    fn schedule(&self, delay: Duration, task: Task);

    /// Number of tasks scheduled but not yet started.
    fn pending(&self) -> usize;
}

// Heap entry ordered so that `BinaryHeap` (a max-heap) pops the earliest
// deadline first; `seq` breaks ties in scheduling order.
struct Entry<T> {
    deadline: T,
    seq: u64,
    task: Task,
}

impl<T: Ord> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl<T: Ord> Eq for Entry<T> {}

impl<T: Ord> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: Ord> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

fn run_task(task: Task) {
    if catch_unwind(AssertUnwindSafe(task)).is_err() {
        log::error!("scheduled task panicked; timer keeps running");
    }
}

struct TimerState {
    queue: BinaryHeap<Entry<Instant>>,
    seq: u64,
    shutdown: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    cond: Condvar,
}

/// Dedicated timer thread. Dropping it stops the thread and discards
/// whatever is still queued.
pub struct TimerThread {
    shared: Arc<TimerShared>,
    thread_id: ThreadId,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimerThread {
    /// Spawn a timer thread with the given name.
    pub fn spawn(name: &str) -> Result<Self> {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                queue: BinaryHeap::new(),
                seq: 0,
                shutdown: false,
            }),
            cond: Condvar::new(),
        });
        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || Self::run(worker))?;
        log::debug!("timer thread {:?} started", name);
        Ok(Self {
            shared,
            thread_id: handle.thread().id(),
            handle: Mutex::new(Some(handle)),
        })
    }

    fn run(shared: Arc<TimerShared>) {
        let mut state = shared.state.lock();
        loop {
            if state.shutdown {
                break;
            }
            let now = Instant::now();
            match state.queue.peek().map(|e| e.deadline) {
                Some(deadline) if deadline <= now => {
                    if let Some(entry) = state.queue.pop() {
                        MutexGuard::unlocked(&mut state, || run_task(entry.task));
                    }
                }
                Some(deadline) => {
                    shared.cond.wait_until(&mut state, deadline);
                }
                None => shared.cond.wait(&mut state),
            }
        }
        let dropped = state.queue.len();
        state.queue.clear();
        log::debug!("timer thread stopped, {} pending task(s) discarded", dropped);
    }
}

impl Schedule for TimerThread {
    fn schedule(&self, delay: Duration, task: Task) {
        let Some(deadline) = Instant::now().checked_add(delay) else {
            log::debug!("delay {:?} out of clock range, task dropped", delay);
            return;
        };
        let mut state = self.shared.state.lock();
        let seq = state.seq;
        state.seq += 1;
        let wake = state
            .queue
            .peek()
            .map_or(true, |head| deadline < head.deadline);
        state.queue.push(Entry {
            deadline,
            seq,
            task,
        });
        drop(state);
        if wake {
            self.shared.cond.notify_one();
        }
    }

    fn pending(&self) -> usize {
        self.shared.state.lock().queue.len()
    }
}

impl Drop for TimerThread {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.cond.notify_all();
        // The last map handle can be released from inside a decay; never join ourselves.
        if thread::current().id() == self.thread_id {
            return;
        }
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                log::error!("timer thread panicked");
            }
        }
    }
}

struct ManualState {
    now: Duration,
    seq: u64,
    queue: BinaryHeap<Entry<Duration>>,
}

/// Virtual-time scheduler. Nothing fires until [`ManualScheduler::advance`]
/// is called, and then due tasks run on the caller's thread.
pub struct ManualScheduler {
    state: Mutex<ManualState>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ManualState {
                now: Duration::ZERO,
                seq: 0,
                queue: BinaryHeap::new(),
            }),
        }
    }

    /// Virtual time elapsed since construction.
    pub fn now(&self) -> Duration {
        self.state.lock().now
    }

    /// Move the clock forward by `by`, running every task that falls due in
    /// deadline order (including tasks scheduled by those tasks). Returns
    /// the number of tasks run.
    pub fn advance(&self, by: Duration) -> usize {
        let mut state = self.state.lock();
        let target = state.now.saturating_add(by);
        let mut fired = 0;
        loop {
            let due = state.queue.peek().map_or(false, |e| e.deadline <= target);
            if !due {
                break;
            }
            let Some(entry) = state.queue.pop() else {
                break;
            };
            state.now = entry.deadline;
            MutexGuard::unlocked(&mut state, || run_task(entry.task));
            fired += 1;
        }
        state.now = target;
        fired
    }
}

impl Default for ManualScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Schedule for ManualScheduler {
    fn schedule(&self, delay: Duration, task: Task) {
        let mut state = self.state.lock();
        let Some(deadline) = state.now.checked_add(delay) else {
            log::debug!("delay {:?} out of clock range, task dropped", delay);
            return;
        };
        let seq = state.seq;
        state.seq += 1;
        state.queue.push(Entry {
            deadline,
            seq,
            task,
        });
    }

    fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }
}
