// Concurrency: many threads hammering one map.
//
// Verifies that no increment is lost under contention on one key, that
// different keys do not interfere, and that everything settles back to
// an empty map once all decays have fired.
use expiring_hash_counter::{CounterMap, ManualScheduler};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

const THREADS: usize = 8;
const PER_THREAD: usize = 500;

fn wait_until_empty(m: &CounterMap<String>, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if m.is_empty() && m.pending_decays() == 0 {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn same_key_never_loses_increments() {
    let s = Arc::new(ManualScheduler::new());
    let m: CounterMap<String> = CounterMap::with_scheduler(Duration::from_secs(1), s.clone()).unwrap();
    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let m = m.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..PER_THREAD {
                    m.increment("hot".to_string());
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    let total = (THREADS * PER_THREAD) as i64;
    assert_eq!(m.get("hot"), Some(total));
    assert_eq!(m.len(), 1);
    assert_eq!(m.pending_decays(), THREADS * PER_THREAD);

    s.advance(Duration::from_secs(1));
    assert!(m.is_empty());
    assert_eq!(m.pending_decays(), 0);
}

// Every round starts with an absent key, so all threads race on the
// create path at once; none of their increments may go missing.
#[test]
fn racing_creators_keep_every_increment() {
    let s = Arc::new(ManualScheduler::new());
    let m: CounterMap<String> = CounterMap::with_scheduler(Duration::from_millis(1), s.clone()).unwrap();
    for round in 0..50 {
        let barrier = Arc::new(Barrier::new(THREADS));
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let m = m.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    m.increment_by(format!("r{}", round), t as i64 + 1);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let want = (THREADS * (THREADS + 1) / 2) as i64;
        assert_eq!(m.get(&format!("r{}", round)), Some(want));
        assert_eq!(m.len(), 1);
        s.advance(Duration::from_millis(1));
        assert!(m.is_empty());
    }
}

#[test]
fn different_keys_are_independent() {
    let s = Arc::new(ManualScheduler::new());
    let m: CounterMap<String> = CounterMap::with_scheduler(Duration::from_secs(1), s.clone()).unwrap();
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let m = m.clone();
            thread::spawn(move || {
                for _ in 0..PER_THREAD {
                    m.increment_by(format!("k{}", t), t as i64 + 1);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    let snap = m.snapshot().to_map();
    assert_eq!(snap.len(), THREADS);
    for t in 0..THREADS {
        assert_eq!(snap[&format!("k{}", t)], (t as i64 + 1) * PER_THREAD as i64);
    }
}

// Increments race real decays and removals on the timer thread; after the
// writers stop, every key must settle to absent.
#[test]
fn racing_decays_settle_to_empty() {
    let m: CounterMap<String> = CounterMap::new(Duration::from_millis(2)).unwrap();
    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let m = m.clone();
            thread::spawn(move || {
                for i in 0..PER_THREAD {
                    m.increment(format!("k{}", (i + t) % 4));
                    if i % 50 == 0 {
                        thread::sleep(Duration::from_millis(1));
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert!(
        wait_until_empty(&m, Duration::from_secs(10)),
        "map did not settle: {:?}",
        m.snapshot().to_map()
    );
}

#[test]
fn readers_see_consistent_key_sets() {
    let m: CounterMap<String> = CounterMap::new(Duration::from_millis(1)).unwrap();
    let writer = {
        let m = m.clone();
        thread::spawn(move || {
            for i in 0..2_000 {
                m.increment(format!("k{}", i % 16));
            }
        })
    };
    for _ in 0..200 {
        let snap = m.snapshot();
        let len = snap.len();
        assert_eq!(snap.iter().count(), len);
        assert!(len <= 16);
    }
    writer.join().unwrap();
    assert!(wait_until_empty(&m, Duration::from_secs(10)));
}
