/*!
 * Linear Lockable Pool Tests
 */

use msgport::core::memory::LinearPool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

#[test]
fn test_waiter_sees_entry_removed_under_lock() {
    let pool = Arc::new(LinearPool::new(2));
    pool.set(1, String::from("client")).unwrap();

    let guard = pool.lock_entry(1).unwrap();
    let started = Arc::new(Barrier::new(2));
    let got_entry = Arc::new(AtomicBool::new(true));

    let waiter = {
        let pool = pool.clone();
        let started = started.clone();
        let got_entry = got_entry.clone();
        thread::spawn(move || {
            started.wait();
            got_entry.store(pool.lock_entry(1).is_some(), Ordering::SeqCst);
        })
    };

    started.wait();
    thread::sleep(Duration::from_millis(50));
    assert_eq!(guard.remove(), "client");

    waiter.join().unwrap();
    assert!(!got_entry.load(Ordering::SeqCst));
    assert!(!pool.is_active(1));
}

#[test]
fn test_entries_lock_independently() {
    let pool = Arc::new(LinearPool::new(2));
    pool.set(0, 0u32).unwrap();
    pool.set(1, 0u32).unwrap();

    let _held = pool.lock_entry(0).unwrap();
    let other = {
        let pool = pool.clone();
        thread::spawn(move || pool.with_entry(1, |v| *v += 1))
    };
    assert_eq!(other.join().unwrap(), Some(()));
    assert!(pool.try_lock_entry(0).is_none());
    assert_eq!(*pool.lock_entry(1).unwrap(), 1);
}

#[test]
fn test_concurrent_insert_and_remove() {
    let pool = Arc::new(LinearPool::new(8));
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let pool = pool.clone();
            thread::spawn(move || {
                for i in 0..200 {
                    if let Ok(index) = pool.insert(t * 1000 + i) {
                        assert_eq!(pool.remove(index), Some(t * 1000 + i));
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    assert!(pool.is_empty());
}

#[test]
fn test_set_rejects_occupied_and_out_of_range() {
    let pool = LinearPool::new(1);
    pool.set(0, 'a').unwrap();
    assert!(pool.set(0, 'b').is_err());
    assert!(pool.set(5, 'c').is_err());
    assert_eq!(pool.find_free(), None);
    assert_eq!(pool.active_indices(), vec![0]);
}
