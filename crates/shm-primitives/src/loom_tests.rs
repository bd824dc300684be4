#![cfg(all(test, feature = "loom"))]

use crate::fifo::{AcquireMode, FifoCursor, FifoQueue, SlotFlag};
use crate::region::HeapRegion;
use crate::spinlock::SpinLock;
use crate::sync::{AtomicU32, Ordering, thread};
use alloc::vec::Vec;
use loom::sync::Arc;

// Loom atomics are larger than their core counterparts, so keep slots well
// clear of the header.
const SLOTS_AT: usize = 1024;
const ELEM: u32 = 64;

fn queue(owner: &HeapRegion, cnt: u32, mode: AcquireMode) -> FifoQueue {
    unsafe { FifoQueue::init(owner.region(), 0, SLOTS_AT, cnt, ELEM, mode) }
}

fn no_double_acquire(mode: AcquireMode) {
    loom::model(move || {
        let owner = Arc::new(HeapRegion::new_zeroed(4096));
        let q = queue(&owner, 2, mode);

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let owner = owner.clone();
                thread::spawn(move || {
                    let _keep = owner;
                    q.try_acquire()
                })
            })
            .collect();

        let mut got: Vec<u32> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        got.sort();
        assert_eq!(got, alloc::vec![0, 1]);
        assert_eq!(q.slot_flag(0), SlotFlag::Used);
        assert_eq!(q.slot_flag(1), SlotFlag::Used);
    });
}

#[test]
fn fifo_cas_no_double_acquire() {
    no_double_acquire(AcquireMode::Cas);
}

#[test]
fn fifo_spinlock_no_double_acquire() {
    no_double_acquire(AcquireMode::SpinLock);
}

#[test]
fn fifo_full_queue_rejects() {
    loom::model(|| {
        let owner = Arc::new(HeapRegion::new_zeroed(4096));
        let q = queue(&owner, 1, AcquireMode::Cas);

        let t = {
            let owner = owner.clone();
            thread::spawn(move || {
                let _keep = owner;
                q.try_acquire()
            })
        };
        let mine = q.try_acquire();
        let theirs = t.join().unwrap();
        assert!(mine.is_some() ^ theirs.is_some());
    });
}

#[test]
fn fifo_producer_consumer_handoff() {
    loom::model(|| {
        let owner = Arc::new(HeapRegion::new_zeroed(4096));
        let q = queue(&owner, 2, AcquireMode::Cas);

        let producer = {
            let owner = owner.clone();
            thread::spawn(move || {
                let _keep = owner;
                for _ in 0..2 {
                    let idx = loop {
                        match q.try_acquire() {
                            Some(idx) => break idx,
                            None => thread::yield_now(),
                        }
                    };
                    q.mark_ready(idx);
                }
            })
        };

        let mut cursor = FifoCursor::new();
        let mut consumed = 0;
        while consumed < 2 {
            if cursor.peek(&q).is_some() {
                cursor.advance(&q);
                consumed += 1;
            } else {
                thread::yield_now();
            }
        }
        producer.join().unwrap();
        assert_eq!(q.slot_flag(0), SlotFlag::Free);
        assert_eq!(q.slot_flag(1), SlotFlag::Free);
    });
}

#[test]
fn spinlock_mutual_exclusion() {
    loom::model(|| {
        let word = Arc::new(AtomicU32::new(0));
        let inside = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let word = word.clone();
                let inside = inside.clone();
                thread::spawn(move || {
                    let _guard = SpinLock::new(&word).lock();
                    assert_eq!(inside.fetch_add(1, Ordering::Relaxed), 0);
                    inside.fetch_sub(1, Ordering::Relaxed);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    });
}
