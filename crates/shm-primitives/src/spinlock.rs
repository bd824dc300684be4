use crate::sync::{AtomicU32, Ordering, spin_loop};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// A spinlock over a single `u32` word that may live in shared memory.
///
/// The word must start out zeroed. Critical sections are a handful of
/// instructions, so contenders spin rather than sleep.
pub struct SpinLock<'a> {
    word: &'a AtomicU32,
}

impl<'a> SpinLock<'a> {
    #[inline]
    pub fn new(word: &'a AtomicU32) -> Self {
        Self { word }
    }

    /// Spin until the lock is held.
    pub fn lock(&self) -> SpinLockGuard<'a> {
        loop {
            if self.try_lock_inner() {
                return SpinLockGuard { word: self.word };
            }
            while self.word.load(Ordering::Relaxed) != UNLOCKED {
                spin_loop();
            }
        }
    }

    /// Take the lock if it is free right now.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'a>> {
        if self.try_lock_inner() {
            Some(SpinLockGuard { word: self.word })
        } else {
            None
        }
    }

    #[inline]
    fn try_lock_inner(&self) -> bool {
        self.word
            .compare_exchange(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }
}

/// Releases the lock on drop.
pub struct SpinLockGuard<'a> {
    word: &'a AtomicU32,
}

impl Drop for SpinLockGuard<'_> {
    fn drop(&mut self) {
        self.word.store(UNLOCKED, Ordering::Release);
    }
}
