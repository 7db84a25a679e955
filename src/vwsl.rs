// SPDX-License-Identifier: Apache-2.0

//! Versioned write spinlock: a single atomic word combining a lock bit and a
//! monotonic version counter, as described by the TL2 paper.
//!
//! Bit 0 holds the lock flag; the remaining bits hold the version. Packing
//! both into one word lets a reader sample lock state and version together in
//! a single atomic load, which is what the commit protocol's pre/post
//! "sandwich" check relies on.

use std::sync::atomic::{AtomicUsize, Ordering};

const LOCK_BIT: usize = 1;

/// A single versioned write spinlock covering some (possibly many, via hashing)
/// shared-memory words.
#[derive(Debug)]
pub struct VersionedWriteSpinlock {
    word: AtomicUsize,
}

impl Default for VersionedWriteSpinlock {
    fn default() -> Self {
        Self::new(0)
    }
}

impl VersionedWriteSpinlock {
    /// Creates an unlocked spinlock starting at `version`.
    pub fn new(version: usize) -> Self {
        Self {
            word: AtomicUsize::new(version << 1),
        }
    }

    /// Attempts to acquire the lock with a single compare-and-swap. Never spins;
    /// bounded retry belongs to the caller.
    pub fn try_lock(&self) -> bool {
        let snapshot = self.word.load(Ordering::SeqCst);
        if snapshot & LOCK_BIT != 0 {
            return false;
        }

        self.word
            .compare_exchange(snapshot, snapshot | LOCK_BIT, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Clears the lock bit without touching the version. Caller must hold the lock.
    /// Used when a commit aborts after having locked the write set.
    pub fn unlock_preserve_version(&self) {
        self.word.fetch_and(!LOCK_BIT, Ordering::SeqCst);
    }

    /// Replaces the word with `new_version`, clearing the lock bit. Caller must
    /// hold the lock. This is the publish step of a successful commit.
    pub fn set_version_and_unlock(&self, new_version: usize) {
        self.word.store(new_version << 1, Ordering::SeqCst);
    }

    /// Loads the current `(locked, version)` pair in one atomic read.
    pub fn snapshot(&self) -> (bool, usize) {
        let n = self.word.load(Ordering::SeqCst);
        (n & LOCK_BIT != 0, n >> 1)
    }

    /// Convenience accessor over [`Self::snapshot`].
    pub fn is_locked(&self) -> bool {
        self.snapshot().0
    }

    /// Convenience accessor over [`Self::snapshot`].
    pub fn version(&self) -> usize {
        self.snapshot().1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use threadpool::ThreadPool;

    #[test]
    fn try_lock_then_release_bumps_version() {
        let lock = VersionedWriteSpinlock::default();

        let runs = rand::thread_rng().gen_range(1..0xFFF);
        for v in 0..runs {
            assert!(lock.try_lock());
            assert!(lock.is_locked());
            lock.set_version_and_unlock(v + 1);
            assert!(!lock.is_locked());
        }

        assert_eq!(lock.version(), runs);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = VersionedWriteSpinlock::default();
        assert!(lock.try_lock());
        assert!(!lock.try_lock());
        lock.unlock_preserve_version();
        assert_eq!(lock.version(), 0);
        assert!(lock.try_lock());
    }

    #[test]
    fn concurrent_try_lock_is_mutually_exclusive() {
        use std::sync::Arc;

        let lock = Arc::new(VersionedWriteSpinlock::default());
        let pool = ThreadPool::new(8);
        let attempts = 2000;

        for _ in 0..attempts {
            let lock = lock.clone();
            pool.execute(move || {
                loop {
                    if lock.try_lock() {
                        break;
                    }
                    std::hint::spin_loop();
                }
                let v = lock.version();
                lock.set_version_and_unlock(v + 1);
            });
        }

        pool.join();
        assert_eq!(lock.version(), attempts);
    }
}
