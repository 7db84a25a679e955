// SPDX-License-Identifier: Apache-2.0

//! The global versioned clock supplies commit timestamps and gives the total
//! order of committed write transactions.

use std::sync::atomic::{AtomicUsize, Ordering};

/// A single process-wide monotonic counter.
#[derive(Debug, Default)]
pub struct GlobalVersionedClock {
    clock: AtomicUsize,
}

impl GlobalVersionedClock {
    pub fn new() -> Self {
        Self {
            clock: AtomicUsize::new(0),
        }
    }

    /// Returns the current value.
    pub fn load(&self) -> usize {
        self.clock.load(Ordering::SeqCst)
    }

    /// Atomically adds one and returns the new value. This is the `wv` a
    /// committing write transaction is assigned.
    pub fn fetch_add_one_and_get(&self) -> usize {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }
}
