// SPDX-License-Identifier: Apache-2.0

//! The shared memory region: a fixed-size, `align`-aligned byte buffer plus
//! the lock table and global clock that make it transactable, and a
//! dynamically growing list of additional allocated segments.

use std::alloc::{self, Layout};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use log::{debug, warn};

use crate::clock::GlobalVersionedClock;
use crate::config::DEFAULT_LOCK_TABLE_SIZE;
use crate::error::{AllocError, BeginError, CreateError};
use crate::lock_table::LockTable;
use crate::transaction::Transaction;

/// One dynamically allocated, `align`-aligned block of memory, tracked so it
/// can be freed when the owning [`Region`] is torn down. Freeing is always
/// deferred to region teardown: the transactional-free problem (knowing when
/// a freed segment becomes unreachable by every in-flight transaction) is
/// explicitly out of scope.
struct Segment {
    ptr: *mut u8,
    layout: Layout,
}

// SAFETY: a Segment only exposes its payload through Region methods that are
// themselves synchronized (the segment list mutex for bookkeeping, VWSLs for
// the payload bytes); the raw pointer itself carries no thread affinity.
unsafe impl Send for Segment {}

/// A shared, word-addressable memory region. Transactions are opened against
/// a `Region` with [`Region::begin`] and drive their reads/writes through the
/// returned [`Transaction`].
pub struct Region {
    /// Backing memory for the region's first (non-freeable) segment.
    start: *mut u8,
    start_layout: Layout,

    size: usize,
    align: usize,

    clock: GlobalVersionedClock,
    lock_table: LockTable,

    segments: Mutex<Vec<Segment>>,
    live_transactions: AtomicUsize,
}

// SAFETY: all mutation of the shared payload bytes happens under a VWSL from
// `lock_table`, and all mutation of `segments` happens under its mutex.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Creates a new region with one first, non-freeable segment of `size`
    /// bytes, `align`-aligned. `size` must be a positive multiple of `align`,
    /// and `align` must be a power of two.
    pub fn create(size: usize, align: usize) -> Result<Self, CreateError> {
        Self::with_lock_table_size(size, align, DEFAULT_LOCK_TABLE_SIZE)
    }

    /// As [`Self::create`], but with an explicit lock-table size. Exposed so
    /// tests can force VWSL collisions deterministically; production callers
    /// should use [`Self::create`].
    pub fn with_lock_table_size(size: usize, align: usize, lock_table_size: usize) -> Result<Self, CreateError> {
        if align == 0 || !align.is_power_of_two() {
            return Err(CreateError::InvalidAlign);
        }
        if size == 0 || size % align != 0 {
            return Err(CreateError::InvalidSize);
        }

        let layout = Layout::from_size_align(size, align).map_err(|_| CreateError::Alloc)?;
        // SAFETY: layout has a non-zero size, checked above.
        let start = unsafe { alloc::alloc_zeroed(layout) };
        if start.is_null() {
            warn!("Region::create: allocation of {size} bytes (align {align}) failed");
            return Err(CreateError::Alloc);
        }

        debug!("Region::create: allocated region of {size} bytes, align {align}");

        Ok(Self {
            start,
            start_layout: layout,
            size,
            align,
            clock: GlobalVersionedClock::new(),
            lock_table: LockTable::new(lock_table_size),
            segments: Mutex::new(Vec::new()),
            live_transactions: AtomicUsize::new(0),
        })
    }

    /// Address of the first byte of the region's first segment.
    pub fn start(&self) -> usize {
        self.start as usize
    }

    /// Size in bytes of the region's first segment.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Alignment, in bytes, that every read/write/alloc on this region must honor.
    pub fn align(&self) -> usize {
        self.align
    }

    pub(crate) fn clock(&self) -> &GlobalVersionedClock {
        &self.clock
    }

    pub(crate) fn lock_table(&self) -> &LockTable {
        &self.lock_table
    }

    /// Returns the VWSL that `addr` is mapped to. This bypasses the
    /// transaction protocol entirely and exists so tests can force external
    /// contention on a specific word deterministically (see the bounded
    /// retry scenario in the integration tests); production code should
    /// always go through a [`Transaction`].
    pub fn lock_for(&self, addr: usize) -> &crate::vwsl::VersionedWriteSpinlock {
        self.lock_table.lock_for(addr)
    }

    /// Begins a new transaction against this region.
    pub fn begin(&self, is_read_only: bool) -> Result<Transaction<'_>, BeginError> {
        self.live_transactions.fetch_add(1, Ordering::SeqCst);
        Ok(Transaction::new(self, is_read_only))
    }

    pub(crate) fn transaction_ended(&self) {
        self.live_transactions.fetch_sub(1, Ordering::SeqCst);
    }

    /// Allocates a new `align`-aligned segment of `size` bytes, zero-filled,
    /// and returns its start address. The segment is freed only when the
    /// region itself is dropped.
    pub fn alloc(&self, size: usize) -> Result<usize, AllocError> {
        if size == 0 || size % self.align != 0 {
            return Err(AllocError::InvalidSize);
        }

        let layout = Layout::from_size_align(size, self.align).map_err(|_| AllocError::NoMem)?;
        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            warn!("Region::alloc: allocation of {size} bytes failed");
            return Err(AllocError::NoMem);
        }

        let addr = ptr as usize;
        self.segments.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).push(Segment { ptr, layout });
        debug!("Region::alloc: new segment at {addr:#x}, {size} bytes");

        Ok(addr)
    }

    /// Deferred no-op: segments are only released on [`Drop`].
    pub fn free(&self, _addr: usize) -> bool {
        true
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.live_transactions.load(Ordering::SeqCst),
            0,
            "Region dropped while transactions were still running"
        );

        let segments = self.segments.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
        for segment in segments.drain(..) {
            // SAFETY: each Segment's (ptr, layout) pair came from a matching
            // alloc_zeroed call in `alloc` and is freed exactly once here.
            unsafe { alloc::dealloc(segment.ptr, segment.layout) };
        }

        // SAFETY: `start`/`start_layout` came from the matching alloc_zeroed
        // call in `create` and are freed exactly once here.
        unsafe { alloc::dealloc(self.start, self.start_layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_rejects_bad_size_and_align() {
        assert!(matches!(Region::create(8, 3), Err(CreateError::InvalidAlign)));
        assert!(matches!(Region::create(7, 8), Err(CreateError::InvalidSize)));
    }

    #[test]
    fn create_zeroes_the_region() {
        let region = Region::create(64, 8).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(region.start() as *const u8, region.size()) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn alloc_returns_distinct_zeroed_segments() {
        let region = Region::create(8, 8).unwrap();
        let a = region.alloc(16).unwrap();
        let b = region.alloc(16).unwrap();
        assert_ne!(a, b);

        let bytes = unsafe { std::slice::from_raw_parts(a as *const u8, 16) };
        assert!(bytes.iter().all(|&b| b == 0));
    }
}
