// SPDX-License-Identifier: Apache-2.0

//! The transaction engine: begin, speculative read/write, and the two-phase
//! commit protocol (lock write set → bump clock → validate read set →
//! publish + release).

use std::cell::Cell;
use std::marker::PhantomData;

use log::{debug, trace, warn};

use crate::config::{BACKOFF_UNIT_SPINS, MAX_LOCK_ATTEMPTS};
use crate::error::AllocError;
use crate::region::Region;
use crate::sets::{ReadSet, WriteSet};
use crate::vwsl::VersionedWriteSpinlock;

/// A single transaction against a [`Region`]. Created by [`Region::begin`],
/// driven through [`Self::read`]/[`Self::write`], and finished with
/// [`Self::end`]. A transaction belongs to a single thread for its whole
/// lifetime: it is `Send` (so it can be constructed and handed to the thread
/// that will drive it) but is never `Sync` — it is never meant to be shared
/// behind `&Transaction` from two threads at once. The `PhantomData<Cell<()>>`
/// marker below is what makes that a compiler-enforced property rather than a
/// doc comment.
pub struct Transaction<'r> {
    region: &'r Region,
    is_read_only: bool,
    rv: usize,
    read_set: ReadSet,
    write_set: WriteSet,
    aborted: bool,
    _not_sync: PhantomData<Cell<()>>,
}

static_assertions::assert_not_impl_any!(Transaction<'static>: Sync);

impl<'r> Transaction<'r> {
    pub(crate) fn new(region: &'r Region, is_read_only: bool) -> Self {
        Self {
            region,
            is_read_only,
            rv: region.clock().load(),
            read_set: ReadSet::new(),
            write_set: WriteSet::new(),
            aborted: false,
            _not_sync: PhantomData,
        }
    }

    /// The sampled read-version this transaction is validated against.
    pub fn read_version(&self) -> usize {
        self.rv
    }

    pub fn is_read_only(&self) -> bool {
        self.is_read_only
    }

    fn abort(&mut self, reason: &str) -> bool {
        self.aborted = true;
        warn!("transaction aborted: {reason}");
        false
    }

    /// Reads `dst.len()` bytes (a positive multiple of the region's
    /// alignment) from `src` (aligned, inside the region) into `dst`.
    /// Returns `false` if the transaction aborted, in which case it must be
    /// dropped and retried by the caller.
    pub fn read(&mut self, src: usize, dst: &mut [u8]) -> bool {
        if self.aborted {
            return false;
        }

        let word_size = self.region.align();
        debug_assert!(!dst.is_empty() && dst.len() % word_size == 0);
        debug_assert_eq!(src % word_size, 0);

        let lock_table = self.region.lock_table();

        for offset in (0..dst.len()).step_by(word_size) {
            let word_addr = src + offset;
            let dst_word = &mut dst[offset..offset + word_size];

            if !self.is_read_only {
                if let Some(buffered) = self.write_set.lookup(word_addr) {
                    dst_word.copy_from_slice(buffered);
                    continue;
                }
            }

            let vwsl = lock_table.lock_for(word_addr);
            let (locked_before, version_before) = vwsl.snapshot();
            if locked_before || version_before > self.rv {
                return self.abort("word locked or stale on pre-check");
            }

            // SAFETY: word_addr names a word-aligned location inside the
            // region's backing allocation (caller contract); the publish
            // phase of commit is the only writer, and it only runs while
            // holding this word's VWSL, which we just observed unlocked.
            let word = unsafe { std::slice::from_raw_parts(word_addr as *const u8, word_size) };
            dst_word.copy_from_slice(word);

            let (locked_after, version_after) = vwsl.snapshot();
            if locked_after || version_after != version_before {
                return self.abort("word locked or changed on post-check");
            }

            if !self.is_read_only {
                self.read_set.upsert(word_addr);
            }
        }

        true
    }

    /// Buffers a write of `src` into the write set, to be published at
    /// `dst` (aligned, inside the region) on a successful commit. No shared
    /// memory is touched and no lock is taken here.
    pub fn write(&mut self, src: &[u8], dst: usize) -> bool {
        if self.aborted {
            return false;
        }

        let word_size = self.region.align();
        debug_assert!(!src.is_empty() && src.len() % word_size == 0);
        debug_assert_eq!(dst % word_size, 0);

        for offset in (0..src.len()).step_by(word_size) {
            let word_addr = dst + offset;
            self.write_set.upsert(word_addr, &src[offset..offset + word_size]);
        }

        true
    }

    /// Allocates a new segment in the owning region. See [`Region::alloc`].
    pub fn alloc(&self, size: usize) -> Result<usize, AllocError> {
        self.region.alloc(size)
    }

    /// Deferred no-op; see [`Region::free`].
    pub fn free(&self, addr: usize) -> bool {
        self.region.free(addr)
    }

    /// Ends the transaction, consuming it. Returns `true` if it committed,
    /// `false` if it aborted. Always drops the transaction's internal state.
    pub fn end(mut self) -> bool {
        if self.aborted {
            return false;
        }

        if self.is_read_only || self.write_set.is_empty() {
            trace!("end: trivial commit (read-only or empty write set)");
            return true;
        }

        self.commit()
    }

    fn commit(&mut self) -> bool {
        let lock_table = self.region.lock_table();

        let mut acquired: Vec<&VersionedWriteSpinlock> = Vec::new();
        for (addr, _) in self.write_set.iter() {
            let vwsl = lock_table.lock_for(addr);

            // A transaction's own writes may collide on the same VWSL; treat
            // a lock we already hold as already acquired rather than retrying it.
            if acquired.iter().any(|held| std::ptr::eq(*held, vwsl)) {
                continue;
            }

            if !try_lock_bounded(vwsl) {
                release_all(&acquired);
                warn!("commit: could not acquire write-set lock within the retry bound, aborting");
                return false;
            }
            acquired.push(vwsl);
        }

        let wv = self.region.clock().fetch_add_one_and_get();

        if wv != self.rv + 1 {
            for addr in self.read_set.iter() {
                let vwsl = lock_table.lock_for(addr);
                let (locked, version) = vwsl.snapshot();
                let locked_by_other = locked && !acquired.iter().any(|held| std::ptr::eq(*held, vwsl));

                if locked_by_other || version > self.rv {
                    release_all(&acquired);
                    warn!("commit: read-set validation failed, aborting");
                    return false;
                }
            }
        } else {
            trace!("commit: wv == rv + 1, skipping read-set validation");
        }

        for (addr, value) in self.write_set.iter() {
            // SAFETY: addr is word-aligned and inside the region (caller
            // contract on `write`); its VWSL is held by this transaction,
            // per the acquire phase above, so no other transaction observes
            // this write mid-flight.
            unsafe {
                std::ptr::copy_nonoverlapping(value.as_ptr(), addr as *mut u8, value.len());
            }
        }
        for vwsl in &acquired {
            vwsl.set_version_and_unlock(wv);
        }

        debug!("commit: published at wv={wv}");
        true
    }
}

impl<'r> Drop for Transaction<'r> {
    fn drop(&mut self) {
        self.region.transaction_ended();
    }
}

fn try_lock_bounded(vwsl: &VersionedWriteSpinlock) -> bool {
    for attempt in 0..MAX_LOCK_ATTEMPTS {
        if vwsl.try_lock() {
            return true;
        }
        for _ in 0..(attempt * BACKOFF_UNIT_SPINS) {
            std::hint::spin_loop();
        }
    }
    false
}

fn release_all(acquired: &[&VersionedWriteSpinlock]) {
    for vwsl in acquired {
        vwsl.unlock_preserve_version();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::Region;

    #[test]
    fn write_then_read_sees_own_write() {
        let region = Region::create(8, 8).unwrap();
        let mut tx = region.begin(false).unwrap();

        assert!(tx.write(&22usize.to_ne_bytes(), region.start()));

        let mut buf = [0u8; 8];
        assert!(tx.read(region.start(), &mut buf));
        assert_eq!(usize::from_ne_bytes(buf), 22);

        assert!(tx.end());
    }

    #[test]
    fn committed_write_is_visible_to_later_transaction() {
        let region = Region::create(8, 8).unwrap();

        let mut writer = region.begin(false).unwrap();
        assert!(writer.write(&22usize.to_ne_bytes(), region.start()));
        assert!(writer.end());

        let mut reader = region.begin(true).unwrap();
        let mut buf = [0u8; 8];
        assert!(reader.read(region.start(), &mut buf));
        assert_eq!(usize::from_ne_bytes(buf), 22);
        assert!(reader.end());
    }

    #[test]
    fn empty_write_transaction_commits_trivially() {
        let region = Region::create(8, 8).unwrap();
        let tx = region.begin(false).unwrap();
        assert!(tx.end());
    }

    #[test]
    fn externally_held_lock_aborts_commit() {
        let region = Region::create(8, 8).unwrap();
        let vwsl = region.lock_table().lock_for(region.start());
        assert!(vwsl.try_lock());

        let mut tx = region.begin(false).unwrap();
        assert!(tx.write(&1usize.to_ne_bytes(), region.start()));
        assert!(!tx.end());

        vwsl.unlock_preserve_version();
    }

    #[test]
    fn gvc_fast_path_skips_revalidation_when_uncontended() {
        let region = Region::create(8, 8).unwrap();
        let rv_before = region.begin(false).unwrap().read_version();

        let mut tx = region.begin(false).unwrap();
        assert_eq!(tx.read_version(), rv_before);
        assert!(tx.write(&7usize.to_ne_bytes(), region.start()));
        assert!(tx.end());
        // wv assigned was rv + 1 here since nothing else committed meanwhile;
        // the read set (empty in this test) would have been skipped either way.
    }
}
