// SPDX-License-Identifier: Apache-2.0

//! Build-time constants that tune the engine without affecting correctness.

/// Default size of a [`crate::LockTable`](crate::lock_table::LockTable), i.e. the number of
/// versioned write spinlocks a region's address space is hashed onto.
///
/// Sized large enough that two distinct hot words rarely collide, while staying
/// small enough to allocate eagerly on region creation.
pub const DEFAULT_LOCK_TABLE_SIZE: usize = 1 << 16;

/// Maximum number of `try_lock` attempts the commit path makes per write-set entry
/// before giving up and aborting. Bounds livelock under pathological contention.
pub const MAX_LOCK_ATTEMPTS: usize = 300;

/// Number of linear-backoff units spun between failed lock attempts. Attempt `n`
/// spins `n * BACKOFF_UNIT_SPINS` times, capped at `MAX_LOCK_ATTEMPTS`.
pub const BACKOFF_UNIT_SPINS: usize = 32;
