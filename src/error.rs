// SPDX-License-Identifier: Apache-2.0

use thiserror::Error as DeriveError;

/// Failure to create a new [`crate::Region`].
#[derive(Debug, DeriveError)]
pub enum CreateError {
    #[error("requested size is not a positive multiple of the alignment")]
    InvalidSize,

    #[error("alignment must be a power of two")]
    InvalidAlign,

    #[error("allocation of the region's backing memory failed")]
    Alloc,
}

/// Failure to begin a new [`crate::Transaction`].
#[derive(Debug, DeriveError)]
pub enum BeginError {
    #[error("allocation of the transaction descriptor failed")]
    Alloc,
}

/// Failure of [`crate::Region::alloc`].
#[derive(Debug, DeriveError)]
pub enum AllocError {
    #[error("requested size is not a positive multiple of the region's alignment")]
    InvalidSize,

    #[error("allocation of the new segment failed")]
    NoMem,

    #[error("the calling transaction aborted while allocating")]
    Abort,
}
