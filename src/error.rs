// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Error taxonomy for the DMA pool allocator. A single enum covers every
// fallible public operation so callers can match on kind instead of
// string-sniffing.

use std::io;

/// Errors returned by pool allocator operations.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// A pointer failed validation (bad magic, dangling segment, wrong owner state).
    #[error("corrupted pointer: {0}")]
    Corrupted(&'static str),

    /// The requested size exceeds what a single segment can hold.
    #[error("requested size {requested} exceeds max alloc size {max}")]
    TooLarge { requested: usize, max: usize },

    /// No inactive segment descriptor was available to satisfy a miss.
    #[error("no free segment descriptors available")]
    OutOfSegments,

    /// An OS call (mmap/munmap/shm_open/ftruncate) failed.
    #[error("os failure: {0}")]
    OsFailure(#[from] io::Error),

    /// `mmap`/`munmap` failed in a way that leaves the address space
    /// inconsistent. The caller must treat this as unrecoverable.
    #[error("fatal os failure, address space may be inconsistent: {0}")]
    Fatal(io::Error),

    /// The device-binding collaborator failed to pin or unpin a segment.
    #[error("device pin failure: {0}")]
    PinFailure(io::Error),

    /// A `PoolConfig` value was invalid at startup.
    #[error("invalid configuration: {0}")]
    Config(&'static str),
}

pub type PoolResult<T> = Result<T, PoolError>;
