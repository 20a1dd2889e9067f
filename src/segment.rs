// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Segment descriptor: one fixed-size shared-memory object's bookkeeping.
// Descriptors themselves live in the SegmentTable's shared control block;
// `revision` parity is the sole source of truth for whether the backing
// object currently exists.

use crate::chunk::{MAX_CLASS, MIN_CLASS, NULL_OFFSET};
use crate::spin_lock::SpinLock;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

pub const NULL_INDEX: u32 = u32::MAX;

/// Per-segment descriptor. POD and `repr(C)` so it can live in a shared
/// memory region accessed identically by every process in the group.
#[repr(C)]
pub struct Segment {
    pub segment_id: u32,
    /// Non-zero for the first `min_dma_segment_nums` descriptors: never
    /// destroyed when their chunk count reaches zero.
    pub persistent: u32,
    /// Odd: backing shm object exists. Even: absent.
    pub revision: AtomicU32,
    /// Guards `num_chunks` and `free_chunks` for this segment.
    pub lock: SpinLock,
    pub num_chunks: AtomicU32,
    pub list_prev: AtomicU32,
    pub list_next: AtomicU32,
    pub free_chunks: [AtomicU64; Segment::NUM_CLASSES],
}

impl Segment {
    pub const NUM_CLASSES: usize = (MAX_CLASS - MIN_CLASS + 1) as usize;

    fn class_index(m: u32) -> usize {
        debug_assert!((MIN_CLASS..=MAX_CLASS).contains(&m));
        (m - MIN_CLASS) as usize
    }

    /// Initialise a freshly zeroed descriptor slot. Called once at table
    /// creation time, never again (the slot is reused across many
    /// create/destroy cycles of its backing object).
    pub fn init_in_place(&mut self, segment_id: u32, persistent: bool) {
        self.segment_id = segment_id;
        self.persistent = persistent as u32;
        self.revision = AtomicU32::new(0);
        self.lock = SpinLock::new();
        self.num_chunks = AtomicU32::new(0);
        self.list_prev = AtomicU32::new(NULL_INDEX);
        self.list_next = AtomicU32::new(NULL_INDEX);
        self.free_chunks = std::array::from_fn(|_| AtomicU64::new(NULL_OFFSET));
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent != 0
    }

    /// True iff the backing shm object currently exists.
    pub fn is_attached_anywhere(&self) -> bool {
        self.revision.load(Ordering::Acquire) % 2 == 1
    }

    pub fn free_head(&self, m: u32) -> u64 {
        self.free_chunks[Self::class_index(m)].load(Ordering::Acquire)
    }

    pub fn set_free_head(&self, m: u32, offset: u64) {
        self.free_chunks[Self::class_index(m)].store(offset, Ordering::Release);
    }

    /// Clear every free-list head and the chunk count, in preparation for
    /// reformatting by the buddy allocator after (re)attachment.
    pub fn reset_lists(&self) {
        for c in &self.free_chunks {
            c.store(NULL_OFFSET, Ordering::Release);
        }
        self.num_chunks.store(0, Ordering::Release);
    }
}
