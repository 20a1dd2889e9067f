// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Per-process virtual address reservation. Each process reserves one
// contiguous range at startup, `PROT_NONE`, so every segment has a fixed
// slot `V_base + i * S` for the lifetime of the process — whether or not
// that segment is currently backed by a shared-memory object. Touching an
// unbacked slot raises SIGSEGV/SIGBUS, caught by the fault handler.

use std::io;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

pub struct VirtualReservation {
    base: usize,
    seg_size: u64,
    count: u32,
}

unsafe impl Send for VirtualReservation {}
unsafe impl Sync for VirtualReservation {}

impl VirtualReservation {
    /// Reserve `count * seg_size` bytes of address space, backed by
    /// nothing (`PROT_NONE`). The kernel picks the base address.
    pub fn reserve(count: u32, seg_size: u64) -> io::Result<Self> {
        let total = count as usize * seg_size as usize;
        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if mem == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            base: mem as usize,
            seg_size,
            count,
        })
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn seg_size(&self) -> u64 {
        self.seg_size
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn segment_addr(&self, id: u32) -> *mut u8 {
        (self.base + id as usize * self.seg_size as usize) as *mut u8
    }

    /// Classify an address: `Some(segment_id)` if it lies within the
    /// reservation, `None` otherwise (the fault handler chains to the
    /// previously installed handler in that case).
    pub fn segment_id_of(&self, addr: usize) -> Option<u32> {
        let end = self.base + self.count as usize * self.seg_size as usize;
        if addr < self.base || addr >= end {
            return None;
        }
        Some(((addr - self.base) / self.seg_size as usize) as u32)
    }
}

impl Drop for VirtualReservation {
    fn drop(&mut self) {
        let total = self.count as usize * self.seg_size as usize;
        unsafe { libc::munmap(self.base as *mut libc::c_void, total) };
    }
}

/// This process's view of a single segment: whether it currently has the
/// backing object mapped at that segment's fixed slot, and at which
/// revision. Touched by both ordinary allocator code and the signal
/// handler, hence plain atomics rather than a mutex.
pub struct LocalMapEntry {
    pub is_attached: AtomicBool,
    pub revision: AtomicU32,
}

impl LocalMapEntry {
    fn new() -> Self {
        Self {
            is_attached: AtomicBool::new(false),
            revision: AtomicU32::new(0),
        }
    }
}

pub struct LocalMap {
    entries: Vec<LocalMapEntry>,
}

impl LocalMap {
    pub fn new(count: u32) -> Self {
        Self {
            entries: (0..count).map(|_| LocalMapEntry::new()).collect(),
        }
    }

    pub fn entry(&self, id: u32) -> &LocalMapEntry {
        &self.entries[id as usize]
    }

    pub fn is_attached(&self, id: u32) -> bool {
        self.entry(id).is_attached.load(Ordering::Acquire)
    }

    pub fn mark_attached(&self, id: u32, revision: u32) {
        let e = self.entry(id);
        e.revision.store(revision, Ordering::Release);
        e.is_attached.store(true, Ordering::Release);
    }

    pub fn mark_detached(&self, id: u32) {
        self.entry(id).is_attached.store(false, Ordering::Release);
    }
}
