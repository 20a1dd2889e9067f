// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Shared control block: a reader-writer lock (`mutex`) guarding a fixed
// array of Segment descriptors plus two intrusive, index-linked lists
// (active / inactive). Readers (the allocation fast path) hold the lock
// shared and only contend on a segment's own spinlock; writers
// (create/destroy) hold it exclusive. Shared-to-exclusive upgrade is
// drop-then-reacquire-and-reverify, never an atomic upgrade.

use crate::rw_lock::RwLock;
use crate::segment::{Segment, NULL_INDEX};
use std::ffi::CString;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};

/// Fixed header at the start of the control block; the `Segment` array
/// follows immediately after in the same mapping.
#[repr(C)]
struct TableHeader {
    mutex: RwLock,
    active_head: AtomicU32,
    inactive_head: AtomicU32,
    count: u32,
}

pub struct SegmentTable {
    mem: *mut u8,
    mapped_size: usize,
    count: u32,
    /// Set when this mapping owns a named shm object (multi-process);
    /// `None` for an anonymous, process-private table (tests, or a
    /// single-process embedding of the allocator).
    shm_name: Option<String>,
}

unsafe impl Send for SegmentTable {}
unsafe impl Sync for SegmentTable {}

fn layout_size(count: u32) -> usize {
    std::mem::size_of::<TableHeader>() + count as usize * std::mem::size_of::<Segment>()
}

impl SegmentTable {
    /// Create a brand-new control block backed by an anonymous, process-
    /// private shared mapping (`MAP_SHARED | MAP_ANONYMOUS`). Suitable for
    /// a single-process embedding or for tests; the mapping disappears
    /// when the process exits, nothing to unlink.
    pub fn create_anonymous(count: u32, persistent_count: u32) -> io::Result<Self> {
        let size = layout_size(count);
        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if mem == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let table = Self {
            mem: mem as *mut u8,
            mapped_size: size,
            count,
            shm_name: None,
        };
        table.init(persistent_count);
        Ok(table)
    }

    /// Create (or open, if it already exists) a named control block so
    /// multiple processes in the same group share one `SegmentTable`.
    pub fn create_named(name: &str, count: u32, persistent_count: u32) -> io::Result<Self> {
        let posix_name = crate::shm_name::make_shm_name(name);
        let c_name = CString::new(posix_name.as_bytes())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let size = layout_size(count);
        let perms: libc::mode_t = 0o666;

        let created;
        let fd = unsafe {
            let f = libc::shm_open(
                c_name.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                perms as libc::c_uint,
            );
            if f != -1 {
                created = true;
                f
            } else {
                let e = io::Error::last_os_error();
                if e.raw_os_error() != Some(libc::EEXIST) {
                    return Err(e);
                }
                created = false;
                libc::shm_open(c_name.as_ptr(), libc::O_RDWR, perms as libc::c_uint)
            }
        };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }
        if created && unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
            let e = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(e);
        }

        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        if mem == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let table = Self {
            mem: mem as *mut u8,
            mapped_size: size,
            count,
            shm_name: Some(posix_name),
        };
        if created {
            table.init(persistent_count);
        }
        Ok(table)
    }

    fn header(&self) -> &TableHeader {
        unsafe { &*(self.mem as *const TableHeader) }
    }

    fn segments_base(&self) -> *mut Segment {
        unsafe { self.mem.add(std::mem::size_of::<TableHeader>()) as *mut Segment }
    }

    fn init(&self, persistent_count: u32) {
        unsafe {
            let hdr = self.mem as *mut TableHeader;
            ptr::write(
                hdr,
                TableHeader {
                    mutex: RwLock::new(),
                    active_head: AtomicU32::new(NULL_INDEX),
                    inactive_head: AtomicU32::new(NULL_INDEX),
                    count: self.count,
                },
            );
        }
        let base = self.segments_base();
        for i in 0..self.count {
            unsafe {
                let slot = &mut *base.add(i as usize);
                slot.init_in_place(i, i < persistent_count);
            }
            self.push_inactive(i);
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// # Safety
    /// `id` must be `< count()`.
    pub fn segment(&self, id: u32) -> &Segment {
        debug_assert!(id < self.count);
        unsafe { &*self.segments_base().add(id as usize) }
    }

    pub fn lock_shared(&self) {
        self.header().mutex.lock_shared();
    }

    pub fn unlock_shared(&self) {
        self.header().mutex.unlock_shared();
    }

    pub fn lock_exclusive(&self) {
        self.header().mutex.lock();
    }

    pub fn unlock_exclusive(&self) {
        self.header().mutex.unlock();
    }

    /// Iterate the active list, calling `f` on each segment id until it
    /// returns `true` (match found) or the list is exhausted. Caller must
    /// hold `mutex` shared or exclusive.
    pub fn for_each_active(&self, mut f: impl FnMut(u32) -> bool) -> bool {
        let mut cur = self.header().active_head.load(Ordering::Acquire);
        while cur != NULL_INDEX {
            if f(cur) {
                return true;
            }
            cur = self.segment(cur).list_next.load(Ordering::Acquire);
        }
        false
    }

    /// Pop one descriptor from the inactive list. Caller must hold
    /// `mutex` exclusive.
    pub fn pop_inactive(&self) -> Option<u32> {
        let head = self.header().inactive_head.load(Ordering::Acquire);
        if head == NULL_INDEX {
            return None;
        }
        let next = self.segment(head).list_next.load(Ordering::Acquire);
        self.header().inactive_head.store(next, Ordering::Release);
        if next != NULL_INDEX {
            self.segment(next).list_prev.store(NULL_INDEX, Ordering::Release);
        }
        let seg = self.segment(head);
        seg.list_prev.store(NULL_INDEX, Ordering::Release);
        seg.list_next.store(NULL_INDEX, Ordering::Release);
        Some(head)
    }

    /// Push a descriptor onto the head of the inactive list. Caller must
    /// hold `mutex` exclusive.
    pub fn push_inactive(&self, id: u32) {
        self.link_front(id, &self.header().inactive_head);
    }

    /// Push a descriptor onto the head of the active list. Caller must
    /// hold `mutex` exclusive.
    pub fn push_active(&self, id: u32) {
        self.link_front(id, &self.header().active_head);
    }

    fn link_front(&self, id: u32, list_head: &AtomicU32) {
        let old_head = list_head.load(Ordering::Acquire);
        let seg = self.segment(id);
        seg.list_prev.store(NULL_INDEX, Ordering::Release);
        seg.list_next.store(old_head, Ordering::Release);
        if old_head != NULL_INDEX {
            self.segment(old_head).list_prev.store(id, Ordering::Release);
        }
        list_head.store(id, Ordering::Release);
    }

    /// Remove a descriptor from whichever list (active or inactive) it is
    /// currently on. Caller must hold `mutex` exclusive and know which
    /// list `id` is on via `head_hint`.
    pub fn unlink(&self, id: u32, head_hint: &AtomicU32) {
        let seg = self.segment(id);
        let prev = seg.list_prev.load(Ordering::Acquire);
        let next = seg.list_next.load(Ordering::Acquire);
        if prev == NULL_INDEX {
            head_hint.store(next, Ordering::Release);
        } else {
            self.segment(prev).list_next.store(next, Ordering::Release);
        }
        if next != NULL_INDEX {
            self.segment(next).list_prev.store(prev, Ordering::Release);
        }
        seg.list_prev.store(NULL_INDEX, Ordering::Release);
        seg.list_next.store(NULL_INDEX, Ordering::Release);
    }

    pub fn active_head_cell(&self) -> &AtomicU32 {
        &self.header().active_head
    }

    pub fn inactive_head_cell(&self) -> &AtomicU32 {
        &self.header().inactive_head
    }

    /// Move a descriptor from the active list to the inactive list.
    /// Caller must hold `mutex` exclusive.
    pub fn move_active_to_inactive(&self, id: u32) {
        self.unlink(id, self.active_head_cell());
        self.push_inactive(id);
    }

    /// Move a descriptor from the inactive list to the active list.
    /// Caller must hold `mutex` exclusive.
    pub fn move_inactive_to_active(&self, id: u32) {
        self.unlink(id, self.inactive_head_cell());
        self.push_active(id);
    }
}

impl Drop for SegmentTable {
    fn drop(&mut self) {
        if self.mem.is_null() {
            return;
        }
        unsafe { libc::munmap(self.mem as *mut libc::c_void, self.mapped_size) };
        if let Some(name) = &self.shm_name {
            if let Ok(c_name) = CString::new(name.as_bytes()) {
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_table_has_all_segments_inactive() {
        let table = SegmentTable::create_anonymous(4, 1).unwrap();
        let mut inactive_count = 0;
        let mut cur = table.inactive_head_cell().load(Ordering::Acquire);
        while cur != NULL_INDEX {
            inactive_count += 1;
            cur = table.segment(cur).list_next.load(Ordering::Acquire);
        }
        assert_eq!(inactive_count, 4);
        assert_eq!(table.active_head_cell().load(Ordering::Acquire), NULL_INDEX);
    }

    #[test]
    fn persistent_flag_set_on_first_n_segments() {
        let table = SegmentTable::create_anonymous(4, 2).unwrap();
        assert!(table.segment(0).is_persistent());
        assert!(table.segment(1).is_persistent());
        assert!(!table.segment(2).is_persistent());
        assert!(!table.segment(3).is_persistent());
    }

    #[test]
    fn pop_then_push_active_round_trips() {
        let table = SegmentTable::create_anonymous(3, 0).unwrap();
        let id = table.pop_inactive().unwrap();
        table.push_active(id);
        let found = table.for_each_active(|s| s == id);
        assert!(found);
    }
}
