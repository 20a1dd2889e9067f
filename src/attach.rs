// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Segment creation and destruction: derives the backing shm object's
// name from the segment's current revision, flips `revision` parity to
// publish the change to peer processes, and formats a freshly created
// segment via the buddy allocator. The fault handler in `fault.rs`
// performs the read-side counterpart of step 3/6 below when a peer
// process touches a segment it has not yet mapped.

use crate::buddy;
use crate::device::DeviceBinding;
use crate::error::{PoolError, PoolResult};
use crate::host::HostRuntime;
use crate::reservation::{LocalMap, VirtualReservation};
use crate::segment::Segment;
use crate::segment_table::SegmentTable;
use log::{debug, warn};
use std::ffi::CString;
use std::io;
use std::sync::atomic::Ordering;

/// Shared-memory object name for segment `seg_id` at incarnation
/// `revision_quotient`: `/<pg-name>.<port>.<segment_id>:<quotient>`.
pub fn object_name(host: &dyn HostRuntime, seg_id: u32, revision_quotient: u32) -> String {
    format!(
        "{}.{}.{}:{}",
        host.pg_name(),
        host.instance_port(),
        seg_id,
        revision_quotient
    )
}

pub struct AttachManager<'a> {
    pub table: &'a SegmentTable,
    pub reservation: &'a VirtualReservation,
    pub local_map: &'a LocalMap,
    pub host: &'a dyn HostRuntime,
    pub device: &'a dyn DeviceBinding,
}

impl<'a> AttachManager<'a> {
    /// Create the backing object for `seg`, map it at its fixed slot, pin
    /// it if a device context is live, and format it.
    ///
    /// Caller holds the table's `mutex` exclusive. `seg.revision` is
    /// currently even (no backing object).
    pub fn create_segment(&self, seg: &Segment) -> PoolResult<()> {
        let seg_id = seg.segment_id;
        let base_addr = self.reservation.segment_addr(seg_id);
        let seg_size = self.reservation.seg_size();

        if self.local_map.is_attached(seg_id) {
            self.detach_local_ghost(seg_id, base_addr)?;
        }

        let revision_before = seg.revision.load(Ordering::Acquire);
        let name = object_name(self.host, seg_id, revision_before >> 1);
        let posix_name = crate::shm_name::make_shm_name(&name);
        let c_name = CString::new(posix_name.as_bytes())
            .map_err(|e| PoolError::OsFailure(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                0o666,
            )
        };
        if fd == -1 {
            return Err(PoolError::OsFailure(io::Error::last_os_error()));
        }
        if unsafe { libc::ftruncate(fd, seg_size as libc::off_t) } != 0 {
            let e = io::Error::last_os_error();
            unsafe {
                libc::close(fd);
                libc::shm_unlink(c_name.as_ptr());
            }
            return Err(PoolError::OsFailure(e));
        }

        let mapped = unsafe {
            libc::mmap(
                base_addr as *mut libc::c_void,
                seg_size as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        if mapped == libc::MAP_FAILED {
            let e = io::Error::last_os_error();
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
            return Err(PoolError::OsFailure(e));
        }

        if self.device.is_context_live() {
            if let Err(e) = self.device.pin(base_addr, seg_size as usize) {
                unsafe {
                    libc::munmap(base_addr as *mut libc::c_void, seg_size as usize);
                    Self::remap_placeholder(base_addr, seg_size)?;
                    libc::shm_unlink(c_name.as_ptr());
                }
                return Err(PoolError::PinFailure(e));
            }
        }

        seg.lock.lock();
        unsafe { buddy::format_segment(seg, base_addr, seg_size) };
        seg.lock.unlock();

        let new_revision = seg.revision.fetch_add(1, Ordering::AcqRel) + 1;
        self.local_map.mark_attached(seg_id, new_revision);
        debug!("attached segment {seg_id} at revision {new_revision}");
        Ok(())
    }

    /// Destroy the backing object for `seg` and evict every process's
    /// mapping of it.
    ///
    /// Caller holds the table's `mutex` exclusive and `seg.lock`.
    pub fn destroy_segment(&self, seg: &Segment) -> PoolResult<()> {
        let seg_id = seg.segment_id;
        let base_addr = self.reservation.segment_addr(seg_id);
        let seg_size = self.reservation.seg_size();

        let revision_before = seg.revision.fetch_add(1, Ordering::AcqRel);
        let name = object_name(self.host, seg_id, revision_before >> 1);
        let posix_name = crate::shm_name::make_shm_name(&name);
        let c_name = CString::new(posix_name.as_bytes())
            .map_err(|e| PoolError::OsFailure(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

        if self.device.is_context_live() {
            if let Err(e) = self.device.unpin(base_addr) {
                warn!("unpin failed for segment {seg_id} during destroy: {e}");
            }
        }

        unsafe {
            if libc::munmap(base_addr as *mut libc::c_void, seg_size as usize) != 0 {
                return Err(PoolError::Fatal(io::Error::last_os_error()));
            }
        }
        Self::remap_placeholder(base_addr, seg_size)?;
        self.local_map.mark_detached(seg_id);

        unsafe {
            let fd = libc::shm_open(c_name.as_ptr(), libc::O_RDWR | libc::O_TRUNC, 0o666);
            if fd != -1 {
                libc::close(fd);
            }
            libc::shm_unlink(c_name.as_ptr());
        }
        debug!("destroyed segment {seg_id}");
        Ok(())
    }

    fn detach_local_ghost(&self, seg_id: u32, base_addr: *mut u8) -> PoolResult<()> {
        warn!("clearing ghost mapping for segment {seg_id} before recreation");
        if self.device.is_context_live() {
            let _ = self.device.unpin(base_addr);
        }
        unsafe {
            libc::munmap(base_addr as *mut libc::c_void, self.reservation.seg_size() as usize);
        }
        Self::remap_placeholder(base_addr, self.reservation.seg_size())?;
        self.local_map.mark_detached(seg_id);
        Ok(())
    }

    fn remap_placeholder(addr: *mut u8, len: u64) -> PoolResult<()> {
        let mapped = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                len as usize,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
                -1,
                0,
            )
        };
        if mapped == libc::MAP_FAILED {
            return Err(PoolError::Fatal(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Attach to an already-existing segment (the reader side of lazy
    /// attachment performed outside the signal handler, e.g. by
    /// `PoolAllocator::alloc` when it observes an odd revision it hasn't
    /// mapped yet but chooses to resolve eagerly instead of deferring to
    /// a future fault).
    pub fn attach_existing(&self, seg: &Segment) -> PoolResult<()> {
        let seg_id = seg.segment_id;
        let base_addr = self.reservation.segment_addr(seg_id);
        let seg_size = self.reservation.seg_size();
        let revision = seg.revision.load(Ordering::Acquire);
        if revision % 2 == 0 {
            return Err(PoolError::Corrupted("segment has no backing object"));
        }
        let name = object_name(self.host, seg_id, revision >> 1);
        let posix_name = crate::shm_name::make_shm_name(&name);
        let c_name = CString::new(posix_name.as_bytes())
            .map_err(|e| PoolError::OsFailure(io::Error::new(io::ErrorKind::InvalidInput, e)))?;

        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0o666) };
        if fd == -1 {
            return Err(PoolError::OsFailure(io::Error::last_os_error()));
        }
        let mapped = unsafe {
            libc::mmap(
                base_addr as *mut libc::c_void,
                seg_size as usize,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        if mapped == libc::MAP_FAILED {
            return Err(PoolError::OsFailure(io::Error::last_os_error()));
        }
        if self.device.is_context_live() {
            if let Err(e) = self.device.pin(base_addr, seg_size as usize) {
                return Err(PoolError::PinFailure(e));
            }
        }
        self.local_map.mark_attached(seg_id, revision);
        debug!("attached to existing segment {seg_id} at revision {revision}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buddy;
    use crate::chunk::ChunkHeader;
    use crate::device::NullDevice;
    use crate::host::StandaloneHost;
    use crate::reservation::{LocalMap, VirtualReservation};
    use crate::segment_table::SegmentTable;

    const TEST_SEG_SIZE: u64 = 1 << 20;

    #[test]
    fn create_then_destroy_round_trip() {
        let table = SegmentTable::create_anonymous(2, 0).unwrap();
        let reservation = VirtualReservation::reserve(2, TEST_SEG_SIZE).unwrap();
        let local_map = LocalMap::new(2);
        let host = StandaloneHost::new("attachtest", 0);
        let device = NullDevice;
        let manager = AttachManager {
            table: &table,
            reservation: &reservation,
            local_map: &local_map,
            host: &host,
            device: &device,
        };

        let seg = table.segment(0);
        assert!(!seg.is_attached_anywhere());
        manager.create_segment(seg).unwrap();
        assert!(seg.is_attached_anywhere());
        assert!(local_map.is_attached(0));

        seg.lock.lock();
        let off = unsafe { buddy::alloc_class(seg, reservation.segment_addr(0), 8, 10) }.unwrap();
        seg.lock.unlock();
        assert_eq!(off, 0);

        seg.lock.lock();
        manager.destroy_segment(seg).unwrap();
        seg.lock.unlock();
        assert!(!seg.is_attached_anywhere());
        assert!(!local_map.is_attached(0));
    }

    /// Simulates the two-process lazy-attach scenario without a real fork:
    /// two independent reservations (distinct base addresses, as two real
    /// processes would have) and two independent mappings of the same named
    /// segment table (as two processes opening the same shm object would
    /// have). P1 creates the segment and writes into a chunk; P2 explicitly
    /// attaches (the eager counterpart of what the fault handler does
    /// lazily) and reads the same bytes back.
    #[test]
    fn second_process_reads_what_the_first_wrote() {
        let name = format!("dmapool-attach-test-{}", std::process::id());
        let table1 = SegmentTable::create_named(&name, 2, 0).unwrap();
        let table2 = SegmentTable::create_named(&name, 2, 0).unwrap();
        let reservation1 = VirtualReservation::reserve(2, TEST_SEG_SIZE).unwrap();
        let reservation2 = VirtualReservation::reserve(2, TEST_SEG_SIZE).unwrap();
        assert_ne!(reservation1.base(), reservation2.base());
        let local_map1 = LocalMap::new(2);
        let local_map2 = LocalMap::new(2);
        let host = StandaloneHost::new("attachtest", 0);
        let device = NullDevice;

        let manager1 = AttachManager {
            table: &table1,
            reservation: &reservation1,
            local_map: &local_map1,
            host: &host,
            device: &device,
        };
        let manager2 = AttachManager {
            table: &table2,
            reservation: &reservation2,
            local_map: &local_map2,
            host: &host,
            device: &device,
        };

        let seg1 = table1.segment(0);
        manager1.create_segment(seg1).unwrap();

        seg1.lock.lock();
        let off = unsafe { buddy::alloc_class(seg1, reservation1.segment_addr(0), 8, 5) }.unwrap();
        seg1.lock.unlock();
        let payload1 = unsafe { reservation1.segment_addr(0).add(off as usize + ChunkHeader::SIZE) };
        unsafe { std::ptr::copy_nonoverlapping(b"hello".as_ptr(), payload1, 5) };

        let seg2 = table2.segment(0);
        assert!(!local_map2.is_attached(0));
        manager2.attach_existing(seg2).unwrap();
        let payload2 = unsafe { reservation2.segment_addr(0).add(off as usize + ChunkHeader::SIZE) };
        let read = unsafe { std::slice::from_raw_parts(payload2, 5) };
        assert_eq!(read, b"hello");
    }
}
