// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Public façade: alloc/realloc/free/free_all/size/chunk_size/validate.
// Implements the lock hierarchy in this order: SegmentTable `mutex`,
// then a Segment spinlock, then an Owner spinlock — and reverses it on
// release. `free`'s destroy-on-empty path promotes from segment spinlock
// to table-exclusive and back, re-checking the emptiness condition after
// the promotion, so a racing allocator can never grab a chunk out of a
// segment whose destroy has already begun.

use crate::attach::AttachManager;
use crate::buddy;
use crate::chunk::{self, ChunkHeader, ChunkRef};
use crate::error::{PoolError, PoolResult};
use crate::lifecycle::PoolContext;
use crate::owner::OwnerHandle;
use std::cell::Cell;
use std::sync::atomic::Ordering;

pub struct PoolAllocator<'a> {
    ctx: &'a PoolContext,
}

impl<'a> PoolAllocator<'a> {
    pub fn new(ctx: &'a PoolContext) -> Self {
        Self { ctx }
    }

    fn attach_manager(&self) -> AttachManager<'a> {
        self.ctx.attach_manager()
    }

    fn header_ptr(&self, r: ChunkRef) -> *mut u8 {
        unsafe { self.ctx.reservation.segment_addr(r.segment_id).add(r.offset as usize) }
    }

    fn payload_ptr(&self, r: ChunkRef) -> *mut u8 {
        unsafe { self.header_ptr(r).add(ChunkHeader::SIZE) }
    }

    fn ptr_to_chunkref(&self, payload_ptr: *mut u8) -> PoolResult<ChunkRef> {
        if payload_ptr.is_null() {
            return Err(PoolError::Corrupted("null pointer"));
        }
        let header_ptr = unsafe { payload_ptr.sub(ChunkHeader::SIZE) };
        let addr = header_ptr as usize;
        let seg_id = self
            .ctx
            .reservation
            .segment_id_of(addr)
            .ok_or(PoolError::Corrupted("pointer outside reserved range"))?;
        let seg_base = self.ctx.reservation.segment_addr(seg_id) as usize;
        Ok(ChunkRef {
            segment_id: seg_id,
            offset: (addr - seg_base) as u64,
        })
    }

    fn validate_chunkref(&self, cref: ChunkRef) -> PoolResult<()> {
        if cref.segment_id >= self.ctx.table.count() {
            return Err(PoolError::Corrupted("segment id out of range"));
        }
        let seg = self.ctx.table.segment(cref.segment_id);
        if !seg.is_attached_anywhere() {
            return Err(PoolError::Corrupted("segment has no backing object"));
        }
        let header_ptr = self.header_ptr(cref);
        let ok = unsafe {
            ChunkHeader::check_magic(header_ptr) && ChunkHeader::read(header_ptr).is_active()
        };
        if !ok {
            return Err(PoolError::Corrupted("chunk failed integrity check"));
        }
        Ok(())
    }

    pub fn validate(&self, ptr: *mut u8) -> bool {
        self.ptr_to_chunkref(ptr)
            .and_then(|r| self.validate_chunkref(r))
            .is_ok()
    }

    pub fn max_alloc_size(&self) -> usize {
        self.ctx.config.dma_segment_size as usize - ChunkHeader::SIZE - 4
    }

    pub fn alloc(&self, owner: &dyn OwnerHandle, required: usize) -> PoolResult<*mut u8> {
        let max = self.max_alloc_size();
        let m = chunk::size_class(required).ok_or(PoolError::TooLarge {
            requested: required,
            max,
        })?;
        let table = &self.ctx.table;

        let found = Cell::new(None::<ChunkRef>);
        table.lock_shared();
        table.for_each_active(|id| {
            let seg = table.segment(id);
            let base = self.ctx.reservation.segment_addr(id);
            seg.lock.lock();
            let off = unsafe { buddy::alloc_class(seg, base, m, required as u32) };
            seg.lock.unlock();
            match off {
                Some(o) => {
                    found.set(Some(ChunkRef { segment_id: id, offset: o }));
                    true
                }
                None => false,
            }
        });
        table.unlock_shared();

        let chunk_ref = match found.into_inner() {
            Some(r) => r,
            None => self.alloc_slow(table, m, required)?,
        };

        self.link_owner_head(owner, chunk_ref);
        Ok(self.payload_ptr(chunk_ref))
    }

    fn alloc_slow(
        &self,
        table: &crate::segment_table::SegmentTable,
        m: u32,
        required: usize,
    ) -> PoolResult<ChunkRef> {
        table.lock_exclusive();
        let found = Cell::new(None::<ChunkRef>);
        table.for_each_active(|id| {
            let seg = table.segment(id);
            let base = self.ctx.reservation.segment_addr(id);
            seg.lock.lock();
            let off = unsafe { buddy::alloc_class(seg, base, m, required as u32) };
            seg.lock.unlock();
            match off {
                Some(o) => {
                    found.set(Some(ChunkRef { segment_id: id, offset: o }));
                    true
                }
                None => false,
            }
        });
        if let Some(r) = found.into_inner() {
            table.unlock_exclusive();
            return Ok(r);
        }

        let seg_id = match table.pop_inactive() {
            Some(id) => id,
            None => {
                table.unlock_exclusive();
                return Err(PoolError::OutOfSegments);
            }
        };
        let seg = table.segment(seg_id);
        if let Err(e) = self.attach_manager().create_segment(seg) {
            table.push_inactive(seg_id);
            table.unlock_exclusive();
            return Err(e);
        }
        table.push_active(seg_id);
        let base = self.ctx.reservation.segment_addr(seg_id);
        seg.lock.lock();
        let off = unsafe { buddy::alloc_class(seg, base, m, required as u32) };
        seg.lock.unlock();
        table.unlock_exclusive();
        off.map(|o| ChunkRef { segment_id: seg_id, offset: o })
            .ok_or(PoolError::OutOfSegments)
    }

    fn link_owner_head(&self, owner: &dyn OwnerHandle, chunk_ref: ChunkRef) {
        owner.lock();
        let head = owner.head();
        unsafe {
            let hdr = ChunkHeader::read(self.header_ptr(chunk_ref));
            hdr.owner_id = owner.id();
            hdr.set_owner_prev(ChunkRef::NULL);
            hdr.set_owner_next(head);
            if !head.is_null() {
                ChunkHeader::read(self.header_ptr(head)).set_owner_prev(chunk_ref);
            }
        }
        owner.set_head(chunk_ref);
        owner.unlock();
    }

    fn unlink_owner(&self, owner: &dyn OwnerHandle, chunk_ref: ChunkRef) {
        owner.lock();
        let (prev, next) = unsafe {
            let hdr = ChunkHeader::read(self.header_ptr(chunk_ref));
            (hdr.owner_prev(), hdr.owner_next())
        };
        if prev.is_null() {
            owner.set_head(next);
        } else {
            unsafe { ChunkHeader::read(self.header_ptr(prev)).set_owner_next(next) };
        }
        if !next.is_null() {
            unsafe { ChunkHeader::read(self.header_ptr(next)).set_owner_prev(prev) };
        }
        unsafe {
            let hdr = ChunkHeader::read(self.header_ptr(chunk_ref));
            hdr.owner_id = 0;
            hdr.set_owner_prev(ChunkRef::NULL);
            hdr.set_owner_next(ChunkRef::NULL);
        }
        owner.unlock();
    }

    pub fn free(&self, owner: &dyn OwnerHandle, ptr: *mut u8) -> PoolResult<()> {
        let cref = self.ptr_to_chunkref(ptr)?;
        self.validate_chunkref(cref)?;

        self.unlink_owner(owner, cref);

        let table = &self.ctx.table;
        let seg = table.segment(cref.segment_id);
        let base = self.ctx.reservation.segment_addr(cref.segment_id);
        let seg_size = self.ctx.reservation.seg_size();

        seg.lock.lock();
        let about_to_empty = !seg.is_persistent() && seg.num_chunks.load(Ordering::Acquire) == 1;

        if !about_to_empty {
            unsafe { buddy::free_chunk(seg, base, cref.offset, seg_size) };
            seg.lock.unlock();
            return Ok(());
        }

        seg.lock.unlock();
        table.lock_exclusive();
        seg.lock.lock();
        let still_about_to_empty =
            !seg.is_persistent() && seg.num_chunks.load(Ordering::Acquire) == 1;
        unsafe { buddy::free_chunk(seg, base, cref.offset, seg_size) };

        let mut result = Ok(());
        if still_about_to_empty && seg.num_chunks.load(Ordering::Acquire) == 0 {
            result = self.attach_manager().destroy_segment(seg);
            if result.is_ok() {
                table.move_active_to_inactive(cref.segment_id);
            }
        }
        seg.lock.unlock();
        table.unlock_exclusive();
        result
    }

    pub fn realloc(&self, owner: &dyn OwnerHandle, ptr: *mut u8, required: usize) -> PoolResult<*mut u8> {
        let cref = self.ptr_to_chunkref(ptr)?;
        self.validate_chunkref(cref)?;
        let max = self.max_alloc_size();
        let new_m = chunk::size_class(required).ok_or(PoolError::TooLarge {
            requested: required,
            max,
        })?;

        let table = &self.ctx.table;
        let seg = table.segment(cref.segment_id);
        let base = self.ctx.reservation.segment_addr(cref.segment_id);
        let old_m = unsafe { ChunkHeader::read(self.header_ptr(cref)).mclass as u32 };

        if new_m == old_m {
            seg.lock.lock();
            unsafe {
                let header_ptr = self.header_ptr(cref);
                let hdr = ChunkHeader::read(header_ptr);
                hdr.required = required as u32;
                let tail_off = hdr.tail_magic_offset();
                std::ptr::write_unaligned(header_ptr.add(tail_off) as *mut u32, chunk::TAIL_MAGIC);
            }
            seg.lock.unlock();
            return Ok(ptr);
        }

        if new_m < old_m {
            seg.lock.lock();
            unsafe { buddy::shrink_chunk(seg, base, cref.offset, new_m, required as u32) };
            seg.lock.unlock();
            return Ok(ptr);
        }

        let old_required = unsafe { ChunkHeader::read(self.header_ptr(cref)).required as usize };
        let new_ptr = self.alloc(owner, required)?;
        unsafe {
            std::ptr::copy_nonoverlapping(ptr, new_ptr, old_required.min(required));
        }
        self.free(owner, ptr)?;
        Ok(new_ptr)
    }

    pub fn free_all(&self, owner: &dyn OwnerHandle) -> PoolResult<()> {
        loop {
            owner.lock();
            let head = owner.head();
            owner.unlock();
            if head.is_null() {
                break;
            }
            let ptr = self.payload_ptr(head);
            self.free(owner, ptr)?;
        }
        Ok(())
    }

    pub fn size(&self, ptr: *mut u8) -> PoolResult<usize> {
        let cref = self.ptr_to_chunkref(ptr)?;
        self.validate_chunkref(cref)?;
        Ok(unsafe { ChunkHeader::read(self.header_ptr(cref)).required as usize })
    }

    pub fn chunk_size(&self, ptr: *mut u8) -> PoolResult<u64> {
        let cref = self.ptr_to_chunkref(ptr)?;
        self.validate_chunkref(cref)?;
        Ok(unsafe { ChunkHeader::read(self.header_ptr(cref)).chunk_size() })
    }
}
