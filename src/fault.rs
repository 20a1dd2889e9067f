// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Signal-driven lazy attachment. A SIGSEGV/SIGBUS on an address inside
// the reserved virtual range means "this segment exists (odd revision)
// but this process hasn't mapped it yet" — the handler maps it and
// returns, so the faulting instruction re-executes against live memory.
//
// Everything below the line `// --- async-signal-safe region ---` must
// stay async-signal-safe: no heap allocation, no locks that could already
// be held by the interrupted thread, no logging. Integers are formatted
// by hand into stack buffers; names are built from a prefix captured once
// at install time.

use crate::reservation::{LocalMap, VirtualReservation};
use crate::segment_table::SegmentTable;
use std::cell::Cell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

thread_local! {
    static IN_HANDLER: Cell<bool> = Cell::new(false);
}

struct FaultContext {
    reservation: *const VirtualReservation,
    local_map: *const LocalMap,
    table: *const SegmentTable,
    /// Pre-built `"<pg-name>.<port>."` prefix, null-free, captured once.
    name_prefix: [u8; PREFIX_CAP],
    name_prefix_len: usize,
    device_pin: Option<unsafe fn(*mut u8, usize) -> bool>,
    device_is_live: Option<unsafe fn() -> bool>,
}

unsafe impl Send for FaultContext {}
unsafe impl Sync for FaultContext {}

const PREFIX_CAP: usize = 96;
const NAME_BUF_LEN: usize = 128;

static CONTEXT: AtomicPtr<FaultContext> = AtomicPtr::new(std::ptr::null_mut());
static INSTALLED: AtomicBool = AtomicBool::new(false);

static mut PREV_SIGSEGV: MaybeUninit<libc::sigaction> = MaybeUninit::uninit();
static mut PREV_SIGBUS: MaybeUninit<libc::sigaction> = MaybeUninit::uninit();

/// Install the fault handler for SIGSEGV and SIGBUS, chaining to whatever
/// handler was previously installed (the host runtime's own crash path,
/// typically) for faults outside the reserved range.
///
/// # Safety
/// Must be called once per process, after `reservation`/`local_map`/`table`
/// are fully initialised and guaranteed to outlive the installed handler
/// (i.e. for the remainder of the process's life, or until `uninstall`).
pub unsafe fn install(
    reservation: &'static VirtualReservation,
    local_map: &'static LocalMap,
    table: &'static SegmentTable,
    pg_name: &str,
    port: u16,
    device_is_live: Option<unsafe fn() -> bool>,
    device_pin: Option<unsafe fn(*mut u8, usize) -> bool>,
) {
    let mut prefix = [0u8; PREFIX_CAP];
    let mut pos = 0usize;
    for &b in pg_name.as_bytes() {
        if pos >= PREFIX_CAP - 2 {
            break;
        }
        prefix[pos] = b;
        pos += 1;
    }
    prefix[pos] = b'.';
    pos += 1;
    pos += write_u32(&mut prefix[pos..], port as u32);
    prefix[pos] = b'.';
    pos += 1;

    let ctx = Box::new(FaultContext {
        reservation: reservation as *const _,
        local_map: local_map as *const _,
        table: table as *const _,
        name_prefix: prefix,
        name_prefix_len: pos,
        device_pin,
        device_is_live,
    });
    CONTEXT.store(Box::into_raw(ctx), Ordering::Release);

    let mut sa: libc::sigaction = std::mem::zeroed();
    sa.sa_sigaction = handle_signal as usize;
    sa.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
    libc::sigemptyset(&mut sa.sa_mask);

    libc::sigaction(libc::SIGSEGV, &sa, PREV_SIGSEGV.as_mut_ptr());
    libc::sigaction(libc::SIGBUS, &sa, PREV_SIGBUS.as_mut_ptr());
    INSTALLED.store(true, Ordering::Release);
}

/// Restore whatever handlers were installed before `install`, and drop
/// the fault context. Call during orderly shutdown only — never while a
/// fault could still be in flight.
pub unsafe fn uninstall() {
    if !INSTALLED.swap(false, Ordering::AcqRel) {
        return;
    }
    libc::sigaction(libc::SIGSEGV, PREV_SIGSEGV.as_ptr(), std::ptr::null_mut());
    libc::sigaction(libc::SIGBUS, PREV_SIGBUS.as_ptr(), std::ptr::null_mut());
    let old = CONTEXT.swap(std::ptr::null_mut(), Ordering::AcqRel);
    if !old.is_null() {
        drop(Box::from_raw(old));
    }
}

fn write_u32(out: &mut [u8], mut v: u32) -> usize {
    if v == 0 {
        out[0] = b'0';
        return 1;
    }
    let mut tmp = [0u8; 10];
    let mut n = 0;
    while v > 0 {
        tmp[n] = b'0' + (v % 10) as u8;
        v /= 10;
        n += 1;
    }
    for i in 0..n {
        out[i] = tmp[n - 1 - i];
    }
    n
}

static STDERR_FATAL: &[u8] = b"dma pool: unresolved fault, chaining to previous handler\n";

unsafe fn write_stderr(msg: &[u8]) {
    libc::write(libc::STDERR_FILENO, msg.as_ptr() as *const libc::c_void, msg.len());
}

unsafe fn chain(signum: i32, info: *mut libc::siginfo_t, ctx: *mut libc::c_void) {
    write_stderr(STDERR_FATAL);
    let prev = if signum == libc::SIGSEGV {
        PREV_SIGSEGV.as_ptr()
    } else {
        PREV_SIGBUS.as_ptr()
    };
    let prev = &*prev;
    if prev.sa_sigaction == libc::SIG_DFL {
        libc::sigaction(signum, prev, std::ptr::null_mut());
        libc::raise(signum);
        return;
    }
    if prev.sa_sigaction == libc::SIG_IGN {
        return;
    }
    if prev.sa_flags & libc::SA_SIGINFO != 0 {
        let handler: extern "C" fn(i32, *mut libc::siginfo_t, *mut libc::c_void) =
            std::mem::transmute(prev.sa_sigaction);
        handler(signum, info, ctx);
    } else {
        let handler: extern "C" fn(i32) = std::mem::transmute(prev.sa_sigaction);
        handler(signum);
    }
}

extern "C" fn handle_signal(signum: i32, info: *mut libc::siginfo_t, ctx: *mut libc::c_void) {
    // --- async-signal-safe region ---
    let reentrant = IN_HANDLER.with(|f| {
        if f.get() {
            true
        } else {
            f.set(true);
            false
        }
    });
    if reentrant {
        unsafe { chain(signum, info, ctx) };
        return;
    }

    let result = unsafe { try_resolve(signum, info) };

    IN_HANDLER.with(|f| f.set(false));

    if !result {
        unsafe { chain(signum, info, ctx) };
    }
}

/// Returns `true` if the fault was resolved by mapping a segment.
unsafe fn try_resolve(_signum: i32, info: *mut libc::siginfo_t) -> bool {
    let fctx_ptr = CONTEXT.load(Ordering::Acquire);
    if fctx_ptr.is_null() {
        return false;
    }
    let fctx = &*fctx_ptr;
    let reservation = &*fctx.reservation;
    let local_map = &*fctx.local_map;
    let table = &*fctx.table;

    let fault_addr = (*info).si_addr() as usize;
    let seg_id = match reservation.segment_id_of(fault_addr) {
        Some(id) => id,
        None => return false,
    };

    let seg = table.segment(seg_id);
    let revision = seg.revision.load(Ordering::Acquire);
    if revision % 2 == 0 {
        // No backing object: a genuine fault, not a lazy-attach miss.
        return false;
    }
    if local_map.is_attached(seg_id) && local_map.entry(seg_id).revision.load(Ordering::Acquire) == revision {
        // Already mapped at this revision: a genuine fault.
        return false;
    }

    let base_addr = reservation.segment_addr(seg_id);
    let seg_size = reservation.seg_size();

    if local_map.is_attached(seg_id) {
        if let Some(is_live) = fctx.device_is_live {
            if is_live() {
                // unpin intentionally skipped here: no signal-safe unpin
                // hook is assumed; the device binding is responsible for
                // tolerating an unpin-less remap of a stale mapping.
            }
        }
        libc::munmap(base_addr as *mut libc::c_void, seg_size as usize);
    }

    let mut name_buf = [0u8; NAME_BUF_LEN];
    let prefix_len = fctx.name_prefix_len;
    if prefix_len + 32 > NAME_BUF_LEN {
        return false;
    }
    name_buf[..prefix_len].copy_from_slice(&fctx.name_prefix[..prefix_len]);
    let mut pos = prefix_len;
    pos += write_u32(&mut name_buf[pos..], seg_id);
    name_buf[pos] = b':';
    pos += 1;
    pos += write_u32(&mut name_buf[pos..], revision >> 1);
    name_buf[pos] = 0;

    let mut posix_name = [0u8; NAME_BUF_LEN + 1];
    posix_name[0] = b'/';
    posix_name[1..=pos + 1].copy_from_slice(&name_buf[..=pos]);

    let fd = libc::shm_open(posix_name.as_ptr() as *const libc::c_char, libc::O_RDWR, 0o666);
    if fd == -1 {
        return false;
    }
    let mapped = libc::mmap(
        base_addr as *mut libc::c_void,
        seg_size as usize,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_SHARED | libc::MAP_FIXED,
        fd,
        0,
    );
    libc::close(fd);
    if mapped == libc::MAP_FAILED {
        return false;
    }

    if let Some(is_live) = fctx.device_is_live {
        if is_live() {
            if let Some(pin) = fctx.device_pin {
                if !pin(base_addr, seg_size as usize) {
                    return false;
                }
            }
        }
    }

    local_map.mark_attached(seg_id, revision);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_u32_formats_without_leading_zero() {
        let mut buf = [0u8; 10];
        let n = write_u32(&mut buf, 42);
        assert_eq!(&buf[..n], b"42");
    }

    #[test]
    fn write_u32_handles_zero() {
        let mut buf = [0u8; 10];
        let n = write_u32(&mut buf, 0);
        assert_eq!(&buf[..n], b"0");
    }

    #[test]
    fn write_u32_round_trips_large_values() {
        let mut buf = [0u8; 10];
        let n = write_u32(&mut buf, 4294967295);
        assert_eq!(&buf[..n], b"4294967295");
    }
}
