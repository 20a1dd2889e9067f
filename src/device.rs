// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// The device-driver binding is an external collaborator that registers
// host memory regions for DMA. The pool allocator calls it only when a
// device context is live in-process, under the segment's write operation.

use std::io;

/// Pin/unpin interface onto the device-driver binding.
pub trait DeviceBinding: Send + Sync {
    /// Whether this process currently holds a live device context. The
    /// allocator skips pin/unpin entirely when this is false.
    fn is_context_live(&self) -> bool;

    /// Register `[ptr, ptr+len)` for device DMA.
    fn pin(&self, ptr: *mut u8, len: usize) -> io::Result<()>;

    /// Release a previously pinned region.
    fn unpin(&self, ptr: *mut u8) -> io::Result<()>;

    /// Optional stateless pin/is-live hooks the fault handler may call
    /// from signal context. Trait objects aren't callable safely from a
    /// signal handler (their vtable dispatch carries no reentrancy
    /// guarantee), so a device binding that wants fault-driven re-pinning
    /// must expose bare, stateless `unsafe fn` pointers instead. The
    /// default is `None`, meaning the handler never attempts to re-pin
    /// and a stale pin is left to the next explicit `alloc`/`attach`.
    fn signal_safe_hooks(&self) -> Option<(unsafe fn() -> bool, unsafe fn(*mut u8, usize) -> bool)> {
        None
    }
}

/// No-op device binding: never reports a live context, so `pin`/`unpin`
/// are never called. Used when the allocator runs without GPU support.
pub struct NullDevice;

impl DeviceBinding for NullDevice {
    fn is_context_live(&self) -> bool {
        false
    }

    fn pin(&self, _ptr: *mut u8, _len: usize) -> io::Result<()> {
        Ok(())
    }

    fn unpin(&self, _ptr: *mut u8) -> io::Result<()> {
        Ok(())
    }
}
