// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Startup reserves the virtual range, opens (or creates) the shared
// segment table, installs the fault handler, and registers a shutdown
// hook that unlinks residual segments. `PoolContext` is an explicit
// value, not a hidden global — `init` stores it in a process-wide
// `OnceLock` only so the fault handler (which needs `'static` references)
// has somewhere stable to point at.

use crate::attach::AttachManager;
use crate::config::PoolConfig;
use crate::device::DeviceBinding;
use crate::error::PoolResult;
use crate::fault;
use crate::host::HostRuntime;
use crate::reservation::{LocalMap, VirtualReservation};
use crate::segment_table::SegmentTable;
use log::info;
use std::sync::OnceLock;

pub struct PoolContext {
    pub config: PoolConfig,
    pub table: SegmentTable,
    pub reservation: VirtualReservation,
    pub local_map: LocalMap,
    pub host: Box<dyn HostRuntime>,
    pub device: Box<dyn DeviceBinding>,
}

impl PoolContext {
    pub fn attach_manager(&self) -> AttachManager<'_> {
        AttachManager {
            table: &self.table,
            reservation: &self.reservation,
            local_map: &self.local_map,
            host: self.host.as_ref(),
            device: self.device.as_ref(),
        }
    }
}

static POOL: OnceLock<PoolContext> = OnceLock::new();

/// Reserve the virtual range, attach to (or create) the segment table,
/// and install the fault handler. Idempotent: a second call returns the
/// context created by the first.
pub fn init(host: Box<dyn HostRuntime>, device: Box<dyn DeviceBinding>) -> PoolResult<&'static PoolContext> {
    if let Some(ctx) = POOL.get() {
        return Ok(ctx);
    }

    let config = PoolConfig::from_host(host.as_ref())?;
    let reservation = VirtualReservation::reserve(config.max_dma_segment_nums, config.dma_segment_size)?;
    let table_name = format!("{}.{}.segtable", host.pg_name(), host.instance_port());
    let table = SegmentTable::create_named(&table_name, config.max_dma_segment_nums, config.min_dma_segment_nums)?;
    let local_map = LocalMap::new(config.max_dma_segment_nums);

    let pg_name = host.pg_name().to_string();
    let port = host.instance_port();
    let hooks = device.signal_safe_hooks();

    let ctx = PoolContext {
        config,
        table,
        reservation,
        local_map,
        host,
        device,
    };
    let ctx_ref = POOL.get_or_init(|| ctx);

    unsafe {
        fault::install(
            &ctx_ref.reservation,
            &ctx_ref.local_map,
            &ctx_ref.table,
            &pg_name,
            port,
            hooks.map(|(is_live, _)| is_live),
            hooks.map(|(_, pin)| pin),
        );
    }

    ctx_ref.host.register_shutdown_hook(Box::new(shutdown));
    info!(
        "dma pool started: {} segments of {} bytes, {} persistent",
        ctx_ref.config.max_dma_segment_nums, ctx_ref.config.dma_segment_size, ctx_ref.config.min_dma_segment_nums
    );
    Ok(ctx_ref)
}

pub fn get() -> Option<&'static PoolContext> {
    POOL.get()
}

/// Unlink every currently active segment's backing object. Run once, at
/// orderly process-group shutdown, so a fresh start doesn't inherit
/// residual shared-memory objects from a prior run.
pub fn shutdown() {
    let ctx = match POOL.get() {
        Some(c) => c,
        None => return,
    };
    unsafe { fault::uninstall() };

    ctx.table.lock_exclusive();
    let manager = ctx.attach_manager();
    let mut ids = Vec::new();
    ctx.table.for_each_active(|id| {
        ids.push(id);
        false
    });
    for id in ids {
        let seg = ctx.table.segment(id);
        seg.lock.lock();
        if let Err(e) = manager.destroy_segment(seg) {
            log::warn!("shutdown: failed to destroy segment {id}: {e}");
        }
        ctx.table.move_active_to_inactive(id);
        seg.lock.unlock();
    }
    ctx.table.unlock_exclusive();
    info!("dma pool shut down");
}
