// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Host-supplied configuration: segment size, descriptor count, and the
// persistent-segment floor. Values are validated at load time so a bad
// configuration is a startup error, not a panic deep inside the
// allocator.

use crate::chunk::MAX_CLASS;
use crate::error::{PoolError, PoolResult};
use crate::host::HostRuntime;

const MIN_SEGMENT_SIZE: u64 = 1 << 28; // 256 MiB
const MAX_SEGMENT_SIZE: u64 = 1 << MAX_CLASS;

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    /// Bytes per segment; power of two, multiple of the page size,
    /// between `2^28` and `2^MAX_CLASS`.
    pub dma_segment_size: u64,
    /// Total descriptor slots (`N`).
    pub max_dma_segment_nums: u32,
    /// First `min_dma_segment_nums` segments are persistent: never
    /// destroyed when their chunk count reaches zero.
    pub min_dma_segment_nums: u32,
}

impl PoolConfig {
    pub fn from_host(host: &dyn HostRuntime) -> PoolResult<Self> {
        let dma_segment_size = host
            .config_usize("dma_segment_size")
            .map(|v| v as u64)
            .unwrap_or(MIN_SEGMENT_SIZE);
        let max_dma_segment_nums = host
            .config_usize("max_dma_segment_nums")
            .map(|v| v as u32)
            .unwrap_or(32);
        let min_dma_segment_nums = match host.config_usize("min_dma_segment_nums") {
            Some(v) => v as u32,
            None => default_min_segments(host.total_device_memory_bytes(), dma_segment_size)
                .min(max_dma_segment_nums),
        };

        let cfg = Self {
            dma_segment_size,
            max_dma_segment_nums,
            min_dma_segment_nums,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> PoolResult<()> {
        if !self.dma_segment_size.is_power_of_two() {
            return Err(PoolError::Config("dma_segment_size must be a power of two"));
        }
        if self.dma_segment_size < MIN_SEGMENT_SIZE || self.dma_segment_size > MAX_SEGMENT_SIZE {
            return Err(PoolError::Config(
                "dma_segment_size out of range [2^28, 2^MAX_CLASS]",
            ));
        }
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;
        if page_size > 0 && self.dma_segment_size % page_size != 0 {
            return Err(PoolError::Config("dma_segment_size must be a multiple of the page size"));
        }
        if self.max_dma_segment_nums == 0 {
            return Err(PoolError::Config("max_dma_segment_nums must be nonzero"));
        }
        if self.min_dma_segment_nums > self.max_dma_segment_nums {
            return Err(PoolError::Config(
                "min_dma_segment_nums cannot exceed max_dma_segment_nums",
            ));
        }
        Ok(())
    }
}

/// Tiered default for `min_dma_segment_nums`: roughly 2/3 of attached
/// device memory above 4 GiB, with diminishing fractions above 10 GiB
/// and 16 GiB.
fn default_min_segments(total_device_memory_bytes: u64, segment_size: u64) -> u32 {
    const GIB: u64 = 1 << 30;
    let usable = total_device_memory_bytes.saturating_sub(4 * GIB);
    let reserved_bytes = if total_device_memory_bytes <= 4 * GIB {
        0
    } else if total_device_memory_bytes <= 10 * GIB {
        usable * 2 / 3
    } else if total_device_memory_bytes <= 16 * GIB {
        let first_tier = 6 * GIB * 2 / 3;
        let rest = total_device_memory_bytes - 10 * GIB;
        first_tier + rest / 2
    } else {
        let first_tier = 6 * GIB * 2 / 3;
        let second_tier = 6 * GIB / 2;
        let rest = total_device_memory_bytes - 16 * GIB;
        first_tier + second_tier + rest / 3
    };
    if segment_size == 0 {
        return 0;
    }
    (reserved_bytes / segment_size) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn below_four_gib_has_no_persistent_segments() {
        assert_eq!(default_min_segments(2 * (1 << 30), 1 << 28), 0);
    }

    #[test]
    fn eight_gib_reserves_two_thirds_of_remainder() {
        let got = default_min_segments(8 * (1 << 30), 1 << 28);
        let expected = ((4u64 * (1 << 30)) * 2 / 3) / (1 << 28);
        assert_eq!(got as u64, expected);
    }

    #[test]
    fn rejects_non_power_of_two_segment_size() {
        let cfg = PoolConfig {
            dma_segment_size: (1 << 28) + 1,
            max_dma_segment_nums: 4,
            min_dma_segment_nums: 0,
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_min_exceeding_max() {
        let cfg = PoolConfig {
            dma_segment_size: 1 << 28,
            max_dma_segment_nums: 2,
            min_dma_segment_nums: 3,
        };
        assert!(cfg.validate().is_err());
    }
}
