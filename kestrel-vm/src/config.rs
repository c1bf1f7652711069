// SPDX-License-Identifier: MPL-2.0

//! Compile-time configuration of the virtual-memory core.

use crate::Vaddr;

/// Number of CPUs the per-CPU state is sized for.
pub const NR_CPUS: usize = 4;

/// Base address used for placing regions mapped without an explicit address
/// when the region's handlers do not provide one.
pub const DEFAULT_MAP_BASE: Vaddr = 0x0000_0008_0000_0000;

/// Base address for anonymous memory regions.
pub const ANON_MAP_BASE: Vaddr = 0x0000_0010_0000_0000;

/// Base address for stack regions.
pub const STACK_MAP_BASE: Vaddr = 0x0000_0070_0000_0000;

/// Largest page size used when paging memory in on demand. Faults in regions
/// that do not force a page size are served with pages up to this size,
/// subject to existing table depth and region boundaries.
pub const DEMAND_PAGE_IN_SIZE: usize = 4096;

/// Unmapped pages at the upper end of every stack region.
pub const STACK_GUARD_PAGES_TOP: usize = 16;

/// Unmapped pages at the lower end of every stack region.
pub const STACK_GUARD_PAGES_BOTTOM: usize = 16;
