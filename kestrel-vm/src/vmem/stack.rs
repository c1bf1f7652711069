// SPDX-License-Identifier: MPL-2.0

//! Stack regions: zero-filled pages between two guard regions that are
//! never backed. A software access to a guard page is silently skipped so
//! population leaves the guards unmapped; a hardware access is an overflow
//! and fails the fault.

use crate::{
    arch::PAGE_SIZE,
    config,
    frame::{FallocFlags, FrameAllocator},
    pt::PageAttr,
    Error, Result, Vaddr,
};

use super::{
    zero_frames, FaultStatus, FaultType, Vas, VmFault, VmaFlags, VmaInfo, VmaMapFlags, VmaOps,
};

fn in_top_guard(vma: &VmaInfo, vaddr: Vaddr) -> bool {
    vaddr >= vma.end - config::STACK_GUARD_PAGES_TOP * PAGE_SIZE
}

fn in_bottom_guard(vma: &VmaInfo, vaddr: Vaddr) -> bool {
    vaddr < vma.start + config::STACK_GUARD_PAGES_BOTTOM * PAGE_SIZE
}

fn in_guard(vma: &VmaInfo, vaddr: Vaddr) -> bool {
    in_top_guard(vma, vaddr) || in_bottom_guard(vma, vaddr)
}

pub struct StackOps;

/// The region ops for stacks.
///
/// Splits and merges are vetoed so the guard regions stay glued to the
/// region edges. A consequence is that attribute changes on a sub-range of
/// a stack are refused as well, since they would require a split.
pub static STACK_VMA_OPS: StackOps = StackOps;

impl VmaOps for StackOps {
    fn get_base(&self, _vas: &Vas, _flags: VmaMapFlags) -> Option<Vaddr> {
        Some(config::STACK_MAP_BASE)
    }

    fn on_new(
        &self,
        _vas: &Vas,
        _vaddr: Vaddr,
        len: usize,
        _attr: PageAttr,
        _flags: &mut VmaFlags,
    ) -> Result<()> {
        // A stack needs at least one usable page between the guards.
        let guards =
            (config::STACK_GUARD_PAGES_TOP + config::STACK_GUARD_PAGES_BOTTOM) * PAGE_SIZE;
        if len <= guards {
            return Err(Error::Invalid);
        }
        Ok(())
    }

    fn fault(&self, vas: &Vas, vma: &VmaInfo, fault: &mut VmFault) -> Result<FaultStatus> {
        debug_assert_eq!(fault.len, PAGE_SIZE);
        debug_assert!(fault.kind.contains(FaultType::NONPRESENT));

        if in_guard(vma, fault.vbase) {
            // Population and advice must leave the guards unbacked; an
            // actual access is a stack overflow.
            if fault.kind.contains(FaultType::SOFT) {
                return Ok(FaultStatus::Skip);
            }

            log::error!(
                "guard page {:#x} of stack region {:#x}-{:#x} hit",
                fault.vbase,
                vma.start,
                vma.end
            );
            return Err(Error::Fault);
        }

        let pt = vas.page_table();
        let paddr = pt.frame_allocator().falloc(1, FallocFlags::empty())?;

        if !vma.flags.contains(VmaFlags::UNINITIALIZED) {
            if let Err(e) = zero_frames(pt, paddr, 1) {
                pt.frame_allocator().ffree(paddr, 1);
                return Err(e);
            }
        }

        fault.paddr = paddr;
        Ok(FaultStatus::Resolved)
    }

    fn split(&self, _vas: &Vas, _vma: &VmaInfo, _at: Vaddr) -> Result<()> {
        Err(Error::Denied)
    }

    fn merge(&self, _vas: &Vas, _vma: &VmaInfo, _next: &VmaInfo) -> Result<()> {
        Err(Error::Denied)
    }
}
