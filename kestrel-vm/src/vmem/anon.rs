// SPDX-License-Identifier: MPL-2.0

//! Anonymous memory regions: zero-filled pages with no backing object.

use crate::{
    arch::{page_aligned, page_size, PAGE_SIZE},
    config,
    frame::{FallocFlags, FrameAllocator},
    pt::BASE_PAGE_LEVEL,
    Result, Vaddr,
};

use super::{
    zero_frames, FaultStatus, FaultType, Vas, VmFault, VmaFlags, VmaInfo, VmaMapFlags, VmaOps,
};

pub struct AnonOps;

/// The region ops for anonymous memory.
pub static ANON_VMA_OPS: AnonOps = AnonOps;

impl VmaOps for AnonOps {
    fn get_base(&self, _vas: &Vas, _flags: VmaMapFlags) -> Option<Vaddr> {
        Some(config::ANON_MAP_BASE)
    }

    fn fault(&self, vas: &Vas, vma: &VmaInfo, fault: &mut VmFault) -> Result<FaultStatus> {
        debug_assert!(page_aligned(fault.len, BASE_PAGE_LEVEL));
        debug_assert_eq!(fault.len, page_size(fault.level));
        debug_assert!(fault.kind.contains(FaultType::NONPRESENT));

        let pt = vas.page_table();
        let pages = fault.len / PAGE_SIZE;

        let paddr = pt.frame_allocator().falloc(pages, FallocFlags::ALIGNED)?;

        if !vma.flags.contains(VmaFlags::UNINITIALIZED) {
            if let Err(e) = zero_frames(pt, paddr, pages) {
                pt.frame_allocator().ffree(paddr, pages);
                return Err(e);
            }
        }

        fault.paddr = paddr;
        Ok(FaultStatus::Resolved)
    }
}
