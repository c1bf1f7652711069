// SPDX-License-Identifier: MPL-2.0

//! Boot-time construction of the initial kernel address space from the
//! platform memory map.

use crate::{
    arch::{page_aligned, PAGE_SIZE},
    pt::{PageAttr, PageFlags, PageTable, BASE_PAGE_LEVEL},
    Error, Paddr, Result, Vaddr,
};

bitflags::bitflags! {
    /// Classification of one boot memory-map record.
    pub struct BootRegionFlags: u32 {
        /// Free memory; seeds the frame pool.
        const FREE = 1 << 0;
        /// Establish a mapping for the region.
        const MAP = 1 << 1;
        /// Remove the region's boot-time mapping (frames are kept).
        const UNMAP = 1 << 2;

        const READ = 1 << 3;
        const WRITE = 1 << 4;
        const EXECUTE = 1 << 5;
    }
}

/// One record of the boot memory map.
#[derive(Clone, Copy, Debug)]
pub struct BootRegion {
    pub pbase: Paddr,
    pub vbase: Vaddr,
    pub len: usize,
    pub flags: BootRegionFlags,
}

fn region_attr(flags: BootRegionFlags) -> PageAttr {
    let mut attr = PageAttr::empty();
    if flags.contains(BootRegionFlags::READ) {
        attr |= PageAttr::PROT_READ;
    }
    if flags.contains(BootRegionFlags::WRITE) {
        attr |= PageAttr::PROT_WRITE;
    }
    if flags.contains(BootRegionFlags::EXECUTE) {
        attr |= PageAttr::PROT_EXEC;
    }
    attr
}

/// Build the initial kernel address space.
///
/// The frame pool is seeded from the free regions: the first usable one
/// initializes the hierarchy (adopting the boot page tables), later ones
/// are added; regions too small to carry pool metadata are skipped. Then
/// the requested boot unmappings and mappings are applied and the hierarchy
/// is activated.
///
/// # Safety
///
/// The memory map must describe the machine truthfully: free regions must
/// really be unused, and mapped regions must stay valid for the lifetime of
/// the kernel.
pub unsafe fn paging_init(regions: &[BootRegion]) -> Result<PageTable> {
    let mut pt: Option<PageTable> = None;

    for r in regions.iter().filter(|r| r.flags.contains(BootRegionFlags::FREE)) {
        debug_assert!(page_aligned(r.pbase, BASE_PAGE_LEVEL));
        debug_assert!(r.len > 0);

        let result = if let Some(pt) = pt.as_ref() {
            pt.add_memory(r.pbase, r.len)
        } else {
            PageTable::init(r.pbase, r.len).map(|new_pt| pt = Some(new_pt))
        };

        // A range too small for the pool metadata is expected; skip it.
        match result {
            Ok(()) | Err(Error::NoMemory) => {}
            Err(e) => {
                log::error!(
                    "cannot add {:#x}-{:#x} to paging: {:?}",
                    r.pbase,
                    r.pbase + r.len,
                    e
                );
            }
        }
    }

    let pt = pt.ok_or(Error::NoMemory)?;

    for r in regions.iter().filter(|r| r.flags.contains(BootRegionFlags::UNMAP)) {
        debug_assert!(page_aligned(r.vbase, BASE_PAGE_LEVEL));
        debug_assert!(page_aligned(r.len, BASE_PAGE_LEVEL));

        // SAFETY: per the memory map, nothing uses this mapping any more.
        unsafe { pt.unmap_pages(Some(r.vbase), r.len / PAGE_SIZE, PageFlags::KEEP_FRAMES)? };
    }

    for r in regions.iter().filter(|r| r.flags.contains(BootRegionFlags::MAP)) {
        debug_assert!(page_aligned(r.vbase, BASE_PAGE_LEVEL));
        debug_assert!(page_aligned(r.pbase, BASE_PAGE_LEVEL));
        debug_assert!(page_aligned(r.len, BASE_PAGE_LEVEL));

        // SAFETY: the memory map vouches for the region.
        unsafe {
            pt.map_pages(
                r.vbase,
                Some(r.pbase),
                r.len / PAGE_SIZE,
                region_attr(r.flags),
                PageFlags::empty(),
            )?
        };
    }

    // SAFETY: the hierarchy was adopted from the running configuration and
    // only modified as directed by the memory map.
    unsafe { pt.activate() };

    Ok(pt)
}
