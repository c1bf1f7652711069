// SPDX-License-Identifier: MPL-2.0

//! Page-fault routing and the mappers that funnel eager population, advice
//! and demand faults through the region fault handlers.

use crate::{
    arch::{self, page_aligned, page_size, pt_idx, Pte, TrapFrame},
    config,
    pt::{
        largest_level, largest_page_level, pte_read, MapAction, PageFlags, PageMapper, PageTable,
        BASE_PAGE_LEVEL,
    },
    Error, Paddr, PagingLevel, Result, Vaddr,
};

use super::{get_active, Vas, VasFlags, VmaInfo};

bitflags::bitflags! {
    /// Classification of a page fault.
    pub struct FaultType: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;

        /// No translation was present for the address.
        const NONPRESENT = 1 << 4;
        /// A translation exists but is malformed.
        const MISCONFIG = 1 << 5;

        /// Software-generated (population, advice), not a hardware trap.
        const SOFT = 1 << 8;

        const ACCESS_MASK = Self::READ.bits | Self::WRITE.bits | Self::EXEC.bits;
    }
}

/// Everything a region fault handler gets to see about one faulting page.
pub struct VmFault<'a> {
    /// The faulting virtual address.
    pub vaddr: Vaddr,
    /// Base of the page that will be installed.
    pub vbase: Vaddr,
    /// Size of that page.
    pub len: usize,
    /// Physical address: what the current entry maps on entry; the frame to
    /// install when the handler resolves the fault.
    pub paddr: Paddr,
    /// What happened.
    pub kind: FaultType,
    /// The candidate entry that will be installed.
    pub pte: Pte,
    /// Level of the page being installed.
    pub level: PagingLevel,
    /// Trap frame of hardware faults.
    pub regs: Option<&'a mut TrapFrame>,
}

/// Outcome of a region fault handler.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FaultStatus {
    /// `VmFault::paddr` names the frame to install.
    Resolved,
    /// Leave the slot unbacked and carry on.
    Skip,
}

/// Hand one prepared slot to a region's fault handler and translate the
/// outcome for the mapping walker. Handlers that run out of memory make the
/// walker retry with a smaller page size.
fn fault_slot(
    vas: &Vas,
    vma: &VmaInfo,
    fault_vaddr: Vaddr,
    vbase: Vaddr,
    level: PagingLevel,
    pte: &mut Pte,
    kind: FaultType,
    regs: Option<&mut TrapFrame>,
) -> Result<MapAction> {
    let mut fault = VmFault {
        vaddr: fault_vaddr,
        vbase,
        len: page_size(level),
        paddr: pte.paddr(level),
        kind,
        pte: *pte,
        level,
        regs,
    };

    match vma.ops.fault(vas, vma, &mut fault) {
        Ok(FaultStatus::Resolved) => {
            debug_assert!(page_aligned(fault.paddr, fault.level));
            *pte = fault.pte.with_paddr(fault.level, fault.paddr);
            Ok(MapAction::Write)
        }
        Ok(FaultStatus::Skip) => Ok(MapAction::Skip),
        Err(Error::NoMemory) => Ok(MapAction::TooBig),
        Err(e) => Err(e),
    }
}

/// Eagerly backs every missing page of a fresh region.
pub(super) struct PopulateMapper<'a> {
    vas: &'a Vas,
    vma: VmaInfo,
}

impl<'a> PopulateMapper<'a> {
    pub(super) fn new(vas: &'a Vas, vma: VmaInfo) -> Self {
        Self { vas, vma }
    }
}

impl PageMapper for PopulateMapper<'_> {
    fn map_page(
        &mut self,
        _pt: &PageTable,
        vaddr: Vaddr,
        _table_vaddr: Vaddr,
        level: PagingLevel,
        pte: &mut Pte,
    ) -> Result<MapAction> {
        fault_slot(
            self.vas,
            &self.vma,
            vaddr,
            vaddr,
            level,
            pte,
            FaultType::SOFT | FaultType::NONPRESENT,
            None,
        )
    }
}

/// Backs missing pages of an existing region; present pages are left alone.
pub(super) struct AdviseMapper<'a> {
    vas: &'a Vas,
    vma: VmaInfo,
}

impl<'a> AdviseMapper<'a> {
    pub(super) fn new(vas: &'a Vas, vma: VmaInfo) -> Self {
        Self { vas, vma }
    }
}

impl PageMapper for AdviseMapper<'_> {
    fn map_page(
        &mut self,
        _pt: &PageTable,
        vaddr: Vaddr,
        table_vaddr: Vaddr,
        level: PagingLevel,
        pte: &mut Pte,
    ) -> Result<MapAction> {
        // Advice walks over pages that may already be present; those stay.
        let current = pte_read(table_vaddr, pt_idx(vaddr, level));
        if current.is_present(level) {
            return Ok(MapAction::Skip);
        }

        fault_slot(
            self.vas,
            &self.vma,
            vaddr,
            vaddr,
            level,
            pte,
            FaultType::SOFT | FaultType::NONPRESENT,
            None,
        )
    }
}

/// Resolves one hardware fault against the region that covers it.
struct PageFaultMapper<'a> {
    vas: &'a Vas,
    vma: VmaInfo,
    vaddr: Vaddr,
    kind: FaultType,
    regs: Option<&'a mut TrapFrame>,
}

impl PageMapper for PageFaultMapper<'_> {
    fn map_page(
        &mut self,
        _pt: &PageTable,
        vbase: Vaddr,
        _table_vaddr: Vaddr,
        level: PagingLevel,
        pte: &mut Pte,
    ) -> Result<MapAction> {
        fault_slot(
            self.vas,
            &self.vma,
            self.vaddr,
            vbase,
            level,
            pte,
            self.kind,
            self.regs.as_deref_mut(),
        )
    }
}

fn access_allowed(attr: crate::pt::PageAttr, kind: FaultType) -> bool {
    use crate::pt::PageAttr;
    let access = kind & FaultType::ACCESS_MASK;
    if access == FaultType::READ {
        attr.contains(PageAttr::PROT_READ)
    } else if access == FaultType::WRITE {
        attr.contains(PageAttr::PROT_WRITE)
    } else if access == FaultType::EXEC {
        attr.contains(PageAttr::PROT_EXEC)
    } else {
        false
    }
}

/// The level at which faults are paged in at most.
fn demand_level() -> PagingLevel {
    let mut lvl = BASE_PAGE_LEVEL;
    while page_size(lvl) < config::DEMAND_PAGE_IN_SIZE {
        lvl += 1;
    }
    lvl
}

/// Route a page fault to the region covering `vaddr`.
///
/// Rejects the fault with [`Error::Fault`] when no space is active, the
/// active space does not page, no region covers the address, or the access
/// is not permitted by the region's attributes. Otherwise exactly one page
/// is installed through the region's fault handler; its size is bounded by
/// the existing table depth, the demand page-in limit and the region
/// boundaries, unless the region forces a size.
pub fn handle_fault(vaddr: Vaddr, kind: FaultType, regs: Option<&mut TrapFrame>) -> Result<()> {
    let vas = get_active().ok_or(Error::Fault)?;
    if vas.flags().contains(VasFlags::NO_PAGING) {
        return Err(Error::Fault);
    }

    let vma = vas.find(vaddr).ok_or(Error::Fault)?;
    debug_assert!(vaddr >= vma.start && vaddr < vma.end);

    if !access_allowed(vma.attr, kind) {
        return Err(Error::Fault);
    }

    let pt = vas.page_table();

    // Choose the page-in level: how deep tables already exist bounds the
    // page size from above (we never replace a table by a page here), the
    // demand page-in limit caps it, and the page must fit the region.
    let (lvl, force) = if vma.page_level.is_none() && demand_level() > BASE_PAGE_LEVEL {
        let walk = pt.walk(vaddr, BASE_PAGE_LEVEL)?;

        let vbase = (vaddr & !(page_size(walk.level) - 1)).max(vma.start);
        let lvl = largest_level(
            vbase,
            0,
            vma.end - vbase,
            walk.level.min(demand_level()).min(largest_page_level()),
        );
        (lvl, PageFlags::FORCE_SIZE)
    } else {
        (vma.page_level.unwrap_or(BASE_PAGE_LEVEL), PageFlags::empty())
    };

    let vbase = vaddr & !(page_size(lvl) - 1);

    debug_assert!(vbase >= vma.start && vbase < vma.end);
    debug_assert!(vbase + page_size(lvl) <= vma.end);

    let mut mapper = PageFaultMapper {
        vas: vas.as_ref(),
        vma,
        vaddr,
        kind,
        regs,
    };

    // SAFETY: the page lies inside a region of the active address space.
    unsafe { pt.map_pages_with(vbase, None, 1, vma.attr, PageFlags::size(lvl) | force, Some(&mut mapper)) }
}

/// Translate the architecture page-fault error code into a [`FaultType`].
pub fn fault_type_from_code(error_code: u64) -> FaultType {
    let mut kind = if error_code & arch::PF_ERR_WRITE != 0 {
        FaultType::WRITE
    } else if error_code & arch::PF_ERR_INSN != 0 {
        FaultType::EXEC
    } else {
        FaultType::READ
    };

    if error_code & arch::PF_ERR_PRESENT == 0 {
        kind |= FaultType::NONPRESENT;
    } else if error_code & arch::PF_ERR_RSVD != 0 {
        kind |= FaultType::MISCONFIG;
    }

    kind
}

/// Entry point for the architecture trap glue.
pub fn handle_hw_fault(vaddr: Vaddr, error_code: u64, regs: &mut TrapFrame) -> Result<()> {
    let kind = fault_type_from_code(error_code);
    handle_fault(vaddr, kind, Some(regs)).map_err(|e| {
        log::debug!(
            "cannot handle {:?} page fault at {:#x} (ec {:#x}): {:?}",
            kind & FaultType::ACCESS_MASK,
            vaddr,
            error_code,
            e
        );
        e
    })
}
