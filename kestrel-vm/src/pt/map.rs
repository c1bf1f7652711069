// SPDX-License-Identifier: MPL-2.0

//! The mapping walker and the page-split primitive.

use align_ext::AlignExt;

use crate::{
    arch::{self, level_has_pages, page_aligned, page_size, pt_idx, Pte, PT_LEVELS, PT_PTES},
    Error, Paddr, PagingLevel, Result, Vaddr,
};

use super::{
    largest_level, largest_page_level, pte_read, pte_table_vaddr, pte_write, unmap, MapAction,
    PageAttr, PageFlags, PageMapper, PageTable, BASE_PAGE_LEVEL,
};

/// Map `[vaddr, vaddr + len)` starting from the table at `pt_vaddr` serving
/// `level`. See [`PageTable::map_pages_with`] for the contract.
///
/// The walker keeps one table address per level and iterates: descend to the
/// target level (allocating or splitting on the way), install the leaf, and
/// when the last entry of a table was written, walk up until an index
/// advances. The target level is re-evaluated at table boundaries because
/// that is where the address becomes aligned for larger page sizes.
#[allow(clippy::too_many_arguments)]
pub(super) fn map_walk(
    pt: &PageTable,
    pt_vaddr: Vaddr,
    level: PagingLevel,
    vaddr: Vaddr,
    paddr: Option<Paddr>,
    len: usize,
    attr: PageAttr,
    flags: PageFlags,
    template: Pte,
    template_level: PagingLevel,
    mut mapper: Option<&mut dyn PageMapper>,
) -> Result<()> {
    let mut to_lvl = flags.level();
    let mut max_lvl = largest_page_level();
    let mut lvl = level;
    let mut pt_vaddr = pt_vaddr;
    let mut vaddr = vaddr;
    let mut len = len;
    let mut pt_vaddr_cache = [0 as Vaddr; PT_LEVELS];

    let alloc_pmem = paddr.is_none();
    let mut paddr = paddr.unwrap_or(0);

    debug_assert!(len > 0);
    debug_assert!(page_aligned(len, to_lvl));
    debug_assert!(page_aligned(vaddr, to_lvl));

    if !flags.contains(PageFlags::FORCE_SIZE) {
        if level < max_lvl {
            max_lvl = level;
        }
        to_lvl = largest_level(vaddr, paddr, len, max_lvl);
    }

    debug_assert!(lvl >= to_lvl);
    pt_vaddr_cache[lvl] = pt_vaddr;

    let mut pte_idx = pt_idx(vaddr, lvl);
    let mut pg_size = page_size(lvl);

    'slot: loop {
        // Walk down to the target level. Missing tables are allocated and
        // linked; larger pages in the way are split if a mapper allows the
        // operation to touch existing mappings.
        while lvl > to_lvl {
            let pte = pte_read(pt_vaddr, pte_idx);
            if pte.is_present(lvl) {
                if pte.is_leaf(lvl) {
                    if mapper.is_none() {
                        return Err(Error::Exists);
                    }
                    split_page(pt, pt_vaddr, vaddr.align_down(page_size(lvl)), lvl)?;
                    continue;
                }
                pt_vaddr = pte_table_vaddr(pte, lvl);
            } else {
                let (new_vaddr, new_paddr) = pt.pt_alloc(lvl - 1)?;

                let (tmpl, tmpl_lvl) = if flags.contains(PageFlags::KEEP_PTES) {
                    (pte, lvl)
                } else {
                    (template, template_level)
                };
                let link = arch::pte_table(new_paddr, lvl, tmpl, tmpl_lvl);
                pte_write(pt_vaddr_cache[lvl], pte_idx, link);

                pt_vaddr = new_vaddr;
            }

            debug_assert!(lvl > BASE_PAGE_LEVEL);
            lvl -= 1;

            pt_vaddr_cache[lvl] = pt_vaddr;

            pte_idx = pt_idx(vaddr, lvl);
            pg_size = page_size(lvl);
        }

        debug_assert_eq!(lvl, to_lvl);
        debug_assert!(level_has_pages(lvl));

        let orig_pte = pte_read(pt_vaddr, pte_idx);

        if orig_pte.is_present(lvl) {
            // A table may be linked at the target level; descend to the
            // next level that can map pages instead.
            if !orig_pte.is_leaf(lvl) && !flags.contains(PageFlags::FORCE_SIZE) {
                debug_assert!(lvl > BASE_PAGE_LEVEL);
                to_lvl = largest_level(0, 0, usize::MAX, lvl - 1);
                debug_assert!(to_lvl < lvl);
                continue 'slot;
            }

            // The slot is occupied; only a mapper may decide what happens
            // to the existing mapping.
            if mapper.is_none() {
                return Err(Error::Exists);
            }

            paddr = orig_pte.paddr(lvl);
        } else if alloc_pmem {
            match pt.pg_falloc(lvl) {
                Ok(pa) => paddr = pa,
                Err(e) => {
                    // No contiguous self-aligned block of this size. Retry
                    // with the next smaller supported page size, and keep
                    // following mappings at most that large.
                    if flags.contains(PageFlags::FORCE_SIZE) || lvl == BASE_PAGE_LEVEL {
                        return Err(e);
                    }
                    to_lvl = largest_level(0, 0, usize::MAX, lvl - 1);
                    debug_assert!(to_lvl < lvl);
                    max_lvl = to_lvl;
                    continue 'slot;
                }
            }
            // From here on, failing the slot must free this allocation.
        }

        debug_assert!(page_aligned(vaddr, lvl));
        debug_assert!(page_aligned(paddr, lvl));

        let (tmpl, tmpl_lvl) = if flags.contains(PageFlags::KEEP_PTES) {
            (orig_pte, lvl)
        } else {
            (template, template_level)
        };
        let mut new_pte = arch::pte_create(paddr, attr, lvl, tmpl, tmpl_lvl);

        let mut write_slot = true;
        if let Some(m) = mapper.as_mut() {
            // `new_pte` is the entry that will be written if the mapper
            // returns `Write`; the current entry can be read from the table.
            match m.map_page(pt, vaddr, pt_vaddr, lvl, &mut new_pte) {
                Ok(MapAction::Write) => {}
                Ok(MapAction::Skip) => {
                    if alloc_pmem && !orig_pte.is_present(lvl) {
                        pt.pg_ffree(paddr, lvl);
                    }
                    write_slot = false;
                }
                Ok(MapAction::TooBig) => {
                    if alloc_pmem && !orig_pte.is_present(lvl) {
                        pt.pg_ffree(paddr, lvl);
                    }
                    if flags.contains(PageFlags::FORCE_SIZE) || lvl == BASE_PAGE_LEVEL {
                        return Err(Error::NoMemory);
                    }
                    to_lvl = largest_level(0, 0, usize::MAX, lvl - 1);
                    debug_assert!(to_lvl < lvl);
                    max_lvl = to_lvl;
                    continue 'slot;
                }
                Err(e) => {
                    if alloc_pmem && !orig_pte.is_present(lvl) {
                        pt.pg_ffree(paddr, lvl);
                    }
                    return Err(e);
                }
            }
        }

        if write_slot {
            debug_assert!(page_aligned(new_pte.paddr(lvl), lvl));
            pte_write(pt_vaddr, pte_idx, new_pte);

            if !flags.contains(PageFlags::KEEP_STATS) {
                pt.stats.page_mapped(lvl);
            }

            if orig_pte.is_present(lvl) && pt.is_active() {
                arch::tlb_flush_entry(vaddr);
            }
        }

        debug_assert!(len >= pg_size);
        len -= pg_size;
        if len == 0 {
            break;
        }

        if pte_idx == PT_PTES - 1 {
            // The last entry of this table was handled; walk up until an
            // index advances.
            loop {
                debug_assert!(lvl <= level);
                lvl += 1;
                pte_idx = pt_idx(vaddr, lvl);
                if pte_idx != PT_PTES - 1 {
                    break;
                }
            }
            pt_vaddr = pt_vaddr_cache[lvl];

            vaddr += pg_size;
            paddr += pg_size;

            // Table boundaries are where the address gets aligned for
            // larger page sizes, so re-evaluate the target level. It cannot
            // exceed the current level: tables down to here exist anyway.
            if !flags.contains(PageFlags::FORCE_SIZE) {
                let tmp_lvl = if max_lvl > lvl { lvl } else { max_lvl };
                if alloc_pmem {
                    paddr = 0;
                }
                to_lvl = largest_level(vaddr, paddr, len, tmp_lvl);
                debug_assert!(to_lvl <= lvl);
            }

            pg_size = page_size(lvl);
        } else {
            vaddr += pg_size;
            paddr += pg_size;

            if len < pg_size {
                debug_assert!(!flags.contains(PageFlags::FORCE_SIZE));

                // Less than a page of this size remains; addresses are
                // aligned here, so only the length constrains the level.
                to_lvl = largest_level(0, 0, len, lvl - 1);
                debug_assert!(to_lvl < lvl);
            }
        }

        pte_idx += 1;
        debug_assert!(pte_idx < PT_PTES);
    }

    Ok(())
}

/// Replace the level-`level` leaf mapping `vaddr` by a table of next-smaller
/// pages reproducing the same physical range and attributes.
///
/// The child table is fully built before the parent entry is swapped, so an
/// allocation failure cancels the split with the original mapping intact.
pub(super) fn split_page(
    pt: &PageTable,
    pt_vaddr: Vaddr,
    vaddr: Vaddr,
    level: PagingLevel,
) -> Result<()> {
    debug_assert!(level > BASE_PAGE_LEVEL);
    debug_assert!(level_has_pages(level));
    debug_assert!(page_aligned(vaddr, level));

    let idx = pt_idx(vaddr, level);
    let pte = pte_read(pt_vaddr, idx);
    debug_assert!(pte.is_present(level) && pte.is_leaf(level));

    let attr = arch::attr_from_pte(pte, level);

    let to_lvl = largest_level(vaddr, 0, usize::MAX, level - 1);
    debug_assert!(to_lvl <= level - 1);

    let (new_vaddr, new_paddr) = pt.pt_alloc(level - 1)?;

    let flags = PageFlags::size(to_lvl) | PageFlags::FORCE_SIZE | PageFlags::KEEP_STATS;
    let paddr = pte.paddr(level);
    if let Err(e) = map_walk(
        pt,
        new_vaddr,
        level - 1,
        vaddr,
        Some(paddr),
        page_size(level),
        attr,
        flags,
        pte,
        level,
        None,
    ) {
        unmap::unmap_walk(
            pt,
            new_vaddr,
            level - 1,
            None,
            usize::MAX,
            PageFlags::KEEP_FRAMES | PageFlags::KEEP_STATS,
        )
        .expect("cancelling a partial split cannot fail");
        pt.pt_free(new_vaddr, level - 1);
        return Err(e);
    }

    // The parent entry must still be the leaf we read: splits precede every
    // irreversible leaf write in the affected range.
    debug_assert_eq!(pte_read(pt_vaddr, idx), pte);

    let link = arch::pte_table(new_paddr, level - 1, pte, level);
    pte_write(pt_vaddr, idx, link);

    pt.stats.page_unmapped(level);
    pt.stats.pages[to_lvl]
        .fetch_add(page_size(level) / page_size(to_lvl), core::sync::atomic::Ordering::Relaxed);
    pt.stats.splits[level].fetch_add(1, core::sync::atomic::Ordering::Relaxed);

    Ok(())
}
