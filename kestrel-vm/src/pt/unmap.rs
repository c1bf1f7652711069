// SPDX-License-Identifier: MPL-2.0

//! The unmapping and attribute-change walkers.

use align_ext::AlignExt;

use crate::{
    arch::{self, page_aligned, page_size, pt_idx, Pte, PT_LEVELS, PT_PTES},
    Error, PagingLevel, Result, Vaddr,
};

use super::{map, pte_read, pte_table_vaddr, pte_write, PageAttr, PageFlags, PageTable, BASE_PAGE_LEVEL};

/// Unmap `[vaddr, vaddr + len)` starting from the table at `pt_vaddr`
/// serving `level`, or every mapping below that table when `vaddr` is
/// `None` (whole-hierarchy teardown; `len` must be `usize::MAX`).
///
/// Leaves larger than the remaining range or misaligned to it are split
/// first. On the way back up, tables left without a single valid entry are
/// unlinked and released, unless [`PageFlags::KEEP_PTES`].
pub(super) fn unmap_walk(
    pt: &PageTable,
    pt_vaddr: Vaddr,
    level: PagingLevel,
    vaddr: Option<Vaddr>,
    len: usize,
    flags: PageFlags,
) -> Result<()> {
    let to_lvl = flags.level();
    let mut lvl = level;
    let mut pt_vaddr = pt_vaddr;
    let mut len = len;
    let mut pt_vaddr_cache = [0 as Vaddr; PT_LEVELS];
    let mut pte_idx_cache = [0usize; PT_LEVELS];
    let mut first_pte_idx = [0usize; PT_LEVELS];

    let any = vaddr.is_none();
    let mut vaddr = vaddr.unwrap_or(0);

    debug_assert!(lvl >= to_lvl);
    pt_vaddr_cache[lvl] = pt_vaddr;

    let mut pte_idx;
    let mut pg_size;
    if any {
        debug_assert_eq!(len, usize::MAX);
        pte_idx = 0;
        pg_size = 0;
    } else {
        debug_assert!(len > 0);
        debug_assert!(page_aligned(len, to_lvl));
        debug_assert!(page_aligned(vaddr, to_lvl));
        pte_idx = pt_idx(vaddr, lvl);
        pg_size = page_size(lvl);
    }

    first_pte_idx[lvl] = pte_idx;
    let mut skip_pt_free = flags.contains(PageFlags::KEEP_PTES);

    loop {
        let pte = pte_read(pt_vaddr, pte_idx);

        if pte.is_present(lvl) {
            // A lower-level table: descend, if allowed.
            if !pte.is_leaf(lvl) {
                if flags.contains(PageFlags::FORCE_SIZE) && lvl == to_lvl {
                    return Err(Error::Fault);
                }

                pt_vaddr = pte_table_vaddr(pte, lvl);

                pte_idx_cache[lvl] = pte_idx;

                debug_assert!(lvl > BASE_PAGE_LEVEL);
                lvl -= 1;

                pt_vaddr_cache[lvl] = pt_vaddr;

                if any {
                    pte_idx = 0;
                    debug_assert_eq!(pg_size, 0);
                } else {
                    pte_idx = pt_idx(vaddr, lvl);
                    pg_size = page_size(lvl);
                }

                first_pte_idx[lvl] = pte_idx;
                skip_pt_free = flags.contains(PageFlags::KEEP_PTES);

                continue;
            }

            if flags.contains(PageFlags::FORCE_SIZE) && lvl != to_lvl {
                return Err(Error::Fault);
            }

            // A page larger than the remaining range, or misaligned to the
            // current address, must be split before any part of it goes.
            if !any && (pg_size > len || !page_aligned(vaddr, lvl)) {
                debug_assert!(lvl > BASE_PAGE_LEVEL);
                map::split_page(pt, pt_vaddr, vaddr.align_down(page_size(lvl)), lvl)?;
                continue;
            }

            debug_assert!(any || len >= pg_size);
            debug_assert!(any || page_aligned(vaddr, lvl));

            let new_pte = if flags.contains(PageFlags::KEEP_PTES) {
                pte.without_present(lvl)
            } else {
                Pte::invalid(lvl)
            };
            pte_write(pt_vaddr, pte_idx, new_pte);

            if !any && pt.is_active() {
                arch::tlb_flush_entry(vaddr);
            }

            if !flags.contains(PageFlags::KEEP_STATS) {
                pt.stats.page_unmapped(lvl);
            }

            if !flags.contains(PageFlags::KEEP_FRAMES) {
                pt.pg_ffree(pte.paddr(lvl), lvl);
            }
        }

        // More entries in this table and more pages to unmap: advance.
        if pte_idx < PT_PTES - 1 && len > pg_size {
            vaddr += pg_size;
            len -= pg_size;
            pte_idx += 1;
            continue;
        }

        debug_assert!(pte_idx == PT_PTES - 1 || len <= pg_size);

        // Either the last entry of this table was invalidated or the range
        // is exhausted. Free empty tables on the way up. The scan includes
        // the entries this walk touched: a lower-level table may have
        // survived, leaving its link valid.
        while pte_idx == PT_PTES - 1 || (len <= pg_size && !skip_pt_free) {
            if lvl == level {
                break;
            }

            let child_idx = pte_idx;
            let child_lvl = lvl;

            lvl += 1;
            pte_idx = pte_idx_cache[lvl];
            debug_assert!(pte_idx < PT_PTES);

            if skip_pt_free {
                continue;
            }

            // Entries following the unmapped range...
            let mut i = child_idx;
            while i < PT_PTES - 1 {
                i += 1;
                if pte_read(pt_vaddr, i) != Pte::invalid(child_lvl) {
                    skip_pt_free = true;
                    break;
                }
            }
            if skip_pt_free {
                continue;
            }

            // ...and those preceding it, including the first touched one.
            let mut i = first_pte_idx[child_lvl];
            loop {
                if pte_read(pt_vaddr, i) != Pte::invalid(child_lvl) {
                    skip_pt_free = true;
                    break;
                }
                if i == 0 {
                    break;
                }
                i -= 1;
            }
            if skip_pt_free {
                continue;
            }

            // The table holds no valid entry: unlink and release it.
            pt_vaddr = pt_vaddr_cache[lvl];
            pte_write(pt_vaddr, pte_idx, Pte::invalid(lvl));

            if !any && pt.is_active() {
                arch::tlb_flush_entry(vaddr);
            }

            pt.pt_free(pt_vaddr_cache[child_lvl], child_lvl);
        }

        if len <= pg_size {
            break;
        }

        pt_vaddr = pt_vaddr_cache[lvl];

        vaddr += pg_size;
        len -= pg_size;

        if !any {
            pg_size = page_size(lvl);
        }

        pte_idx += 1;
        if pte_idx == PT_PTES {
            break;
        }
    }

    if any && pt.is_active() {
        arch::tlb_flush();
    }

    Ok(())
}

/// Rebuild the attributes of every mapped page in `[vaddr, vaddr + len)`
/// (or of every mapping when `vaddr` is `None`), keeping the physical
/// mapping. Oversize leaves are split; nothing is freed or reclaimed.
pub(super) fn set_attr_walk(
    pt: &PageTable,
    pt_vaddr: Vaddr,
    level: PagingLevel,
    vaddr: Option<Vaddr>,
    len: usize,
    attr: PageAttr,
    flags: PageFlags,
) -> Result<()> {
    let to_lvl = flags.level();
    let mut lvl = level;
    let mut pt_vaddr = pt_vaddr;
    let mut len = len;
    let mut pt_vaddr_cache = [0 as Vaddr; PT_LEVELS];
    let mut pte_idx_cache = [0usize; PT_LEVELS];

    let any = vaddr.is_none();
    let mut vaddr = vaddr.unwrap_or(0);

    debug_assert!(lvl >= to_lvl);
    pt_vaddr_cache[lvl] = pt_vaddr;

    let mut pte_idx;
    let mut pg_size;
    if any {
        debug_assert_eq!(len, usize::MAX);
        pte_idx = 0;
        pg_size = 0;
    } else {
        debug_assert!(len > 0);
        debug_assert!(page_aligned(len, to_lvl));
        debug_assert!(page_aligned(vaddr, to_lvl));
        pte_idx = pt_idx(vaddr, lvl);
        pg_size = page_size(lvl);
    }

    loop {
        let pte = pte_read(pt_vaddr, pte_idx);

        if pte.is_present(lvl) {
            if !pte.is_leaf(lvl) {
                if flags.contains(PageFlags::FORCE_SIZE) && lvl == to_lvl {
                    return Err(Error::Fault);
                }

                pt_vaddr = pte_table_vaddr(pte, lvl);

                pte_idx_cache[lvl] = pte_idx;

                debug_assert!(lvl > BASE_PAGE_LEVEL);
                lvl -= 1;

                pt_vaddr_cache[lvl] = pt_vaddr;

                if any {
                    pte_idx = 0;
                    debug_assert_eq!(pg_size, 0);
                } else {
                    pte_idx = pt_idx(vaddr, lvl);
                    pg_size = page_size(lvl);
                }

                continue;
            }

            if flags.contains(PageFlags::FORCE_SIZE) && lvl != to_lvl {
                return Err(Error::Fault);
            }

            if !any && (pg_size > len || !page_aligned(vaddr, lvl)) {
                debug_assert!(lvl > BASE_PAGE_LEVEL);
                map::split_page(pt, pt_vaddr, vaddr.align_down(page_size(lvl)), lvl)?;
                continue;
            }

            debug_assert!(any || page_aligned(vaddr, lvl));

            // Rebuild the entry with the new attributes, keeping the
            // physical mapping and the per-entry state.
            let new_pte = arch::pte_create(pte.paddr(lvl), attr, lvl, pte, lvl);
            pte_write(pt_vaddr, pte_idx, new_pte);

            if !any && pt.is_active() {
                arch::tlb_flush_entry(vaddr);
            }
        }

        if pg_size >= len {
            break;
        }

        len -= pg_size;
        vaddr += pg_size;

        if pte_idx == PT_PTES - 1 {
            loop {
                if lvl == level {
                    break;
                }
                lvl += 1;
                pte_idx = pte_idx_cache[lvl];
                if pte_idx != PT_PTES - 1 {
                    break;
                }
            }
            pt_vaddr = pt_vaddr_cache[lvl];

            if !any {
                pg_size = page_size(lvl);
            }
        }

        pte_idx += 1;
        if pte_idx == PT_PTES {
            break;
        }
    }

    if any && pt.is_active() {
        arch::tlb_flush();
    }

    Ok(())
}
