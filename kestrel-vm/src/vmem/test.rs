// SPDX-License-Identifier: MPL-2.0

use alloc::sync::Arc;

use super::*;
use crate::{
    arch::{page_aligned, page_size, PAGE_SIZE},
    frame::{BitmapFramePool, FrameAllocator},
    pt::{PageAttr, BASE_PAGE_LEVEL},
    test_util::{boot, TestEnv},
    Error, Vaddr,
};

const PAGE: usize = PAGE_SIZE;
const HUGE_SIZE: usize = PAGE * 512;

fn new_vas(pool_pages: usize) -> (TestEnv, Arc<Vas>, Arc<BitmapFramePool>) {
    let (env, pt, pool) = boot(pool_pages);
    let vas = Vas::new(pt, VasFlags::empty());
    // SAFETY: emulated hardware; nothing runs on these translations.
    unsafe { set_active(&vas) };
    (env, vas, pool)
}

fn present(vas: &Vas, va: Vaddr) -> bool {
    let walk = vas.page_table().walk(va, BASE_PAGE_LEVEL).unwrap();
    walk.pte.is_present(walk.level) && walk.pte.is_leaf(walk.level)
}

fn read_u64(vas: &Vas, va: Vaddr) -> u64 {
    let walk = vas.page_table().walk(va, BASE_PAGE_LEVEL).unwrap();
    assert!(walk.pte.is_present(walk.level));
    let pa = walk.pte.paddr(walk.level) + (va & (page_size(walk.level) - 1));
    let window = vas.page_table().kmap(pa, 1).unwrap();
    // SAFETY: the window maps a frame owned by this space.
    unsafe { *(window as *const u64) }
}

/// The region list must stay sorted, non-overlapping, aligned, and free of
/// adjacent mergeable pairs.
fn assert_well_formed(vas: &Vas) {
    let regions = vas.region_list();
    for r in &regions {
        assert!(r.start < r.end);
        let lvl = r.align_level();
        assert!(page_aligned(r.start, lvl));
        assert!(page_aligned(r.len(), lvl));
    }
    for w in regions.windows(2) {
        let (a, b) = (&w[0], &w[1]);
        assert!(a.end <= b.start);
        if a.end == b.start {
            let mergeable = super::ops_eq(a.ops, b.ops)
                && a.attr == b.attr
                && a.flags == b.flags
                && !a.flags.contains(VmaFlags::NO_MERGE)
                && a.page_level == b.page_level
                && a.name == b.name
                && a.ops.merge(vas, a, b).is_ok();
            assert!(!mergeable, "adjacent mergeable regions at {:#x}", a.end);
        }
    }
}

#[test]
fn anon_demand_paging_round_trip() {
    let (_env, vas, pool) = new_vas(256);
    let free0 = pool.free_memory();

    let va = vas
        .map(
            None,
            3 * PAGE,
            PageAttr::PROT_RW,
            VmaMapFlags::empty(),
            None,
            Some("heap"),
            &ANON_VMA_OPS,
        )
        .unwrap();
    assert!(page_aligned(va, BASE_PAGE_LEVEL));
    assert_well_formed(&vas);

    // Lazily mapped: nothing is present yet.
    assert!(!present(&vas, va));

    // A write into the middle page is served with a zeroed frame.
    handle_fault(va + PAGE, FaultType::WRITE | FaultType::NONPRESENT, None).unwrap();
    assert!(present(&vas, va + PAGE));
    assert_eq!(read_u64(&vas, va + PAGE), 0);
    assert!(!present(&vas, va));
    assert!(!present(&vas, va + 2 * PAGE));

    // Coverage: find agrees with the mapping.
    let info = vas.find(va + PAGE).unwrap();
    assert!(info.start <= va + PAGE && va + PAGE < info.end);
    assert_eq!(info.name, Some("heap"));

    vas.unmap(va, 3 * PAGE, VmaMapFlags::empty()).unwrap();
    assert!(vas.find(va).is_none());
    assert!(vas.region_list().is_empty());
    assert_eq!(pool.free_memory(), free0);
}

#[test]
fn populate_with_forced_huge_pages() {
    let (_env, vas, pool) = new_vas(4096);

    let va = vas
        .map(
            None,
            2 * HUGE_SIZE,
            PageAttr::PROT_RW,
            VmaMapFlags::POPULATE,
            Some(1),
            None,
            &ANON_VMA_OPS,
        )
        .unwrap();

    for i in 0..2 {
        let walk = vas.page_table().walk(va + i * HUGE_SIZE, BASE_PAGE_LEVEL).unwrap();
        assert_eq!(walk.level, 1);
        assert!(walk.pte.is_present(1) && walk.pte.is_leaf(1));
        assert_eq!(walk.pte.paddr(1) % HUGE_SIZE, 0);
    }
    assert_eq!(read_u64(&vas, va + HUGE_SIZE + 8), 0);

    vas.unmap(va, 2 * HUGE_SIZE, VmaMapFlags::empty()).unwrap();
    let (allocated, freed) = pool.counters();
    assert_eq!(allocated, freed);
}

#[test]
fn attr_change_splits_and_merges_back() {
    let (_env, vas, _pool) = new_vas(256);

    let va = vas
        .map(
            None,
            3 * PAGE,
            PageAttr::PROT_RW,
            VmaMapFlags::empty(),
            None,
            None,
            &ANON_VMA_OPS,
        )
        .unwrap();

    vas.set_attr(va + PAGE, PAGE, PageAttr::PROT_READ, VmaMapFlags::empty())
        .unwrap();

    let regions = vas.region_list();
    assert_eq!(regions.len(), 3);
    assert_eq!((regions[0].start, regions[0].end), (va, va + PAGE));
    assert_eq!(regions[0].attr, PageAttr::PROT_RW);
    assert_eq!((regions[1].start, regions[1].end), (va + PAGE, va + 2 * PAGE));
    assert_eq!(regions[1].attr, PageAttr::PROT_READ);
    assert_eq!((regions[2].start, regions[2].end), (va + 2 * PAGE, va + 3 * PAGE));
    assert_eq!(regions[2].attr, PageAttr::PROT_RW);
    assert_well_formed(&vas);

    // Restoring the attributes collapses the list again.
    vas.set_attr(va, 3 * PAGE, PageAttr::PROT_RW, VmaMapFlags::empty())
        .unwrap();
    let regions = vas.region_list();
    assert_eq!(regions.len(), 1);
    assert_eq!((regions[0].start, regions[0].end), (va, va + 3 * PAGE));
    assert_eq!(regions[0].attr, PageAttr::PROT_RW);
    assert_well_formed(&vas);
}

#[test]
fn attribute_changes_reach_the_page_table() {
    let (_env, vas, _pool) = new_vas(256);

    let va = vas
        .map(
            None,
            2 * PAGE,
            PageAttr::PROT_RW,
            VmaMapFlags::POPULATE,
            None,
            None,
            &ANON_VMA_OPS,
        )
        .unwrap();

    // Rewriting present entries of the active hierarchy invalidates them.
    let flushes0 = crate::arch::tlb_entry_flush_count();
    vas.set_attr(va, 2 * PAGE, PageAttr::PROT_READ, VmaMapFlags::empty())
        .unwrap();
    assert!(crate::arch::tlb_entry_flush_count() >= flushes0 + 2);

    for i in 0..2 {
        let walk = vas.page_table().walk(va + i * PAGE, BASE_PAGE_LEVEL).unwrap();
        assert_eq!(
            crate::arch::attr_from_pte(walk.pte, walk.level),
            PageAttr::PROT_READ
        );
    }
}

#[test]
fn stack_guards_stay_unbacked() {
    let (_env, vas, _pool) = new_vas(512);
    let size = 64 * PAGE;

    let va = vas
        .map(
            None,
            size,
            PageAttr::PROT_RW,
            VmaMapFlags::empty(),
            None,
            Some("stack"),
            &STACK_VMA_OPS,
        )
        .unwrap();

    // A hardware access inside a guard is an overflow, not a page-in.
    assert_eq!(
        handle_fault(va + PAGE, FaultType::WRITE | FaultType::NONPRESENT, None),
        Err(Error::Fault)
    );
    assert_eq!(
        handle_fault(va + size - PAGE, FaultType::WRITE | FaultType::NONPRESENT, None),
        Err(Error::Fault)
    );
    assert!(!present(&vas, va + PAGE));

    // Interior pages demand-fault normally and come zeroed.
    let mid = va + size / 2;
    handle_fault(mid, FaultType::WRITE | FaultType::NONPRESENT, None).unwrap();
    assert!(present(&vas, mid));
    assert_eq!(read_u64(&vas, mid), 0);

    // Eager population backs the whole interior but skips both guards.
    vas.advise(va, size, Advice::WILLNEED, VmaMapFlags::empty())
        .unwrap();
    assert!(present(&vas, va + 16 * PAGE));
    assert!(present(&vas, va + size - 17 * PAGE));
    assert!(!present(&vas, va));
    assert!(!present(&vas, va + 15 * PAGE));
    assert!(!present(&vas, va + size - PAGE));

    vas.unmap(va, size, VmaMapFlags::empty()).unwrap();
    assert!(vas.find(mid).is_none());
}

#[test]
fn stack_rejects_subrange_attr_changes() {
    let (_env, vas, _pool) = new_vas(512);
    let size = 48 * PAGE;

    let va = vas
        .map(
            None,
            size,
            PageAttr::PROT_RW,
            VmaMapFlags::empty(),
            None,
            None,
            &STACK_VMA_OPS,
        )
        .unwrap();

    // The split needed at the sub-range boundary is vetoed.
    assert_eq!(
        vas.set_attr(va, PAGE, PageAttr::PROT_READ, VmaMapFlags::empty()),
        Err(Error::Denied)
    );

    // Whole-region changes need no split and work.
    vas.set_attr(va, size, PageAttr::PROT_READ, VmaMapFlags::empty())
        .unwrap();
    assert_eq!(vas.find(va).unwrap().attr, PageAttr::PROT_READ);
}

#[test]
fn stacks_need_room_for_their_guards() {
    let (_env, vas, _pool) = new_vas(64);
    assert_eq!(
        vas.map(
            None,
            32 * PAGE,
            PageAttr::PROT_RW,
            VmaMapFlags::empty(),
            None,
            None,
            &STACK_VMA_OPS,
        ),
        Err(Error::Invalid)
    );
}

#[test]
fn dontneed_frees_and_refaults_zeroed() {
    let (_env, vas, pool) = new_vas(256);

    let va = vas
        .map(
            None,
            4 * PAGE,
            PageAttr::PROT_RW,
            VmaMapFlags::POPULATE,
            None,
            None,
            &ANON_VMA_OPS,
        )
        .unwrap();
    for i in 0..4 {
        assert!(present(&vas, va + i * PAGE));
    }

    // Dirty one page so a stale frame would be observable.
    let walk = vas.page_table().walk(va + 2 * PAGE, BASE_PAGE_LEVEL).unwrap();
    let window = vas.page_table().kmap(walk.pte.paddr(0), 1).unwrap();
    // SAFETY: the window maps a frame owned by this space.
    unsafe { core::ptr::write_bytes(window as *mut u8, 0xee, PAGE) };

    let free0 = pool.free_memory();
    vas.advise(va, 4 * PAGE, Advice::DONTNEED, VmaMapFlags::empty())
        .unwrap();
    for i in 0..4 {
        assert!(!present(&vas, va + i * PAGE));
    }
    assert!(pool.free_memory() >= free0 + 4 * PAGE);

    // The region itself stays; the next access gets a fresh zeroed frame.
    handle_fault(va + 2 * PAGE, FaultType::READ | FaultType::NONPRESENT, None).unwrap();
    assert_eq!(read_u64(&vas, va + 2 * PAGE), 0);
}

#[test]
fn replace_swaps_the_region() {
    let (_env, vas, pool) = new_vas(256);

    let va = vas
        .map(
            None,
            PAGE,
            PageAttr::PROT_READ,
            VmaMapFlags::POPULATE,
            None,
            None,
            &ANON_VMA_OPS,
        )
        .unwrap();
    assert!(present(&vas, va));
    let free0 = pool.free_memory();

    // Without REPLACE the collision is refused.
    assert_eq!(
        vas.map(
            Some(va),
            PAGE,
            PageAttr::PROT_RW,
            VmaMapFlags::empty(),
            None,
            None,
            &ANON_VMA_OPS,
        ),
        Err(Error::Exists)
    );

    let va2 = vas
        .map(
            Some(va),
            PAGE,
            PageAttr::PROT_RW,
            VmaMapFlags::REPLACE,
            None,
            None,
            &ANON_VMA_OPS,
        )
        .unwrap();
    assert_eq!(va2, va);

    let regions = vas.region_list();
    assert_eq!(regions.len(), 1);
    assert_eq!(regions[0].attr, PageAttr::PROT_RW);

    // The old backing frame was released, the new region is still lazy.
    assert!(pool.free_memory() > free0);
    assert!(!present(&vas, va));
}

#[test]
fn first_fit_reuses_gaps() {
    let (_env, vas, _pool) = new_vas(256);
    let flags = VmaMapFlags::empty();

    let a = vas
        .map(None, 2 * PAGE, PageAttr::PROT_RW, flags, None, None, &ANON_VMA_OPS)
        .unwrap();
    let b = vas
        .map(None, 2 * PAGE, PageAttr::PROT_RW, flags, None, None, &ANON_VMA_OPS)
        .unwrap();
    assert_eq!(b, a + 2 * PAGE);
    // Equal neighbours merged into one region.
    assert_eq!(vas.region_list().len(), 1);

    vas.unmap(a, 2 * PAGE, flags).unwrap();
    assert_eq!(vas.region_list().len(), 1);

    // The scan finds the gap again and the merge heals the region.
    let c = vas
        .map(None, 2 * PAGE, PageAttr::PROT_RW, flags, None, None, &ANON_VMA_OPS)
        .unwrap();
    assert_eq!(c, a);
    assert_eq!(vas.region_list().len(), 1);
    assert_well_formed(&vas);
}

#[test]
fn unmap_carves_holes() {
    let (_env, vas, _pool) = new_vas(256);

    let va = vas
        .map(
            None,
            3 * PAGE,
            PageAttr::PROT_RW,
            VmaMapFlags::empty(),
            None,
            None,
            &ANON_VMA_OPS,
        )
        .unwrap();

    vas.unmap(va + PAGE, PAGE, VmaMapFlags::empty()).unwrap();

    let regions = vas.region_list();
    assert_eq!(regions.len(), 2);
    assert_eq!((regions[0].start, regions[0].end), (va, va + PAGE));
    assert_eq!((regions[1].start, regions[1].end), (va + 2 * PAGE, va + 3 * PAGE));
    assert_well_formed(&vas);
}

#[test]
fn non_strict_ops_tolerate_holes() {
    let (_env, vas, _pool) = new_vas(256);
    let flags = VmaMapFlags::empty();

    // Unmapping unmapped space is a no-op.
    vas.unmap(0x5000_0000, 8 * PAGE, flags).unwrap();
    vas.set_attr(0x5000_0000, 8 * PAGE, PageAttr::PROT_READ, flags)
        .unwrap();
    vas.advise(0x5000_0000, 8 * PAGE, Advice::DONTNEED, flags)
        .unwrap();

    // Two regions with a hole; different attributes keep them apart.
    let a = vas
        .map(None, 2 * PAGE, PageAttr::PROT_READ, flags, None, None, &ANON_VMA_OPS)
        .unwrap();
    let b = vas
        .map(
            Some(a + 4 * PAGE),
            2 * PAGE,
            PageAttr::PROT_RW,
            flags,
            None,
            None,
            &ANON_VMA_OPS,
        )
        .unwrap();

    assert_eq!(
        vas.unmap(a, 6 * PAGE, VmaMapFlags::STRICT),
        Err(Error::NotFound)
    );
    assert_eq!(vas.region_list().len(), 2);

    // The non-strict sweep removes both.
    vas.unmap(a, 6 * PAGE, flags).unwrap();
    assert!(vas.region_list().is_empty());
    assert!(vas.find(b).is_none());
}

#[test]
fn misaligned_subranges_are_rejected() {
    let (_env, vas, _pool) = new_vas(256);

    let va = vas
        .map(
            None,
            2 * PAGE,
            PageAttr::PROT_RW,
            VmaMapFlags::empty(),
            None,
            None,
            &ANON_VMA_OPS,
        )
        .unwrap();

    assert_eq!(
        vas.unmap(va + 12, PAGE, VmaMapFlags::empty()),
        Err(Error::Invalid)
    );
    assert_eq!(
        vas.map(
            Some(va + 12),
            PAGE,
            PageAttr::PROT_RW,
            VmaMapFlags::empty(),
            None,
            None,
            &ANON_VMA_OPS
        ),
        Err(Error::Invalid)
    );
}

#[test]
fn faults_outside_permissions_are_refused() {
    let (_env, vas, _pool) = new_vas(256);

    let ro = vas
        .map(
            None,
            PAGE,
            PageAttr::PROT_READ,
            VmaMapFlags::empty(),
            None,
            None,
            &ANON_VMA_OPS,
        )
        .unwrap();
    let none = vas
        .map(
            None,
            PAGE,
            PageAttr::empty(),
            VmaMapFlags::empty(),
            None,
            None,
            &ANON_VMA_OPS,
        )
        .unwrap();

    // Write to read-only, read from inaccessible, access outside any
    // region: all refused.
    assert_eq!(
        handle_fault(ro, FaultType::WRITE | FaultType::NONPRESENT, None),
        Err(Error::Fault)
    );
    assert_eq!(
        handle_fault(none, FaultType::READ | FaultType::NONPRESENT, None),
        Err(Error::Fault)
    );
    assert_eq!(
        handle_fault(0x6000_0000, FaultType::READ | FaultType::NONPRESENT, None),
        Err(Error::Fault)
    );

    // Reads from the readable region work.
    handle_fault(ro, FaultType::READ | FaultType::NONPRESENT, None).unwrap();
    assert!(present(&vas, ro));
}

#[test]
fn hw_fault_entry_decodes_error_codes() {
    let (_env, vas, _pool) = new_vas(256);

    let va = vas
        .map(
            None,
            PAGE,
            PageAttr::PROT_RW,
            VmaMapFlags::empty(),
            None,
            None,
            &ANON_VMA_OPS,
        )
        .unwrap();

    assert_eq!(
        fault_type_from_code(crate::arch::PF_ERR_WRITE),
        FaultType::WRITE | FaultType::NONPRESENT
    );
    assert_eq!(
        fault_type_from_code(crate::arch::PF_ERR_PRESENT | crate::arch::PF_ERR_INSN),
        FaultType::EXEC
    );

    let mut frame = crate::arch::TrapFrame::default();
    handle_hw_fault(va, crate::arch::PF_ERR_WRITE, &mut frame).unwrap();
    assert!(present(&vas, va));
}

#[test]
fn paging_disabled_spaces_refuse_faults() {
    let (_env, pt, _pool) = boot(64);
    let vas = Vas::new(pt, VasFlags::NO_PAGING);
    // SAFETY: emulated hardware.
    unsafe { set_active(&vas) };

    let va = vas
        .map(
            None,
            PAGE,
            PageAttr::PROT_RW,
            VmaMapFlags::empty(),
            None,
            None,
            &ANON_VMA_OPS,
        )
        .unwrap();
    assert_eq!(
        handle_fault(va, FaultType::READ | FaultType::NONPRESENT, None),
        Err(Error::Fault)
    );

    vas.destroy();
    assert!(get_active().is_none());
    assert_eq!(
        handle_fault(va, FaultType::READ | FaultType::NONPRESENT, None),
        Err(Error::Fault)
    );
}

#[test]
fn destroy_releases_every_region() {
    let (_env, vas, pool) = new_vas(512);
    let free0 = pool.free_memory();

    vas.map(
        None,
        4 * PAGE,
        PageAttr::PROT_RW,
        VmaMapFlags::POPULATE,
        None,
        Some("heap"),
        &ANON_VMA_OPS,
    )
    .unwrap();
    vas.map(
        None,
        48 * PAGE,
        PageAttr::PROT_RW,
        VmaMapFlags::POPULATE,
        None,
        Some("stack"),
        &STACK_VMA_OPS,
    )
    .unwrap();

    vas.destroy();
    assert!(vas.region_list().is_empty());
    assert_eq!(pool.free_memory(), free0);
    assert!(get_active().is_none());
}
