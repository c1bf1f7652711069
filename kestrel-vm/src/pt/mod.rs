// SPDX-License-Identifier: MPL-2.0

//! The page-table engine.
//!
//! A [`PageTable`] owns one hardware translation hierarchy. The engine can
//! initialize a hierarchy over a physical range, clone it (deep, with leaf
//! frames shared, or empty but rooted), map, unmap and re-attribute page
//! ranges at any supported page size, walk to any level, and transiently map
//! physical frames for the kernel to touch. Mapping operations optionally
//! carry a per-slot [`PageMapper`] callback; this is the single mechanism by
//! which eager population, demand paging and advice share one walker.
//!
//! The walkers are iterative with explicit per-level state, one slot per
//! level, so the engine runs on bounded kernel stacks.

mod map;
mod unmap;

use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    arch::{
        self, level_has_pages, page_aligned, page_shift, page_size, pt_idx, vaddr_range_valid,
        Pte, PAGE_SHIFT, PT_LEVELS, PT_PTES,
    },
    config,
    frame::{BitmapFramePool, FallocFlags, FrameAllocator},
    Error, Paddr, PagingLevel, Result, Vaddr,
};

/// The level of base pages.
pub const BASE_PAGE_LEVEL: PagingLevel = 0;

bitflags::bitflags! {
    /// Access and cacheability attributes of a mapping.
    pub struct PageAttr: u32 {
        const PROT_READ = 1 << 0;
        const PROT_WRITE = 1 << 1;
        const PROT_EXEC = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE = 1 << 4;

        const PROT_RW = Self::PROT_READ.bits | Self::PROT_WRITE.bits;
        const PROT_RWX = Self::PROT_RW.bits | Self::PROT_EXEC.bits;
    }
}

/// Option word of the paging calls. The lowest bits carry the page-size
/// level the address and count arguments are expressed in.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct PageFlags(usize);

impl PageFlags {
    const LEVEL_MASK: usize = 0xf;

    /// Fail instead of falling back to another page size.
    pub const FORCE_SIZE: PageFlags = PageFlags(1 << 4);
    /// Keep non-present entries and do not reclaim empty tables.
    pub const KEEP_PTES: PageFlags = PageFlags(1 << 5);
    /// Do not return unmapped frames to the allocator.
    pub const KEEP_FRAMES: PageFlags = PageFlags(1 << 6);
    /// Clone into an empty hierarchy with a fresh root.
    pub const CLONE_NEW: PageFlags = PageFlags(1 << 7);
    /// Leave the statistics counters untouched (internal restructuring).
    pub(crate) const KEEP_STATS: PageFlags = PageFlags(1 << 8);

    pub const fn empty() -> PageFlags {
        PageFlags(0)
    }

    /// Express addresses and counts in pages of the given level.
    pub const fn size(level: PagingLevel) -> PageFlags {
        PageFlags(level & Self::LEVEL_MASK)
    }

    /// The page-size level carried in this word.
    pub const fn level(self) -> PagingLevel {
        self.0 & Self::LEVEL_MASK
    }

    pub const fn contains(self, other: PageFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl core::ops::BitOr for PageFlags {
    type Output = PageFlags;
    fn bitor(self, rhs: PageFlags) -> PageFlags {
        PageFlags(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for PageFlags {
    fn bitor_assign(&mut self, rhs: PageFlags) {
        self.0 |= rhs.0;
    }
}

impl core::ops::BitAnd for PageFlags {
    type Output = PageFlags;
    fn bitand(self, rhs: PageFlags) -> PageFlags {
        PageFlags(self.0 & rhs.0)
    }
}

/// Result of [`PageTable::walk`].
#[derive(Clone, Copy, Debug)]
pub struct PtWalk {
    /// The level the walk stopped at.
    pub level: PagingLevel,
    /// Kernel-visible address of the table holding `pte`.
    pub table_vaddr: Vaddr,
    /// The entry found there.
    pub pte: Pte,
}

/// Decision of a [`PageMapper`] for one prepared slot.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MapAction {
    /// Write the (possibly edited) entry.
    Write,
    /// Leave the slot untouched and continue with the next page.
    Skip,
    /// The mapper cannot back a page of this size; retry the slot at the
    /// next smaller supported level.
    TooBig,
}

/// Per-slot callback of the extended mapping path.
///
/// The walker prepares the leaf entry it intends to write and hands it to
/// the mapper, which may edit it (typically to substitute the backing
/// frame) or direct the walker with a [`MapAction`]. The entry currently
/// in the table can be read through `table_vaddr`.
pub trait PageMapper {
    fn map_page(
        &mut self,
        pt: &PageTable,
        vaddr: Vaddr,
        table_vaddr: Vaddr,
        level: PagingLevel,
        pte: &mut Pte,
    ) -> Result<MapAction>;
}

/// Diagnostic per-level counters of one hierarchy.
#[derive(Clone, Copy, Debug, Default)]
pub struct PtStatsSnapshot {
    /// Pages currently mapped, per leaf level.
    pub pages: [usize; PT_LEVELS],
    /// Page tables allocated, per level they serve.
    pub tables: [usize; PT_LEVELS],
    /// Large pages split so far, per original level.
    pub splits: [usize; PT_LEVELS],
}

struct PtStats {
    pages: [AtomicUsize; PT_LEVELS],
    tables: [AtomicUsize; PT_LEVELS],
    splits: [AtomicUsize; PT_LEVELS],
}

impl PtStats {
    const fn new() -> Self {
        const ZERO: AtomicUsize = AtomicUsize::new(0);
        Self {
            pages: [ZERO; PT_LEVELS],
            tables: [ZERO; PT_LEVELS],
            splits: [ZERO; PT_LEVELS],
        }
    }

    fn page_mapped(&self, level: PagingLevel) {
        self.pages[level].fetch_add(1, Ordering::Relaxed);
    }

    fn page_unmapped(&self, level: PagingLevel) {
        let prev = self.pages[level].fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0);
    }
}

/// One hardware translation hierarchy.
pub struct PageTable {
    /// Physical address of the root table.
    root_paddr: Paddr,
    /// Kernel-visible address of the root table.
    root_vaddr: Vaddr,
    falloc: Arc<dyn FrameAllocator>,
    stats: PtStats,
}

/// Physical roots of the hierarchies active per CPU.
static ACTIVE_ROOT: [AtomicUsize; config::NR_CPUS] = {
    const NONE: AtomicUsize = AtomicUsize::new(usize::MAX);
    [NONE; config::NR_CPUS]
};

static LARGEST_PAGE_LEVEL: spin::Once<PagingLevel> = spin::Once::new();

/// The largest level that can map a page, discovered on first use.
pub(crate) fn largest_page_level() -> PagingLevel {
    *LARGEST_PAGE_LEVEL.call_once(|| {
        let mut lvl = PT_LEVELS - 1;
        while lvl > BASE_PAGE_LEVEL && !level_has_pages(lvl) {
            lvl -= 1;
        }
        lvl
    })
}

/// Find the largest supported level at which pages of `len` bytes starting
/// at `vaddr`/`paddr` can be mapped. Callers pass zero for addresses whose
/// alignment should not constrain the choice.
pub(crate) fn largest_level(
    vaddr: Vaddr,
    paddr: Paddr,
    len: usize,
    max_level: PagingLevel,
) -> PagingLevel {
    let mut lvl = max_level;
    while lvl > BASE_PAGE_LEVEL {
        if level_has_pages(lvl)
            && page_aligned(vaddr, lvl)
            && page_aligned(paddr, lvl)
            && page_size(lvl) <= len
        {
            return lvl;
        }
        lvl -= 1;
    }
    BASE_PAGE_LEVEL
}

pub(crate) fn pte_read(table_vaddr: Vaddr, idx: usize) -> Pte {
    debug_assert!(idx < PT_PTES);
    // SAFETY: the address designates a live table of a hierarchy the caller
    // operates on; tables stay allocated while reachable from a root.
    unsafe { (table_vaddr as *const Pte).add(idx).read_volatile() }
}

pub(crate) fn pte_write(table_vaddr: Vaddr, idx: usize, pte: Pte) {
    debug_assert!(idx < PT_PTES);
    // SAFETY: as for `pte_read`; the public mutating entry points are unsafe
    // and their callers vouch for the translations being written.
    unsafe { (table_vaddr as *mut Pte).add(idx).write_volatile(pte) }
}

/// Kernel-visible address of the table an entry links to.
pub(crate) fn pte_table_vaddr(pte: Pte, level: PagingLevel) -> Vaddr {
    arch::paddr_to_vaddr(pte.paddr(level))
}

impl PageTable {
    /// Create a hierarchy over the physical range `[start, start + len)`.
    ///
    /// The range seeds a fresh [`BitmapFramePool`]; the hierarchy currently
    /// installed in hardware is adopted as the root so existing mappings
    /// become part of the new hierarchy (frames they reference need not stem
    /// from the pool; returning them later is silently ignored).
    pub fn init(start: Paddr, len: usize) -> Result<PageTable> {
        let pool = BitmapFramePool::new();
        pool.add_memory(start, len)?;
        Self::with_allocator(Arc::new(pool))
    }

    /// Adopt the hardware-installed hierarchy, backed by `falloc`.
    pub fn with_allocator(falloc: Arc<dyn FrameAllocator>) -> Result<PageTable> {
        // First-use discovery of the largest supported page size.
        let _ = largest_page_level();

        let root_paddr = arch::pt_read_base();
        Ok(PageTable {
            root_paddr,
            root_vaddr: arch::paddr_to_vaddr(root_paddr),
            falloc,
            stats: PtStats::new(),
        })
    }

    /// Extend the backing frame pool by a further physical range.
    pub fn add_memory(&self, start: Paddr, len: usize) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        self.falloc.add_memory(start, len)
    }

    /// Physical address of the root table.
    pub fn root_paddr(&self) -> Paddr {
        self.root_paddr
    }

    /// The frame allocator backing this hierarchy.
    pub fn frame_allocator(&self) -> &Arc<dyn FrameAllocator> {
        &self.falloc
    }

    /// Install this hierarchy in the translation-base register.
    ///
    /// # Safety
    ///
    /// The hierarchy must map the kernel at its current addresses.
    pub unsafe fn activate(&self) {
        // SAFETY: upheld by the caller.
        unsafe { arch::pt_write_base(self.root_paddr) };
        ACTIVE_ROOT[arch::cpu_id()].store(self.root_paddr, Ordering::Relaxed);
        log::trace!("activated page table {:#x}", self.root_paddr);
    }

    /// Whether this hierarchy is the one active on the current CPU. Edits of
    /// present entries only need TLB maintenance if it is.
    pub(crate) fn is_active(&self) -> bool {
        ACTIVE_ROOT[arch::cpu_id()].load(Ordering::Relaxed) == self.root_paddr
    }

    /// Duplicate this hierarchy.
    ///
    /// With [`PageFlags::CLONE_NEW`] the result is an empty hierarchy with a
    /// fresh root. Otherwise every non-leaf table is deep-copied while leaf
    /// frames are shared between the hierarchies. On failure everything
    /// allocated so far is released and `self` is unchanged.
    pub fn clone_tree(&self, flags: PageFlags) -> Result<PageTable> {
        let mut lvl = PT_LEVELS - 1;
        let mut svaddr_cache = [0 as Vaddr; PT_LEVELS];
        let mut dvaddr_cache = [0 as Vaddr; PT_LEVELS];
        let mut idx_cache = [0usize; PT_LEVELS];

        let mut dst = PageTable {
            root_paddr: 0,
            root_vaddr: 0,
            falloc: self.falloc.clone(),
            stats: PtStats::new(),
        };

        let mut pt_svaddr = self.root_vaddr;
        svaddr_cache[lvl] = pt_svaddr;

        let (mut pt_dvaddr, dpaddr_root) = dst.pt_alloc(lvl)?;
        dvaddr_cache[lvl] = pt_dvaddr;

        if !flags.contains(PageFlags::CLONE_NEW) {
            let mut pte_idx = 0;
            loop {
                let pte = pte_read(pt_svaddr, pte_idx);

                // A lower-level table: copy it and descend.
                if pte.is_present(lvl) && !pte.is_leaf(lvl) {
                    let (dvaddr, dpaddr) = match dst.pt_alloc(lvl - 1) {
                        Ok(t) => t,
                        Err(e) => {
                            self.clone_abort(&dst, dvaddr_cache[PT_LEVELS - 1]);
                            return Err(e);
                        }
                    };

                    pt_svaddr = pte_table_vaddr(pte, lvl);
                    let link = arch::pte_table(dpaddr, lvl, pte, lvl);
                    pte_write(dvaddr_cache[lvl], pte_idx, link);

                    idx_cache[lvl] = pte_idx;

                    debug_assert!(lvl > BASE_PAGE_LEVEL);
                    lvl -= 1;

                    svaddr_cache[lvl] = pt_svaddr;
                    dvaddr_cache[lvl] = dvaddr;
                    pt_dvaddr = dvaddr;

                    pte_idx = 0;
                    continue;
                }

                if pte.is_present(lvl) {
                    debug_assert!(pte.is_leaf(lvl));
                    dst.stats.page_mapped(lvl);
                }

                // Copy whatever entry is here, present or not.
                pte_write(pt_dvaddr, pte_idx, pte);

                // Reached the last entry of this table: walk up until an
                // index advances.
                if pte_idx == PT_PTES - 1 {
                    loop {
                        if lvl == PT_LEVELS - 1 {
                            break;
                        }
                        lvl += 1;
                        pte_idx = idx_cache[lvl];
                        if pte_idx != PT_PTES - 1 {
                            break;
                        }
                    }
                    pt_svaddr = svaddr_cache[lvl];
                    pt_dvaddr = dvaddr_cache[lvl];
                }

                pte_idx += 1;
                if pte_idx == PT_PTES {
                    break;
                }
            }
            debug_assert_eq!(lvl, PT_LEVELS - 1);
        }

        dst.root_paddr = dpaddr_root;
        dst.root_vaddr = dvaddr_cache[PT_LEVELS - 1];
        Ok(dst)
    }

    fn clone_abort(&self, dst: &PageTable, dst_root_vaddr: Vaddr) {
        // Frames are shared with `self`, so only the tables go.
        unmap::unmap_walk(
            dst,
            dst_root_vaddr,
            PT_LEVELS - 1,
            None,
            usize::MAX,
            PageFlags::KEEP_FRAMES,
        )
        .expect("cancelling a partial clone cannot fail");
        dst.pt_free(dst_root_vaddr, PT_LEVELS - 1);
    }

    /// Tear the hierarchy down, releasing every table and, unless
    /// [`PageFlags::KEEP_FRAMES`] is given, every mapped frame.
    ///
    /// # Safety
    ///
    /// The hierarchy must not be active on any CPU.
    pub unsafe fn release(self, flags: PageFlags) -> Result<()> {
        unmap::unmap_walk(
            &self,
            self.root_vaddr,
            PT_LEVELS - 1,
            None,
            usize::MAX,
            flags & PageFlags::KEEP_FRAMES,
        )?;
        self.pt_free(self.root_vaddr, PT_LEVELS - 1);
        Ok(())
    }

    /// Walk towards `to_level` and report where the descent stopped: at
    /// `to_level`, at a non-present entry, or at a larger-page leaf.
    pub fn walk(&self, vaddr: Vaddr, to_level: PagingLevel) -> Result<PtWalk> {
        if to_level >= PT_LEVELS || vaddr > arch::VADDR_MAX {
            return Err(Error::Invalid);
        }

        let mut lvl = PT_LEVELS - 1;
        let mut table_vaddr = self.root_vaddr;
        loop {
            let pte = pte_read(table_vaddr, pt_idx(vaddr, lvl));
            if lvl == to_level || !pte.is_present(lvl) || pte.is_leaf(lvl) {
                return Ok(PtWalk {
                    level: lvl,
                    table_vaddr,
                    pte,
                });
            }
            table_vaddr = pte_table_vaddr(pte, lvl);
            lvl -= 1;
        }
    }

    /// Map `count` pages starting at `vaddr`.
    ///
    /// `paddr` gives the first backing frame; with `None` the engine
    /// allocates frames itself, falling back to smaller page sizes when
    /// large contiguous runs are not available. The page size is taken from
    /// `flags` and treated as a hint unless [`PageFlags::FORCE_SIZE`].
    /// Mapping over a present page fails with [`Error::Exists`].
    ///
    /// # Safety
    ///
    /// The caller must ensure the installed translations do not break
    /// kernel memory safety.
    pub unsafe fn map_pages(
        &self,
        vaddr: Vaddr,
        paddr: Option<Paddr>,
        count: usize,
        attr: PageAttr,
        flags: PageFlags,
    ) -> Result<()> {
        // SAFETY: upheld by the caller.
        unsafe { self.map_pages_with(vaddr, paddr, count, attr, flags, None) }
    }

    /// Like [`PageTable::map_pages`], with a per-slot [`PageMapper`].
    ///
    /// With a mapper, larger pages in the way are split down to the target
    /// level and present slots are offered to the mapper instead of failing.
    ///
    /// # Safety
    ///
    /// As for [`PageTable::map_pages`].
    pub unsafe fn map_pages_with(
        &self,
        vaddr: Vaddr,
        paddr: Option<Paddr>,
        count: usize,
        attr: PageAttr,
        flags: PageFlags,
        mapper: Option<&mut dyn PageMapper>,
    ) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let level = flags.level();
        if level >= PT_LEVELS || !level_has_pages(level) {
            return Err(Error::Invalid);
        }
        if count > usize::MAX / page_size(level) {
            return Err(Error::Invalid);
        }
        let len = count * page_size(level);
        if !page_aligned(vaddr, level) || !vaddr_range_valid(vaddr, len) {
            return Err(Error::Invalid);
        }
        if let Some(pa) = paddr {
            if !page_aligned(pa, level) {
                return Err(Error::Invalid);
            }
        }

        map::map_walk(
            self,
            self.root_vaddr,
            PT_LEVELS - 1,
            vaddr,
            paddr,
            len,
            attr,
            flags,
            Pte::invalid(BASE_PAGE_LEVEL),
            BASE_PAGE_LEVEL,
            mapper,
        )
    }

    /// Unmap `count` pages starting at `vaddr`, or the whole hierarchy's
    /// mappings when `vaddr` is `None`.
    ///
    /// Larger pages straddling the range boundary are split first. Freed
    /// frames return to the allocator unless [`PageFlags::KEEP_FRAMES`];
    /// tables left without a single valid entry are reclaimed unless
    /// [`PageFlags::KEEP_PTES`]. Unmapping non-present pages succeeds.
    ///
    /// # Safety
    ///
    /// The caller must ensure nothing relies on the removed translations.
    pub unsafe fn unmap_pages(
        &self,
        vaddr: Option<Vaddr>,
        count: usize,
        flags: PageFlags,
    ) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let len = match vaddr {
            None => usize::MAX,
            Some(va) => self.range_len(va, count, flags)?,
        };
        unmap::unmap_walk(self, self.root_vaddr, PT_LEVELS - 1, vaddr, len, flags)
    }

    /// Change the attributes of `count` mapped pages starting at `vaddr`
    /// (or of every mapping when `vaddr` is `None`), preserving the
    /// physical mapping. Larger pages straddling the boundary are split; no
    /// frames or tables are released.
    ///
    /// # Safety
    ///
    /// The caller must ensure the new attributes do not break kernel memory
    /// safety (e.g. revoking write access from memory the kernel writes).
    pub unsafe fn set_attr(
        &self,
        vaddr: Option<Vaddr>,
        count: usize,
        attr: PageAttr,
        flags: PageFlags,
    ) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let len = match vaddr {
            None => usize::MAX,
            Some(va) => self.range_len(va, count, flags)?,
        };
        unmap::set_attr_walk(self, self.root_vaddr, PT_LEVELS - 1, vaddr, len, attr, flags)
    }

    fn range_len(&self, vaddr: Vaddr, count: usize, flags: PageFlags) -> Result<usize> {
        let level = flags.level();
        if level >= PT_LEVELS || !level_has_pages(level) {
            return Err(Error::Invalid);
        }
        if count > usize::MAX / page_size(level) {
            return Err(Error::Invalid);
        }
        let len = count * page_size(level);
        if !page_aligned(vaddr, level) || !vaddr_range_valid(vaddr, len) {
            return Err(Error::Invalid);
        }
        Ok(len)
    }

    /// Transiently map `count` frames starting at `paddr` for kernel access.
    /// Used to prepare frames (e.g. zero-filling) before they are installed
    /// in an address space.
    pub fn kmap(&self, paddr: Paddr, count: usize) -> Result<Vaddr> {
        if count == 0 {
            return Err(Error::Invalid);
        }
        Ok(arch::paddr_to_vaddr(paddr))
    }

    /// Undo [`PageTable::kmap`]. The window comes from the direct map, so
    /// nothing needs tearing down; other architectures may hook real
    /// transient mappings here.
    pub fn kunmap(&self, _vaddr: Vaddr, _count: usize) {}

    /// A snapshot of the per-level diagnostic counters.
    pub fn stats(&self) -> PtStatsSnapshot {
        let mut snap = PtStatsSnapshot::default();
        for lvl in 0..PT_LEVELS {
            snap.pages[lvl] = self.stats.pages[lvl].load(Ordering::Relaxed);
            snap.tables[lvl] = self.stats.tables[lvl].load(Ordering::Relaxed);
            snap.splits[lvl] = self.stats.splits[lvl].load(Ordering::Relaxed);
        }
        snap
    }

    /// Allocate and clear a page table serving `level`.
    fn pt_alloc(&self, level: PagingLevel) -> Result<(Vaddr, Paddr)> {
        debug_assert!(level < PT_LEVELS);
        let paddr = self.falloc.falloc(1, FallocFlags::ALIGNED)?;
        let vaddr = arch::paddr_to_vaddr(paddr);
        for i in 0..PT_PTES {
            pte_write(vaddr, i, Pte::invalid(level));
        }
        self.stats.tables[level].fetch_add(1, Ordering::Relaxed);
        Ok((vaddr, paddr))
    }

    /// Release a page table serving `level`.
    fn pt_free(&self, table_vaddr: Vaddr, level: PagingLevel) {
        debug_assert!(level < PT_LEVELS);
        let paddr = arch::vaddr_to_paddr(table_vaddr);
        self.pg_ffree(paddr, BASE_PAGE_LEVEL);
        let prev = self.stats.tables[level].fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0);
    }

    /// Allocate the self-aligned contiguous frames backing one page of the
    /// given level.
    fn pg_falloc(&self, level: PagingLevel) -> Result<Paddr> {
        debug_assert!(level < PT_LEVELS);
        let count = 1 << (page_shift(level) - PAGE_SHIFT);
        self.falloc.falloc(count, FallocFlags::ALIGNED)
    }

    /// Return the frames backing one page of the given level. Frames the
    /// allocator does not know (adopted boot mappings, shared clone leaves)
    /// are silently left alone.
    fn pg_ffree(&self, paddr: Paddr, level: PagingLevel) {
        debug_assert!(level < PT_LEVELS);
        let count = 1 << (page_shift(level) - PAGE_SHIFT);
        let _ = self.falloc.ffree(paddr, count);
    }
}
