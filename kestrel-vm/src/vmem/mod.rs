// SPDX-License-Identifier: MPL-2.0

//! The virtual-address-space manager.
//!
//! A [`Vas`] composes the page-granular mappings of one [`PageTable`] into an
//! ordered set of non-overlapping regions. Each region delegates its policy
//! to a [`VmaOps`] implementation: where to place the region, how to back a
//! faulting page, whether it may be split or merged, and how to react to
//! advice. The manager takes care of the mechanics (first-fit placement,
//! boundary splits, merging of compatible neighbours, attribute changes and
//! fault routing) so that region kinds only differ where they must.
//!
//! Two lock levels protect a space: `map_lock` serialises structural
//! operations (map, unmap, attribute changes) including their page-table
//! edits, while the region set itself sits under a reader/writer lock shared
//! with the fault path. The fault router never holds either lock across a
//! region's `fault` handler; it works on a snapshot ([`VmaInfo`]).

mod anon;
mod fault;
mod stack;
#[cfg(test)]
mod test;

pub use anon::{AnonOps, ANON_VMA_OPS};
pub use fault::{
    fault_type_from_code, handle_fault, handle_hw_fault, FaultStatus, FaultType, VmFault,
};
pub use stack::{StackOps, STACK_VMA_OPS};

use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};

use align_ext::AlignExt;

use crate::{
    arch::{self, level_has_pages, page_aligned, page_shift, page_size, vaddr_range_valid,
        PAGE_SIZE, PT_LEVELS, VADDR_MAX},
    config,
    pt::{PageAttr, PageFlags, PageTable, BASE_PAGE_LEVEL},
    Error, PagingLevel, Result, Vaddr,
};

bitflags::bitflags! {
    /// Behaviour of a whole address space.
    pub struct VasFlags: u32 {
        /// The space only reserves address ranges; faults are never served.
        const NO_PAGING = 1 << 0;
    }
}

bitflags::bitflags! {
    /// Per-region state.
    pub struct VmaFlags: u32 {
        /// Freshly backed pages are not zero-filled.
        const UNINITIALIZED = 1 << 0;
        /// Never merge this region with a neighbour.
        const NO_MERGE = 1 << 1;
    }
}

bitflags::bitflags! {
    /// Options for the mapping operations of a [`Vas`].
    pub struct VmaMapFlags: u32 {
        /// Back every page eagerly instead of on first access.
        const POPULATE = 1 << 0;
        /// Replace colliding regions instead of failing with `Exists`.
        const REPLACE = 1 << 1;
        /// Do not zero-fill freshly backed pages.
        const UNINITIALIZED = 1 << 2;
        /// Fail on ranges that are not fully covered by regions.
        const STRICT = 1 << 3;
    }
}

bitflags::bitflags! {
    /// Paging advice. `WILLNEED` takes precedence over `DONTNEED`.
    pub struct Advice: u32 {
        /// Back missing pages now; already present pages are left alone.
        const WILLNEED = 1 << 0;
        /// Drop the backing frames. This matches the aggressive semantics
        /// of Linux: the memory is freed, not merely marked for swap-out,
        /// and reads after the call observe fresh zero-filled pages.
        const DONTNEED = 1 << 1;
    }
}

/// Policy hooks of a region kind. Only [`VmaOps::fault`] is mandatory; every
/// other hook defaults to the engine behaviour.
///
/// Except for `fault`, hooks may be invoked with the address-space structure
/// locks held and must not call back into mapping operations of the same
/// space.
pub trait VmaOps: Sync {
    /// Preferred base address for placing a region of this kind when the
    /// caller did not give one.
    fn get_base(&self, vas: &Vas, flags: VmaMapFlags) -> Option<Vaddr> {
        let _ = (vas, flags);
        None
    }

    /// Validate a region about to be created; may adjust its flags.
    fn on_new(
        &self,
        vas: &Vas,
        vaddr: Vaddr,
        len: usize,
        attr: PageAttr,
        flags: &mut VmaFlags,
    ) -> Result<()> {
        let _ = (vas, vaddr, len, attr, flags);
        Ok(())
    }

    /// Release per-region state after the region left the address space.
    fn destroy(&self, vas: &Vas, vma: &VmaInfo) {
        let _ = (vas, vma);
    }

    /// Produce the physical frame backing one page of the region by filling
    /// in `fault.paddr`, or direct the engine with a [`FaultStatus`].
    fn fault(&self, vas: &Vas, vma: &VmaInfo, fault: &mut VmFault) -> Result<FaultStatus>;

    /// Remove the translations of part of the region.
    fn unmap(&self, vas: &Vas, vma: &VmaInfo, vaddr: Vaddr, len: usize) -> Result<()> {
        default_unmap(vas, vma, vaddr, len)
    }

    /// Approve or veto splitting the region at `at`.
    fn split(&self, vas: &Vas, vma: &VmaInfo, at: Vaddr) -> Result<()> {
        let _ = (vas, vma, at);
        Ok(())
    }

    /// Approve or veto merging the region with the adjacent next one.
    fn merge(&self, vas: &Vas, vma: &VmaInfo, next: &VmaInfo) -> Result<()> {
        let _ = (vas, vma, next);
        Ok(())
    }

    /// Apply new access attributes to the whole region.
    fn set_attr(&self, vas: &Vas, vma: &VmaInfo, attr: PageAttr) -> Result<()> {
        default_set_attr(vas, vma, attr)
    }

    /// Apply paging advice to part of the region.
    fn advise(
        &self,
        vas: &Vas,
        vma: &VmaInfo,
        vaddr: Vaddr,
        len: usize,
        advice: Advice,
    ) -> Result<()> {
        default_advise(vas, vma, vaddr, len, advice)
    }
}

/// Default unmap: drop the translations and free the backing frames.
pub fn default_unmap(vas: &Vas, vma: &VmaInfo, vaddr: Vaddr, len: usize) -> Result<()> {
    debug_assert!(vaddr >= vma.start && vaddr + len <= vma.end);
    debug_assert!(page_aligned(len, BASE_PAGE_LEVEL));
    // SAFETY: the range lies within a region of this address space; nothing
    // outside the space relies on these translations.
    unsafe {
        vas.pt
            .unmap_pages(Some(vaddr), len / PAGE_SIZE, PageFlags::empty())
    }
}

/// Default attribute change: rewrite the region's leaf entries in place.
pub fn default_set_attr(vas: &Vas, vma: &VmaInfo, attr: PageAttr) -> Result<()> {
    // SAFETY: as for `default_unmap`; the mapping itself is preserved.
    unsafe {
        vas.pt
            .set_attr(Some(vma.start), vma.len() / PAGE_SIZE, attr, PageFlags::empty())
    }
}

/// Default advice handling; see [`Advice`].
pub fn default_advise(
    vas: &Vas,
    vma: &VmaInfo,
    vaddr: Vaddr,
    len: usize,
    advice: Advice,
) -> Result<()> {
    if advice.contains(Advice::WILLNEED) {
        let (flags, lvl) = match vma.page_level {
            Some(l) => (PageFlags::size(l) | PageFlags::FORCE_SIZE, l),
            None => (PageFlags::empty(), BASE_PAGE_LEVEL),
        };
        let mut mapper = fault::AdviseMapper::new(vas, *vma);
        // SAFETY: only pages inside the region are populated.
        unsafe {
            vas.pt.map_pages_with(
                vaddr,
                None,
                len >> page_shift(lvl),
                vma.attr,
                flags,
                Some(&mut mapper),
            )?;
        }
    } else if advice.contains(Advice::DONTNEED) {
        default_unmap(vas, vma, vaddr, len)?;
    }
    Ok(())
}

/// One region of an address space: a half-open interval with uniform
/// attributes and a single set of policy hooks.
struct Vma {
    start: Vaddr,
    end: Vaddr,
    attr: PageAttr,
    flags: VmaFlags,
    /// Forced page size; `None` lets the engine choose.
    page_level: Option<PagingLevel>,
    name: Option<&'static str>,
    ops: &'static dyn VmaOps,
}

impl Vma {
    fn info(&self) -> VmaInfo {
        VmaInfo {
            start: self.start,
            end: self.end,
            attr: self.attr,
            flags: self.flags,
            page_level: self.page_level,
            name: self.name,
            ops: self.ops,
        }
    }

    fn align_level(&self) -> PagingLevel {
        self.page_level.unwrap_or(BASE_PAGE_LEVEL)
    }
}

/// Immutable snapshot of a region, handed to policy hooks and lookups. The
/// region may change or vanish once the snapshot was taken.
#[derive(Clone, Copy)]
pub struct VmaInfo {
    pub start: Vaddr,
    pub end: Vaddr,
    pub attr: PageAttr,
    pub flags: VmaFlags,
    pub page_level: Option<PagingLevel>,
    pub name: Option<&'static str>,
    pub(crate) ops: &'static dyn VmaOps,
}

impl VmaInfo {
    pub fn len(&self) -> usize {
        debug_assert!(self.end > self.start);
        self.end - self.start
    }

    pub(crate) fn align_level(&self) -> PagingLevel {
        self.page_level.unwrap_or(BASE_PAGE_LEVEL)
    }
}

/// One virtual address space: an ordered, non-overlapping set of regions
/// over a translation hierarchy.
pub struct Vas {
    pt: PageTable,
    /// Placement base for regions whose ops do not provide one.
    base: Vaddr,
    flags: VasFlags,
    /// Serialises structural operations and their page-table edits.
    map_lock: spin::Mutex<()>,
    /// The region set, keyed by start address. Shared with the fault path.
    vmas: spin::RwLock<BTreeMap<Vaddr, Vma>>,
}

/// The address space active per CPU.
static ACTIVE_VAS: [spin::Mutex<Option<Arc<Vas>>>; config::NR_CPUS] = {
    const NONE: spin::Mutex<Option<Arc<Vas>>> = spin::Mutex::new(None);
    [NONE; config::NR_CPUS]
};

/// Make `vas` the active address space of the current CPU, installing its
/// translation hierarchy in hardware.
///
/// # Safety
///
/// The backing hierarchy must map the kernel at its current addresses.
pub unsafe fn set_active(vas: &Arc<Vas>) {
    // SAFETY: upheld by the caller.
    unsafe { vas.pt.activate() };
    *ACTIVE_VAS[arch::cpu_id()].lock() = Some(vas.clone());
}

/// The address space active on the current CPU, if any.
pub fn get_active() -> Option<Arc<Vas>> {
    ACTIVE_VAS[arch::cpu_id()].lock().clone()
}

fn clear_active_if(vas: &Vas) {
    let mut slot = ACTIVE_VAS[arch::cpu_id()].lock();
    if slot
        .as_ref()
        .is_some_and(|a| core::ptr::eq(Arc::as_ptr(a), vas))
    {
        *slot = None;
    }
}

fn ops_eq(a: &'static dyn VmaOps, b: &'static dyn VmaOps) -> bool {
    core::ptr::eq(a as *const dyn VmaOps as *const (), b as *const dyn VmaOps as *const ())
}

fn can_merge(a: &Vma, b: &Vma) -> bool {
    a.end == b.start
        && ops_eq(a.ops, b.ops)
        && a.attr == b.attr
        && a.flags == b.flags
        && !a.flags.contains(VmaFlags::NO_MERGE)
        && a.page_level == b.page_level
        && a.name == b.name
}

/// First region overlapping `[vaddr, vaddr + max(len, 1))`, by start key.
fn find_overlap(map: &BTreeMap<Vaddr, Vma>, vaddr: Vaddr, len: usize) -> Option<Vaddr> {
    let vend = vaddr + len.max(1);
    if let Some((&key, vma)) = map.range(..=vaddr).next_back() {
        if vma.end > vaddr {
            return Some(key);
        }
    }
    map.range(vaddr..vend).next().map(|(&key, _)| key)
}

/// Resolve `[vaddr, vaddr + len)` to the regions covering it.
///
/// In strict mode the range must be fully covered without holes. Otherwise
/// it is clamped to the covered extent. Partial coverage of a region demands
/// the boundary to be aligned to the region's page size.
fn find_range(
    map: &BTreeMap<Vaddr, Vma>,
    vaddr: Vaddr,
    len: usize,
    strict: bool,
) -> Result<(Vaddr, usize, Vaddr, Vaddr)> {
    let mut vstart = vaddr;
    let mut vend = vaddr + len;

    let start_key = find_overlap(map, vaddr, len).ok_or(Error::NotFound)?;
    let start = &map[&start_key];

    debug_assert!(vstart < start.end);
    if vstart < start.start {
        if strict {
            return Err(Error::NotFound);
        }
        vstart = start.start;
    } else if vstart > start.start && !page_aligned(vstart, start.align_level()) {
        return Err(Error::Invalid);
    }

    let mut end_key = start_key;
    if len > 0 {
        loop {
            let cur = &map[&end_key];
            if vend > cur.start && vend <= cur.end {
                break;
            }
            let Some((&next_key, next)) = map
                .range((core::ops::Bound::Excluded(end_key), core::ops::Bound::Unbounded))
                .next()
            else {
                break;
            };
            // Strict ranges must not contain holes between regions.
            if strict && cur.end != next.start {
                return Err(Error::NotFound);
            }
            if vend <= next.start {
                break;
            }
            end_key = next_key;
        }

        let end = &map[&end_key];
        if vend > end.end {
            if strict {
                return Err(Error::NotFound);
            }
            vend = end.end;
        } else if vend < end.end && !page_aligned(vend, end.align_level()) {
            return Err(Error::Invalid);
        }
    }

    debug_assert!(vend > vstart);
    debug_assert!(vstart >= map[&start_key].start && vstart < map[&start_key].end);
    debug_assert!(vend > map[&end_key].start && vend <= map[&end_key].end);

    Ok((vstart, vend - vstart, start_key, end_key))
}

fn need_split(vma: &Vma, part_len: usize, attr: Option<PageAttr>) -> bool {
    part_len > 0 && attr.map_or(true, |a| vma.attr != a)
}

/// First-fit scan for a free range of `len` bytes at `align`ment, starting
/// at `base`. Every step is overflow-checked; address spaces can legally run
/// out of room.
fn first_fit(map: &BTreeMap<Vaddr, Vma>, base: Vaddr, align: usize, len: usize) -> Option<Vaddr> {
    let mut vaddr = base;
    for cur in map.values() {
        if vaddr > VADDR_MAX - align {
            return None;
        }
        vaddr = vaddr.align_up(align);
        if vaddr > VADDR_MAX - len {
            return None;
        }
        if vaddr + len <= cur.start {
            return Some(vaddr);
        }
        vaddr = cur.end.max(base);
    }

    if vaddr > VADDR_MAX - align {
        return None;
    }
    let vaddr = vaddr.align_up(align);
    if vaddr > VADDR_MAX - len {
        return None;
    }
    Some(vaddr)
}

impl Vas {
    /// Create an address space over `pt`.
    pub fn new(pt: PageTable, flags: VasFlags) -> Arc<Vas> {
        Arc::new(Vas {
            pt,
            base: config::DEFAULT_MAP_BASE,
            flags,
            map_lock: spin::Mutex::new(()),
            vmas: spin::RwLock::new(BTreeMap::new()),
        })
    }

    pub fn page_table(&self) -> &PageTable {
        &self.pt
    }

    pub fn flags(&self) -> VasFlags {
        self.flags
    }

    /// The region covering `vaddr`, if any.
    pub fn find(&self, vaddr: Vaddr) -> Option<VmaInfo> {
        let map = self.vmas.read();
        find_overlap(&map, vaddr, 0).map(|key| map[&key].info())
    }

    /// Map a region of `len` bytes.
    ///
    /// With `vaddr` of `None` the region is placed by first-fit scan from
    /// the ops' preferred base (or the space default). A concrete `vaddr`
    /// that collides with existing regions fails with [`Error::Exists`]
    /// unless [`VmaMapFlags::REPLACE`] unmaps the overlapped portions first.
    /// `page_level` forces a page size for the whole region; alignment and
    /// length must fit it. [`VmaMapFlags::POPULATE`] backs all pages
    /// eagerly through the region's fault handler.
    ///
    /// Returns the placed base address.
    pub fn map(
        &self,
        vaddr: Option<Vaddr>,
        len: usize,
        attr: PageAttr,
        flags: VmaMapFlags,
        page_level: Option<PagingLevel>,
        name: Option<&'static str>,
        ops: &'static dyn VmaOps,
    ) -> Result<Vaddr> {
        if len == 0 {
            return Err(Error::Invalid);
        }
        let algn_lvl = match page_level {
            Some(l) if l >= PT_LEVELS || !level_has_pages(l) => return Err(Error::Invalid),
            Some(l) => l,
            None => BASE_PAGE_LEVEL,
        };
        if !page_aligned(len, algn_lvl) {
            return Err(Error::Invalid);
        }

        let _guard = self.map_lock.lock();

        let mut replaced: Vec<Vma> = Vec::new();
        let va = match vaddr {
            None => {
                // Place the region in the first sufficient gap above the
                // preferred base.
                let base = ops.get_base(self, flags).unwrap_or(self.base);
                let map = self.vmas.read();
                first_fit(&map, base, page_size(algn_lvl), len).ok_or(Error::NoMemory)?
            }
            Some(va) => {
                if !page_aligned(va, algn_lvl) || !vaddr_range_valid(va, len) {
                    return Err(Error::Invalid);
                }
                let mut map = self.vmas.write();
                if find_overlap(&map, va, len).is_some() {
                    if !flags.contains(VmaMapFlags::REPLACE) {
                        return Err(Error::Exists);
                    }
                    let strict = flags.contains(VmaMapFlags::STRICT);
                    let (s, e) = self.split_vmas(&mut map, va, len, None, strict)?;
                    let keys: Vec<Vaddr> = map.range(s..=e).map(|(&k, _)| k).collect();
                    for k in keys {
                        replaced.push(map.remove(&k).unwrap());
                    }
                }
                va
            }
        };

        debug_assert!(page_aligned(va, algn_lvl));
        if !vaddr_range_valid(va, len) {
            return Err(Error::Invalid);
        }

        let mut vma_flags = VmaFlags::empty();
        if flags.contains(VmaMapFlags::UNINITIALIZED) {
            vma_flags |= VmaFlags::UNINITIALIZED;
        }
        ops.on_new(self, va, len, attr, &mut vma_flags)?;

        // Replaced regions lose their translations before the new region
        // touches the page table.
        for vma in replaced.drain(..) {
            self.unmap_vma_pages(&vma);
            vma.ops.destroy(self, &vma.info());
        }

        let vma = Vma {
            start: va,
            end: va + len,
            attr,
            flags: vma_flags,
            page_level,
            name,
            ops,
        };

        if flags.contains(VmaMapFlags::POPULATE) {
            let info = vma.info();
            let pflags = match page_level {
                Some(l) => PageFlags::size(l) | PageFlags::FORCE_SIZE,
                None => PageFlags::empty(),
            };
            let mut mapper = fault::PopulateMapper::new(self, info);
            // SAFETY: only pages of the region being created are touched.
            let populated = unsafe {
                self.pt.map_pages_with(
                    va,
                    None,
                    len >> page_shift(algn_lvl),
                    attr,
                    pflags,
                    Some(&mut mapper),
                )
            };
            if let Err(e) = populated {
                // If regions were replaced above, the range is simply empty
                // now; that is not recoverable.
                vma.ops.destroy(self, &vma.info());
                return Err(e);
            }
        }

        let mut map = self.vmas.write();
        debug_assert!(find_overlap(&map, va, len).is_none());
        map.insert(va, vma);
        self.try_merge(&mut map, va);

        Ok(va)
    }

    /// Remove every region overlapping `[vaddr, vaddr + len)`, splitting
    /// boundary regions so the removal matches the range exactly. With
    /// [`VmaMapFlags::STRICT`] the range must be fully covered; otherwise
    /// unmapping unmapped space succeeds as a no-op.
    pub fn unmap(&self, vaddr: Vaddr, len: usize, flags: VmaMapFlags) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        if !vaddr_range_valid(vaddr, len) {
            return Err(Error::Invalid);
        }
        let strict = flags.contains(VmaMapFlags::STRICT);

        let _guard = self.map_lock.lock();

        let removed = {
            let mut map = self.vmas.write();
            match self.split_vmas(&mut map, vaddr, len, None, strict) {
                Err(Error::NotFound) if !strict => return Ok(()),
                Err(e) => return Err(e),
                Ok((s, e)) => {
                    let keys: Vec<Vaddr> = map.range(s..=e).map(|(&k, _)| k).collect();
                    keys.into_iter()
                        .map(|k| map.remove(&k).unwrap())
                        .collect::<Vec<_>>()
                }
            }
        };

        // The regions are already unreachable; tear their pages down
        // without holding the set lock.
        for vma in removed {
            self.unmap_vma_pages(&vma);
            vma.ops.destroy(self, &vma.info());
        }
        Ok(())
    }

    /// Change the access attributes of `[vaddr, vaddr + len)`. Boundary
    /// regions whose attributes differ are split so that every region keeps
    /// uniform attributes; compatible neighbours are re-merged afterwards.
    pub fn set_attr(
        &self,
        vaddr: Vaddr,
        len: usize,
        attr: PageAttr,
        flags: VmaMapFlags,
    ) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        if !vaddr_range_valid(vaddr, len) {
            return Err(Error::Invalid);
        }
        let strict = flags.contains(VmaMapFlags::STRICT);

        let _guard = self.map_lock.lock();

        let affected: Vec<Vaddr> = {
            let mut map = self.vmas.write();
            match self.split_vmas(&mut map, vaddr, len, Some(attr), strict) {
                Err(Error::NotFound) if !strict => return Ok(()),
                Err(e) => return Err(e),
                Ok((s, e)) => map.range(s..=e).map(|(&k, _)| k).collect(),
            }
        };

        for &key in &affected {
            let info = {
                let map = self.vmas.read();
                map[&key].info()
            };
            if info.attr == attr {
                continue;
            }
            if let Err(e) = info.ops.set_attr(self, &info, attr) {
                // A half-changed range cannot be reported in a way the
                // caller could recover from.
                panic!(
                    "failed to set attributes {:#x}-{:#x} to {:?}: {:?}",
                    info.start, info.end, attr, e
                );
            }
            self.vmas.write().get_mut(&key).unwrap().attr = attr;
        }

        let mut map = self.vmas.write();
        for &key in affected.iter().rev() {
            if map.contains_key(&key) {
                self.try_merge(&mut map, key);
            }
        }
        Ok(())
    }

    /// Apply `advice` to `[vaddr, vaddr + len)`, region by region.
    pub fn advise(
        &self,
        vaddr: Vaddr,
        len: usize,
        advice: Advice,
        flags: VmaMapFlags,
    ) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        if !vaddr_range_valid(vaddr, len) {
            return Err(Error::Invalid);
        }
        let strict = flags.contains(VmaMapFlags::STRICT);

        let (vstart, len, infos) = {
            let map = self.vmas.read();
            match find_range(&map, vaddr, len, strict) {
                Err(Error::NotFound) if !strict => return Ok(()),
                Err(e) => return Err(e),
                Ok((vs, l, s, e)) => {
                    let infos: Vec<VmaInfo> = map.range(s..=e).map(|(_, v)| v.info()).collect();
                    (vs, l, infos)
                }
            }
        };

        let vend = vstart + len;
        let mut va = vstart;
        for (i, info) in infos.iter().enumerate() {
            let seg_end = if i == infos.len() - 1 {
                vend
            } else {
                info.end
            };
            debug_assert!(va >= info.start && seg_end <= info.end);
            debug_assert!(page_aligned(va, info.align_level()));
            debug_assert!(page_aligned(seg_end - va, info.align_level()));

            info.ops.advise(self, info, va, seg_end - va, advice)?;

            if i + 1 < infos.len() {
                va = infos[i + 1].start;
            }
        }
        Ok(())
    }

    /// Unmap and destroy every region. The space stays usable (empty); if
    /// it is the active one, it is deactivated.
    pub fn destroy(&self) {
        let _guard = self.map_lock.lock();

        let removed: Vec<Vma> = {
            let mut map = self.vmas.write();
            let keys: Vec<Vaddr> = map.keys().copied().collect();
            keys.into_iter().map(|k| map.remove(&k).unwrap()).collect()
        };
        for vma in removed {
            self.unmap_vma_pages(&vma);
            vma.ops.destroy(self, &vma.info());
        }

        clear_active_if(self);
    }

    /// Split the region at `key` in place; `[at, end)` becomes a new region
    /// with identical attributes.
    fn split_at(&self, map: &mut BTreeMap<Vaddr, Vma>, key: Vaddr, at: Vaddr) -> Result<()> {
        let info = map[&key].info();
        debug_assert!(at > info.start && at < info.end);
        debug_assert!(page_aligned(at, info.align_level()));
        debug_assert!(page_aligned(info.end - at, info.align_level()));

        info.ops.split(self, &info, at)?;

        let second = {
            let vma = map.get_mut(&key).unwrap();
            let second = Vma {
                start: at,
                end: vma.end,
                attr: vma.attr,
                flags: vma.flags,
                page_level: vma.page_level,
                name: vma.name,
                ops: vma.ops,
            };
            vma.end = at;
            second
        };
        map.insert(at, second);
        Ok(())
    }

    /// Split boundary regions so that `[vaddr, vaddr + len)` is covered by
    /// whole regions, and return the first and last covering key.
    ///
    /// With `attr`, a boundary region is only split when its attributes
    /// differ from the target value (attribute changes leave matching
    /// boundaries alone).
    fn split_vmas(
        &self,
        map: &mut BTreeMap<Vaddr, Vma>,
        vaddr: Vaddr,
        len: usize,
        attr: Option<PageAttr>,
        strict: bool,
    ) -> Result<(Vaddr, Vaddr)> {
        let (vstart, len, mut start_key, mut end_key) = find_range(map, vaddr, len, strict)?;
        let vend = vstart + len;
        let left = vstart - map[&start_key].start;
        let right = map[&end_key].end - vend;

        if need_split(&map[&start_key], left, attr) {
            self.split_at(map, start_key, vstart)?;
            if start_key == end_key {
                end_key = vstart;
            }
            start_key = vstart;
        }

        if len > 0 {
            if need_split(&map[&end_key], right, attr) {
                if let Err(e) = self.split_at(map, end_key, vend) {
                    // Undo the first split if possible.
                    self.try_merge(map, start_key);
                    return Err(e);
                }
            }
        } else {
            debug_assert_eq!(start_key, end_key);
        }

        Ok((start_key, end_key))
    }

    /// Merge the region at `key` with its next neighbour if both sides and
    /// their hooks agree. The second record is destroyed; the mapping stays.
    fn try_merge_with_next(&self, map: &mut BTreeMap<Vaddr, Vma>, key: Vaddr) -> bool {
        let next_key = match map.get(&key) {
            Some(vma) => vma.end,
            None => return false,
        };
        let (mergeable, a_info, b_info) = match (map.get(&key), map.get(&next_key)) {
            (Some(a), Some(b)) => (can_merge(a, b), a.info(), b.info()),
            _ => return false,
        };
        if !mergeable {
            return false;
        }
        if a_info.ops.merge(self, &a_info, &b_info).is_err() {
            return false;
        }

        let second = map.remove(&next_key).unwrap();
        map.get_mut(&key).unwrap().end = second.end;
        second.ops.destroy(self, &second.info());
        true
    }

    /// Try merging at both edges of the region at `key`; returns the key of
    /// the surviving region.
    fn try_merge(&self, map: &mut BTreeMap<Vaddr, Vma>, key: Vaddr) -> Vaddr {
        self.try_merge_with_next(map, key);
        if let Some(prev_key) = map.range(..key).next_back().map(|(&k, _)| k) {
            if self.try_merge_with_next(map, prev_key) {
                return prev_key;
            }
        }
        key
    }

    /// Drop the translations of a whole region. Failure here would leave a
    /// half-mapped region in the list, so it is fatal.
    fn unmap_vma_pages(&self, vma: &Vma) {
        let len = vma.end - vma.start;
        debug_assert!(len > 0);
        debug_assert!(page_aligned(vma.start, vma.align_level()));
        debug_assert!(page_aligned(len, vma.align_level()));

        if let Err(e) = vma.ops.unmap(self, &vma.info(), vma.start, len) {
            panic!(
                "failed to unmap address range {:#x}-{:#x}: {:?}",
                vma.start, vma.end, e
            );
        }
    }

    #[cfg(test)]
    pub(crate) fn region_list(&self) -> Vec<VmaInfo> {
        self.vmas.read().values().map(|v| v.info()).collect()
    }
}

/// Zero `count` frames at `paddr` through a transient kernel window.
pub(crate) fn zero_frames(pt: &PageTable, paddr: crate::Paddr, count: usize) -> Result<()> {
    let vaddr = pt.kmap(paddr, count)?;
    // SAFETY: the window maps exactly the freshly allocated frames.
    unsafe { core::ptr::write_bytes(vaddr as *mut u8, 0, count * PAGE_SIZE) };
    pt.kunmap(vaddr, count);
    Ok(())
}
