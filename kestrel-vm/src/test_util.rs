// SPDX-License-Identifier: MPL-2.0

//! Test fixture: an in-memory "physical" arena behind the emulated direct
//! map, plus a boot shim that stands in for the platform loader.
//!
//! The emulated machine state (direct-map base, translation-base register)
//! is process-global, so tests serialise on one lock and each test carves
//! fresh, never-reused ranges out of the arena.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicUsize, Ordering};

use std::sync::{Mutex, MutexGuard};

use crate::{
    arch::{self, PAGE_SIZE},
    frame::{BitmapFramePool, FrameAllocator},
    pt::PageTable,
    Paddr,
};

const ARENA_SIZE: usize = 256 * 1024 * 1024;
const HUGE_ALIGN: usize = 1 << 21;

struct Arena {
    cursor: AtomicUsize,
}

impl Arena {
    fn carve(&self, len: usize, align: usize) -> Paddr {
        let cur = self.cursor.load(Ordering::Relaxed);
        let start = (cur + align - 1) & !(align - 1);
        assert!(start + len <= ARENA_SIZE, "test arena exhausted");
        self.cursor.store(start + len, Ordering::Relaxed);
        start
    }
}

static ARENA: spin::Once<Arena> = spin::Once::new();
static ENV_LOCK: Mutex<()> = Mutex::new(());

fn arena() -> &'static Arena {
    ARENA.call_once(|| {
        let layout = std::alloc::Layout::from_size_align(ARENA_SIZE, HUGE_ALIGN).unwrap();
        // Stands in for physical memory for the whole test run.
        let base = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!base.is_null());
        arch::set_direct_map_base(base as usize);
        Arena {
            cursor: AtomicUsize::new(0),
        }
    })
}

/// Holds the emulated machine serialised for one test.
pub(crate) struct TestEnv {
    _guard: MutexGuard<'static, ()>,
}

fn boot_at(pool_pages: usize, pool_align: usize) -> (TestEnv, PageTable, Arc<BitmapFramePool>) {
    let guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    let a = arena();

    // Fresh carvings are zero-filled; the root is valid as-is. It lies
    // outside the pool, like a loader-provided table would.
    let root = a.carve(PAGE_SIZE, PAGE_SIZE);
    // SAFETY: emulated register on hosted targets.
    unsafe { arch::pt_write_base(root) };

    let pool = Arc::new(BitmapFramePool::new());
    let base = a.carve(pool_pages * PAGE_SIZE, pool_align);
    pool.add_memory(base, pool_pages * PAGE_SIZE).unwrap();

    let pt = PageTable::with_allocator(pool.clone()).unwrap();

    (TestEnv { _guard: guard }, pt, pool)
}

/// "Boot" with a pool aligned for the largest page sizes.
pub(crate) fn boot(pool_pages: usize) -> (TestEnv, PageTable, Arc<BitmapFramePool>) {
    boot_at(pool_pages, HUGE_ALIGN)
}

/// "Boot" with a pool deliberately misaligned so that no self-aligned huge
/// run exists in it.
pub(crate) fn boot_unaligned(pool_pages: usize) -> (TestEnv, PageTable, Arc<BitmapFramePool>) {
    let (env, pt, pool) = {
        let guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let a = arena();

        let root = a.carve(PAGE_SIZE, PAGE_SIZE);
        // SAFETY: emulated register on hosted targets.
        unsafe { arch::pt_write_base(root) };

        let pool = Arc::new(BitmapFramePool::new());
        let base = a.carve((pool_pages + 1) * PAGE_SIZE, HUGE_ALIGN) + PAGE_SIZE;
        pool.add_memory(base, pool_pages * PAGE_SIZE).unwrap();

        let pt = PageTable::with_allocator(pool.clone()).unwrap();
        (TestEnv { _guard: guard }, pt, pool)
    };
    (env, pt, pool)
}

/// A never-managed frame address, outside every pool.
pub(crate) fn foreign_frame() -> Paddr {
    arena().carve(PAGE_SIZE, PAGE_SIZE)
}
