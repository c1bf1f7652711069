// SPDX-License-Identifier: MPL-2.0

//! Physical frame provisioning.
//!
//! The paging engine places a deliberately narrow contract on the physical
//! allocator behind it: hand out base frames, take them back, and tolerate
//! frames it has never seen. The latter is load bearing: a hierarchy adopted
//! at boot maps memory the allocator does not manage, and shared leaves can
//! be returned twice when two hierarchies are torn down.

mod bitmap;

pub use bitmap::BitmapFramePool;

use crate::{Paddr, Result};

bitflags::bitflags! {
    /// Options for [`FrameAllocator::falloc`].
    pub struct FallocFlags: u32 {
        /// The returned run must be contiguous and self-aligned, i.e. the
        /// physical address is a multiple of the run size.
        const ALIGNED = 1 << 0;
    }
}

/// Outcome of returning frames to an allocator.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FfreeStatus {
    /// The frames were returned to the pool.
    Freed,
    /// The address is outside every range the allocator manages.
    NotMine,
    /// The frames were not allocated, or have already been returned.
    AlreadyFree,
}

/// The contract the paging engine places on a physical frame allocator.
///
/// Implementations must be internally synchronized; one allocator may back
/// several translation hierarchies at once.
pub trait FrameAllocator: Send + Sync {
    /// Allocate `count` contiguous base frames and return the physical
    /// address of the first one.
    fn falloc(&self, count: usize, flags: FallocFlags) -> Result<Paddr>;

    /// Return `count` base frames starting at `paddr`.
    ///
    /// [`FfreeStatus::NotMine`] and [`FfreeStatus::AlreadyFree`] are ordinary
    /// outcomes, not failures; callers that overmap legacy regions or share
    /// leaves between hierarchies rely on them being harmless.
    fn ffree(&self, paddr: Paddr, count: usize) -> FfreeStatus;

    /// Extend the pool by a further physical range.
    fn add_memory(&self, base: Paddr, len: usize) -> Result<()>;

    /// Number of free bytes in the pool.
    fn free_memory(&self) -> usize;
}
