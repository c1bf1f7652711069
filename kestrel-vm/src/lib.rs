// SPDX-License-Identifier: MPL-2.0

//! Virtual-memory core of the Kestrel library OS.
//!
//! Two components are stacked here, leaves first:
//!
//! * [`pt`], the page-table engine. It owns one or more hardware translation
//!   hierarchies and knows how to initialize, clone, map, unmap, re-attribute
//!   and tear them down, splitting and reclaiming intermediate tables as it
//!   goes. It talks downwards to a physical [`frame`] allocator and to the
//!   architecture PTE codec in [`arch`].
//!
//! * [`vmem`], the virtual-address-space manager. It composes page-granular
//!   mappings into typed regions ([`vmem::VmaOps`]) with demand paging, guard
//!   pages, attribute changes and advice, and routes page faults to the
//!   owning region. Eager population, demand faulting and advice all funnel
//!   through the same per-page callback protocol ([`pt::PageMapper`]) so that
//!   there is exactly one implementation of "produce a frame for this slot".
//!
//! The crate is `no_std` and builds both for bare metal and for hosted
//! targets. On hosted targets the privileged architecture operations
//! (translation-base register, TLB invalidation) are emulated, which lets the
//! whole engine run against in-memory page tables under `cargo test`.

#![no_std]
#![warn(unsafe_op_in_unsafe_fn)]

extern crate alloc;
#[cfg(test)]
extern crate std;

pub mod arch;
pub mod boot;
pub mod config;
mod error;
pub mod frame;
pub mod pt;
pub mod vmem;

#[cfg(test)]
mod test_util;

pub use error::{Error, Result};

/// Virtual addresses.
pub type Vaddr = usize;

/// Physical addresses.
pub type Paddr = usize;

/// A page-table level, counted upwards from the leaf level 0.
pub type PagingLevel = usize;
