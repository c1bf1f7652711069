// SPDX-License-Identifier: MPL-2.0

//! Architecture-specific parts of the paging engine: the PTE codec, the
//! per-level page-size table, TLB maintenance and the translation-base
//! register. Generic code never inspects PTE bits directly; everything goes
//! through this module.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use self::x86_64::*;
    } else {
        compile_error!("architecture not supported by the paging engine");
    }
}

/// The CPU this code is running on.
///
/// The core is single-CPU for now; the SMP port routes this to the per-CPU
/// area so that the active-space slots below stay per processor.
pub fn cpu_id() -> usize {
    0
}
