// SPDX-License-Identifier: MPL-2.0

/// The error type which is returned from the APIs of this crate.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Error {
    /// A frame or record allocation failed.
    NoMemory,
    /// A mapping collides with an existing one.
    Exists,
    /// A strict lookup found no mapping.
    NotFound,
    /// Misaligned address or length, bad level, or out-of-range address.
    Invalid,
    /// An access was not permitted, or a guard page was hit.
    Fault,
    /// A region operation was vetoed by the region's handlers.
    Denied,
}

pub type Result<T> = core::result::Result<T, Error>;
