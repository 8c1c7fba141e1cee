//! # Patcher
//!
//! This module covers patchers, which are the only code allowed to write into live code

pub mod byte;
pub mod mem;

/// Writes byte arrays into memory
///
/// Patchers don't remember what they overwrote. Hackable code keeps its own snapshot and
/// restores it by patching again.
///
/// # Safety
///
/// Patchers are inherently unsafe. The implementor must ensure that when `patch` returns successfully,
/// exactly `patch.len()` bytes at `target` hold `patch` and are visible to subsequent execution
pub unsafe trait Patcher {
    /// Error type that can occur when patching. If patching always succeeds, use [`std::convert::Infallible`].
    type Error;

    /// Writes `patch` to `target`.
    ///
    /// # Safety
    ///
    /// This function is intended to be used on arbitrary memory addresses, but must be valid for the supplied patcher
    unsafe fn patch(&self, target: *mut u8, patch: &[u8]) -> Result<(), Self::Error>;
}
