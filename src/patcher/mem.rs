//! This module contains a patcher which adjusts memory permissions to patch read-only code

use std::convert::Infallible;

use log::trace;
use region::Protection;
use thiserror::Error;

use super::Patcher;
use crate::error::Error as HackError;

/// Errors when using permission patching
#[derive(Debug, Error)]
pub enum PermissionError<E> {
    /// Error when setting memory protections
    #[error("Error setting memory protections")]
    ProtectionError(#[from] region::Error),
    /// Custom error type from the underlying patcher
    #[error("{0}")]
    CustomError(E),
}

impl From<Infallible> for PermissionError<Infallible> {
    fn from(e: Infallible) -> Self {
        match e {}
    }
}

impl<E> From<PermissionError<E>> for HackError
where
    HackError: From<E>,
{
    fn from(e: PermissionError<E>) -> Self {
        match e {
            PermissionError::ProtectionError(e) => HackError::Protection(e),
            PermissionError::CustomError(e) => e.into(),
        }
    }
}

impl From<Infallible> for HackError {
    fn from(e: Infallible) -> Self {
        match e {}
    }
}

/// This struct wraps patchers to allow them to write to memory that's normally unwritable, such as code.
/// It achieves this result by changing the memory permissions of the target memory, triggering the patch, and then reverting the permissions.
///
/// # Safety
///
/// `PermissionWrapper` relies on the size of the patch value to determine how many pages to change write permissions,
/// pairing `PermissionWrapper` with a patcher that writes more memory than the size of the patch is undefined behavior.
///
/// The target memory **MUST** be memory not tracked by Rust, such as the code of a function,
/// or ensured that reading from and writing to data tracked by Rust will not trigger undefined behavior.
#[derive(Debug, Default, Clone)]
pub struct PermissionWrapper<P: Patcher> {
    /// Underlying patcher.
    patcher: P,
}
impl<P: Patcher> PermissionWrapper<P> {
    /// Creates a new PermissionWrapper
    pub fn new(patcher: P) -> Self {
        Self { patcher }
    }
}

unsafe impl<P> Patcher for PermissionWrapper<P>
where
    P: Patcher,
    PermissionError<P::Error>: From<P::Error>,
{
    type Error = PermissionError<P::Error>;

    unsafe fn patch(&self, target: *mut u8, patch: &[u8]) -> Result<(), Self::Error> {
        // region rejects empty ranges, and there's nothing to write anyway
        if patch.is_empty() {
            return Ok(());
        }
        // previous protection comes back when the handle drops
        let _guard = region::protect_with_handle(target, patch.len(), Protection::READ_WRITE_EXECUTE)?;
        trace!(
            "Unprotected {} bytes at {:#x} for patching",
            patch.len(),
            target as usize
        );
        self.patcher.patch(target, patch).map_err(Into::into)
    }
}
