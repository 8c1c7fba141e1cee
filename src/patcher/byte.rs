//! This module contains a byte patcher

use std::convert::Infallible;
use std::ptr;

use log::trace;

use super::Patcher;

/// Patcher for writing byte arrays to memory that is already writable.
/// This patcher never fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytePatcher;
impl BytePatcher {
    /// Creates a new [`BytePatcher`]
    pub fn new() -> Self {
        Self
    }
}
unsafe impl Patcher for BytePatcher {
    type Error = Infallible;

    unsafe fn patch(&self, target: *mut u8, patch: &[u8]) -> Result<(), Self::Error> {
        trace!("Writing {} bytes to {:#x}", patch.len(), target as usize);
        // Safety: caller must ensure that `target` is writable for the full length of the patch
        ptr::copy(patch.as_ptr(), target, patch.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::patcher::byte::BytePatcher;
    use crate::patcher::Patcher;

    #[test]
    /// Test patch and revert functionality
    fn test_patch() {
        let mut data = vec![1u8, 2, 3, 4];
        let ptr = data.as_mut_ptr();

        // get our patcher to test
        let patcher = BytePatcher::new();

        // patch the vec's data
        unsafe { patcher.patch(ptr, &[4, 3, 2, 1]).unwrap() };
        assert_eq!(data, [4, 3, 2, 1]);

        // write the original back
        unsafe { patcher.patch(data.as_mut_ptr(), &[1, 2, 3, 4]).unwrap() };
        assert_eq!(data, [1, 2, 3, 4]);
    }

    #[test]
    /// Tests a partial patch of a block to ensure we're not overwriting outside the patch area
    fn test_partial_patch() {
        let mut data = vec![1u8, 2, 3, 4];
        let patcher = BytePatcher::new();

        unsafe { patcher.patch(data.as_mut_ptr().add(1), &[5, 5]).unwrap() };

        assert_eq!(data, [1, 5, 5, 4]);
    }
}
