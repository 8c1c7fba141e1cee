//! # View
//!
//! Bounded, read-only views over live code

use std::marker::PhantomData;
use std::ptr;

use region::Protection;

/// A window of live executable memory, described by its base address and length.
///
/// Unlike a `&[u8]`, a `CodeView` does not claim the bytes are immutable: the memory
/// belongs to the running program and may be rewritten by a patch at any time.
/// Every read goes through [`ptr::read_volatile`] for that reason.
#[derive(Debug, Clone, Copy)]
pub struct CodeView<'a> {
    /// First byte of the view
    base: *const u8,
    /// Number of readable bytes starting at `base`
    len: usize,
    /// Ties views built from slices to the slice's lifetime
    _marker: PhantomData<&'a [u8]>,
}

impl<'a> CodeView<'a> {
    /// Creates a view over an ordinary byte buffer
    pub fn from_slice(bytes: &'a [u8]) -> Self {
        Self {
            base: bytes.as_ptr(),
            len: bytes.len(),
            _marker: PhantomData,
        }
    }

    /// Creates a view over `len` bytes at `base`
    ///
    /// # Safety
    ///
    /// `base` must be [valid](https://doc.rust-lang.org/stable/std/ptr/index.html#safety) for reads of `len` bytes for `'a`
    pub unsafe fn from_raw(base: *const u8, len: usize) -> Self {
        Self {
            base,
            len,
            _marker: PhantomData,
        }
    }

    /// Creates a view of at most `max_len` bytes at `base`, stopping early at the first unmapped or unreadable page
    ///
    /// # Safety
    ///
    /// The mapping must not be torn down while the view is alive
    pub unsafe fn readable(base: *const u8, max_len: usize) -> Result<Self, region::Error> {
        let start = base as usize;
        let mut end = start;

        while end - start < max_len {
            let area = match region::query(end as *const u8) {
                Ok(area) => area,
                Err(region::Error::UnmappedRegion) => break,
                Err(e) => return Err(e),
            };
            if !area.protection().contains(Protection::READ) {
                break;
            }
            let area_end = area.as_range().end;
            if area_end <= end {
                break;
            }
            end = area_end;
        }

        Ok(Self::from_raw(base, (end - start).min(max_len)))
    }

    /// Address of the first byte
    pub fn address(&self) -> usize {
        self.base as usize
    }

    /// Address of the byte at `index`
    pub fn address_of(&self, index: usize) -> usize {
        self.address() + index
    }

    /// Number of bytes in the view
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the view has no bytes
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reads the byte at `index`, or `None` past the end of the view
    pub fn get(&self, index: usize) -> Option<u8> {
        if index < self.len {
            // Safety: the constructor guarantees `base` is readable for `len` bytes
            Some(unsafe { ptr::read_volatile(self.base.add(index)) })
        } else {
            None
        }
    }

    /// Copies `len` bytes starting at `index` out of the view
    pub fn copy(&self, index: usize, len: usize) -> Option<Vec<u8>> {
        let end = index.checked_add(len)?;
        (index..end).map(|i| self.get(i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::CodeView;

    #[test]
    fn test_bounds() {
        let data = [1u8, 2, 3];
        let view = CodeView::from_slice(&data);

        assert_eq!(view.len(), 3);
        assert_eq!(view.get(0), Some(1));
        assert_eq!(view.get(2), Some(3));
        assert_eq!(view.get(3), None);
        assert_eq!(view.address_of(2), data.as_ptr() as usize + 2);
        assert_eq!(view.copy(1, 2), Some(vec![2, 3]));
        assert_eq!(view.copy(2, 2), None);
    }

    #[test]
    /// A readable view over mapped memory covers the whole request
    fn test_readable() {
        let data = vec![0xccu8; 64];
        let view = unsafe { CodeView::readable(data.as_ptr(), data.len()).unwrap() };

        assert_eq!(view.len(), data.len());
        assert_eq!(view.get(63), Some(0xcc));
    }
}
