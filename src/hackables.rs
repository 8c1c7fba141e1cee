//! # Hackables
//!
//! Entry point for extracting hackable code from functions

use std::sync::{Mutex, PoisonError};

use lazy_static::lazy_static;

use crate::backend::{Backend, NativeBackend};
use crate::cache::MarkerCache;
use crate::code::HackableCode;

/// Owns a backend and the marker cache, and hands out [`HackableCode`] for tagged functions
#[derive(Debug)]
pub struct Hackables<B: Backend> {
    /// Backend every region created here uses
    backend: B,
    /// Markers already found, keyed by function
    cache: Mutex<MarkerCache>,
}

impl<B: Backend> Hackables<B> {
    /// Creates a new instance with an empty cache
    pub fn new(backend: B) -> Self {
        Self::with_cache(backend, MarkerCache::new())
    }

    /// Creates a new instance using `cache`
    pub fn with_cache(backend: B, cache: MarkerCache) -> Self {
        Self {
            backend,
            cache: Mutex::new(cache),
        }
    }

    /// Backend in use
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Extracts every hackable region of `function`, in the order they appear.
    ///
    /// The function is only scanned the first time it's asked for. Later calls build fresh
    /// regions from the cached markers, capturing whatever bytes are in memory at that point.
    ///
    /// # Safety
    ///
    /// `function` must be a function (or a thunk to one) whose code stays mapped for the life of
    /// the process, and which ends its hackable regions with a stop tag.
    /// See [`HackableCode::new`] for the rules on using the returned regions.
    pub unsafe fn create(&self, function: *const u8) -> Vec<HackableCode<'_, B>> {
        let markers = {
            let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            cache.markers(function as usize, &self.backend).to_vec()
        };

        markers
            .into_iter()
            .map(|marker| HackableCode::new(&self.backend, marker))
            .collect()
    }

    /// Whether `function` has already been scanned
    pub fn is_cached(&self, function: *const u8) -> bool {
        self.cache
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(function as usize)
    }
}

impl Hackables<NativeBackend> {
    /// Creates an instance for patching the running process
    pub fn native() -> Self {
        Self::new(NativeBackend::native())
    }
}

lazy_static! {
    /// Shared instance for the running process
    static ref GLOBAL: Hackables<NativeBackend> = Hackables::native();
}

/// Shared [`Hackables`] for the running process
pub fn global() -> &'static Hackables<NativeBackend> {
    &GLOBAL
}

/// Extracts the hackable regions of `function` using the shared instance
///
/// # Safety
///
/// See [`Hackables::create`]
pub unsafe fn create(function: *const u8) -> Vec<HackableCode<'static, NativeBackend>> {
    global().create(function)
}

#[cfg(test)]
mod tests {
    use super::Hackables;
    use crate::backend::{IcedAssembler, IcedDisassembler, IdentityResolver, Toolchain};
    use crate::patcher::byte::BytePatcher;
    use crate::tag::{END_TAG, START_TAG, STOP_SEARCH_TAG};

    /// Backend that writes straight into ordinary buffers
    type BufferBackend = Toolchain<IcedAssembler, IcedDisassembler, BytePatcher, IdentityResolver>;

    #[test]
    fn test_create() {
        let code = [
            &START_TAG[..],
            &[0x31, 0xc0],
            &END_TAG,
            &[0xcc],
            &START_TAG,
            &[0xff, 0xc0, 0x90],
            &END_TAG,
            &STOP_SEARCH_TAG,
        ]
        .concat();
        let hackables = Hackables::new(BufferBackend::default());

        let regions = unsafe { hackables.create(code.as_ptr()) };

        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].original_assembly(), "xor eax, eax");
        assert_eq!(regions[1].original_assembly(), "inc eax\nnop");
        assert_eq!(regions[1].original_len(), 3);
        assert!(hackables.is_cached(code.as_ptr()));
    }

    #[test]
    /// Regions created later see the same boundaries without rescanning
    fn test_create_cached() {
        let mut code = [&START_TAG[..], &[0x90, 0x90], &END_TAG, &STOP_SEARCH_TAG].concat();
        let hackables = Hackables::new(BufferBackend::default());
        let function = code.as_ptr();

        let first: Vec<_> = unsafe { hackables.create(function) }
            .iter()
            .map(|r| (r.address(), r.original_len()))
            .collect();

        // wreck the tags, a rescan would find nothing
        code[0] = 0;
        let second: Vec<_> = unsafe { hackables.create(function) }
            .iter()
            .map(|r| (r.address(), r.original_len()))
            .collect();

        assert_eq!(first.len(), 1);
        assert_eq!(first, second);
    }

    #[test]
    fn test_no_regions() {
        let code = [&[0x55u8, 0xc3][..], &STOP_SEARCH_TAG].concat();
        let hackables = Hackables::new(BufferBackend::default());

        assert!(unsafe { hackables.create(code.as_ptr()) }.is_empty());
    }
}
