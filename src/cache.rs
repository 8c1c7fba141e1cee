//! # Cache
//!
//! Remembers the markers found for each function so code is only scanned once

use std::collections::HashMap;

use log::{debug, trace, warn};

use crate::backend::AddressResolver;
use crate::scan::{BoundaryMarker, Scanner};
use crate::view::CodeView;

/// Marker lists keyed by the address the caller asked for.
///
/// The key is the address *before* resolution, so two different thunks for the same
/// function get separate entries. Entries are never evicted: tagged code is assumed
/// not to move for the lifetime of the process.
#[derive(Debug, Default)]
pub struct MarkerCache {
    /// Scanner used to fill the cache
    scanner: Scanner,
    /// Cached markers
    entries: HashMap<usize, Vec<BoundaryMarker>>,
}

impl MarkerCache {
    /// Creates an empty cache using the default [`Scanner`]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty cache that fills itself with `scanner`
    pub fn with_scanner(scanner: Scanner) -> Self {
        Self {
            scanner,
            entries: HashMap::new(),
        }
    }

    /// Returns the markers for `function`, scanning it on first use
    ///
    /// A scan that trips the fail-safe is logged and whatever it found is cached.
    ///
    /// # Safety
    ///
    /// `function` must be resolvable by `resolver`, and the resolved code must stay mapped for the life of the process
    pub unsafe fn markers<R>(&mut self, function: usize, resolver: &R) -> &[BoundaryMarker]
    where
        R: AddressResolver + ?Sized,
    {
        let scanner = self.scanner;
        self.entries.entry(function).or_insert_with(|| {
            let resolved = resolver.resolve(function);
            trace!("Resolved {function:#x} to {resolved:#x}");

            let view = match CodeView::readable(resolved as *const u8, scanner.horizon()) {
                Ok(view) => view,
                Err(e) => {
                    warn!("Unable to query memory at {resolved:#x}: {e}");
                    return Vec::new();
                }
            };
            let scan = scanner.scan(view);
            debug!(
                "Cached {} marker(s) for {function:#x}",
                scan.markers.len()
            );
            scan.markers
        })
    }

    /// Stores markers for `function` without scanning, replacing any cached entry
    pub fn insert(&mut self, function: usize, markers: Vec<BoundaryMarker>) {
        self.entries.insert(function, markers);
    }

    /// Whether `function` has been scanned
    pub fn contains(&self, function: usize) -> bool {
        self.entries.contains_key(&function)
    }

    /// Number of cached functions
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing has been cached yet
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
