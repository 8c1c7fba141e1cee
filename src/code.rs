//! # Code
//!
//! Hackable code: one tagged region of a compiled function that can be rewritten and restored

use log::{debug, warn};

use crate::backend::Backend;
use crate::error::Error;
use crate::scan::BoundaryMarker;
use crate::view::CodeView;

/// Single-byte `nop`, used to fill whatever a replacement leaves of the original region
pub const NOP: u8 = 0x90;

/// A region of live code between a start and end tag.
///
/// The region keeps a copy of the bytes it had when it was created, so it can always be
/// put back the way it was. Replacements may be shorter than the original but never longer;
/// the rest of the region is filled with [`NOP`]s so execution falls through to the code after it.
pub struct HackableCode<'b, B: Backend + ?Sized> {
    /// Backend used to assemble and write code
    backend: &'b B,
    /// First byte of the region
    address: *mut u8,
    /// Size of the region
    original_len: usize,
    /// Bytes of the region when it was created
    original_bytes: Vec<u8>,
    /// Disassembly of `original_bytes`
    original_assembly: String,
    /// Text of the last activation attempt, or the original disassembly
    assembly: String,
    /// Whether replacement code is currently written
    patched: bool,
}

impl<'b, B: Backend + ?Sized> HackableCode<'b, B> {
    /// Captures the region described by `marker`
    ///
    /// # Safety
    ///
    /// `marker` must describe code that stays mapped for as long as the returned value lives.
    /// While [`activate`](Self::activate) or [`restore`](Self::restore) run, no thread may be
    /// executing the region.
    pub unsafe fn new(backend: &'b B, marker: BoundaryMarker) -> Self {
        let address = marker.start as *mut u8;
        let original_len = marker.len();

        let original_bytes = if address.is_null() {
            Vec::new()
        } else {
            CodeView::from_raw(address, original_len)
                .copy(0, original_len)
                .unwrap_or_default()
        };
        let original_assembly = backend.disassemble(&original_bytes, marker.start as u64);

        Self {
            backend,
            address,
            original_len,
            original_bytes,
            assembly: original_assembly.clone(),
            original_assembly,
            patched: false,
        }
    }

    /// Text of the last activation attempt, or the original disassembly if there hasn't been one
    pub fn assembly(&self) -> &str {
        &self.assembly
    }

    /// Disassembly of the region as it was compiled
    pub fn original_assembly(&self) -> &str {
        &self.original_assembly
    }

    /// Address of the first byte of the region
    pub fn address(&self) -> *const u8 {
        self.address
    }

    /// Size of the region, which is also the largest replacement it accepts
    pub fn original_len(&self) -> usize {
        self.original_len
    }

    /// Bytes of the region as it was compiled
    pub fn original_bytes(&self) -> &[u8] {
        &self.original_bytes
    }

    /// Whether replacement code is currently written into the region
    pub fn is_patched(&self) -> bool {
        self.patched
    }

    /// Reads what is currently in the region
    pub fn current_bytes(&self) -> Vec<u8> {
        if self.address.is_null() {
            return Vec::new();
        }
        // Safety: `new` requires the region to stay mapped for our lifetime
        unsafe { CodeView::from_raw(self.address, self.original_len) }
            .copy(0, self.original_len)
            .unwrap_or_default()
    }

    /// Assembles `text` and writes it over the region
    ///
    /// The text is kept as [`assembly`](Self::assembly) even if it fails to assemble, so it can
    /// be shown again for correcting. Nothing is written unless the code assembles and fits.
    pub fn activate(&mut self, text: &str) -> Result<(), Error> {
        if self.address.is_null() {
            warn!("Unable to activate hackable code: {}", Error::UnresolvedAddress);
            return Err(Error::UnresolvedAddress);
        }

        self.assembly = text.to_owned();

        let mut compiled = self
            .backend
            .assemble(text, self.address as u64)
            .map_err(|e| {
                warn!("Unable to assemble hackable code at {:#x}: {e}", self.address as usize);
                Error::from(e)
            })?;

        if compiled.len() > self.original_len {
            let error = Error::SizeOverflow {
                compiled: compiled.len(),
                available: self.original_len,
            };
            warn!("Unable to activate hackable code at {:#x}: {error}", self.address as usize);
            return Err(error);
        }

        let unfilled = self.original_len - compiled.len();
        compiled.resize(self.original_len, NOP);

        // Safety: `new` requires the region to stay mapped and not be executing while we write
        unsafe { self.backend.write(self.address, &compiled) }.map_err(|e| {
            warn!("Unable to write hackable code at {:#x}: {e}", self.address as usize);
            e
        })?;
        self.patched = true;

        debug!(
            "Activated {} bytes of hackable code at {:#x} ({unfilled} bytes of padding)",
            self.original_len,
            self.address as usize
        );
        Ok(())
    }

    /// Writes the original bytes back into the region
    ///
    /// Restoring a region that isn't patched rewrites the same bytes and changes nothing.
    pub fn restore(&mut self) -> Result<(), Error> {
        if self.address.is_null() {
            return Err(Error::UnresolvedAddress);
        }

        // Safety: `new` requires the region to stay mapped and not be executing while we write
        unsafe { self.backend.write(self.address, &self.original_bytes) }?;
        self.patched = false;

        debug!("Restored hackable code at {:#x}", self.address as usize);
        Ok(())
    }
}

impl<B: Backend + ?Sized> std::fmt::Debug for HackableCode<'_, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HackableCode")
            .field("address", &self.address)
            .field("original_len", &self.original_len)
            .field("patched", &self.patched)
            .field("assembly", &self.assembly)
            .finish()
    }
}
