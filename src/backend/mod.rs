//! # Backend
//!
//! The collaborators hackable code relies on: an assembler, a disassembler, something to
//! write into live code, and something to turn function references into code addresses.
//!
//! [`Toolchain`] bundles one of each into a [`Backend`]. [`NativeBackend`] is the default
//! for the running process.

use crate::error::{AssembleError, Error};
use crate::patcher::byte::BytePatcher;
use crate::patcher::mem::PermissionWrapper;
use crate::patcher::Patcher;

pub mod asm;
pub mod disasm;
pub mod resolve;

pub use asm::IcedAssembler;
pub use disasm::IcedDisassembler;
pub use resolve::{IdentityResolver, ThunkResolver};

/// Bitness of the running process
pub const NATIVE_BITNESS: u32 = if cfg!(target_pointer_width = "64") {
    64
} else {
    32
};

/// Turns assembly text into machine code
pub trait Assembler {
    /// Assembles `text` as if it will execute at `ip`, so relative branches land where they should
    fn assemble(&self, text: &str, ip: u64) -> Result<Vec<u8>, AssembleError>;
}

/// Turns machine code into assembly text
pub trait Disassembler {
    /// Produces a listing of `code` as if it were located at `ip`, one instruction per line
    fn disassemble(&self, code: &[u8], ip: u64) -> String;
}

/// Maps a function reference to the address of its first instruction
pub trait AddressResolver {
    /// Resolves `address`
    ///
    /// # Safety
    ///
    /// `address` must point at readable code
    unsafe fn resolve(&self, address: usize) -> usize;
}

/// Everything a hackable region needs from the outside world
pub trait Backend: AddressResolver {
    /// See [`Assembler::assemble`]
    fn assemble(&self, text: &str, ip: u64) -> Result<Vec<u8>, AssembleError>;
    /// See [`Disassembler::disassemble`]
    fn disassemble(&self, code: &[u8], ip: u64) -> String;
    /// Writes `bytes` to `target`, dealing with any memory protection on the way
    ///
    /// # Safety
    ///
    /// `target` must be [valid](https://doc.rust-lang.org/stable/std/ptr/index.html#safety) for `bytes.len()` bytes,
    /// and no other thread may be executing that memory during the write
    unsafe fn write(&self, target: *mut u8, bytes: &[u8]) -> Result<(), Error>;
}

/// A [`Backend`] assembled from independent parts
#[derive(Debug, Default, Clone)]
pub struct Toolchain<A, D, P, R> {
    /// Assembler
    pub assembler: A,
    /// Disassembler
    pub disassembler: D,
    /// Writer for live code
    pub patcher: P,
    /// Function address resolver
    pub resolver: R,
}

impl<A, D, P, R> Toolchain<A, D, P, R> {
    /// Creates a new toolchain
    pub fn new(assembler: A, disassembler: D, patcher: P, resolver: R) -> Self {
        Self {
            assembler,
            disassembler,
            patcher,
            resolver,
        }
    }
}

impl<A, D, P, R: AddressResolver> AddressResolver for Toolchain<A, D, P, R> {
    unsafe fn resolve(&self, address: usize) -> usize {
        self.resolver.resolve(address)
    }
}

impl<A, D, P, R> Backend for Toolchain<A, D, P, R>
where
    A: Assembler,
    D: Disassembler,
    P: Patcher,
    R: AddressResolver,
    Error: From<P::Error>,
{
    fn assemble(&self, text: &str, ip: u64) -> Result<Vec<u8>, AssembleError> {
        self.assembler.assemble(text, ip)
    }

    fn disassemble(&self, code: &[u8], ip: u64) -> String {
        self.disassembler.disassemble(code, ip)
    }

    unsafe fn write(&self, target: *mut u8, bytes: &[u8]) -> Result<(), Error> {
        self.patcher.patch(target, bytes).map_err(Into::into)
    }
}

/// Backend for patching the running process
pub type NativeBackend =
    Toolchain<IcedAssembler, IcedDisassembler, PermissionWrapper<BytePatcher>, ThunkResolver>;

impl NativeBackend {
    /// Creates a backend for the running process
    pub fn native() -> Self {
        Toolchain::new(
            IcedAssembler::default(),
            IcedDisassembler::default(),
            PermissionWrapper::new(BytePatcher::new()),
            ThunkResolver::default(),
        )
    }
}
