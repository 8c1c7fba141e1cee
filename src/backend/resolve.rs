//! Resolvers for turning function references into code addresses

use std::mem;

use iced_x86::{Code, Decoder, DecoderOptions, Instruction, OpKind, Register};
use log::trace;

use super::{AddressResolver, NATIVE_BITNESS};
use crate::view::CodeView;

/// Longest x86 instruction
const MAX_INSTRUCTION_LEN: usize = 15;

/// Resolver that treats every address as the function's first instruction
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityResolver;

impl AddressResolver for IdentityResolver {
    unsafe fn resolve(&self, address: usize) -> usize {
        address
    }
}

/// Follows jump thunks until it reaches real code.
///
/// Function pointers often land on a trampoline rather than the function body:
/// incremental-linking thunks (`jmp rel32`) and import stubs (`jmp [rip+disp]` or `jmp [abs]`).
#[derive(Debug, Clone, Copy)]
pub struct ThunkResolver {
    /// 32 or 64
    bitness: u32,
    /// Maximum number of thunks to follow
    max_depth: usize,
}

impl Default for ThunkResolver {
    fn default() -> Self {
        Self {
            bitness: NATIVE_BITNESS,
            max_depth: 8,
        }
    }
}

impl ThunkResolver {
    /// Creates a resolver for 32 or 64 bit code
    pub fn new(bitness: u32) -> Self {
        Self {
            bitness,
            ..Self::default()
        }
    }

    /// Limits how many chained thunks are followed
    pub fn with_max_depth(self, max_depth: usize) -> Self {
        Self { max_depth, ..self }
    }

    /// Decodes the instruction at `address`
    ///
    /// # Safety
    ///
    /// `address` must stay mapped while decoding
    unsafe fn decode(&self, address: usize) -> Option<Instruction> {
        let view = CodeView::readable(address as *const u8, MAX_INSTRUCTION_LEN).ok()?;
        let bytes = view.copy(0, view.len())?;
        let mut decoder = Decoder::with_ip(self.bitness, &bytes, address as u64, DecoderOptions::NONE);
        let instruction = decoder.decode();
        (!instruction.is_invalid()).then_some(instruction)
    }

    /// Reads a pointer-sized value for the target mode out of `slot`
    ///
    /// # Safety
    ///
    /// `slot` must stay mapped while reading
    unsafe fn read_pointer(&self, slot: usize) -> Option<usize> {
        let size = (self.bitness / 8) as usize;
        if size > mem::size_of::<usize>() {
            return None;
        }
        let view = CodeView::readable(slot as *const u8, size).ok()?;
        let bytes = view.copy(0, size)?;

        let mut buffer = [0u8; mem::size_of::<usize>()];
        buffer[..size].copy_from_slice(&bytes);
        Some(usize::from_le_bytes(buffer))
    }

    /// Returns where the thunk at `address` jumps to, or `None` if it isn't a thunk
    ///
    /// # Safety
    ///
    /// `address` must stay mapped while decoding
    unsafe fn follow(&self, address: usize) -> Option<usize> {
        let instruction = self.decode(address)?;
        match instruction.code() {
            Code::Jmp_rel8_32 | Code::Jmp_rel8_64 | Code::Jmp_rel32_32 | Code::Jmp_rel32_64 => {
                Some(instruction.near_branch_target() as usize)
            }
            Code::Jmp_rm32 | Code::Jmp_rm64 if instruction.op0_kind() == OpKind::Memory => {
                if instruction.memory_index() != Register::None {
                    return None;
                }
                let slot = if instruction.is_ip_rel_memory_operand() {
                    instruction.ip_rel_memory_address() as usize
                } else if instruction.memory_base() == Register::None {
                    instruction.memory_displacement64() as usize
                } else {
                    return None;
                };
                self.read_pointer(slot)
            }
            _ => None,
        }
    }
}

impl AddressResolver for ThunkResolver {
    unsafe fn resolve(&self, address: usize) -> usize {
        let mut current = address;
        for _ in 0..self.max_depth {
            match self.follow(current) {
                Some(next) if next != current => {
                    trace!("Following thunk {current:#x} -> {next:#x}");
                    current = next;
                }
                _ => break,
            }
        }
        current
    }
}
