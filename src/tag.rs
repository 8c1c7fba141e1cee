//! # Tag
//!
//! Byte signatures that delimit hackable code inside compiled functions.
//!
//! Each tag is a short x86 sequence that pushes a register, clobbers it, and pops it back,
//! so a tag is harmless when executed but stays easy to find in the instruction stream.
//!
//! Note: all tags must start with a different byte and have the same length

/// Length of every tag signature
pub const TAG_SIZE: usize = 10;

/// A tag signature
pub type Tag = [u8; TAG_SIZE];

/// Marks the start of a hackable region (`push rdi; push 0x45; mov edi, 0xfeedc0de; pop rdi; pop rdi`)
pub const START_TAG: Tag = [0x57, 0x6A, 0x45, 0xBF, 0xDE, 0xC0, 0xED, 0xFE, 0x5F, 0x5F];
/// Marks the end of a hackable region (`push rsi; push 0x45; mov esi, 0xdeadc0de; pop rsi; pop rsi`)
pub const END_TAG: Tag = [0x56, 0x6A, 0x45, 0xBE, 0xDE, 0xC0, 0xAD, 0xDE, 0x5E, 0x5E];
/// Tells the scanner to stop searching (`push rdx; push 0x45; mov edx, 0x0d15ea5e; pop rdx; pop rdx`)
pub const STOP_SEARCH_TAG: Tag = [0x52, 0x6A, 0x45, 0xBA, 0x5E, 0xEA, 0x15, 0x0D, 0x5A, 0x5A];

/// The three kinds of tag the scanner looks for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    /// [`START_TAG`]
    Start,
    /// [`END_TAG`]
    End,
    /// [`STOP_SEARCH_TAG`]
    StopSearch,
}

impl TagKind {
    /// Selects the tag whose signature begins with `byte`, if any
    pub fn from_first_byte(byte: u8) -> Option<Self> {
        match byte {
            b if b == START_TAG[0] => Some(Self::Start),
            b if b == END_TAG[0] => Some(Self::End),
            b if b == STOP_SEARCH_TAG[0] => Some(Self::StopSearch),
            _ => None,
        }
    }

    /// Signature bytes of this tag
    pub fn signature(self) -> &'static Tag {
        match self {
            Self::Start => &START_TAG,
            Self::End => &END_TAG,
            Self::StopSearch => &STOP_SEARCH_TAG,
        }
    }
}

/// Emits [`START_TAG`](crate::tag::START_TAG) into the current function
///
/// Code between this and [`hackable_end!`] becomes a hackable region.
/// The tag preserves every register and the flags when executed.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
#[macro_export]
macro_rules! hackable_begin {
    () => {
        unsafe {
            ::core::arch::asm!(
                ".byte 0x57, 0x6A, 0x45, 0xBF, 0xDE, 0xC0, 0xED, 0xFE, 0x5F, 0x5F",
                options(preserves_flags)
            )
        }
    };
}

/// Emits [`END_TAG`](crate::tag::END_TAG) into the current function
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
#[macro_export]
macro_rules! hackable_end {
    () => {
        unsafe {
            ::core::arch::asm!(
                ".byte 0x56, 0x6A, 0x45, 0xBE, 0xDE, 0xC0, 0xAD, 0xDE, 0x5E, 0x5E",
                options(preserves_flags)
            )
        }
    };
}

/// Emits [`STOP_SEARCH_TAG`](crate::tag::STOP_SEARCH_TAG) into the current function
///
/// Every function scanned for hackable code must contain one after its last region,
/// otherwise the scan runs until the fail-safe limit.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
#[macro_export]
macro_rules! hackable_stop {
    () => {
        unsafe {
            ::core::arch::asm!(
                ".byte 0x52, 0x6A, 0x45, 0xBA, 0x5E, 0xEA, 0x15, 0x0D, 0x5A, 0x5A",
                options(preserves_flags)
            )
        }
    };
}
