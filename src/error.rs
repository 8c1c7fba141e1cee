//! # Error
//!
//! Error types shared by the scanner, the patch engine and the default backend

use thiserror::Error;

/// Errors produced while scanning for or rewriting hackable code
///
/// None of these are fatal. Failed activations leave live memory untouched and
/// a tripped scan still hands back the markers it found.
#[derive(Debug, Error)]
pub enum Error {
    /// The code pointer of a region is null
    #[error("Hackable code has no code pointer")]
    UnresolvedAddress,
    /// The assembler rejected the replacement text
    #[error("{0}")]
    Assembly(#[from] AssembleError),
    /// The assembled bytes do not fit in the original window
    #[error("Compiled code is {compiled} bytes but only {available} bytes are available")]
    SizeOverflow {
        /// Number of bytes the assembler produced
        compiled: usize,
        /// Length of the original region
        available: usize,
    },
    /// No stop tag was found within the scan limit
    #[error("Unable to find stop tag within {limit} bytes of {origin:#x}")]
    ScanFailSafeTripped {
        /// Resolved address the scan started from
        origin: usize,
        /// Maximum distance the scan may travel
        limit: usize,
    },
    /// Error when setting memory protections
    #[error("Error setting memory protections")]
    Protection(#[from] region::Error),
}

/// Errors reported by an [`Assembler`](crate::backend::Assembler)
#[derive(Debug, Error)]
pub enum AssembleError {
    /// A line could not be parsed
    #[error("line {line}: {message}")]
    Syntax {
        /// 1-based line number of the offending statement
        line: usize,
        /// What went wrong
        message: String,
    },
    /// The mnemonic is not supported
    #[error("line {line}: unsupported instruction `{mnemonic}`")]
    Unsupported {
        /// 1-based line number of the offending statement
        line: usize,
        /// Mnemonic as written
        mnemonic: String,
    },
    /// Error from the encoder
    #[error("{0}")]
    Encoder(#[from] iced_x86::IcedError),
}
