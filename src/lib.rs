#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::missing_crate_level_docs)]
#![doc = include_str!("../README.md")]

pub mod backend;
pub mod cache;
pub mod code;
mod error;
pub mod hackables;
pub mod patcher;
pub mod scan;
pub mod tag;
pub mod view;

pub use code::HackableCode;
pub use error::{AssembleError, Error};
pub use hackables::{create, global, Hackables};
