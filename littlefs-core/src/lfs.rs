#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod error;
pub mod fs;
pub mod io;
pub mod layout;
pub mod traits;

// `core/` and `alloc/` would shadow the `core` and `alloc` crates.
// `#[path]` keeps the directory names while the modules get an `fs_` prefix.
#[path = "core/mod.rs"]
pub mod fs_core;
#[path = "alloc/mod.rs"]
pub mod fs_alloc;

#[cfg(test)]
mod tests;

// Re-exports
pub use config::Config;
pub use error::{LfsError, Result};
pub use fs::{Dir, File, FileType, Info, LittleFs};
pub use fs_core::file::{FileConfig, OpenFlags, SeekFrom, UserAttr};
pub use fs_core::path_resolver::PathResolver;
pub use io::ram_device::{BadBlock, RamBlockDevice};
pub use layout::superblock::SuperBlock;
pub use traits::block_device::BlockDevice;
