use log::{error, warn};

use super::{read_u32_le, write_u32_le};
use crate::config::Config;
use crate::error::{LfsError, Result};

// ─── Constants ──────────────────────────────────────────────────────────────

/// On-disk version, major in the upper half-word.
pub const DISK_VERSION: u32 = 0x0002_0000;
pub const DISK_VERSION_MAJOR: u16 = (DISK_VERSION >> 16) as u16;
pub const DISK_VERSION_MINOR: u16 = (DISK_VERSION & 0xffff) as u16;

/// Name of the superblock entry in the root pair.
pub const MAGIC: &[u8; 8] = b"littlefs";

/// Superblock payload, stored as an inline struct under id 0 of the root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperBlock {
    pub version: u32,
    pub block_size: u32,
    pub block_count: u32,
    pub name_max: u32,
    pub file_max: u32,
    pub attr_max: u32,
}

impl SuperBlock {
    pub const DISK_SIZE: usize = 24;

    /// Superblock describing a freshly formatted volume.
    pub fn from_config(cfg: &Config) -> SuperBlock {
        SuperBlock {
            version: DISK_VERSION,
            block_size: cfg.block_size,
            block_count: cfg.block_count,
            name_max: cfg.name_max,
            file_max: cfg.file_max,
            attr_max: cfg.attr_max,
        }
    }

    pub fn parse(raw: &[u8; Self::DISK_SIZE]) -> SuperBlock {
        SuperBlock {
            version: read_u32_le(raw, 0),
            block_size: read_u32_le(raw, 4),
            block_count: read_u32_le(raw, 8),
            name_max: read_u32_le(raw, 12),
            file_max: read_u32_le(raw, 16),
            attr_max: read_u32_le(raw, 20),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::DISK_SIZE] {
        let mut out = [0u8; Self::DISK_SIZE];
        write_u32_le(&mut out, 0, self.version);
        write_u32_le(&mut out, 4, self.block_size);
        write_u32_le(&mut out, 8, self.block_count);
        write_u32_le(&mut out, 12, self.name_max);
        write_u32_le(&mut out, 16, self.file_max);
        write_u32_le(&mut out, 20, self.attr_max);
        out
    }

    pub fn major_version(&self) -> u16 {
        (self.version >> 16) as u16
    }

    pub fn minor_version(&self) -> u16 {
        (self.version & 0xffff) as u16
    }

    /// Check compatibility with `cfg` and narrow its limits to the on-disk ones.
    ///
    /// On-disk limits may only be smaller than the configured maxima; zero on
    /// disk means the default was used at format time.
    pub fn negotiate(&self, cfg: &mut Config) -> Result<()> {
        if self.major_version() != DISK_VERSION_MAJOR || self.minor_version() > DISK_VERSION_MINOR {
            error!(
                "Invalid version v{}.{}",
                self.major_version(),
                self.minor_version()
            );
            return Err(LfsError::Inval);
        }

        if self.block_size != cfg.block_size || self.block_count != cfg.block_count {
            error!(
                "Superblock geometry {}x{} does not match config {}x{}",
                self.block_count, self.block_size, cfg.block_count, cfg.block_size
            );
            return Err(LfsError::Inval);
        }

        negotiate_limit("name_max", self.name_max, &mut cfg.name_max)?;
        negotiate_limit("file_max", self.file_max, &mut cfg.file_max)?;
        negotiate_limit("attr_max", self.attr_max, &mut cfg.attr_max)?;
        Ok(())
    }
}

fn negotiate_limit(what: &str, on_disk: u32, configured: &mut u32) -> Result<()> {
    if on_disk == 0 {
        return Ok(());
    }
    if on_disk > *configured {
        error!("Unsupported {} ({} > {})", what, on_disk, configured);
        return Err(LfsError::Inval);
    }
    if on_disk < *configured {
        warn!("Narrowing {} to {} from superblock", what, on_disk);
    }
    *configured = on_disk;
    Ok(())
}
