use log::error;

use crate::error::{LfsError, Result};

// ─── Hard limits ────────────────────────────────────────────────────────────

/// Maximum name size in bytes that the on-disk format can carry.
pub const NAME_MAX: u32 = 255;

/// Maximum size of a file in bytes.
pub const FILE_MAX: u32 = 2_147_483_647;

/// Maximum size of a custom attribute in bytes.
pub const ATTR_MAX: u32 = 1022;

// ─── Defaults ───────────────────────────────────────────────────────────────

pub const DEFAULT_IO_SIZE: u32 = 64;
pub const DEFAULT_LOOKAHEAD_SIZE: u32 = 64;
pub const DEFAULT_BLOCK_CYCLES: i32 = 16;
pub const DEFAULT_NAME_MAX: u32 = 32;

/// Static geometry and limits of a mounted volume.
///
/// Zero for `name_max`, `file_max`, `attr_max` or `metadata_max` selects the
/// default value, matching what ends up in the superblock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Minimum size of a block read in bytes.
    pub read_size: u32,
    /// Minimum size of a block program in bytes.
    pub prog_size: u32,
    /// Size of an erasable block in bytes.
    pub block_size: u32,
    /// Number of erasable blocks on the device.
    pub block_count: u32,
    /// Erase cycles before a metadata pair is moved, -1 disables wear leveling.
    pub block_cycles: i32,
    /// Size of the read, program and per-file caches.
    pub cache_size: u32,
    /// Size of the lookahead bitmap in bytes, each byte tracks 8 blocks.
    pub lookahead_size: u32,
    pub name_max: u32,
    pub file_max: u32,
    pub attr_max: u32,
    /// Upper bound for the bytes a metadata pair may use.
    pub metadata_max: u32,
}

impl Config {
    /// Config with the default I/O sizes for a device of the given geometry.
    pub fn new(block_size: u32, block_count: u32) -> Self {
        let io = DEFAULT_IO_SIZE.min(block_size);
        Self {
            read_size: io,
            prog_size: io,
            block_size,
            block_count,
            block_cycles: DEFAULT_BLOCK_CYCLES,
            cache_size: io,
            lookahead_size: DEFAULT_LOOKAHEAD_SIZE,
            name_max: DEFAULT_NAME_MAX,
            file_max: FILE_MAX,
            attr_max: ATTR_MAX,
            metadata_max: block_size,
        }
    }

    pub fn with_io_sizes(mut self, read_size: u32, prog_size: u32, cache_size: u32) -> Self {
        self.read_size = read_size;
        self.prog_size = prog_size;
        self.cache_size = cache_size;
        self
    }

    pub fn with_block_cycles(mut self, block_cycles: i32) -> Self {
        self.block_cycles = block_cycles;
        self
    }

    pub fn with_lookahead_size(mut self, lookahead_size: u32) -> Self {
        self.lookahead_size = lookahead_size;
        self
    }

    pub fn with_name_max(mut self, name_max: u32) -> Self {
        self.name_max = name_max;
        self
    }

    /// Check geometry constraints and fill the zero-means-default limits.
    pub fn validate(&self) -> Result<Config> {
        let mut cfg = self.clone();
        if cfg.name_max == 0 {
            cfg.name_max = NAME_MAX;
        }
        if cfg.file_max == 0 {
            cfg.file_max = FILE_MAX;
        }
        if cfg.attr_max == 0 {
            cfg.attr_max = ATTR_MAX;
        }
        if cfg.metadata_max == 0 {
            cfg.metadata_max = cfg.block_size;
        }

        let check = |ok: bool, what: &'static str| -> Result<()> {
            if ok {
                Ok(())
            } else {
                error!("Invalid config: {}", what);
                Err(LfsError::Inval)
            }
        };

        check(cfg.read_size > 0 && cfg.prog_size > 0, "zero read/prog size")?;
        check(cfg.cache_size > 0 && cfg.lookahead_size > 0, "zero cache/lookahead size")?;
        check(cfg.block_size >= 128, "block size below 128 bytes")?;
        check(cfg.block_count >= 2, "fewer than two blocks")?;
        check(cfg.cache_size % cfg.read_size == 0, "cache size not a multiple of read size")?;
        check(cfg.cache_size % cfg.prog_size == 0, "cache size not a multiple of prog size")?;
        check(cfg.block_size % cfg.cache_size == 0, "block size not a multiple of cache size")?;
        check(cfg.lookahead_size % 8 == 0, "lookahead size not a multiple of 8")?;
        check(cfg.block_cycles != 0, "block_cycles of zero")?;
        check(cfg.name_max <= NAME_MAX, "name_max above 255")?;
        check(cfg.file_max <= FILE_MAX, "file_max above 2147483647")?;
        check(cfg.attr_max <= ATTR_MAX, "attr_max above 1022")?;
        check(
            cfg.metadata_max <= cfg.block_size && cfg.metadata_max % cfg.prog_size == 0,
            "metadata_max not within block and prog aligned",
        )?;

        // the ctz skip pointers of a full-size file must fit in one block
        let ptrs = 4 * crate::layout::npw2(0xffff_ffff / (cfg.block_size - 2 * 4));
        check(ptrs <= cfg.block_size, "block size too small for ctz pointers")?;

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::{ATTR_MAX, Config, NAME_MAX};
    use crate::error::LfsError;

    #[test]
    fn test_defaults_validate() {
        let cfg = Config::new(4096, 16).validate().unwrap();
        assert_eq!(cfg.read_size, 64);
        assert_eq!(cfg.cache_size, 64);
        assert_eq!(cfg.metadata_max, 4096);
        assert_eq!(cfg.attr_max, ATTR_MAX);
    }

    #[test]
    fn test_zero_limits_fall_back_to_hard_limits() {
        let mut cfg = Config::new(512, 32);
        cfg.name_max = 0;
        cfg.metadata_max = 0;
        let cfg = cfg.validate().unwrap();
        assert_eq!(cfg.name_max, NAME_MAX);
        assert_eq!(cfg.metadata_max, 512);
    }

    #[test]
    fn test_rejects_misaligned_cache() {
        let cfg = Config::new(4096, 16).with_io_sizes(16, 16, 24);
        assert_eq!(cfg.validate(), Err(LfsError::Inval));
    }

    #[test]
    fn test_rejects_zero_block_cycles_and_tiny_devices() {
        assert_eq!(
            Config::new(4096, 16).with_block_cycles(0).validate(),
            Err(LfsError::Inval)
        );
        assert_eq!(Config::new(4096, 1).validate(), Err(LfsError::Inval));
        assert_eq!(Config::new(64, 16).validate(), Err(LfsError::Inval));
    }
}
