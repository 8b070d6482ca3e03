pub mod crc;
pub mod ctz;
pub mod gstate;
pub mod pair;
pub mod superblock;
pub mod tag;

/// Block address that means "no block".
pub const BLOCK_NULL: u32 = 0xffff_ffff;

/// Block address carried by caches holding inline file data.
pub const BLOCK_INLINE: u32 = 0xffff_fffe;

// Shared little-endian helpers for all layout modules
#[inline]
pub(crate) fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

#[inline]
pub(crate) fn write_u32_le(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub(crate) fn aligndown(a: u32, alignment: u32) -> u32 {
    a - (a % alignment)
}

#[inline]
pub(crate) fn alignup(a: u32, alignment: u32) -> u32 {
    aligndown(a + alignment - 1, alignment)
}

/// Smallest power of two greater than or equal to `a`, as an exponent.
#[inline]
pub(crate) fn npw2(a: u32) -> u32 {
    if a <= 1 { 0 } else { 32 - (a - 1).leading_zeros() }
}

/// Wraparound-aware comparison of revision counters.
#[inline]
pub(crate) fn scmp(a: u32, b: u32) -> i32 {
    a.wrapping_sub(b) as i32
}

#[cfg(test)]
mod tests {
    use super::{alignup, npw2, scmp};

    #[test]
    fn test_npw2() {
        assert_eq!(npw2(1), 0);
        assert_eq!(npw2(2), 1);
        assert_eq!(npw2(3), 2);
        assert_eq!(npw2(4), 2);
        assert_eq!(npw2(5), 3);
    }

    #[test]
    fn test_alignup_and_scmp_wraparound() {
        assert_eq!(alignup(1, 16), 16);
        assert_eq!(alignup(32, 16), 32);
        assert!(scmp(1, 0xffff_ffff) > 0);
        assert!(scmp(0xffff_fff0, 3) < 0);
    }
}
