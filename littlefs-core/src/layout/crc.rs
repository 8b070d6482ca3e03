/// Reflected CRC-32 polynomial 0x04c11db7, nibble table.
const RTABLE: [u32; 16] = [
    0x0000_0000, 0x1db7_1064, 0x3b6e_20c8, 0x26d9_30ac, 0x76dc_4190, 0x6b6b_51f4, 0x4db2_6158,
    0x5005_713c, 0xedb8_8320, 0xf00f_9344, 0xd6d6_a3e8, 0xcb61_b38c, 0x9b64_c2b0, 0x86d3_d2d4,
    0xa00a_e278, 0xbdbd_f21c,
];

/// Running CRC-32 without final complement.
///
/// Commits seed it with `0xffffffff`; a segment followed by its own
/// little-endian CRC folds back to zero, which is how commits are validated.
pub fn crc32(mut crc: u32, data: &[u8]) -> u32 {
    for &b in data {
        crc = (crc >> 4) ^ RTABLE[((crc ^ (b as u32)) & 0xf) as usize];
        crc = (crc >> 4) ^ RTABLE[((crc ^ ((b as u32) >> 4)) & 0xf) as usize];
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::crc32;

    #[test]
    fn test_crc32_check_value() {
        assert_eq!(crc32(0xffff_ffff, b"123456789") ^ 0xffff_ffff, 0xcbf4_3926);
    }

    #[test]
    fn test_crc32_residue_is_zero() {
        let data = b"littlefs commit";
        let crc = crc32(0xffff_ffff, data);
        assert_eq!(crc32(crc, &crc.to_le_bytes()), 0);
    }

    #[test]
    fn test_crc32_is_incremental() {
        let whole = crc32(0xffff_ffff, b"abcdef");
        let split = crc32(crc32(0xffff_ffff, b"abc"), b"def");
        assert_eq!(whole, split);
    }
}
