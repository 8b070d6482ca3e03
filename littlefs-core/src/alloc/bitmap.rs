//! Bit helpers over the lookahead buffer. Bit `n` lives in byte `n / 8`,
//! least significant bit first.

/// First clear bit in `[start, end)`.
pub fn find_first_zero(bitmap: &[u8], start: usize, end: usize) -> Option<usize> {
    let end = end.min(bitmap.len() * 8);
    let mut bit = start;
    while bit < end {
        // pretend the bits below `bit` are taken
        let byte = bitmap[bit / 8] | ((1u8 << (bit % 8)) - 1);
        if byte == 0xff {
            bit = (bit / 8 + 1) * 8;
            continue;
        }

        let found = (bit / 8) * 8 + (!byte).trailing_zeros() as usize;
        return (found < end).then_some(found);
    }

    None
}

pub fn set_bit(bitmap: &mut [u8], bit: usize) {
    bitmap[bit / 8] |= 1 << (bit % 8);
}

pub fn test_bit(bitmap: &[u8], bit: usize) -> bool {
    bitmap[bit / 8] & (1 << (bit % 8)) != 0
}

#[cfg(test)]
mod tests {
    use super::{find_first_zero, set_bit, test_bit};

    #[test]
    fn test_find_first_zero_skips_full_bytes() {
        let bitmap = [0xffu8, 0b1110_1111];
        assert_eq!(find_first_zero(&bitmap, 0, 16), Some(12));
        assert_eq!(find_first_zero(&bitmap, 0, 12), None);
    }

    #[test]
    fn test_find_first_zero_from_mid_byte() {
        let bitmap = [0b0000_0100u8, 0];
        assert_eq!(find_first_zero(&bitmap, 0, 16), Some(0));
        assert_eq!(find_first_zero(&bitmap, 2, 16), Some(3));
        assert_eq!(find_first_zero(&bitmap, 16, 32), None);
    }

    #[test]
    fn test_set_and_test() {
        let mut bitmap = [0u8; 2];
        set_bit(&mut bitmap, 0);
        set_bit(&mut bitmap, 9);
        assert!(test_bit(&bitmap, 0));
        assert!(test_bit(&bitmap, 9));
        assert!(!test_bit(&bitmap, 8));
        assert_eq!(find_first_zero(&bitmap, 0, 16), Some(1));
    }
}
