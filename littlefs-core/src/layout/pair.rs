use super::{BLOCK_NULL, read_u32_le};

/// Two block addresses backing one metadata pair, `[0]` is the active block.
pub type Pair = [u32; 2];

pub const NULL_PAIR: Pair = [BLOCK_NULL, BLOCK_NULL];
pub const ROOT_PAIR: Pair = [0, 1];

/// Either half is null.
pub fn is_null(pair: &Pair) -> bool {
    pair[0] == BLOCK_NULL || pair[1] == BLOCK_NULL
}

/// Pairs overlap in any block, the way littlefs identifies "the same" pair
/// before and after a compaction swapped or relocated one half.
pub fn same(a: &Pair, b: &Pair) -> bool {
    a[0] == b[0] || a[1] == b[1] || a[0] == b[1] || a[1] == b[0]
}

/// Pairs hold exactly the same two blocks, in either order.
pub fn sync(a: &Pair, b: &Pair) -> bool {
    (a[0] == b[0] && a[1] == b[1]) || (a[0] == b[1] && a[1] == b[0])
}

pub fn to_bytes(pair: &Pair) -> [u8; 8] {
    let mut out = [0u8; 8];
    out[..4].copy_from_slice(&pair[0].to_le_bytes());
    out[4..].copy_from_slice(&pair[1].to_le_bytes());
    out
}

pub fn from_bytes(raw: &[u8]) -> Pair {
    [read_u32_le(raw, 0), read_u32_le(raw, 4)]
}
