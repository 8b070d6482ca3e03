use super::{read_u32_le, write_u32_le};

/// Reference to a file's data: head of the CTZ skip-list and byte size.
///
/// With `head == BLOCK_INLINE` the data lives in the directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CtzStruct {
    pub head: u32,
    pub size: u32,
}

impl CtzStruct {
    pub const DISK_SIZE: usize = 8;

    pub fn parse(raw: &[u8]) -> CtzStruct {
        CtzStruct {
            head: read_u32_le(raw, 0),
            size: read_u32_le(raw, 4),
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::DISK_SIZE] {
        let mut out = [0u8; Self::DISK_SIZE];
        write_u32_le(&mut out, 0, self.head);
        write_u32_le(&mut out, 4, self.size);
        out
    }
}
