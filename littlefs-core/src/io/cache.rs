use alloc::vec;
use alloc::vec::Vec;

use crate::layout::BLOCK_NULL;

/// One cached window `[off, off + size)` of a block.
///
/// The filesystem owns a read cache and a program cache; every open file
/// owns one more, which doubles as the inline data buffer for small files.
#[derive(Debug, Clone)]
pub struct Cache {
    pub block: u32,
    pub off: u32,
    pub size: u32,
    pub buffer: Vec<u8>,
}

impl Cache {
    pub fn new(cache_size: u32) -> Self {
        Self {
            block: BLOCK_NULL,
            off: 0,
            size: 0,
            buffer: vec![0xff; cache_size as usize],
        }
    }

    /// Forget the cached window without touching the buffer.
    pub fn invalidate(&mut self) {
        self.block = BLOCK_NULL;
    }

    /// Forget the window and scrub the buffer, so stale bytes never leak
    /// into padding of a later program.
    pub fn reset(&mut self) {
        self.buffer.fill(0xff);
        self.block = BLOCK_NULL;
    }

    /// The window of `block` starts at or before `off` and ends after it.
    pub fn holds(&self, block: u32, off: u32) -> bool {
        block == self.block && off >= self.off && off < self.off + self.size
    }

    /// Take over another cache's window and contents.
    pub fn copy_from(&mut self, other: &Cache) {
        self.buffer.copy_from_slice(&other.buffer);
        self.block = other.block;
        self.off = other.off;
        self.size = other.size;
    }
}

impl Default for Cache {
    /// Empty cache without a buffer, a placeholder while one is borrowed out.
    fn default() -> Self {
        Self::new(0)
    }
}
