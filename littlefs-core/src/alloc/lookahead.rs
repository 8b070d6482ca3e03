use alloc::vec;
use alloc::vec::Vec;

use log::error;

use super::bitmap::{find_first_zero, set_bit, test_bit};
use crate::error::{LfsError, Result};
use crate::fs::LittleFs;
use crate::traits::block_device::BlockDevice;

/// Sliding window of the block address space with one bit per block.
///
/// A set bit means the block is referenced by the filesystem. The window
/// is rebuilt by traversing every live structure whenever it runs out.
/// `ack` counts how many blocks may still be examined before the allocator
/// has wrapped the whole device without an intervening acknowledgement.
#[derive(Debug, Clone, Default)]
pub struct Lookahead {
    /// First block of the window.
    pub off: u32,
    /// Blocks covered by the window.
    pub size: u32,
    /// Next position to examine, relative to `off`.
    pub i: u32,
    pub ack: u32,
    pub buffer: Vec<u8>,
}

impl Lookahead {
    pub fn new(lookahead_size: u32) -> Self {
        Self {
            buffer: vec![0; lookahead_size as usize],
            ..Self::default()
        }
    }

    /// Acknowledge that everything allocated so far is in use.
    pub fn ack(&mut self, block_count: u32) {
        self.ack = block_count;
    }

    /// Throw the window away, the next allocation rebuilds it.
    pub fn drop_window(&mut self, block_count: u32) {
        self.size = 0;
        self.i = 0;
        self.ack(block_count);
    }

    /// Start an empty window at `off` covering `size` blocks.
    pub fn reset_at(&mut self, off: u32, size: u32) {
        self.off = off;
        self.size = size;
        self.i = 0;
        self.buffer.fill(0);
    }

    /// Mark `block` as in use if it falls inside the window.
    pub fn mark(&mut self, block: u32, block_count: u32) {
        let off = ((block as u64 + block_count as u64 - self.off as u64) % block_count as u64) as u32;
        if off < self.size {
            set_bit(&mut self.buffer, off as usize);
        }
    }

    /// Take the next free block of the window, if any.
    pub fn next_free(&mut self, block_count: u32) -> Option<u32> {
        let size = self.size as usize;
        let found = find_first_zero(&self.buffer, self.i as usize, size);
        let Some(off) = found else {
            self.ack = self.ack.saturating_sub(self.size - self.i);
            self.i = self.size;
            return None;
        };

        let off = off as u32;
        self.ack = self.ack.saturating_sub(off + 1 - self.i);
        self.i = off + 1;

        // eagerly skip used blocks so an ack discredits fewer of them
        while self.i < self.size && test_bit(&self.buffer, self.i as usize) {
            self.i += 1;
            self.ack = self.ack.saturating_sub(1);
        }

        Some(((self.off as u64 + off as u64) % block_count as u64) as u32)
    }

    /// Slide to the next window, sized by what is left to scan.
    pub fn advance(&mut self, block_count: u32) {
        let next = ((self.off as u64 + self.size as u64) % block_count as u64) as u32;
        let size = (8 * self.buffer.len() as u32).min(self.ack);
        self.reset_at(next, size);
    }
}

impl<D: BlockDevice> LittleFs<D> {
    /// Allocate one free block.
    ///
    /// Blocks handed out are only known to be free with respect to what the
    /// traversal saw, so callers must [`Self::alloc_ack`] once the previous
    /// allocations have been committed.
    pub(crate) fn alloc(&mut self) -> Result<u32> {
        let block_count = self.cfg.block_count;
        loop {
            if let Some(block) = self.free.next_free(block_count) {
                return Ok(block);
            }

            // check if we have looked at all blocks since last ack
            if self.free.ack == 0 {
                error!("No more free space {}", self.free.i + self.free.off);
                return Err(LfsError::NoSpc);
            }

            self.free.advance(block_count);

            // find mask of free blocks from tree
            let mut free = core::mem::take(&mut self.free);
            let res = self.fs_rawtraverse(
                &mut |block| {
                    free.mark(block, block_count);
                    Ok(())
                },
                true,
            );
            self.free = free;
            if let Err(err) = res {
                self.alloc_drop();
                return Err(err);
            }
        }
    }

    pub(crate) fn alloc_ack(&mut self) {
        self.free.ack(self.cfg.block_count);
    }

    /// Invalidate the window, needed after errors that may leave blocks
    /// marked free while they are referenced.
    pub(crate) fn alloc_drop(&mut self) {
        self.free.drop_window(self.cfg.block_count);
    }
}

#[cfg(test)]
mod tests {
    use super::Lookahead;

    #[test]
    fn test_window_hands_out_unmarked_blocks() {
        let mut la = Lookahead::new(1);
        la.ack(16);
        la.reset_at(4, 8);
        la.mark(4, 16);
        la.mark(5, 16);
        la.mark(7, 16);
        // outside the window
        la.mark(2, 16);

        assert_eq!(la.next_free(16), Some(6));
        // 7 was skipped eagerly
        assert_eq!(la.i, 4);
        assert_eq!(la.next_free(16), Some(8));
        assert_eq!(la.ack, 16 - 5);
    }

    #[test]
    fn test_window_wraps_around_device() {
        let mut la = Lookahead::new(1);
        la.ack(10);
        la.reset_at(8, 4);
        la.mark(8, 10);
        la.mark(9, 10);
        assert_eq!(la.next_free(10), Some(0));
        assert_eq!(la.next_free(10), Some(1));
        assert_eq!(la.next_free(10), None);
    }

    #[test]
    fn test_exhausted_window_consumes_ack() {
        let mut la = Lookahead::new(1);
        la.ack(8);
        la.reset_at(0, 8);
        for b in 0..8 {
            la.mark(b, 8);
        }
        assert_eq!(la.next_free(8), None);
        assert_eq!(la.ack, 0);
    }

    #[test]
    fn test_advance_slides_and_shrinks() {
        let mut la = Lookahead::new(1);
        la.ack(20);
        la.reset_at(0, 8);
        la.ack = 5;
        la.advance(20);
        assert_eq!(la.off, 8);
        assert_eq!(la.size, 5);
        assert_eq!(la.i, 0);
    }
}
