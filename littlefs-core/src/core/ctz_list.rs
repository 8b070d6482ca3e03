use log::debug;

use crate::error::{LfsError, Result};
use crate::fs::LittleFs;
use crate::io::block_io::BlockIo;
use crate::io::cache::Cache;
use crate::layout::BLOCK_NULL;
use crate::layout::npw2;
use crate::traits::block_device::BlockDevice;

/// CTZ skip-list walker.
///
/// Block `n` of a file starts with `ctz(n) + 1` little-endian pointers, the
/// `i`th pointing at block `n - 2^i`; block 0 has none. Data follows the
/// pointers, so the last block is always the head of the list.
pub struct CtzList;

impl CtzList {
    /// Index of the block holding byte `off` of a file, and the offset of
    /// that byte inside the block.
    pub fn index(block_size: u32, off: u32) -> (u32, u32) {
        let b = block_size - 2 * 4;
        let i = off / b;
        if i == 0 {
            return (0, off);
        }

        let i = (off - 4 * ((i - 1).count_ones() + 2)) / b;
        (i, off - b * i - 4 * i.count_ones())
    }

    /// Locate byte `pos` of a list of `size` bytes ending at `head`.
    pub fn find<D: BlockDevice>(
        io: &mut BlockIo<D>,
        pcache: Option<&Cache>,
        rcache: &mut Cache,
        mut head: u32,
        size: u32,
        pos: u32,
    ) -> Result<(u32, u32)> {
        if size == 0 {
            return Ok((BLOCK_NULL, 0));
        }

        let block_size = io.block_size();
        let (mut current, _) = Self::index(block_size, size - 1);
        let (target, off) = Self::index(block_size, pos);

        while current > target {
            let skip = (npw2(current - target + 1) - 1).min(current.trailing_zeros());

            let mut raw = [0u8; 4];
            io.read(pcache, rcache, 4, head, 4 * skip, &mut raw)?;
            head = u32::from_le_bytes(raw);

            current -= 1 << skip;
        }

        Ok((head, off))
    }

    /// Call `cb` for every block of the list.
    pub fn traverse<D: BlockDevice>(
        io: &mut BlockIo<D>,
        pcache: Option<&Cache>,
        rcache: &mut Cache,
        mut head: u32,
        size: u32,
        cb: &mut dyn FnMut(u32) -> Result<()>,
    ) -> Result<()> {
        if size == 0 {
            return Ok(());
        }

        let (mut index, _) = Self::index(io.block_size(), size - 1);

        loop {
            cb(head)?;

            if index == 0 {
                return Ok(());
            }

            // odd blocks carry a single pointer, the skip pointer of an even
            // block is followed in the same step
            let count = 2 - (index & 1) as usize;
            let mut raw = [0u8; 8];
            io.read(pcache, rcache, 4 * count as u32, head, 0, &mut raw[..4 * count])?;
            let heads = [
                u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
                u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
            ];

            for &block in &heads[..count - 1] {
                cb(block)?;
            }

            head = heads[count - 1];
            index -= count as u32;
        }
    }
}

impl<D: BlockDevice> LittleFs<D> {
    /// Grow the list ending at `head` by one block for the open file in
    /// `slot`, returning the new head and the offset at which data continues.
    /// Writes go through the file's cache.
    ///
    /// A partially filled last block is copied rather than appended to, since
    /// programmed blocks can not be written again without an erase.
    pub(crate) fn ctz_extend(&mut self, slot: usize, head: u32, size: u32) -> Result<(u32, u32)> {
        loop {
            // go ahead and grab a block
            let nblock = self.alloc()?;
            if let Some(found) = self.ctz_extend_into(slot, nblock, head, size)? {
                return Ok(found);
            }

            debug!("Bad block at {:#x}", nblock);
            // just clear cache and try a new block
            self.handles.file_mut(slot)?.cache.invalidate();
        }
    }

    /// `Ok(None)` when `nblock` turned out to be bad.
    fn ctz_extend_into(
        &mut self,
        slot: usize,
        nblock: u32,
        head: u32,
        size: u32,
    ) -> Result<Option<(u32, u32)>> {
        let block_size = self.cfg.block_size;
        let LittleFs {
            io,
            rcache,
            handles,
            ..
        } = self;
        let pcache = &mut handles.file_mut(slot)?.cache;

        if is_bad_block(io.erase(nblock))? {
            return Ok(None);
        }

        if size == 0 {
            return Ok(Some((nblock, 0)));
        }

        let (index, noff) = CtzList::index(block_size, size - 1);
        let noff = noff + 1;

        // just copy out the last block if it is incomplete
        if noff != block_size {
            let mut chunk = [0u8; 32];
            let mut i = 0u32;
            while i < noff {
                let n = (noff - i).min(chunk.len() as u32) as usize;
                io.read(None, rcache, noff - i, head, i, &mut chunk[..n])?;
                if is_bad_block(io.prog(pcache, rcache, true, nblock, i, &chunk[..n]))? {
                    return Ok(None);
                }
                i += n as u32;
            }

            return Ok(Some((nblock, noff)));
        }

        // append block
        let index = index + 1;
        let skips = index.trailing_zeros() + 1;
        let mut nhead = head;
        for i in 0..skips {
            let res = io.prog(pcache, rcache, true, nblock, 4 * i, &nhead.to_le_bytes());
            if is_bad_block(res)? {
                return Ok(None);
            }

            if i != skips - 1 {
                let mut raw = [0u8; 4];
                io.read(None, rcache, 4, nhead, 4 * i, &mut raw)?;
                nhead = u32::from_le_bytes(raw);
            }
        }

        Ok(Some((nblock, 4 * skips)))
    }
}

/// Writes that fail with `Corrupt` mark the target block as bad.
pub(crate) fn is_bad_block(res: Result<()>) -> Result<bool> {
    match res {
        Ok(()) => Ok(false),
        Err(LfsError::Corrupt) => Ok(true),
        Err(err) => Err(err),
    }
}
