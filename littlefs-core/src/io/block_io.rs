use core::cmp::Ordering;

use crate::config::Config;
use crate::error::{LfsError, Result};
use crate::io::cache::Cache;
use crate::layout::{BLOCK_INLINE, BLOCK_NULL, aligndown, alignup};
use crate::traits::block_device::BlockDevice;

/// Cached access to a [`BlockDevice`].
///
/// Caches are passed in rather than owned: metadata goes through the
/// filesystem's read/program caches while file data goes through the
/// file's own cache, and callers pick the combination per operation.
pub struct BlockIo<D: BlockDevice> {
    device: D,
    read_size: u32,
    prog_size: u32,
    block_size: u32,
    block_count: u32,
    cache_size: u32,
}

impl<D: BlockDevice> BlockIo<D> {
    pub fn new(device: D, cfg: &Config) -> Self {
        Self {
            device,
            read_size: cfg.read_size,
            prog_size: cfg.prog_size,
            block_size: cfg.block_size,
            block_count: cfg.block_count,
            cache_size: cfg.cache_size,
        }
    }

    pub fn into_inner(self) -> D {
        self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    pub fn prog_size(&self) -> u32 {
        self.prog_size
    }

    pub fn cache_size(&self) -> u32 {
        self.cache_size
    }

    /// Read `buf.len()` bytes at `(block, off)`.
    ///
    /// Lookup order is the program cache (unflushed data wins), then the read
    /// cache, then the device. Large aligned runs of at least `hint` bytes
    /// bypass the read cache; otherwise the read cache is refilled with up to
    /// `hint` bytes starting at `off`.
    pub fn read(
        &mut self,
        pcache: Option<&Cache>,
        rcache: &mut Cache,
        hint: u32,
        block: u32,
        mut off: u32,
        buf: &mut [u8],
    ) -> Result<()> {
        if block >= self.block_count || off as usize + buf.len() > self.block_size as usize {
            return Err(LfsError::Corrupt);
        }

        let mut done = 0usize;
        while done < buf.len() {
            let size = (buf.len() - done) as u32;
            let mut diff = size;

            if let Some(pcache) = pcache {
                if block == pcache.block && off < pcache.off + pcache.size {
                    if off >= pcache.off {
                        // is already in pcache?
                        diff = diff.min(pcache.size - (off - pcache.off));
                        let start = (off - pcache.off) as usize;
                        buf[done..done + diff as usize]
                            .copy_from_slice(&pcache.buffer[start..start + diff as usize]);
                        done += diff as usize;
                        off += diff;
                        continue;
                    }
                    // pcache takes priority
                    diff = diff.min(pcache.off - off);
                }
            }

            if block == rcache.block && off < rcache.off + rcache.size {
                if off >= rcache.off {
                    diff = diff.min(rcache.size - (off - rcache.off));
                    let start = (off - rcache.off) as usize;
                    buf[done..done + diff as usize]
                        .copy_from_slice(&rcache.buffer[start..start + diff as usize]);
                    done += diff as usize;
                    off += diff;
                    continue;
                }
                diff = diff.min(rcache.off - off);
            }

            if size >= hint && off % self.read_size == 0 && size >= self.read_size {
                // bypass cache
                diff = aligndown(diff, self.read_size);
                self.device
                    .read(block, off, &mut buf[done..done + diff as usize])?;
                done += diff as usize;
                off += diff;
                continue;
            }

            // load to cache, first condition can no longer fail
            rcache.block = block;
            rcache.off = aligndown(off, self.read_size);
            rcache.size = (alignup(off.saturating_add(hint), self.read_size).min(self.block_size)
                - rcache.off)
                .min(self.cache_size);
            let len = rcache.size as usize;
            if let Err(err) = self.device.read(block, rcache.off, &mut rcache.buffer[..len]) {
                rcache.invalidate();
                return Err(err);
            }
        }

        Ok(())
    }

    /// Compare on-disk bytes at `(block, off)` with `data`.
    ///
    /// `Less` means the disk content sorts before `data`.
    pub fn cmp(
        &mut self,
        pcache: Option<&Cache>,
        rcache: &mut Cache,
        hint: u32,
        block: u32,
        off: u32,
        data: &[u8],
    ) -> Result<Ordering> {
        let mut dat = [0u8; 8];
        let mut i = 0usize;
        while i < data.len() {
            let diff = (data.len() - i).min(dat.len());
            self.read(
                pcache,
                rcache,
                hint.saturating_sub(i as u32),
                block,
                off + i as u32,
                &mut dat[..diff],
            )?;

            let ord = dat[..diff].cmp(&data[i..i + diff]);
            if ord != Ordering::Equal {
                return Ok(ord);
            }
            i += diff;
        }
        Ok(Ordering::Equal)
    }

    /// Write out the program cache, optionally reading it back.
    ///
    /// A read-back mismatch is reported as `Corrupt`, the only way bad
    /// blocks are detected.
    pub fn flush(&mut self, pcache: &mut Cache, rcache: &mut Cache, validate: bool) -> Result<()> {
        if pcache.block != BLOCK_NULL && pcache.block != BLOCK_INLINE {
            debug_assert!(pcache.block < self.block_count);
            let diff = alignup(pcache.size, self.prog_size);
            self.device
                .prog(pcache.block, pcache.off, &pcache.buffer[..diff as usize])?;

            if validate {
                // check data on disk
                rcache.invalidate();
                let res = self.cmp(
                    None,
                    rcache,
                    diff,
                    pcache.block,
                    pcache.off,
                    &pcache.buffer[..diff as usize],
                )?;
                if res != Ordering::Equal {
                    return Err(LfsError::Corrupt);
                }
            }

            pcache.reset();
        }

        Ok(())
    }

    /// Flush and ask the device to persist everything.
    pub fn sync(&mut self, pcache: &mut Cache, rcache: &mut Cache, validate: bool) -> Result<()> {
        rcache.invalidate();
        self.flush(pcache, rcache, validate)?;
        self.device.sync()
    }

    /// Buffer `data` for `(block, off)` in the program cache.
    ///
    /// The cache is written out as soon as it fills up, or before it is
    /// redirected to a different region.
    pub fn prog(
        &mut self,
        pcache: &mut Cache,
        rcache: &mut Cache,
        validate: bool,
        block: u32,
        mut off: u32,
        data: &[u8],
    ) -> Result<()> {
        debug_assert!(block == BLOCK_INLINE || block < self.block_count);
        debug_assert!(off as usize + data.len() <= self.block_size as usize);

        let mut done = 0usize;
        while done < data.len() {
            if block == pcache.block
                && off >= pcache.off
                && off < pcache.off + self.cache_size
            {
                // already fits in pcache?
                let diff = (data.len() - done).min((self.cache_size - (off - pcache.off)) as usize);
                let start = (off - pcache.off) as usize;
                pcache.buffer[start..start + diff].copy_from_slice(&data[done..done + diff]);

                done += diff;
                off += diff as u32;
                pcache.size = pcache.size.max(off - pcache.off);
                if pcache.size == self.cache_size {
                    // eagerly flush out pcache if we fill up
                    self.flush(pcache, rcache, validate)?;
                }
                continue;
            }

            if pcache.block != BLOCK_NULL {
                self.flush(pcache, rcache, validate)?;
            }

            // prepare pcache, first condition can no longer fail
            pcache.block = block;
            pcache.off = aligndown(off, self.prog_size);
            pcache.size = 0;
        }

        Ok(())
    }

    pub fn erase(&mut self, block: u32) -> Result<()> {
        if block >= self.block_count {
            return Err(LfsError::Corrupt);
        }
        self.device.erase(block)
    }
}

#[cfg(test)]
mod tests {
    use core::cmp::Ordering;

    use super::BlockIo;
    use crate::config::Config;
    use crate::error::LfsError;
    use crate::io::cache::Cache;
    use crate::io::ram_device::{BadBlock, RamBlockDevice};

    fn setup() -> (BlockIo<RamBlockDevice>, Cache, Cache) {
        let cfg = Config::new(512, 8).with_io_sizes(16, 16, 64);
        let dev = RamBlockDevice::new(512, 8);
        (BlockIo::new(dev, &cfg), Cache::new(64), Cache::new(64))
    }

    #[test]
    fn test_prog_is_buffered_until_flush() {
        let (mut io, mut pcache, mut rcache) = setup();
        io.erase(2).unwrap();
        io.prog(&mut pcache, &mut rcache, false, 2, 0, b"hello").unwrap();
        assert_eq!(io.device_mut().progs(), 0);

        // pcache data is visible to reads that consult it
        let mut buf = [0u8; 5];
        io.read(Some(&pcache), &mut rcache, 5, 2, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        io.flush(&mut pcache, &mut rcache, true).unwrap();
        assert_eq!(io.device_mut().progs(), 1);
        let mut buf = [0u8; 5];
        io.read(None, &mut rcache, 5, 2, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_prog_flushes_when_redirected() {
        let (mut io, mut pcache, mut rcache) = setup();
        io.erase(1).unwrap();
        io.erase(3).unwrap();
        io.prog(&mut pcache, &mut rcache, true, 1, 0, b"abcd").unwrap();
        io.prog(&mut pcache, &mut rcache, true, 3, 0, b"efgh").unwrap();
        let mut buf = [0u8; 4];
        io.read(None, &mut rcache, 4, 1, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"abcd");
        assert_eq!(pcache.block, 3);
    }

    #[test]
    fn test_validation_reports_bad_block() {
        let (mut io, mut pcache, mut rcache) = setup();
        io.device_mut().set_bad_block(4, BadBlock::ProgNoop);
        io.erase(4).unwrap();
        io.prog(&mut pcache, &mut rcache, true, 4, 0, b"data").unwrap();
        assert_eq!(
            io.flush(&mut pcache, &mut rcache, true),
            Err(LfsError::Corrupt)
        );
    }

    #[test]
    fn test_cmp_orders_disk_against_data() {
        let (mut io, mut pcache, mut rcache) = setup();
        io.erase(0).unwrap();
        io.prog(&mut pcache, &mut rcache, false, 0, 0, b"littlefs").unwrap();
        io.flush(&mut pcache, &mut rcache, false).unwrap();
        assert_eq!(
            io.cmp(None, &mut rcache, 8, 0, 0, b"littlefs").unwrap(),
            Ordering::Equal
        );
        assert_eq!(
            io.cmp(None, &mut rcache, 8, 0, 0, b"littlefz").unwrap(),
            Ordering::Less
        );
    }

    #[test]
    fn test_out_of_range_read_is_corrupt() {
        let (mut io, _pcache, mut rcache) = setup();
        let mut buf = [0u8; 4];
        assert_eq!(
            io.read(None, &mut rcache, 4, 8, 0, &mut buf),
            Err(LfsError::Corrupt)
        );
        assert_eq!(
            io.read(None, &mut rcache, 4, 0, 510, &mut buf),
            Err(LfsError::Corrupt)
        );
    }
}
