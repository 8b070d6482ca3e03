use core::cmp::Ordering;

use alloc::string::String;
use alloc::vec;

use log::error;

use crate::error::{LfsError, Result};
use crate::fs::{FileType, Info, LittleFs};
use crate::io::cache::Cache;
use crate::layout::crc::crc32;
use crate::layout::ctz::CtzStruct;
use crate::layout::gstate::GState;
use crate::layout::pair::{self, Pair};
use crate::layout::tag::{
    ID_NONE, TYPE_CRC, TYPE_CREATE, TYPE_CTZSTRUCT, TYPE_DELETE, TYPE_INLINESTRUCT,
    TYPE_MOVESTATE, TYPE_NAME, TYPE_REG, TYPE_SPLICE, TYPE_STRUCT, TYPE_SUPERBLOCK, TYPE_TAIL, Tag,
};
use crate::layout::{BLOCK_INLINE, BLOCK_NULL, aligndown, alignup, scmp};
use crate::traits::block_device::BlockDevice;

/// In-memory state of one metadata pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MDir {
    /// `pair[0]` holds the most recent revision.
    pub pair: Pair,
    pub rev: u32,
    /// End of the last valid commit in `pair[0]`.
    pub off: u32,
    /// Last tag of the log, the XOR seed for the next append.
    pub etag: Tag,
    pub count: u16,
    /// Space after `off` is still erased and can take an append.
    pub erased: bool,
    /// The tail continues this directory rather than starting the next one.
    pub split: bool,
    pub tail: Pair,
}

impl MDir {
    /// Placeholder whose tail points at the root pair, the start of every
    /// walk over the metadata list.
    pub fn list_head() -> MDir {
        MDir {
            tail: pair::ROOT_PAIR,
            ..MDir::default()
        }
    }
}

/// Location of a tag payload on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskOff {
    pub block: u32,
    pub off: u32,
}

/// What a fetch compares matching tags against.
#[derive(Debug, Clone, Copy)]
pub(crate) enum FetchMatcher<'a> {
    /// Entry name, ordered so lookups yield an insertion point.
    Name(&'a [u8]),
    /// Directory-struct payload pointing at a child pair.
    ChildPair(Pair),
}

impl<D: BlockDevice> LittleFs<D> {
    /// Fetch `pair` into `dir` while looking for the tag matching
    /// `(fmask, ftag)` whose payload `matcher` accepts.
    ///
    /// Returns the best matching tag, `Tag::NOOP` when no entry matched and
    /// the matcher ran off the end, or `NoEnt` when the matcher stopped at a
    /// live id, with `id` set to that insertion point.
    pub(crate) fn dir_fetchmatch(
        &mut self,
        dir: &mut MDir,
        pair: Pair,
        fmask: Tag,
        ftag: Tag,
        mut id: Option<&mut u16>,
        matcher: Option<FetchMatcher<'_>>,
    ) -> Result<Tag> {
        let block_count = self.cfg.block_count;
        let block_size = self.cfg.block_size;
        let mut besttag = Tag::NONE;

        // an invalid block address would be written to later otherwise
        if pair[0] >= block_count || pair[1] >= block_count {
            return Err(LfsError::Corrupt);
        }

        // find the block with the most recent revision
        let mut revs = [0u32; 2];
        let mut r = 0usize;
        for i in 0..2 {
            let mut raw = [0u8; 4];
            match self.io.read(None, &mut self.rcache, 4, pair[i], 0, &mut raw) {
                Ok(()) => {
                    revs[i] = u32::from_le_bytes(raw);
                    if scmp(revs[i], revs[(i + 1) % 2]) > 0 {
                        r = i;
                    }
                }
                Err(LfsError::Corrupt) => {}
                Err(err) => return Err(err),
            }
        }

        dir.pair = [pair[r % 2], pair[(r + 1) % 2]];
        dir.rev = revs[r % 2];
        dir.off = 0; // nonzero = found some commits

        // now scan tags to fetch the actual dir and find possible match
        for attempt in 0..2 {
            let mut off = 0u32;
            let mut ptag = Tag::NONE;

            let mut tempcount: u16 = 0;
            let mut temptail: Pair = [BLOCK_NULL, BLOCK_NULL];
            let mut tempsplit = false;
            let mut tempbesttag = besttag;

            let mut crc = crc32(0xffff_ffff, &dir.rev.to_le_bytes());

            loop {
                // extract next tag
                off += ptag.dsize();
                let mut raw = [0u8; 4];
                match self
                    .io
                    .read(None, &mut self.rcache, block_size, dir.pair[0], off, &mut raw)
                {
                    Ok(()) => {}
                    Err(LfsError::Corrupt) => {
                        // can't continue?
                        dir.erased = false;
                        break;
                    }
                    Err(err) => return Err(err),
                }

                crc = crc32(crc, &raw);
                let tag = Tag::decode(raw, ptag);

                // next commit not yet programmed or we're not in valid range
                if !tag.is_valid() {
                    dir.erased = ptag.type1() == TYPE_CRC && dir.off % self.cfg.prog_size == 0;
                    break;
                } else if off + tag.dsize() > block_size {
                    dir.erased = false;
                    break;
                }

                ptag = tag;

                if tag.type1() == TYPE_CRC {
                    // check the crc attr
                    let mut raw = [0u8; 4];
                    match self.io.read(
                        None,
                        &mut self.rcache,
                        block_size,
                        dir.pair[0],
                        off + 4,
                        &mut raw,
                    ) {
                        Ok(()) => {}
                        Err(LfsError::Corrupt) => {
                            dir.erased = false;
                            break;
                        }
                        Err(err) => return Err(err),
                    }

                    if crc != u32::from_le_bytes(raw) {
                        dir.erased = false;
                        break;
                    }

                    // reset the next bit if we need to
                    ptag = Tag(ptag.0 ^ (((tag.chunk() & 1) as u32) << 31));

                    // toss our crc into the filesystem seed for
                    // pseudorandom numbers
                    self.seed = crc32(self.seed, &crc.to_le_bytes());

                    // update with what's found so far
                    besttag = tempbesttag;
                    dir.off = off + tag.dsize();
                    dir.etag = ptag;
                    dir.count = tempcount;
                    dir.tail = temptail;
                    dir.split = tempsplit;

                    // reset crc
                    crc = 0xffff_ffff;
                    continue;
                }

                // crc the entry first, hopefully leaving it in the cache
                let mut corrupt = false;
                let mut j = 4u32;
                let mut chunk = [0u8; 32];
                while j < tag.dsize() {
                    let n = (tag.dsize() - j).min(chunk.len() as u32) as usize;
                    match self.io.read(
                        None,
                        &mut self.rcache,
                        block_size,
                        dir.pair[0],
                        off + j,
                        &mut chunk[..n],
                    ) {
                        Ok(()) => {}
                        Err(LfsError::Corrupt) => {
                            corrupt = true;
                            break;
                        }
                        Err(err) => return Err(err),
                    }
                    crc = crc32(crc, &chunk[..n]);
                    j += n as u32;
                }
                if corrupt {
                    dir.erased = false;
                    break;
                }

                // directory modification tags?
                if tag.type1() == TYPE_NAME {
                    // increase count of files if necessary
                    if tag.id() >= tempcount {
                        tempcount = tag.id() + 1;
                    }
                } else if tag.type1() == TYPE_SPLICE {
                    tempcount = (tempcount as i32 + tag.splice() as i32) as u16;

                    if tag == Tag(Tag::new(TYPE_DELETE, 0, 0).0 | (Tag::new(0, 0x3ff, 0).0 & tempbesttag.0)) {
                        tempbesttag = Tag(tempbesttag.0 | 0x8000_0000);
                    } else if tempbesttag != Tag::NONE && tag.id() <= tempbesttag.id() {
                        tempbesttag = tempbesttag.shift_id(tag.splice() as i32);
                    }
                } else if tag.type1() == TYPE_TAIL {
                    tempsplit = tag.chunk() & 1 != 0;

                    let mut raw = [0u8; 8];
                    match self.io.read(
                        None,
                        &mut self.rcache,
                        block_size,
                        dir.pair[0],
                        off + 4,
                        &mut raw,
                    ) {
                        Ok(()) => temptail = pair::from_bytes(&raw),
                        Err(LfsError::Corrupt) => {
                            dir.erased = false;
                            break;
                        }
                        Err(err) => return Err(err),
                    }
                }

                // found a match for our fetcher?
                if tag.matches(fmask, ftag) {
                    let Some(matcher) = matcher else { continue };
                    let disk = DiskOff {
                        block: dir.pair[0],
                        off: off + 4,
                    };
                    let res = match self.fetch_match_cmp(matcher, tag, disk) {
                        Ok(res) => res,
                        Err(LfsError::Corrupt) => {
                            dir.erased = false;
                            break;
                        }
                        Err(err) => return Err(err),
                    };

                    if res == Ordering::Equal {
                        // found a match
                        tempbesttag = tag;
                    } else if tag.matches(Tag::new(0x7ff, 0x3ff, 0), tempbesttag) {
                        // found an identical tag, but contents didn't match
                        // this must mean that our besttag has been overwritten
                        tempbesttag = Tag::NONE;
                    } else if res == Ordering::Greater && tag.id() <= tempbesttag.id() {
                        // found a greater match, keep track to keep things sorted
                        tempbesttag = Tag(tag.0 | 0x8000_0000);
                    }
                }
            }

            // consider what we have good enough
            if dir.off > 0 {
                // synthetic move
                if self.gdisk.has_move_here(&dir.pair) {
                    if self.gdisk.move_id() == besttag.id() {
                        besttag = Tag(besttag.0 | 0x8000_0000);
                    } else if besttag != Tag::NONE && self.gdisk.move_id() < besttag.id() {
                        besttag = besttag.shift_id(-1);
                    }
                }

                // found tag? or found best id?
                if let Some(id) = id.as_deref_mut() {
                    *id = besttag.id().min(dir.count);
                }

                return if besttag.is_valid() {
                    Ok(besttag)
                } else if besttag.id() < dir.count {
                    Err(LfsError::NoEnt)
                } else {
                    Ok(Tag::NOOP)
                };
            }

            // failed, try the other block?
            if attempt == 0 {
                dir.pair.swap(0, 1);
                dir.rev = revs[(r + 1) % 2];
            }
        }

        error!(
            "Corrupted dir pair at {{{:#x}, {:#x}}}",
            dir.pair[0], dir.pair[1]
        );
        Err(LfsError::Corrupt)
    }

    /// Plain fetch of a metadata pair.
    pub(crate) fn dir_fetch(&mut self, dir: &mut MDir, pair: Pair) -> Result<()> {
        // a fetch with an all-ones mask never matches
        match self.dir_fetchmatch(dir, pair, Tag::NONE, Tag::NONE, None, None) {
            Ok(_) | Err(LfsError::NoEnt) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn fetch_match_cmp(
        &mut self,
        matcher: FetchMatcher<'_>,
        tag: Tag,
        disk: DiskOff,
    ) -> Result<Ordering> {
        match matcher {
            FetchMatcher::Name(name) => {
                // compare with disk
                let diff = (name.len() as u32).min(tag.size()) as usize;
                let res = self.io.cmp(
                    None,
                    &mut self.rcache,
                    diff as u32,
                    disk.block,
                    disk.off,
                    &name[..diff],
                )?;
                if res != Ordering::Equal {
                    return Ok(res);
                }

                // only equal if our size is still the same
                Ok((name.len() as u32).cmp(&tag.size()))
            }
            FetchMatcher::ChildPair(want) => {
                let mut raw = [0u8; 8];
                self.io.read(
                    Some(&self.pcache),
                    &mut self.rcache,
                    self.cfg.block_size,
                    disk.block,
                    disk.off,
                    &mut raw,
                )?;
                let child = pair::from_bytes(&raw);
                Ok(if pair::same(&child, &want) {
                    Ordering::Equal
                } else {
                    Ordering::Less
                })
            }
        }
    }

    /// Find the most recent tag matching `(gmask, gtag)` and read its payload
    /// from `goff` into `buf`, zero-filling what the payload does not cover.
    ///
    /// The log is walked backwards from the end, tracking creates and deletes
    /// so the id asked for is followed through earlier renumbering.
    pub(crate) fn dir_getslice(
        &mut self,
        dir: &MDir,
        gmask: Tag,
        gtag: Tag,
        goff: u32,
        buf: &mut [u8],
    ) -> Result<Tag> {
        let mut off = dir.off;
        let mut ntag = dir.etag;
        let mut gdiff: u32 = 0;

        if self.gdisk.has_move_here(&dir.pair)
            && gmask.id() != 0
            && self.gdisk.move_id() <= gtag.id()
        {
            // synthetic moves
            gdiff = gdiff.wrapping_sub(Tag::id_delta(1));
        }

        // iterate over dir block backwards (for faster lookups)
        while off >= 4 + ntag.dsize() {
            off -= ntag.dsize();
            let tag = ntag;
            let mut raw = [0u8; 4];
            self.io
                .read(None, &mut self.rcache, 4, dir.pair[0], off, &mut raw)?;
            ntag = Tag((u32::from_be_bytes(raw) ^ tag.0) & 0x7fff_ffff);

            let target = Tag(gtag.0.wrapping_sub(gdiff));
            if gmask.id() != 0 && tag.type1() == TYPE_SPLICE && tag.id() <= target.id() {
                if tag == Tag(Tag::new(TYPE_CREATE, 0, 0).0 | (Tag::new(0, 0x3ff, 0).0 & target.0)) {
                    // found where we were created
                    return Err(LfsError::NoEnt);
                }

                // move around splices
                gdiff = gdiff.wrapping_add(Tag::id_delta(tag.splice() as i32));
            }

            if tag.matches(gmask, Tag(gtag.0.wrapping_sub(gdiff))) {
                if tag.is_delete() {
                    return Err(LfsError::NoEnt);
                }

                let diff = (tag.size().saturating_sub(goff) as usize).min(buf.len());
                self.io.read(
                    None,
                    &mut self.rcache,
                    diff as u32,
                    dir.pair[0],
                    off + 4 + goff,
                    &mut buf[..diff],
                )?;
                buf[diff..].fill(0);

                return Ok(Tag(tag.0.wrapping_add(gdiff)));
            }
        }

        Err(LfsError::NoEnt)
    }

    /// [`Self::dir_getslice`] from the start of the payload.
    pub(crate) fn dir_get(
        &mut self,
        dir: &MDir,
        gmask: Tag,
        gtag: Tag,
        buf: &mut [u8],
    ) -> Result<Tag> {
        self.dir_getslice(dir, gmask, gtag, 0, buf)
    }

    /// Fetch the pair stored in the directory-struct of entry `id`.
    pub(crate) fn dir_get_pair(&mut self, dir: &MDir, id: u16) -> Result<Pair> {
        let mut raw = [0u8; 8];
        self.dir_get(
            dir,
            Tag::new(0x700, 0x3ff, 0),
            Tag::new(TYPE_STRUCT, id, 8),
            &mut raw,
        )?;
        Ok(pair::from_bytes(&raw))
    }

    /// Fold the gstate delta stored in `dir` into `gstate`.
    pub(crate) fn dir_getgstate(&mut self, dir: &MDir, gstate: &mut GState) -> Result<()> {
        let mut raw = [0u8; GState::DISK_SIZE];
        match self.dir_get(
            dir,
            Tag::new(0x7ff, 0, 0),
            Tag::new(TYPE_MOVESTATE, 0, GState::DISK_SIZE as u32),
            &mut raw,
        ) {
            Ok(_) => {
                gstate.xor(&GState::parse(&raw));
                Ok(())
            }
            Err(LfsError::NoEnt) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Name, kind and size of entry `id`.
    pub(crate) fn dir_getinfo(&mut self, dir: &MDir, id: u16) -> Result<Info> {
        if id == ID_NONE {
            // special case for root
            return Ok(Info {
                kind: FileType::Dir,
                size: 0,
                name: String::from("/"),
            });
        }

        let mut name = vec![0u8; self.cfg.name_max as usize + 1];
        let tag = self.dir_get(
            dir,
            Tag::new(0x780, 0x3ff, 0),
            Tag::new(TYPE_NAME, id, self.cfg.name_max + 1),
            &mut name,
        )?;
        if tag.type3() == TYPE_SUPERBLOCK {
            // not an entry of the directory
            return Err(LfsError::NoEnt);
        }
        name.truncate((tag.size() as usize).min(name.len()));

        let kind = if tag.type3() == TYPE_REG {
            FileType::Reg
        } else {
            FileType::Dir
        };

        let mut raw = [0u8; CtzStruct::DISK_SIZE];
        let stag = self.dir_get(
            dir,
            Tag::new(0x700, 0x3ff, 0),
            Tag::new(TYPE_STRUCT, id, CtzStruct::DISK_SIZE as u32),
            &mut raw,
        )?;
        let size = match stag.type3() {
            TYPE_CTZSTRUCT => CtzStruct::parse(&raw).size,
            TYPE_INLINESTRUCT => stag.size(),
            _ => 0,
        };

        Ok(Info {
            kind,
            size,
            name: String::from_utf8_lossy(&name).into_owned(),
        })
    }

    /// Read from the inline payload of entry `id` through `cache`.
    ///
    /// Mirrors a device read for inline files: the cache window is keyed by
    /// [`BLOCK_INLINE`] and refilled from the metadata log when missed.
    pub(crate) fn dir_getread(
        &mut self,
        dir: &MDir,
        cache: &mut Cache,
        hint: u32,
        gmask: Tag,
        gtag: Tag,
        mut off: u32,
        buf: &mut [u8],
    ) -> Result<()> {
        if off as usize + buf.len() > self.cfg.block_size as usize {
            return Err(LfsError::Corrupt);
        }

        let mut done = 0usize;
        while done < buf.len() {
            let mut diff = (buf.len() - done) as u32;

            if cache.block == BLOCK_INLINE && off < cache.off + cache.size {
                if off >= cache.off {
                    // is already in cache?
                    diff = diff.min(cache.size - (off - cache.off));
                    let start = (off - cache.off) as usize;
                    buf[done..done + diff as usize]
                        .copy_from_slice(&cache.buffer[start..start + diff as usize]);
                    done += diff as usize;
                    off += diff;
                    continue;
                }
            }

            // load to cache, first condition can no longer fail
            cache.block = BLOCK_INLINE;
            cache.off = aligndown(off, self.cfg.read_size);
            cache.size = alignup(off + hint, self.cfg.read_size)
                .min(self.cfg.cache_size);
            let len = cache.size as usize;
            let coff = cache.off;
            if let Err(err) = self.dir_getslice(dir, gmask, gtag, coff, &mut cache.buffer[..len]) {
                cache.invalidate();
                return Err(err);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::MDir;
    use crate::layout::pair::ROOT_PAIR;

    #[test]
    fn test_list_head_points_at_root() {
        let head = MDir::list_head();
        assert_eq!(head.tail, ROOT_PAIR);
        assert!(!head.split);
    }
}
