//! Appending to metadata logs, compaction, splitting and relocation of
//! metadata pairs.
//!
//! A commit is a run of XOR-chained tags followed by a CRC tag padded up to
//! the program size. When the log runs out of space it is compacted into
//! the other block of the pair, keeping only the latest version of every
//! tag; compactions that do not fit split the pair into a tail pair.

use log::{debug, warn};

use crate::error::{LfsError, Result};
use crate::fs::LittleFs;
use crate::fs_core::mdir::MDir;
use crate::fs_core::registry::Handle;
use crate::fs_core::traverse::{AttrBuf, MAttr};
use crate::layout::crc::crc32;
use crate::layout::gstate::GState;
use crate::layout::pair::{self, Pair};
use crate::layout::tag::{
    TYPE_CRC, TYPE_CREATE, TYPE_DELETE, TYPE_MOVESTATE, TYPE_NAME, TYPE_TAIL, Tag,
};
use crate::layout::{BLOCK_NULL, alignup};
use crate::traits::block_device::BlockDevice;

/// Bytes a compaction reserves for tail, CRC, gstate and a cleanup delete.
const COMPACT_RESERVE: u32 = 36;

/// Revisions between evictions of a pair for `block_cycles`.
///
/// `(block_cycles + 1) | 1` avoids endless relocation at 1 and aliasing onto
/// a single block of the pair for even values.
fn rev_modulus(block_cycles: u32) -> u32 {
    (block_cycles + 1) | 1
}

/// Round `rev` up to the next multiple of the wear-leveling modulus in
/// wrapping u32 arithmetic.
fn align_rev(rev: u32, block_cycles: u32) -> u32 {
    let m = rev_modulus(block_cycles);
    let a = rev.wrapping_add(m - 1);
    a - a % m
}

/// In-flight commit into one block.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Commit {
    pub block: u32,
    pub off: u32,
    pub ptag: Tag,
    pub crc: u32,
    pub begin: u32,
    pub end: u32,
}

impl<D: BlockDevice> LittleFs<D> {
    fn commit_prog(&mut self, commit: &mut Commit, data: &[u8]) -> Result<()> {
        self.io.prog(
            &mut self.pcache,
            &mut self.rcache,
            false,
            commit.block,
            commit.off,
            data,
        )?;
        commit.crc = crc32(commit.crc, data);
        commit.off += data.len() as u32;
        Ok(())
    }

    /// Append one tag and its payload.
    pub(crate) fn commit_attr(
        &mut self,
        commit: &mut Commit,
        tag: Tag,
        buf: &AttrBuf<'_>,
    ) -> Result<()> {
        // check if we fit
        let dsize = tag.dsize();
        if commit.off + dsize > commit.end {
            return Err(LfsError::NoSpc);
        }

        // write out tag
        let raw = Tag(tag.0 & 0x7fff_ffff).encode(commit.ptag);
        self.commit_prog(commit, &raw)?;

        let len = (dsize - 4) as usize;
        match buf {
            AttrBuf::Disk(disk) => {
                // rely on caching to make this efficient
                let mut chunk = [0u8; 32];
                let mut i = 0usize;
                while i < len {
                    let n = (len - i).min(chunk.len());
                    self.io.read(
                        None,
                        &mut self.rcache,
                        (len - i) as u32,
                        disk.block,
                        disk.off + i as u32,
                        &mut chunk[..n],
                    )?;
                    self.commit_prog(commit, &chunk[..n])?;
                    i += n;
                }
            }
            AttrBuf::Bytes(data) if data.len() >= len => {
                self.commit_prog(commit, &data[..len])?;
            }
            _ if len == 0 => {}
            _ => return Err(LfsError::Inval),
        }

        commit.ptag = Tag(tag.0 & 0x7fff_ffff);
        Ok(())
    }

    /// Seal the commit with CRC tags up to the next program boundary, sync,
    /// and read the result back.
    pub(crate) fn commit_crc(&mut self, commit: &mut Commit) -> Result<()> {
        // align to program units
        let end = alignup(commit.off + 8, self.cfg.prog_size);

        let mut off1 = 0u32;
        let mut crc1 = 0u32;

        // padding is not crced, which lets fetches skip it
        while commit.off < end {
            let off = commit.off + 4;
            let mut noff = (end - off).min(0x3fe) + off;
            if noff < end {
                noff = noff.min(end - 8);
            }

            // read erased state from next program unit
            let mut raw = [0xffu8; 4];
            match self
                .io
                .read(None, &mut self.rcache, 4, commit.block, noff, &mut raw)
            {
                Ok(()) | Err(LfsError::Corrupt) => {}
                Err(err) => return Err(err),
            }

            // build crc tag
            let reset = u32::from_be_bytes(raw) >> 31 == 0;
            let tag = Tag::new(TYPE_CRC + reset as u16, 0x3ff, noff - off);

            // write out crc
            let mut footer = [0u8; 8];
            footer[..4].copy_from_slice(&(tag.0 ^ commit.ptag.0).to_be_bytes());
            commit.crc = crc32(commit.crc, &footer[..4]);
            footer[4..].copy_from_slice(&commit.crc.to_le_bytes());
            self.io.prog(
                &mut self.pcache,
                &mut self.rcache,
                false,
                commit.block,
                commit.off,
                &footer,
            )?;

            // keep track of non-padding checksum to verify
            if off1 == 0 {
                off1 = commit.off + 4;
                crc1 = commit.crc;
            }

            commit.off += 4 + tag.size();
            commit.ptag = Tag(tag.0 ^ ((reset as u32) << 31));
            // reset crc for next "commit"
            commit.crc = 0xffff_ffff;
        }

        // flush buffers
        self.io.sync(&mut self.pcache, &mut self.rcache, false)?;

        // successful commit, check checksums to make sure
        let mut off = commit.begin;
        let mut noff = off1;
        while off < end {
            let mut crc = 0xffff_ffffu32;
            let mut i = off;
            let stop = noff + 4;
            let mut chunk = [0u8; 32];
            while i < stop {
                // check against written crc, may catch blocks that
                // become readonly and match our commit size exactly
                if i == off1 && crc != crc1 {
                    return Err(LfsError::Corrupt);
                }

                let mut n = (stop - i).min(chunk.len() as u32);
                if i < off1 && i + n > off1 {
                    n = off1 - i;
                }
                self.io.read(
                    None,
                    &mut self.rcache,
                    stop - i,
                    commit.block,
                    i,
                    &mut chunk[..n as usize],
                )?;
                crc = crc32(crc, &chunk[..n as usize]);
                i += n;
            }

            // detected write error?
            if crc != 0 {
                return Err(LfsError::Corrupt);
            }

            // skip padding
            off = (end - noff).min(0x3fe) + noff;
            if off < end {
                off = off.min(end - 8);
            }
            noff = off + 4;
        }

        Ok(())
    }

    /// Allocate a fresh pair. Nothing is written until the first commit.
    pub(crate) fn dir_alloc(&mut self) -> Result<MDir> {
        let mut dir = MDir::default();

        // allocate backwards, so block 1 is written first
        dir.pair[1] = self.alloc()?;
        dir.pair[0] = self.alloc()?;

        // pretend the old revision may be valid rather than clobbering it
        let mut raw = [0u8; 4];
        match self
            .io
            .read(None, &mut self.rcache, 4, dir.pair[0], 0, &mut raw)
        {
            Ok(()) => dir.rev = u32::from_le_bytes(raw),
            Err(LfsError::Corrupt) => dir.rev = 0,
            Err(err) => return Err(err),
        }

        // align to the wear-leveling modulus so we do not evict immediately,
        // wrapping like the on-disk counter does
        if self.cfg.block_cycles > 0 {
            dir.rev = align_rev(dir.rev, self.cfg.block_cycles as u32);
        }

        dir.off = 4;
        dir.etag = Tag::NONE;
        dir.count = 0;
        dir.tail = pair::NULL_PAIR;
        dir.erased = false;
        dir.split = false;
        Ok(dir)
    }

    /// Unlink the empty pair `tail` from its predecessor `dir`, handing its
    /// gstate delta over.
    pub(crate) fn dir_drop(&mut self, dir: &mut MDir, tail: &MDir) -> Result<()> {
        // steal state
        let mut gdelta = self.gdelta;
        self.dir_getgstate(tail, &mut gdelta)?;
        self.gdelta = gdelta;

        // steal tail
        let raw = pair::to_bytes(&tail.tail);
        self.dir_commit(
            dir,
            &[MAttr::bytes(
                Tag::new(TYPE_TAIL + tail.split as u16, 0x3ff, 8),
                &raw,
            )],
        )
    }

    /// Move ids `[split, end)` of `source` plus `attrs` into a new tail pair
    /// of `dir`.
    fn dir_split(
        &mut self,
        dir: &mut MDir,
        attrs: &[MAttr<'_>],
        source: &MDir,
        split: u16,
        end: u16,
    ) -> Result<()> {
        // create tail directory
        self.alloc_ack();
        let mut tail = self.dir_alloc()?;
        tail.split = dir.split;
        tail.tail = dir.tail;

        self.dir_compact(&mut tail, attrs, source, split, end)?;

        dir.tail = tail.pair;
        dir.split = true;

        // update root if needed
        if pair::same(&dir.pair, &self.root) && split == 0 {
            self.root = tail.pair;
        }
        Ok(())
    }

    /// Rewrite ids `[begin, end)` of `source` plus `attrs` into `dir`'s
    /// spare block, splitting and relocating as needed.
    pub(crate) fn dir_compact(
        &mut self,
        dir: &mut MDir,
        attrs: &[MAttr<'_>],
        source: &MDir,
        begin: u16,
        mut end: u16,
    ) -> Result<()> {
        // save some state in case block is bad
        let oldpair: Pair = dir.pair;
        let mut relocated = false;
        let mut tired = false;

        let block_size = self.cfg.block_size;
        let limit = (block_size - COMPACT_RESERVE)
            .min(alignup(self.cfg.metadata_max / 2, self.cfg.prog_size));

        // should we split?
        while end - begin > 1 {
            // find size
            let mut size = 0u32;
            self.dir_traverse(
                source,
                0,
                Tag::NONE,
                attrs,
                Tag::new(0x400, 0x3ff, 0),
                Tag::new(TYPE_NAME, 0, 0),
                begin,
                end,
                -(begin as i32),
                &mut |_fs, tag, _buf| {
                    size += tag.dsize();
                    Ok(false)
                },
            )?;

            if end - begin < 0xff && size <= limit {
                break;
            }

            // can't fit, need to split
            let split = (end - begin) / 2;
            match self.dir_split(dir, attrs, source, begin + split, end) {
                Ok(()) => {}
                // overcompact if the whole block still holds it
                Err(LfsError::NoSpc) if size <= block_size - COMPACT_RESERVE => break,
                Err(err) => return Err(err),
            }

            end = begin + split;
        }

        // increment revision count
        dir.rev = dir.rev.wrapping_add(1);

        if self.cfg.block_cycles > 0
            && dir.rev % rev_modulus(self.cfg.block_cycles as u32) == 0
        {
            if pair::same(&dir.pair, &pair::ROOT_PAIR) {
                // writing too much to the superblock, expand if there is room
                let used = self.fs_rawsize()?;
                if used < self.cfg.block_count / 2 {
                    debug!("Expanding superblock at rev {}", dir.rev);
                    match self.dir_split(dir, attrs, source, begin, end) {
                        Ok(()) => end = begin,
                        Err(LfsError::NoSpc) => {}
                        Err(err) => return Err(err),
                    }
                }
            } else {
                // we're writing too much, time to relocate
                tired = true;
            }
        }

        // the gstate already stored in this pair
        let mut stored = GState::default();
        self.dir_getgstate(dir, &mut stored)?;

        // commit compaction to blocks until a compact sticks
        loop {
            if !tired {
                match self.compact_into(dir, attrs, source, begin, end, relocated, &stored) {
                    Ok(()) => break,
                    Err(LfsError::Corrupt) => {}
                    Err(err) => return Err(err),
                }
            }

            // commit was corrupted, drop caches and prepare to relocate block
            relocated = true;
            self.pcache.invalidate();
            if !tired {
                debug!("Bad block at {:#x}", dir.pair[1]);
            }

            // can't relocate superblock, filesystem is now frozen
            if pair::same(&dir.pair, &pair::ROOT_PAIR) {
                warn!("Superblock {:#x} has become unwritable", dir.pair[1]);
                return Err(LfsError::NoSpc);
            }

            // relocate half of pair
            match self.alloc() {
                Ok(block) => dir.pair[1] = block,
                Err(LfsError::NoSpc) if tired => {}
                Err(err) => return Err(err),
            }

            tired = false;
        }

        if relocated {
            // update references if we relocated
            debug!(
                "Relocating {{{:#x}, {:#x}}} -> {{{:#x}, {:#x}}}",
                oldpair[0], oldpair[1], dir.pair[0], dir.pair[1]
            );
            self.fs_relocate(oldpair, dir.pair)?;
        }

        Ok(())
    }

    /// One compaction attempt into `dir.pair[1]`. `Corrupt` means the block
    /// went bad.
    #[allow(clippy::too_many_arguments)]
    fn compact_into(
        &mut self,
        dir: &mut MDir,
        attrs: &[MAttr<'_>],
        source: &MDir,
        begin: u16,
        end: u16,
        relocated: bool,
        stored: &GState,
    ) -> Result<()> {
        let mut commit = Commit {
            block: dir.pair[1],
            off: 0,
            ptag: Tag::NONE,
            crc: 0xffff_ffff,
            begin: 0,
            end: self.cfg.metadata_max - 8,
        };

        // erase block to write to
        self.io.erase(dir.pair[1])?;

        // write out header
        self.commit_prog(&mut commit, &dir.rev.to_le_bytes())?;

        // traverse the directory, this time writing out all unique tags
        self.dir_traverse(
            source,
            0,
            Tag::NONE,
            attrs,
            Tag::new(0x400, 0x3ff, 0),
            Tag::new(TYPE_NAME, 0, 0),
            begin,
            end,
            -(begin as i32),
            &mut |fs, tag, buf| {
                fs.commit_attr(&mut commit, tag, buf)?;
                Ok(false)
            },
        )?;

        // commit tail, which may be new after last size check
        if !pair::is_null(&dir.tail) {
            let raw = pair::to_bytes(&dir.tail);
            self.commit_attr(
                &mut commit,
                Tag::new(TYPE_TAIL + dir.split as u16, 0x3ff, 8),
                &AttrBuf::Bytes(&raw),
            )?;
        }

        // bring over gstate?
        let mut delta = GState::default();
        if !relocated {
            delta.xor(&self.gdisk);
            delta.xor(&self.gstate);
        }
        delta.xor(&self.gdelta);
        delta.tag &= !Tag::new(0, 0, 0x3ff).0;
        delta.xor(stored);

        if !delta.is_zero() {
            let raw = delta.to_bytes();
            self.commit_attr(
                &mut commit,
                Tag::new(TYPE_MOVESTATE, 0x3ff, GState::DISK_SIZE as u32),
                &AttrBuf::Bytes(&raw),
            )?;
        }

        // complete commit with crc
        self.commit_crc(&mut commit)?;

        // successful compaction, swap dir pair to indicate most recent
        debug_assert!(commit.off % self.cfg.prog_size == 0);
        dir.pair.swap(0, 1);
        dir.count = end - begin;
        dir.off = commit.off;
        dir.etag = commit.ptag;
        dir.erased = true;
        // update gstate
        self.gdelta = GState::default();
        if !relocated {
            self.gdisk = self.gstate;
        }
        Ok(())
    }

    /// Append `attrs` to `dir`'s log. `NoSpc` and `Corrupt` ask for a
    /// compaction instead.
    fn commit_append(&mut self, dir: &mut MDir, attrs: &[MAttr<'_>]) -> Result<()> {
        let mut commit = Commit {
            block: dir.pair[0],
            off: dir.off,
            ptag: dir.etag,
            crc: 0xffff_ffff,
            begin: dir.off,
            end: self.cfg.metadata_max - 8,
        };

        // traverse attrs that need to be written out
        let snapshot = *dir;
        self.dir_traverse(
            &snapshot,
            snapshot.off,
            snapshot.etag,
            attrs,
            Tag(0),
            Tag(0),
            0,
            0,
            0,
            &mut |fs, tag, buf| {
                fs.commit_attr(&mut commit, tag, buf)?;
                Ok(false)
            },
        )?;

        // commit any global diffs if we have any
        let mut delta = self.gstate.xored(&self.gdisk).xored(&self.gdelta);
        delta.tag &= !Tag::new(0, 0, 0x3ff).0;
        if !delta.is_zero() {
            self.dir_getgstate(&snapshot, &mut delta)?;
            let raw = delta.to_bytes();
            self.commit_attr(
                &mut commit,
                Tag::new(TYPE_MOVESTATE, 0x3ff, GState::DISK_SIZE as u32),
                &AttrBuf::Bytes(&raw),
            )?;
        }

        // finalize commit with the crc
        self.commit_crc(&mut commit)?;

        // successful commit, update dir
        debug_assert!(commit.off % self.cfg.prog_size == 0);
        dir.off = commit.off;
        dir.etag = commit.ptag;
        // and update gstate
        self.gdisk = self.gstate;
        self.gdelta = GState::default();
        Ok(())
    }

    /// Commit `attrs` to `dir`, then bring every open handle in step.
    pub(crate) fn dir_commit(&mut self, dir: &mut MDir, attrs: &[MAttr<'_>]) -> Result<()> {
        self.dir_commit_from(dir, attrs, None)
    }

    /// Commit `attrs` to the pair the handle in `slot` points at.
    ///
    /// The handle itself is not renumbered by its own creates and deletes,
    /// and ends up following the entry if the pair was split.
    pub(crate) fn dir_commit_handle(&mut self, slot: usize, attrs: &[MAttr<'_>]) -> Result<()> {
        let mut m = *self.handles.get(slot).ok_or(LfsError::BadF)?.m();
        self.dir_commit_from(&mut m, attrs, Some(slot))
    }

    fn dir_commit_from(
        &mut self,
        dir: &mut MDir,
        attrs: &[MAttr<'_>],
        skip: Option<usize>,
    ) -> Result<()> {
        // inline files that are not RAM backed must be evicted before the
        // pair is rewritten
        let cache_size = self.cfg.cache_size;
        for slot in 0..self.handles.slots() {
            if Some(slot) == skip {
                continue;
            }
            let evict = match self.handles.get(slot) {
                Some(Handle::File(f)) => {
                    pair::same(&f.m.pair, &dir.pair) && f.is_inline() && f.ctz.size > cache_size
                }
                _ => false,
            };
            if evict {
                self.file_outline(slot)?;
                self.file_flush(slot)?;
            }
        }

        // calculate changes to the directory
        let olddir = *dir;
        let mut hasdelete = false;
        for a in attrs {
            if a.tag.type3() == TYPE_CREATE {
                dir.count += 1;
            } else if a.tag.type3() == TYPE_DELETE {
                debug_assert!(dir.count > 0);
                dir.count = dir.count.saturating_sub(1);
                hasdelete = true;
            } else if a.tag.type1() == TYPE_TAIL {
                if let AttrBuf::Bytes(raw) = a.buf {
                    dir.tail = pair::from_bytes(raw);
                }
                dir.split = a.tag.chunk() & 1 != 0;
            }
        }

        // should we actually drop the directory block?
        if hasdelete && dir.count == 0 {
            let mut pdir = MDir::default();
            match self.fs_pred(dir.pair, &mut pdir) {
                Ok(()) if pdir.split => {
                    if let Err(err) = self.dir_drop(&mut pdir, dir) {
                        *dir = olddir;
                        return Err(err);
                    }
                }
                Ok(()) | Err(LfsError::NoEnt) => {}
                Err(err) => {
                    *dir = olddir;
                    return Err(err);
                }
            }
        }

        let appended = if dir.erased || dir.count >= 0xff {
            match self.commit_append(dir, attrs) {
                Ok(()) => true,
                Err(LfsError::NoSpc) | Err(LfsError::Corrupt) => false,
                Err(err) => {
                    *dir = olddir;
                    return Err(err);
                }
            }
        } else {
            false
        };

        if !appended {
            // fall back to compaction
            self.pcache.invalidate();
            let source = *dir;
            let count = dir.count;
            if let Err(err) = self.dir_compact(dir, attrs, &source, 0, count) {
                *dir = olddir;
                return Err(err);
            }
        }

        // fix up handles sharing the pair; the committing handle keeps its
        // own id since it is the one being created or deleted
        for (slot, h) in self.handles.iter_mut() {
            if Some(slot) == skip || !pair::same(&h.m().pair, &olddir.pair) {
                continue;
            }
            *h.m_mut() = *dir;
            for a in attrs {
                let ty = a.tag.type3();
                let id = a.tag.id();
                if ty == TYPE_DELETE && h.id() == id {
                    // iterators move on to whatever takes the id
                    if !matches!(h, Handle::Dir(_)) {
                        h.m_mut().pair = [BLOCK_NULL, BLOCK_NULL];
                    }
                } else if ty == TYPE_DELETE && h.id() > id {
                    h.set_id(h.id() - 1);
                    if let Handle::Dir(d) = &mut *h {
                        d.pos = d.pos.saturating_sub(1);
                    }
                } else if ty == TYPE_CREATE && h.id() >= id {
                    h.set_id(h.id() + 1);
                    if let Handle::Dir(d) = &mut *h {
                        d.pos += 1;
                    }
                }
            }
        }

        if let Some(h) = skip.and_then(|slot| self.handles.get_mut(slot)) {
            *h.m_mut() = *dir;
        }

        for slot in 0..self.handles.slots() {
            let Some(h) = self.handles.get(slot) else {
                continue;
            };
            if !pair::same(&h.m().pair, &olddir.pair) {
                continue;
            }

            // we split and id is on tail now
            let (mut id, mut m) = (h.id(), *h.m());
            while id >= m.count && m.split {
                id -= m.count;
                let tail = m.tail;
                self.dir_fetch(&mut m, tail)?;
            }

            if let Some(h) = self.handles.get_mut(slot) {
                h.set_id(id);
                *h.m_mut() = m;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{align_rev, rev_modulus};

    #[test]
    fn test_rev_modulus_is_odd() {
        assert_eq!(rev_modulus(1), 3);
        assert_eq!(rev_modulus(2), 3);
        assert_eq!(rev_modulus(16), 17);
        assert_eq!(rev_modulus(100), 101);
    }

    #[test]
    fn test_align_rev_rounds_up() {
        assert_eq!(align_rev(0, 16), 0);
        assert_eq!(align_rev(1, 16), 17);
        assert_eq!(align_rev(17, 16), 17);
        assert_eq!(align_rev(18, 4), 20);
    }

    #[test]
    fn test_align_rev_wraps_blank_revision() {
        // an erased NOR block reads back as rev 0xffffffff
        for cycles in [2, 4, 16, 256] {
            let rev = align_rev(u32::MAX, cycles);
            assert_eq!(rev % rev_modulus(cycles), 0);
            assert_ne!(rev.wrapping_add(1) % rev_modulus(cycles), 0);
        }
        assert_eq!(align_rev(u32::MAX, 16), 0);
        assert_eq!(align_rev(u32::MAX - 1, 2), 0);
        assert_eq!(align_rev(u32::MAX - 20, 16), u32::MAX - 17);
    }
}
