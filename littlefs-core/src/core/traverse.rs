use log::error;

use crate::error::{LfsError, Result};
use crate::fs::LittleFs;
use crate::fs_core::ctz_list::CtzList;
use crate::fs_core::file::{FileStatus, UserAttr};
use crate::fs_core::mdir::{DiskOff, MDir};
use crate::fs_core::registry::Handle;
use crate::layout::ctz::CtzStruct;
use crate::layout::pair;
use crate::layout::tag::{
    FROM_MOVE, FROM_NOOP, FROM_USERATTRS, TYPE_CTZSTRUCT, TYPE_DELETE, TYPE_DIRSTRUCT, TYPE_SPLICE,
    TYPE_STRUCT, TYPE_USERATTR, Tag,
};
use crate::traits::block_device::BlockDevice;

/// Payload of an attribute fed into a commit.
#[derive(Debug, Clone, Copy)]
pub(crate) enum AttrBuf<'a> {
    None,
    Bytes(&'a [u8]),
    /// Payload already on disk, copied over during compaction.
    Disk(DiskOff),
    /// Pull the entry's struct and attributes over from another pair.
    Move(&'a MDir),
    UserAttrs(&'a [UserAttr]),
}

/// One attribute of a commit.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MAttr<'a> {
    pub tag: Tag,
    pub buf: AttrBuf<'a>,
}

impl<'a> MAttr<'a> {
    pub fn new(tag: Tag, buf: AttrBuf<'a>) -> Self {
        Self { tag, buf }
    }

    pub fn bare(tag: Tag) -> Self {
        Self {
            tag,
            buf: AttrBuf::None,
        }
    }

    pub fn bytes(tag: Tag, data: &'a [u8]) -> Self {
        Self {
            tag,
            buf: AttrBuf::Bytes(data),
        }
    }
}

/// Callback of [`LittleFs::dir_traverse`], `Ok(true)` stops the walk.
pub(crate) type TraverseFn<'c, D> =
    dyn FnMut(&mut LittleFs<D>, Tag, &AttrBuf<'_>) -> Result<bool> + 'c;

/// Whether `tag` makes the pending `filtertag` redundant, updating the
/// pending tag's id for creates and deletes found after it.
fn traverse_filter(filtertag: &mut Tag, tag: Tag) -> bool {
    // which mask depends on unique bit in tag structure
    let mask = if tag.0 & Tag::new(0x100, 0, 0).0 != 0 {
        Tag::new(0x7ff, 0x3ff, 0)
    } else {
        Tag::new(0x700, 0x3ff, 0)
    };

    // check for redundancy
    if tag.matches(mask, *filtertag)
        || filtertag.is_delete()
        || Tag(Tag::new(0x7ff, 0x3ff, 0).0 & tag.0)
            == Tag(Tag::new(TYPE_DELETE, 0, 0).0 | (Tag::new(0, 0x3ff, 0).0 & filtertag.0))
    {
        *filtertag = Tag::new(FROM_NOOP, 0, 0);
        return true;
    }

    // check if we need to adjust for created/deleted tags
    if tag.type1() == TYPE_SPLICE && tag.id() <= filtertag.id() {
        *filtertag = filtertag.shift_id(tag.splice() as i32);
    }

    false
}

impl<D: BlockDevice> LittleFs<D> {
    /// Feed the tags of `dir` from `off` onwards, followed by `attrs`, to `cb`.
    ///
    /// With a nonzero id in `tmask` only the latest version of every tag is
    /// passed on, restricted to ids in `[begin, end)` and shifted by `diff`.
    /// Moves and user-attribute lists expand into the tags they stand for.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn dir_traverse(
        &mut self,
        dir: &MDir,
        mut off: u32,
        mut ptag: Tag,
        mut attrs: &[MAttr<'_>],
        tmask: Tag,
        ttag: Tag,
        begin: u16,
        end: u16,
        diff: i32,
        cb: &mut TraverseFn<'_, D>,
    ) -> Result<bool> {
        // iterate over directory and attrs
        loop {
            let mut tag;
            let buf;
            if off + ptag.dsize() < dir.off {
                off += ptag.dsize();
                let mut raw = [0u8; 4];
                self.io
                    .read(None, &mut self.rcache, 4, dir.pair[0], off, &mut raw)?;
                tag = Tag(Tag::decode(raw, ptag).0 | 0x8000_0000);
                buf = AttrBuf::Disk(DiskOff {
                    block: dir.pair[0],
                    off: off + 4,
                });
                ptag = tag;
            } else if let Some((first, rest)) = attrs.split_first() {
                tag = first.tag;
                buf = first.buf;
                attrs = rest;
            } else {
                return Ok(false);
            }

            let mask = Tag::new(0x7ff, 0, 0);
            if !tag.matches(Tag(mask.0 & tmask.0), Tag(ttag.0)) {
                continue;
            }

            // do we need to filter?
            if tmask.id() != 0 {
                // scan for duplicates and update tag based on creates/deletes
                let mut filtertag = tag;
                let filtered = self.dir_traverse(
                    dir,
                    off,
                    ptag,
                    attrs,
                    Tag(0),
                    Tag(0),
                    0,
                    0,
                    0,
                    &mut |_fs, t, _buf| Ok(traverse_filter(&mut filtertag, t)),
                )?;
                tag = filtertag;
                if filtered {
                    continue;
                }

                // in filter range?
                if !(tag.id() >= begin && tag.id() < end) {
                    continue;
                }
            }

            // handle special cases for mcu-side operations
            match tag.type3() {
                FROM_NOOP => {}
                FROM_MOVE => {
                    let AttrBuf::Move(source) = buf else {
                        return Err(LfsError::Inval);
                    };
                    let fromid = tag.size() as u16;
                    let toid = tag.id();
                    if self.dir_traverse(
                        source,
                        0,
                        Tag::NONE,
                        &[],
                        Tag::new(0x600, 0x3ff, 0),
                        Tag::new(TYPE_STRUCT, 0, 0),
                        fromid,
                        fromid + 1,
                        toid as i32 - fromid as i32 + diff,
                        cb,
                    )? {
                        return Ok(true);
                    }
                }
                FROM_USERATTRS => {
                    let AttrBuf::UserAttrs(list) = buf else {
                        return Err(LfsError::Inval);
                    };
                    for a in list.iter().take(tag.size() as usize) {
                        let attr_tag = Tag::new(
                            TYPE_USERATTR + a.ty as u16,
                            (tag.id() as i32 + diff) as u16,
                            a.buffer.len() as u32,
                        );
                        if cb(self, attr_tag, &AttrBuf::Bytes(&a.buffer))? {
                            return Ok(true);
                        }
                    }
                }
                _ => {
                    if cb(self, tag.shift_id(diff), &buf)? {
                        return Ok(true);
                    }
                }
            }
        }
    }

    /// Visit every block referenced by the filesystem.
    ///
    /// Covers metadata pairs, CTZ lists of committed files and the blocks
    /// open files are still writing to. With `include_orphans` set, the pairs
    /// named by directory entries are reported too, so directories cut out
    /// of the tail chain by an interrupted operation still count as in use.
    pub(crate) fn fs_rawtraverse(
        &mut self,
        cb: &mut dyn FnMut(u32) -> Result<()>,
        include_orphans: bool,
    ) -> Result<()> {
        let mut dir = MDir::list_head();
        let mut cycle = 0u32;

        // iterate over metadata pairs
        while !pair::is_null(&dir.tail) {
            if cycle >= self.cfg.block_count / 2 {
                // loop detected
                error!("Metadata tail loop at {{{:#x}, {:#x}}}", dir.tail[0], dir.tail[1]);
                return Err(LfsError::Corrupt);
            }
            cycle += 1;

            for block in dir.tail {
                cb(block)?;
            }

            // iterate through ids in directory
            let tail = dir.tail;
            self.dir_fetch(&mut dir, tail)?;

            for id in 0..dir.count {
                let mut raw = [0u8; CtzStruct::DISK_SIZE];
                let tag = match self.dir_get(
                    &dir,
                    Tag::new(0x700, 0x3ff, 0),
                    Tag::new(TYPE_STRUCT, id, CtzStruct::DISK_SIZE as u32),
                    &mut raw,
                ) {
                    Ok(tag) => tag,
                    Err(LfsError::NoEnt) => continue,
                    Err(err) => return Err(err),
                };

                if tag.type3() == TYPE_CTZSTRUCT {
                    let ctz = CtzStruct::parse(&raw);
                    CtzList::traverse(
                        &mut self.io,
                        None,
                        &mut self.rcache,
                        ctz.head,
                        ctz.size,
                        cb,
                    )?;
                } else if include_orphans && tag.type3() == TYPE_DIRSTRUCT {
                    for block in pair::from_bytes(&raw) {
                        cb(block)?;
                    }
                }
            }
        }

        // iterate over any open files
        for slot in 0..self.handles.slots() {
            let Some(Handle::File(f)) = self.handles.get(slot) else {
                continue;
            };

            if f.status.contains(FileStatus::DIRTY) && !f.status.contains(FileStatus::INLINE) {
                CtzList::traverse(
                    &mut self.io,
                    Some(&f.cache),
                    &mut self.rcache,
                    f.ctz.head,
                    f.ctz.size,
                    cb,
                )?;
            }

            if f.status.contains(FileStatus::WRITING) && !f.status.contains(FileStatus::INLINE) {
                CtzList::traverse(
                    &mut self.io,
                    Some(&f.cache),
                    &mut self.rcache,
                    f.block,
                    f.pos,
                    cb,
                )?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::traverse_filter;
    use crate::layout::tag::{TYPE_CREATE, TYPE_DELETE, TYPE_NAME, TYPE_REG, TYPE_STRUCT, Tag};

    #[test]
    fn test_later_tag_of_same_kind_supersedes() {
        let mut pending = Tag::new(TYPE_STRUCT, 2, 8);
        assert!(traverse_filter(&mut pending, Tag::new(TYPE_STRUCT + 1, 2, 24)));
        assert_eq!(pending, Tag::NOOP);
    }

    #[test]
    fn test_delete_of_id_supersedes_everything() {
        let mut pending = Tag::new(TYPE_REG, 3, 5);
        assert!(traverse_filter(&mut pending, Tag::new(TYPE_DELETE, 3, 0)));
    }

    #[test]
    fn test_splices_shift_pending_id() {
        let mut pending = Tag::new(TYPE_NAME + TYPE_REG, 3, 5);
        assert!(!traverse_filter(&mut pending, Tag::new(TYPE_CREATE, 1, 0)));
        assert_eq!(pending.id(), 4);
        assert!(!traverse_filter(&mut pending, Tag::new(TYPE_DELETE, 0, 0)));
        assert_eq!(pending.id(), 3);
        // splices above the pending id do not matter
        assert!(!traverse_filter(&mut pending, Tag::new(TYPE_CREATE, 7, 0)));
        assert_eq!(pending.id(), 3);
    }
}
