use core::mem;

use alloc::vec;
use alloc::vec::Vec;

use bitflags::bitflags;
use log::{debug, trace};

use crate::error::{LfsError, Result};
use crate::fs::LittleFs;
use crate::fs_core::ctz_list::{CtzList, is_bad_block};
use crate::fs_core::mdir::MDir;
use crate::fs_core::registry::Handle;
use crate::fs_core::traverse::{AttrBuf, MAttr};
use crate::io::block_io::BlockIo;
use crate::io::cache::Cache;
use crate::layout::ctz::CtzStruct;
use crate::layout::pair;
use crate::layout::tag::{
    FROM_USERATTRS, ID_NONE, TYPE_CREATE, TYPE_CTZSTRUCT, TYPE_INLINESTRUCT, TYPE_REG,
    TYPE_STRUCT, TYPE_USERATTR, Tag,
};
use crate::layout::{BLOCK_INLINE, BLOCK_NULL};
use crate::traits::block_device::BlockDevice;

bitflags! {
    /// Flags accepted when opening a file.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Open a file as read only
        const RDONLY = 0x0001;
        /// Open a file as write only
        const WRONLY = 0x0002;
        /// Open a file as read and write
        const RDWR = Self::RDONLY.bits() | Self::WRONLY.bits();
        /// Create a file if it does not exist
        const CREAT = 0x0100;
        /// Fail if a file already exists
        const EXCL = 0x0200;
        /// Truncate the existing file to zero size
        const TRUNC = 0x0400;
        /// Move to end of file on every write
        const APPEND = 0x0800;
    }
}

bitflags! {
    /// Internal state of an open file.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct FileStatus: u32 {
        /// Entry differs from what is on disk
        const DIRTY = 0x01_0000;
        /// Cache holds data to be written out
        const WRITING = 0x02_0000;
        /// Cache holds data read from disk
        const READING = 0x04_0000;
        /// An error occurred, nothing may be committed
        const ERRED = 0x08_0000;
        /// Data lives in the directory entry
        const INLINE = 0x10_0000;
    }
}

/// Custom attribute attached to a file, read on open and written on sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAttr {
    pub ty: u8,
    /// Its length is the attribute size on disk.
    pub buffer: Vec<u8>,
}

impl UserAttr {
    /// Attribute of `size` bytes, filled in from disk when the file is opened.
    pub fn new(ty: u8, size: usize) -> Self {
        Self {
            ty,
            buffer: vec![0; size],
        }
    }
}

/// Per-open options.
#[derive(Debug, Clone, Default)]
pub struct FileConfig {
    pub attrs: Vec<UserAttr>,
}

/// Where [`LittleFs::file_seek`] measures from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekFrom {
    Start(u32),
    Current(i32),
    End(i32),
}

/// State of an open file.
#[derive(Debug)]
pub(crate) struct OpenFile {
    pub id: u16,
    pub m: MDir,
    pub ctz: CtzStruct,
    pub flags: OpenFlags,
    pub status: FileStatus,
    pub pos: u32,
    /// Block and offset the cache is positioned at.
    pub block: u32,
    pub off: u32,
    pub cache: Cache,
    pub attrs: Vec<UserAttr>,
}

impl OpenFile {
    pub fn is_inline(&self) -> bool {
        self.status.contains(FileStatus::INLINE)
    }

    /// Size including data not flushed yet.
    pub fn size(&self) -> u32 {
        if self.status.contains(FileStatus::WRITING) {
            self.pos.max(self.ctz.size)
        } else {
            self.ctz.size
        }
    }
}

/// Sequential reader over a committed CTZ list.
struct CtzReader {
    ctz: CtzStruct,
    pos: u32,
    block: u32,
    off: u32,
    positioned: bool,
    cache: Cache,
}

impl CtzReader {
    fn new(ctz: CtzStruct, pos: u32, cache_size: u32) -> Self {
        Self {
            ctz,
            pos,
            block: BLOCK_NULL,
            off: 0,
            positioned: false,
            cache: Cache::new(cache_size),
        }
    }

    fn read<D: BlockDevice>(&mut self, io: &mut BlockIo<D>, buf: &mut [u8]) -> Result<usize> {
        if self.pos >= self.ctz.size {
            return Ok(0);
        }

        let block_size = io.block_size();
        let size = (buf.len() as u32).min(self.ctz.size - self.pos) as usize;
        let mut done = 0usize;
        while done < size {
            if !self.positioned || self.off == block_size {
                let (block, off) = CtzList::find(
                    io,
                    None,
                    &mut self.cache,
                    self.ctz.head,
                    self.ctz.size,
                    self.pos,
                )?;
                self.block = block;
                self.off = off;
                self.positioned = true;
            }

            let diff = ((size - done) as u32).min(block_size - self.off) as usize;
            io.read(
                None,
                &mut self.cache,
                block_size,
                self.block,
                self.off,
                &mut buf[done..done + diff],
            )?;

            self.pos += diff as u32;
            self.off += diff as u32;
            done += diff;
        }

        Ok(size)
    }
}

impl<D: BlockDevice> LittleFs<D> {
    /// Largest size a file may keep inline in its directory entry.
    fn inline_max(&self) -> u32 {
        0x3fe
            .min(self.cfg.cache_size)
            .min(self.cfg.metadata_max / 8)
    }

    pub(crate) fn file_opencfg_raw(
        &mut self,
        path: &str,
        flags: OpenFlags,
        config: FileConfig,
    ) -> Result<usize> {
        trace!("file_open({:?}, {:?})", path, flags);
        if !flags.intersects(OpenFlags::RDWR) {
            return Err(LfsError::Inval);
        }

        // deorphan if we haven't yet, needed at most once after poweron
        if flags.contains(OpenFlags::WRONLY) {
            self.fs_forceconsistency()?;
        }

        // allocate entry for file if it doesn't exist
        let mut m = MDir::default();
        let lookup = self.dir_find(&mut m, path);
        let tag = match lookup.tag {
            Err(LfsError::NoEnt) if lookup.id != ID_NONE => None,
            Err(err) => return Err(err),
            Ok(tag) => Some(tag),
        };

        // register to catch updates from our own commits
        let slot = self.handles.insert(Handle::File(OpenFile {
            id: lookup.id,
            m,
            ctz: CtzStruct::default(),
            flags,
            status: FileStatus::empty(),
            pos: 0,
            block: BLOCK_NULL,
            off: 0,
            cache: Cache::new(self.cfg.cache_size),
            attrs: config.attrs,
        }));

        match self.file_open_entry(slot, tag, lookup.name) {
            Ok(()) => Ok(slot),
            Err(err) => {
                // clean up lingering resources
                self.handles.remove(slot);
                Err(err)
            }
        }
    }

    fn file_open_entry(&mut self, slot: usize, tag: Option<Tag>, name: &str) -> Result<()> {
        let (id, flags) = {
            let f = self.handles.file(slot)?;
            (f.id, f.flags)
        };

        let tag = match tag {
            None => {
                if !flags.contains(OpenFlags::CREAT) {
                    return Err(LfsError::NoEnt);
                }

                // check that name fits
                if name.len() as u32 > self.cfg.name_max {
                    return Err(LfsError::NameTooLong);
                }

                // get next slot and create entry to remember name
                self.dir_commit_handle(
                    slot,
                    &[
                        MAttr::bare(Tag::new(TYPE_CREATE, id, 0)),
                        MAttr::bytes(Tag::new(TYPE_REG, id, name.len() as u32), name.as_bytes()),
                        MAttr::bare(Tag::new(TYPE_INLINESTRUCT, id, 0)),
                    ],
                )?;

                Tag::new(TYPE_INLINESTRUCT, 0, 0)
            }
            Some(_) if flags.contains(OpenFlags::EXCL) => return Err(LfsError::Exist),
            Some(tag) if tag.type3() != TYPE_REG => return Err(LfsError::IsDir),
            Some(_) if flags.contains(OpenFlags::TRUNC) => {
                // truncate if requested
                self.handles.file_mut(slot)?.status |= FileStatus::DIRTY;
                Tag::new(TYPE_INLINESTRUCT, id, 0)
            }
            Some(_) => {
                // try to load what's on disk, if it's inlined we'll fix it later
                let m = self.handles.file(slot)?.m;
                let mut raw = [0u8; CtzStruct::DISK_SIZE];
                let tag = self.dir_get(
                    &m,
                    Tag::new(0x700, 0x3ff, 0),
                    Tag::new(TYPE_STRUCT, id, CtzStruct::DISK_SIZE as u32),
                    &mut raw,
                )?;
                self.handles.file_mut(slot)?.ctz = CtzStruct::parse(&raw);
                tag
            }
        };

        // the entry may have moved with a split of our own commit
        let (id, m) = {
            let f = self.handles.file(slot)?;
            (f.id, f.m)
        };

        // fetch attrs
        let mut attrs = mem::take(&mut self.handles.file_mut(slot)?.attrs);
        let mut res = Ok(());
        for attr in attrs.iter_mut() {
            // if opened for read / read-write operations
            if flags.contains(OpenFlags::RDONLY) {
                match self.dir_get(
                    &m,
                    Tag::new(0x7ff, 0x3ff, 0),
                    Tag::new(TYPE_USERATTR + attr.ty as u16, id, attr.buffer.len() as u32),
                    &mut attr.buffer,
                ) {
                    Ok(_) | Err(LfsError::NoEnt) => {}
                    Err(err) => {
                        res = Err(err);
                        break;
                    }
                }
            }

            // if opened for write / read-write operations
            if flags.contains(OpenFlags::WRONLY) {
                if attr.buffer.len() as u32 > self.cfg.attr_max {
                    res = Err(LfsError::NoSpc);
                    break;
                }
                self.handles.file_mut(slot)?.status |= FileStatus::DIRTY;
            }
        }
        self.handles.file_mut(slot)?.attrs = attrs;
        res?;

        if tag.type3() == TYPE_INLINESTRUCT {
            // load inline files
            let cache_size = self.cfg.cache_size;
            let mut cache = mem::take(&mut self.handles.file_mut(slot)?.cache);
            cache.reset();
            cache.block = BLOCK_INLINE;
            cache.off = 0;
            cache.size = cache_size;

            let size = tag.size();
            // don't always read (may be new/trunc file)
            let loaded = if size > 0 {
                let len = cache_size.min(0x3fe) as usize;
                self.dir_get(
                    &m,
                    Tag::new(0x700, 0x3ff, 0),
                    Tag::new(TYPE_STRUCT, id, len as u32),
                    &mut cache.buffer[..len],
                )
                .map(|_| ())
            } else {
                Ok(())
            };

            let f = self.handles.file_mut(slot)?;
            f.cache = cache;
            f.ctz = CtzStruct {
                head: BLOCK_INLINE,
                size,
            };
            f.status |= FileStatus::INLINE;
            loaded?;
        }

        Ok(())
    }

    pub(crate) fn file_close_raw(&mut self, slot: usize) -> Result<()> {
        trace!("file_close({})", slot);
        let res = self.file_sync_raw(slot);
        // remove from list of mdirs
        self.handles.remove(slot);
        res
    }

    pub(crate) fn file_sync_raw(&mut self, slot: usize) -> Result<()> {
        if self.handles.file(slot)?.status.contains(FileStatus::ERRED) {
            // it's not safe to do anything if our file errored
            return Ok(());
        }

        if let Err(err) = self.file_flush(slot) {
            self.handles.file_mut(slot)?.status |= FileStatus::ERRED;
            return Err(err);
        }

        let f = self.handles.file(slot)?;
        if f.status.contains(FileStatus::DIRTY) && !pair::is_null(&f.m.pair) {
            // update dir entry
            let id = f.id;
            let (ty, payload): (u16, Vec<u8>) = if f.is_inline() {
                // inline the whole file
                (
                    TYPE_INLINESTRUCT,
                    f.cache.buffer[..f.ctz.size as usize].to_vec(),
                )
            } else {
                // update the ctz reference
                (TYPE_CTZSTRUCT, f.ctz.to_bytes().to_vec())
            };
            let attrs = f.attrs.clone();

            // commit file data and attributes
            let res = self.dir_commit_handle(
                slot,
                &[
                    MAttr::bytes(Tag::new(ty, id, payload.len() as u32), &payload),
                    MAttr::new(
                        Tag::new(FROM_USERATTRS, id, attrs.len() as u32),
                        AttrBuf::UserAttrs(&attrs),
                    ),
                ],
            );

            let f = self.handles.file_mut(slot)?;
            match res {
                Ok(()) => f.status.remove(FileStatus::DIRTY),
                Err(err) => {
                    f.status |= FileStatus::ERRED;
                    return Err(err);
                }
            }
        }

        Ok(())
    }

    /// Copy what is written so far into a fresh block, used when a program
    /// failed or an inline file outgrows its entry.
    fn file_relocate(&mut self, slot: usize) -> Result<()> {
        loop {
            // just relocate what exists into new block
            let nblock = self.alloc()?;

            if !is_bad_block(self.io.erase(nblock))? && self.file_copy_to(slot, nblock)? {
                // copy over new state of file
                let f = self.handles.file_mut(slot)?;
                f.cache.copy_from(&self.pcache);
                self.pcache.reset();

                f.block = nblock;
                f.status |= FileStatus::WRITING;
                return Ok(());
            }

            debug!("Bad block at {:#x}", nblock);
            // just clear cache and try a new block
            self.pcache.invalidate();
        }
    }

    /// Program the first `off` bytes of the file's current block into
    /// `nblock` through the filesystem's program cache. `Ok(false)` when
    /// `nblock` is bad.
    fn file_copy_to(&mut self, slot: usize, nblock: u32) -> Result<bool> {
        let (inline, block, off, id, m) = {
            let f = self.handles.file(slot)?;
            (f.is_inline(), f.block, f.off, f.id, f.m)
        };

        let mut chunk = [0u8; 32];
        let mut i = 0u32;
        while i < off {
            let n = (off - i).min(chunk.len() as u32) as usize;

            // either read from dirty cache or disk
            if inline {
                let mut cache = mem::take(&mut self.handles.file_mut(slot)?.cache);
                let res = self.dir_getread(
                    &m,
                    &mut cache,
                    off - i,
                    Tag::new(0xfff, 0x1ff, 0),
                    Tag::new(TYPE_INLINESTRUCT, id, 0),
                    i,
                    &mut chunk[..n],
                );
                self.handles.file_mut(slot)?.cache = cache;
                res?;
            } else {
                let LittleFs {
                    io,
                    rcache,
                    handles,
                    ..
                } = self;
                let f = handles.file(slot)?;
                io.read(Some(&f.cache), rcache, off - i, block, i, &mut chunk[..n])?;
            }

            let res = self.io.prog(
                &mut self.pcache,
                &mut self.rcache,
                true,
                nblock,
                i,
                &chunk[..n],
            );
            if is_bad_block(res)? {
                return Ok(false);
            }

            i += n as u32;
        }

        Ok(true)
    }

    /// Move an inline file's data out into a block of its own.
    pub(crate) fn file_outline(&mut self, slot: usize) -> Result<()> {
        {
            let f = self.handles.file_mut(slot)?;
            f.off = f.pos;
        }
        self.alloc_ack();
        self.file_relocate(slot)?;

        self.handles.file_mut(slot)?.status.remove(FileStatus::INLINE);
        Ok(())
    }

    /// Write out pending data and fold it into the file's CTZ reference.
    ///
    /// Rewriting the middle of a file creates a new branch of the list, so
    /// the old data after the write position is copied over first.
    pub(crate) fn file_flush(&mut self, slot: usize) -> Result<()> {
        let f = self.handles.file_mut(slot)?;
        if f.status.contains(FileStatus::READING) {
            if !f.is_inline() {
                f.cache.invalidate();
            }
            f.status.remove(FileStatus::READING);
        }

        if !f.status.contains(FileStatus::WRITING) {
            return Ok(());
        }

        let pos = f.pos;
        if !f.is_inline() {
            // copy over anything after current branch
            let mut orig = CtzReader::new(f.ctz, f.pos, self.cfg.cache_size);
            self.rcache.invalidate();

            let mut chunk = [0u8; 32];
            loop {
                let f = self.handles.file(slot)?;
                if f.pos >= f.ctz.size {
                    break;
                }
                let want = ((f.ctz.size - f.pos) as usize).min(chunk.len());
                let n = orig.read(&mut self.io, &mut chunk[..want])?;
                if n == 0 {
                    break;
                }
                self.file_flushedwrite(slot, &chunk[..n])?;
            }

            // write out what we have
            loop {
                let LittleFs {
                    io,
                    rcache,
                    handles,
                    ..
                } = self;
                let f = handles.file_mut(slot)?;
                if !is_bad_block(io.flush(&mut f.cache, rcache, true))? {
                    break;
                }

                debug!("Bad block at {:#x}", f.block);
                self.file_relocate(slot)?;
            }
        } else {
            f.pos = f.pos.max(f.ctz.size);
        }

        // actual file updates
        let f = self.handles.file_mut(slot)?;
        f.ctz.head = f.block;
        f.ctz.size = f.pos;
        f.status.remove(FileStatus::WRITING);
        f.status |= FileStatus::DIRTY;

        f.pos = pos;
        Ok(())
    }

    fn file_flushedread(&mut self, slot: usize, buf: &mut [u8]) -> Result<usize> {
        let block_size = self.cfg.block_size;
        let size = {
            let f = self.handles.file(slot)?;
            if f.pos >= f.ctz.size {
                // eof if past end
                return Ok(0);
            }
            (buf.len() as u32).min(f.ctz.size - f.pos) as usize
        };

        let mut done = 0usize;
        while done < size {
            let LittleFs {
                io,
                rcache: _,
                handles,
                ..
            } = self;
            let f = handles.file_mut(slot)?;

            // check if we need a new block
            if !f.status.contains(FileStatus::READING) || f.off == block_size {
                if !f.is_inline() {
                    let (block, off) =
                        CtzList::find(io, None, &mut f.cache, f.ctz.head, f.ctz.size, f.pos)?;
                    f.block = block;
                    f.off = off;
                } else {
                    f.block = BLOCK_INLINE;
                    f.off = f.pos;
                }

                f.status |= FileStatus::READING;
            }

            // read as much as we can in current block
            let diff = ((size - done) as u32).min(block_size - f.off) as usize;
            let out = &mut buf[done..done + diff];
            if f.is_inline() {
                let (id, m, off) = (f.id, f.m, f.off);
                let mut cache = mem::take(&mut f.cache);
                let res = self.dir_getread(
                    &m,
                    &mut cache,
                    block_size,
                    Tag::new(0xfff, 0x1ff, 0),
                    Tag::new(TYPE_INLINESTRUCT, id, 0),
                    off,
                    out,
                );
                self.handles.file_mut(slot)?.cache = cache;
                res?;
            } else {
                io.read(None, &mut f.cache, block_size, f.block, f.off, out)?;
            }

            let f = self.handles.file_mut(slot)?;
            f.pos += diff as u32;
            f.off += diff as u32;
            done += diff;
        }

        Ok(size)
    }

    pub(crate) fn file_read_raw(&mut self, slot: usize, buf: &mut [u8]) -> Result<usize> {
        let f = self.handles.file(slot)?;
        if !f.flags.contains(OpenFlags::RDONLY) {
            return Err(LfsError::BadF);
        }

        if f.status.contains(FileStatus::WRITING) {
            // flush out any writes
            self.file_flush(slot)?;
        }

        self.file_flushedread(slot, buf)
    }

    fn file_flushedwrite(&mut self, slot: usize, data: &[u8]) -> Result<usize> {
        match self.file_flushedwrite_inner(slot, data) {
            Ok(n) => {
                self.handles.file_mut(slot)?.status.remove(FileStatus::ERRED);
                Ok(n)
            }
            Err(err) => {
                if let Ok(f) = self.handles.file_mut(slot) {
                    f.status |= FileStatus::ERRED;
                }
                Err(err)
            }
        }
    }

    fn file_flushedwrite_inner(&mut self, slot: usize, data: &[u8]) -> Result<usize> {
        let block_size = self.cfg.block_size;
        let inline_max = self.inline_max();

        let f = self.handles.file(slot)?;
        if f.is_inline() && (f.pos + data.len() as u32).max(f.ctz.size) > inline_max {
            // inline file doesn't fit anymore
            self.file_outline(slot)?;
        }

        let mut done = 0usize;
        while done < data.len() {
            // check if we need a new block
            let f = self.handles.file_mut(slot)?;
            if !f.status.contains(FileStatus::WRITING) || f.off == block_size {
                if !f.is_inline() {
                    if !f.status.contains(FileStatus::WRITING) && f.pos > 0 {
                        // find out which block we're extending from
                        let LittleFs { io, handles, .. } = self;
                        let f = handles.file_mut(slot)?;
                        let (block, off) = CtzList::find(
                            io,
                            None,
                            &mut f.cache,
                            f.ctz.head,
                            f.ctz.size,
                            f.pos - 1,
                        )?;
                        f.block = block;
                        f.off = off;

                        // mark cache as dirty since we may have read data into it
                        f.cache.reset();
                    }

                    // extend file with new blocks
                    self.alloc_ack();
                    let (head, pos) = {
                        let f = self.handles.file(slot)?;
                        (f.block, f.pos)
                    };
                    let (block, off) = self.ctz_extend(slot, head, pos)?;
                    let f = self.handles.file_mut(slot)?;
                    f.block = block;
                    f.off = off;
                } else {
                    f.block = BLOCK_INLINE;
                    f.off = f.pos;
                }

                self.handles.file_mut(slot)?.status |= FileStatus::WRITING;
            }

            // program as much as we can in current block
            let diff = {
                let f = self.handles.file(slot)?;
                (data.len() - done).min((block_size - f.off) as usize)
            };
            loop {
                let LittleFs {
                    io,
                    rcache,
                    handles,
                    ..
                } = self;
                let f = handles.file_mut(slot)?;
                let res = io.prog(
                    &mut f.cache,
                    rcache,
                    true,
                    f.block,
                    f.off,
                    &data[done..done + diff],
                );
                if !is_bad_block(res)? {
                    break;
                }

                self.file_relocate(slot)?;
            }

            let f = self.handles.file_mut(slot)?;
            f.pos += diff as u32;
            f.off += diff as u32;
            done += diff;

            self.alloc_ack();
        }

        Ok(data.len())
    }

    pub(crate) fn file_write_raw(&mut self, slot: usize, data: &[u8]) -> Result<usize> {
        let f = self.handles.file(slot)?;
        if !f.flags.contains(OpenFlags::WRONLY) {
            return Err(LfsError::BadF);
        }

        if f.status.contains(FileStatus::READING) {
            // drop any reads
            self.file_flush(slot)?;
        }

        let file_max = self.cfg.file_max;
        let f = self.handles.file_mut(slot)?;
        if f.flags.contains(OpenFlags::APPEND) && f.pos < f.ctz.size {
            f.pos = f.ctz.size;
        }

        if f.pos as u64 + data.len() as u64 > file_max as u64 {
            // larger than file limit?
            return Err(LfsError::FBig);
        }

        if !f.status.contains(FileStatus::WRITING) && f.pos > f.ctz.size {
            // fill with zeros
            let pos = f.pos;
            f.pos = f.ctz.size;
            let zeros = [0u8; 32];
            loop {
                let at = self.handles.file(slot)?.pos;
                if at >= pos {
                    break;
                }
                let n = ((pos - at) as usize).min(zeros.len());
                self.file_flushedwrite(slot, &zeros[..n])?;
            }
        }

        let n = self.file_flushedwrite(slot, data)?;
        self.handles.file_mut(slot)?.status.remove(FileStatus::ERRED);
        Ok(n)
    }

    pub(crate) fn file_seek_raw(&mut self, slot: usize, npos: i64) -> Result<u32> {
        if npos < 0 || npos > self.cfg.file_max as i64 {
            return Err(LfsError::Inval);
        }
        let npos = npos as u32;

        if self.handles.file(slot)?.pos == npos {
            // noop - position has not changed
            return Ok(npos);
        }

        // write out everything beforehand, may be noop if rdonly
        self.file_flush(slot)?;

        // update pos
        self.handles.file_mut(slot)?.pos = npos;
        Ok(npos)
    }

    pub(crate) fn file_truncate_raw(&mut self, slot: usize, size: u32) -> Result<()> {
        let f = self.handles.file(slot)?;
        if !f.flags.contains(OpenFlags::WRONLY) {
            return Err(LfsError::BadF);
        }
        if size > self.cfg.file_max {
            return Err(LfsError::Inval);
        }

        let pos = f.pos;
        let oldsize = f.size();
        if size < oldsize {
            // need to flush since directly changing metadata
            self.file_flush(slot)?;

            let LittleFs { io, handles, .. } = self;
            let f = handles.file_mut(slot)?;
            if f.is_inline() {
                f.ctz.size = size;
            } else if size == 0 {
                f.ctz = CtzStruct {
                    head: BLOCK_NULL,
                    size: 0,
                };
            } else {
                // lookup new head in ctz skip list
                let (block, off) = CtzList::find(
                    io,
                    None,
                    &mut f.cache,
                    f.ctz.head,
                    f.ctz.size,
                    size - 1,
                )?;
                f.block = block;
                f.off = off + 1;
                f.ctz = CtzStruct { head: block, size };
                f.status |= FileStatus::READING;
            }

            f.pos = size;
            f.status |= FileStatus::DIRTY;
        } else if size > oldsize {
            // flush+seek if not already at end
            self.file_seek_raw(slot, oldsize as i64)?;

            // fill with zeros
            let zeros = [0u8; 32];
            loop {
                let at = self.handles.file(slot)?.pos;
                if at >= size {
                    break;
                }
                let n = ((size - at) as usize).min(zeros.len());
                self.file_write_raw(slot, &zeros[..n])?;
            }
        }

        // restore pos
        self.file_seek_raw(slot, pos as i64)?;
        Ok(())
    }
}
