use alloc::string::String;

use log::{debug, error, trace};

use crate::config::Config;
use crate::error::{LfsError, Result};
use crate::fs_alloc::lookahead::Lookahead;
use crate::fs_core::file::{FileConfig, FileStatus, OpenFlags, SeekFrom, UserAttr};
use crate::fs_core::mdir::{FetchMatcher, MDir};
use crate::fs_core::registry::{Handle, HandleRegistry, Tracked};
use crate::fs_core::traverse::{AttrBuf, MAttr};
use crate::io::block_io::BlockIo;
use crate::io::cache::Cache;
use crate::layout::gstate::GState;
use crate::layout::pair::{self, Pair};
use crate::layout::superblock::{MAGIC, SuperBlock};
use crate::layout::tag::{
    FROM_MOVE, ID_NONE, SIZE_DELETE, TYPE_CREATE, TYPE_DELETE, TYPE_DIR, TYPE_DIRSTRUCT,
    TYPE_INLINESTRUCT, TYPE_SOFTTAIL, TYPE_SUPERBLOCK, TYPE_USERATTR, Tag,
};
use crate::traits::block_device::BlockDevice;

/// Kind of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Reg,
    Dir,
}

/// What [`LittleFs::stat`] and [`LittleFs::dir_read`] report about an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Info {
    pub kind: FileType,
    /// Size in bytes, zero for directories.
    pub size: u32,
    pub name: String,
}

/// Open file, returned by [`LittleFs::file_open`] and consumed by
/// [`LittleFs::file_close`].
#[derive(Debug)]
pub struct File(usize);

/// Open directory, returned by [`LittleFs::dir_open`] and consumed by
/// [`LittleFs::dir_close`].
#[derive(Debug)]
pub struct Dir(usize);

/// A mounted littlefs volume on top of a [`BlockDevice`].
///
/// All state lives here: the validated configuration, the read and program
/// caches, the block allocator, the global state and the registry of open
/// files and directories. Operations take `&mut self`, so the volume is
/// used from one place at a time.
pub struct LittleFs<D: BlockDevice> {
    pub(crate) io: BlockIo<D>,
    pub(crate) cfg: Config,
    pub(crate) rcache: Cache,
    pub(crate) pcache: Cache,
    pub(crate) root: Pair,
    pub(crate) handles: HandleRegistry,
    /// Folded from every commit CRC seen at mount, spreads allocations.
    pub(crate) seed: u32,
    /// Global state as it should be.
    pub(crate) gstate: GState,
    /// Global state as committed on disk.
    pub(crate) gdisk: GState,
    /// Delta carried by the pair being committed.
    pub(crate) gdelta: GState,
    pub(crate) free: Lookahead,
}

impl<D: BlockDevice> LittleFs<D> {
    fn init(device: D, config: &Config) -> Result<Self> {
        let cfg = config.validate()?;
        Ok(Self {
            io: BlockIo::new(device, &cfg),
            rcache: Cache::new(cfg.cache_size),
            pcache: Cache::new(cfg.cache_size),
            root: pair::NULL_PAIR,
            handles: HandleRegistry::new(),
            seed: 0,
            gstate: GState::default(),
            gdisk: GState::default(),
            gdelta: GState::default(),
            free: Lookahead::new(cfg.lookahead_size),
            cfg,
        })
    }

    /// Write an empty filesystem to `device` and hand the device back.
    pub fn format(device: D, config: &Config) -> Result<D> {
        trace!(
            "format({}x{} blocks)",
            config.block_count, config.block_size
        );
        let mut fs = Self::init(device, config)?;
        fs.format_root()?;
        Ok(fs.io.into_inner())
    }

    fn format_root(&mut self) -> Result<()> {
        // create free lookahead
        let size = (8 * self.cfg.lookahead_size).min(self.cfg.block_count);
        self.free.reset_at(0, size);
        self.alloc_ack();

        // create root dir
        let mut root = self.dir_alloc()?;

        // write one superblock
        let superblock = SuperBlock::from_config(&self.cfg).to_bytes();
        self.dir_commit(
            &mut root,
            &[
                MAttr::bare(Tag::new(TYPE_CREATE, 0, 0)),
                MAttr::bytes(Tag::new(TYPE_SUPERBLOCK, 0, MAGIC.len() as u32), MAGIC),
                MAttr::bytes(
                    Tag::new(TYPE_INLINESTRUCT, 0, SuperBlock::DISK_SIZE as u32),
                    &superblock,
                ),
            ],
        )?;

        // force compaction to prevent accidentally mounting any
        // older version of littlefs that may live on disk
        root.erased = false;
        self.dir_commit(&mut root, &[])?;

        // sanity check that fetch works
        self.dir_fetch(&mut root, pair::ROOT_PAIR)
    }

    /// Mount the filesystem on `device`.
    ///
    /// Scans the whole metadata list for the superblock and the global
    /// state. Interrupted operations are repaired lazily by the first
    /// operation that writes.
    pub fn mount(device: D, config: &Config) -> Result<Self> {
        trace!("mount({}x{} blocks)", config.block_count, config.block_size);
        let mut fs = Self::init(device, config)?;
        fs.mount_scan()?;
        Ok(fs)
    }

    fn mount_scan(&mut self) -> Result<()> {
        // scan directory blocks for superblock and any global updates
        let mut dir = MDir::list_head();
        let mut cycle = 0u32;
        while !pair::is_null(&dir.tail) {
            if cycle >= self.cfg.block_count / 2 {
                // loop detected
                error!("Metadata tail loop at {{{:#x}, {:#x}}}", dir.tail[0], dir.tail[1]);
                return Err(LfsError::Corrupt);
            }
            cycle += 1;

            // fetch next block in tail list
            let tail = dir.tail;
            let tag = self.dir_fetchmatch(
                &mut dir,
                tail,
                Tag::new(0x7ff, 0x3ff, 0),
                Tag::new(TYPE_SUPERBLOCK, 0, MAGIC.len() as u32),
                None,
                Some(FetchMatcher::Name(MAGIC)),
            )?;

            // has superblock?
            if tag != Tag::NOOP && !tag.is_delete() {
                // update root
                self.root = dir.pair;

                // grab superblock
                let mut raw = [0u8; SuperBlock::DISK_SIZE];
                self.dir_get(
                    &dir,
                    Tag::new(0x7ff, 0x3ff, 0),
                    Tag::new(TYPE_INLINESTRUCT, 0, SuperBlock::DISK_SIZE as u32),
                    &mut raw,
                )?;
                SuperBlock::parse(&raw).negotiate(&mut self.cfg)?;
            }

            // has gstate?
            let mut gstate = self.gstate;
            self.dir_getgstate(&dir, &mut gstate)?;
            self.gstate = gstate;
        }

        // found superblock?
        if pair::is_null(&self.root) {
            error!("No superblock found");
            return Err(LfsError::Inval);
        }

        // update littlefs with gstate
        if !self.gstate.is_zero() {
            debug!(
                "Found pending gstate {:#010x}{:08x}{:08x}",
                self.gstate.tag, self.gstate.pair[0], self.gstate.pair[1]
            );
        }
        // an interrupted operation left orphans, make sure they are searched
        if !Tag(self.gstate.tag).is_valid() {
            self.gstate.tag = self.gstate.tag.wrapping_add(1);
        }
        self.gdisk = self.gstate;

        // start the allocator at a pseudo-random location so allocations
        // spread across boots
        self.free.off = self.seed % self.cfg.block_count;
        self.alloc_drop();
        Ok(())
    }

    /// Release the volume and hand the device back. Open files are not
    /// synced.
    pub fn unmount(self) -> D {
        trace!("unmount()");
        self.io.into_inner()
    }

    /// Configuration in effect, with limits narrowed to the superblock's.
    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn device_mut(&mut self) -> &mut D {
        self.io.device_mut()
    }

    // ─── Namespace ──────────────────────────────────────────────────────────

    pub fn mkdir(&mut self, path: &str) -> Result<()> {
        trace!("mkdir({:?})", path);
        // deorphan if we haven't yet, needed at most once after poweron
        self.fs_forceconsistency()?;

        let mut cwd = MDir::default();
        let lookup = self.dir_find(&mut cwd, path);
        let id = lookup.id;
        match lookup.tag {
            Err(LfsError::NoEnt) if id != ID_NONE => {}
            Err(err) => return Err(err),
            Ok(_) => return Err(LfsError::Exist),
        }

        // check that name fits
        let name = lookup.name;
        if name.len() as u32 > self.cfg.name_max {
            return Err(LfsError::NameTooLong);
        }

        // build up new directory
        self.alloc_ack();
        let mut dir = self.dir_alloc()?;

        // find end of list
        let mut pred = cwd;
        while pred.split {
            let tail = pred.tail;
            self.dir_fetch(&mut pred, tail)?;
        }

        // setup dir
        let raw = pair::to_bytes(&pred.tail);
        self.dir_commit(
            &mut dir,
            &[MAttr::bytes(Tag::new(TYPE_SOFTTAIL, 0x3ff, 8), &raw)],
        )?;

        // current block not end of list?
        if cwd.split {
            // update tails, this creates a desync
            self.fs_preporphans(1);

            // relocating pred may move cwd too when cwd is pred's
            // predecessor, track it through the commit
            let slot = self
                .handles
                .insert(Handle::Tracker(Tracked { id: 0, m: cwd }));
            let raw = pair::to_bytes(&dir.pair);
            let res = self.dir_commit(
                &mut pred,
                &[MAttr::bytes(Tag::new(TYPE_SOFTTAIL, 0x3ff, 8), &raw)],
            );
            if let Some(h) = self.handles.remove(slot) {
                cwd = *h.m();
            }
            res?;

            self.fs_preporphans(-1);
        }

        // now insert into our parent block
        let raw = pair::to_bytes(&dir.pair);
        let split = cwd.split;
        self.dir_commit(
            &mut cwd,
            &[
                MAttr::bare(Tag::new(TYPE_CREATE, id, 0)),
                MAttr::bytes(Tag::new(TYPE_DIR, id, name.len() as u32), name.as_bytes()),
                MAttr::bytes(Tag::new(TYPE_DIRSTRUCT, id, 8), &raw),
                MAttr::bytes(Tag::new_if(!split, TYPE_SOFTTAIL, 0x3ff, 8), &raw),
            ],
        )
    }

    /// Fetch the pair of the empty directory entry `id` of `cwd` points at.
    fn empty_dir(&mut self, cwd: &MDir, id: u16) -> Result<MDir> {
        let pair = self.dir_get_pair(cwd, id)?;
        let mut dir = MDir::default();
        self.dir_fetch(&mut dir, pair)?;

        if dir.count > 0 || dir.split {
            return Err(LfsError::NotEmpty);
        }
        Ok(dir)
    }

    /// Remove a file or an empty directory.
    pub fn remove(&mut self, path: &str) -> Result<()> {
        trace!("remove({:?})", path);
        // deorphan if we haven't yet, needed at most once after poweron
        self.fs_forceconsistency()?;

        let mut cwd = MDir::default();
        let tag = self.dir_find(&mut cwd, path).tag?;
        if tag.id() == ID_NONE {
            return Err(LfsError::Inval);
        }

        let mut tracker = None;
        if tag.type3() == TYPE_DIR {
            // must be empty before removal
            let dir = self.empty_dir(&cwd, tag.id())?;

            // mark fs as orphaned
            self.fs_preporphans(1);

            // the dir can be changed by our parent's commit if it is the
            // predecessor
            tracker = Some(
                self.handles
                    .insert(Handle::Tracker(Tracked { id: 0, m: dir })),
            );
        }

        // delete the entry
        let res = self.dir_commit(
            &mut cwd,
            &[MAttr::bare(Tag::new(TYPE_DELETE, tag.id(), 0))],
        );
        let dir = tracker
            .and_then(|slot| self.handles.remove(slot))
            .map(|h| *h.m());
        res?;

        if let Some(dir) = dir {
            // fix orphan
            self.fs_preporphans(-1);

            self.fs_pred(dir.pair, &mut cwd)?;
            self.dir_drop(&mut cwd, &dir)?;
        }

        Ok(())
    }

    /// Move an entry, replacing a file or empty directory at `newpath`.
    pub fn rename(&mut self, oldpath: &str, newpath: &str) -> Result<()> {
        trace!("rename({:?}, {:?})", oldpath, newpath);
        // deorphan if we haven't yet, needed at most once after poweron
        self.fs_forceconsistency()?;

        // find old entry
        let mut oldcwd = MDir::default();
        let oldtag = self.dir_find(&mut oldcwd, oldpath).tag?;
        if oldtag.id() == ID_NONE {
            return Err(LfsError::Inval);
        }

        // find new entry
        let mut newcwd = MDir::default();
        let lookup = self.dir_find(&mut newcwd, newpath);
        let newid = lookup.id;
        let newname = lookup.name;
        let prevtag = match lookup.tag {
            Err(LfsError::NoEnt) if newid != ID_NONE => None,
            Err(err) => return Err(err),
            Ok(tag) if tag.id() == ID_NONE => return Err(LfsError::Inval),
            Ok(tag) => Some(tag),
        };

        // if we're in the same pair there's a few special cases...
        let samepair = pair::same(&oldcwd.pair, &newcwd.pair);
        let mut newoldid = oldtag.id();

        let mut prevdir = None;
        match prevtag {
            None => {
                // check that name fits
                if newname.len() as u32 > self.cfg.name_max {
                    return Err(LfsError::NameTooLong);
                }

                // renaming to a lower id in the same directory shifts the
                // old entry up by one
                if samepair && newid <= newoldid {
                    newoldid += 1;
                }
            }
            Some(prevtag) if prevtag.type3() != oldtag.type3() => return Err(LfsError::IsDir),
            // we're renaming to ourselves??
            Some(_) if samepair && newid == newoldid => return Ok(()),
            Some(prevtag) if prevtag.type3() == TYPE_DIR => {
                // must be empty before removal
                let dir = self.empty_dir(&newcwd, newid)?;

                // mark fs as orphaned
                self.fs_preporphans(1);

                // the dir can be changed by our parent's commit if it is the
                // predecessor
                prevdir = Some(
                    self.handles
                        .insert(Handle::Tracker(Tracked { id: 0, m: dir })),
                );
            }
            Some(_) => {}
        }

        if !samepair {
            self.fs_prepmove(Some((newoldid, oldcwd.pair)));
        }

        // the source pair may be relocated by the commit below
        let oldslot = self.handles.insert(Handle::Tracker(Tracked {
            id: oldtag.id(),
            m: oldcwd,
        }));

        // move over all attributes
        let res = self.dir_commit(
            &mut newcwd,
            &[
                MAttr::bare(Tag::new_if(prevtag.is_some(), TYPE_DELETE, newid, 0)),
                MAttr::bare(Tag::new(TYPE_CREATE, newid, 0)),
                MAttr::bytes(
                    Tag::new(oldtag.type3(), newid, newname.len() as u32),
                    newname.as_bytes(),
                ),
                MAttr::new(
                    Tag::new(FROM_MOVE, newid, oldtag.id() as u32),
                    AttrBuf::Move(&oldcwd),
                ),
                MAttr::bare(Tag::new_if(samepair, TYPE_DELETE, newoldid, 0)),
            ],
        );

        // let commit clean up after move (if we're different! otherwise move
        // logic already fixed it for us)
        let res = res.and_then(|()| {
            if samepair || !self.gstate.has_move() {
                return Ok(());
            }
            let mut oldcwd = *self
                .handles
                .get(oldslot)
                .ok_or(LfsError::BadF)?
                .m();

            // prep gstate and delete move id
            self.fs_prepmove(None);
            self.dir_commit(
                &mut oldcwd,
                &[MAttr::bare(Tag::new(TYPE_DELETE, oldtag.id(), 0))],
            )
        });

        self.handles.remove(oldslot);
        let prevdir = prevdir
            .and_then(|slot| self.handles.remove(slot))
            .map(|h| *h.m());
        res?;

        if let Some(prevdir) = prevdir {
            // fix orphan
            self.fs_preporphans(-1);

            self.fs_pred(prevdir.pair, &mut newcwd)?;
            self.dir_drop(&mut newcwd, &prevdir)?;
        }

        Ok(())
    }

    pub fn stat(&mut self, path: &str) -> Result<Info> {
        let mut cwd = MDir::default();
        let tag = self.dir_find(&mut cwd, path).tag?;
        self.dir_getinfo(&cwd, tag.id())
    }

    // ─── Custom attributes ──────────────────────────────────────────────────

    /// Pair and id carrying the attributes of `path`. The root's live on
    /// the superblock entry.
    fn attr_target(&mut self, path: &str) -> Result<(MDir, u16)> {
        let mut cwd = MDir::default();
        let tag = self.dir_find(&mut cwd, path).tag?;

        let mut id = tag.id();
        if id == ID_NONE {
            // special case for root
            id = 0;
            let root = self.root;
            self.dir_fetch(&mut cwd, root)?;
        }

        Ok((cwd, id))
    }

    /// Read attribute `ty` of `path` into `buf`, returning its full size.
    ///
    /// At most `buf.len()` bytes are copied, the rest of `buf` is zeroed.
    pub fn getattr(&mut self, path: &str, ty: u8, buf: &mut [u8]) -> Result<usize> {
        let (cwd, id) = self.attr_target(path)?;

        let len = buf.len().min(self.cfg.attr_max as usize);
        match self.dir_get(
            &cwd,
            Tag::new(0x7ff, 0x3ff, 0),
            Tag::new(TYPE_USERATTR + ty as u16, id, len as u32),
            &mut buf[..len],
        ) {
            Ok(tag) => Ok(tag.size() as usize),
            Err(LfsError::NoEnt) => Err(LfsError::NoAttr),
            Err(err) => Err(err),
        }
    }

    pub fn setattr(&mut self, path: &str, ty: u8, value: &[u8]) -> Result<()> {
        trace!("setattr({:?}, {:#x}, {} bytes)", path, ty, value.len());
        if value.len() as u32 > self.cfg.attr_max {
            return Err(LfsError::NoSpc);
        }

        let (mut cwd, id) = self.attr_target(path)?;
        self.dir_commit(
            &mut cwd,
            &[MAttr::bytes(
                Tag::new(TYPE_USERATTR + ty as u16, id, value.len() as u32),
                value,
            )],
        )
    }

    pub fn removeattr(&mut self, path: &str, ty: u8) -> Result<()> {
        trace!("removeattr({:?}, {:#x})", path, ty);
        let (mut cwd, id) = self.attr_target(path)?;
        self.dir_commit(
            &mut cwd,
            &[MAttr::bare(Tag::new(TYPE_USERATTR + ty as u16, id, SIZE_DELETE))],
        )
    }

    // ─── Files ──────────────────────────────────────────────────────────────

    pub fn file_open(&mut self, path: &str, flags: OpenFlags) -> Result<File> {
        self.file_opencfg(path, flags, FileConfig::default())
    }

    /// Open with custom attributes, read on open when readable and written
    /// on every sync when writable.
    pub fn file_opencfg(
        &mut self,
        path: &str,
        flags: OpenFlags,
        config: FileConfig,
    ) -> Result<File> {
        self.file_opencfg_raw(path, flags, config).map(File)
    }

    /// Sync and close. The handle is gone even when syncing fails.
    pub fn file_close(&mut self, file: File) -> Result<()> {
        self.file_close_raw(file.0)
    }

    pub fn file_sync(&mut self, file: &File) -> Result<()> {
        trace!("file_sync({})", file.0);
        self.file_sync_raw(file.0)
    }

    pub fn file_read(&mut self, file: &File, buf: &mut [u8]) -> Result<usize> {
        self.file_read_raw(file.0, buf)
    }

    pub fn file_write(&mut self, file: &File, data: &[u8]) -> Result<usize> {
        self.file_write_raw(file.0, data)
    }

    /// Move the file position, returning the new one.
    pub fn file_seek(&mut self, file: &File, pos: SeekFrom) -> Result<u32> {
        let f = self.handles.file(file.0)?;
        let npos = match pos {
            SeekFrom::Start(off) => off as i64,
            SeekFrom::Current(off) => f.pos as i64 + off as i64,
            SeekFrom::End(off) => f.size() as i64 + off as i64,
        };
        self.file_seek_raw(file.0, npos)
    }

    pub fn file_tell(&self, file: &File) -> Result<u32> {
        Ok(self.handles.file(file.0)?.pos)
    }

    pub fn file_rewind(&mut self, file: &File) -> Result<()> {
        self.file_seek(file, SeekFrom::Start(0)).map(|_| ())
    }

    pub fn file_size(&self, file: &File) -> Result<u32> {
        Ok(self.handles.file(file.0)?.size())
    }

    pub fn file_truncate(&mut self, file: &File, size: u32) -> Result<()> {
        trace!("file_truncate({}, {})", file.0, size);
        self.file_truncate_raw(file.0, size)
    }

    /// Current value of the file's custom attribute `ty`.
    pub fn file_attr(&self, file: &File, ty: u8) -> Result<&[u8]> {
        self.handles
            .file(file.0)?
            .attrs
            .iter()
            .find(|a| a.ty == ty)
            .map(|a| a.buffer.as_slice())
            .ok_or(LfsError::NoAttr)
    }

    /// Replace the file's custom attribute `ty`, written out on next sync.
    pub fn file_set_attr(&mut self, file: &File, ty: u8, value: &[u8]) -> Result<()> {
        if value.len() as u32 > self.cfg.attr_max {
            return Err(LfsError::NoSpc);
        }

        let f = self.handles.file_mut(file.0)?;
        if !f.flags.contains(OpenFlags::WRONLY) {
            return Err(LfsError::BadF);
        }

        match f.attrs.iter_mut().find(|a| a.ty == ty) {
            Some(attr) => {
                attr.buffer.clear();
                attr.buffer.extend_from_slice(value);
            }
            None => f.attrs.push(UserAttr {
                ty,
                buffer: value.to_vec(),
            }),
        }
        f.status |= FileStatus::DIRTY;
        Ok(())
    }

    // ─── Directories ────────────────────────────────────────────────────────

    pub fn dir_open(&mut self, path: &str) -> Result<Dir> {
        self.dir_open_raw(path).map(Dir)
    }

    pub fn dir_close(&mut self, dir: Dir) -> Result<()> {
        self.dir_close_raw(dir.0)
    }

    /// Next entry, `.` and `..` first; `None` at the end.
    pub fn dir_read(&mut self, dir: &Dir) -> Result<Option<Info>> {
        self.dir_read_raw(dir.0)
    }

    /// Return to a position previously reported by [`Self::dir_tell`].
    pub fn dir_seek(&mut self, dir: &Dir, off: u32) -> Result<()> {
        self.dir_seek_raw(dir.0, off)
    }

    pub fn dir_tell(&mut self, dir: &Dir) -> Result<u32> {
        self.dir_tell_raw(dir.0)
    }

    pub fn dir_rewind(&mut self, dir: &Dir) -> Result<()> {
        self.dir_rewind_raw(dir.0)
    }

    // ─── Filesystem ─────────────────────────────────────────────────────────

    /// Number of blocks in use.
    pub fn fs_size(&mut self) -> Result<u32> {
        self.fs_rawsize()
    }

    pub(crate) fn fs_rawsize(&mut self) -> Result<u32> {
        let mut size = 0u32;
        self.fs_rawtraverse(
            &mut |_: u32| {
                size += 1;
                Ok(())
            },
            false,
        )?;
        Ok(size)
    }

    /// Call `cb` with every block in use, including blocks of files still
    /// being written. Blocks may be reported more than once.
    pub fn fs_traverse<F>(&mut self, mut cb: F) -> Result<()>
    where
        F: FnMut(u32) -> Result<()>,
    {
        self.fs_rawtraverse(&mut cb, true)
    }

    /// Finish interrupted operations now instead of on the next write, and
    /// write out pending global state.
    pub fn fs_mkconsistent(&mut self) -> Result<()> {
        trace!("fs_mkconsistent()");
        self.fs_forceconsistency()?;

        // do we have any pending gstate?
        let delta = self.gdisk.xored(&self.gstate);
        if !delta.is_zero() {
            // committing writes out any pending gstate
            let mut root = MDir::default();
            let pair = self.root;
            self.dir_fetch(&mut root, pair)?;
            self.dir_commit(&mut root, &[])?;
        }

        Ok(())
    }
}
