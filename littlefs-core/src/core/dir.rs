use alloc::string::String;

use log::trace;

use crate::error::{LfsError, Result};
use crate::fs::{FileType, Info, LittleFs};
use crate::fs_core::mdir::MDir;
use crate::fs_core::registry::Handle;
use crate::layout::pair::{self, Pair};
use crate::layout::tag::{ID_NONE, TYPE_DIR};
use crate::traits::block_device::BlockDevice;

/// Iterator state of an open directory.
///
/// `pos` counts entries handed out including `.` and `..`, `id` is the next
/// entry inside the pair `m`; `head` is the first pair of the directory.
#[derive(Debug)]
pub(crate) struct OpenDir {
    pub id: u16,
    pub m: MDir,
    pub head: Pair,
    pub pos: u32,
}

impl<D: BlockDevice> LittleFs<D> {
    pub(crate) fn dir_open_raw(&mut self, path: &str) -> Result<usize> {
        trace!("dir_open({:?})", path);
        let mut m = MDir::default();
        let tag = self.dir_find(&mut m, path).tag?;
        if tag.type3() != TYPE_DIR {
            return Err(LfsError::NotDir);
        }

        let pair = if tag.id() == ID_NONE {
            // handle root dir separately
            self.root
        } else {
            // get dir pair from parent
            self.dir_get_pair(&m, tag.id())?
        };

        // fetch first pair
        self.dir_fetch(&mut m, pair)?;

        Ok(self.handles.insert(Handle::Dir(OpenDir {
            id: 0,
            m,
            head: m.pair,
            pos: 0,
        })))
    }

    pub(crate) fn dir_close_raw(&mut self, slot: usize) -> Result<()> {
        self.handles.dir_mut(slot)?;
        self.handles.remove(slot);
        Ok(())
    }

    pub(crate) fn dir_read_raw(&mut self, slot: usize) -> Result<Option<Info>> {
        let d = self.handles.dir_mut(slot)?;

        // special offset for '.' and '..'
        if d.pos < 2 {
            let name = if d.pos == 0 { "." } else { ".." };
            d.pos += 1;
            return Ok(Some(Info {
                kind: FileType::Dir,
                size: 0,
                name: String::from(name),
            }));
        }

        let (mut id, mut m) = (d.id, d.m);
        let info = loop {
            if id == m.count {
                if !m.split {
                    let d = self.handles.dir_mut(slot)?;
                    d.id = id;
                    d.m = m;
                    return Ok(None);
                }

                let tail = m.tail;
                self.dir_fetch(&mut m, tail)?;
                id = 0;
            }

            let res = self.dir_getinfo(&m, id);
            id += 1;
            match res {
                Ok(info) => break info,
                Err(LfsError::NoEnt) => {}
                Err(err) => return Err(err),
            }
        };

        let d = self.handles.dir_mut(slot)?;
        d.id = id;
        d.m = m;
        d.pos += 1;
        Ok(Some(info))
    }

    pub(crate) fn dir_seek_raw(&mut self, slot: usize, off: u32) -> Result<()> {
        // simply walk from head dir
        self.dir_rewind_raw(slot)?;

        let root = self.root;
        let d = self.handles.dir_mut(slot)?;
        // first two for ./..
        d.pos = off.min(2);
        let mut off = off - d.pos;

        // skip superblock entry
        d.id = (off > 0 && pair::same(&d.head, &root)) as u16;

        let (mut id, mut pos, mut m) = (d.id, d.pos, d.m);
        while off > 0 {
            let diff = ((m.count - id) as u32).min(off);
            id += diff as u16;
            pos += diff;
            off -= diff;

            if off > 0 && id == m.count {
                if !m.split {
                    return Err(LfsError::Inval);
                }
                let tail = m.tail;
                self.dir_fetch(&mut m, tail)?;
                id = 0;
            }
        }

        let d = self.handles.dir_mut(slot)?;
        d.id = id;
        d.pos = pos;
        d.m = m;
        Ok(())
    }

    pub(crate) fn dir_tell_raw(&mut self, slot: usize) -> Result<u32> {
        Ok(self.handles.dir_mut(slot)?.pos)
    }

    pub(crate) fn dir_rewind_raw(&mut self, slot: usize) -> Result<()> {
        // reload the head dir
        let head = self.handles.dir_mut(slot)?.head;
        let mut m = MDir::default();
        self.dir_fetch(&mut m, head)?;

        let d = self.handles.dir_mut(slot)?;
        d.m = m;
        d.id = 0;
        d.pos = 0;
        Ok(())
    }
}
