use log::{debug, error};

use crate::error::{LfsError, Result};
use crate::fs::LittleFs;
use crate::fs_core::mdir::{FetchMatcher, MDir};
use crate::fs_core::registry::Handle;
use crate::fs_core::traverse::MAttr;
use crate::layout::pair::{self, Pair};
use crate::layout::tag::{ID_NONE, TYPE_DELETE, TYPE_DIRSTRUCT, TYPE_SOFTTAIL, TYPE_TAIL, Tag};
use crate::traits::block_device::BlockDevice;

impl<D: BlockDevice> LittleFs<D> {
    /// Find the pair whose tail is `pair`, leaving it fetched in `pdir`.
    pub(crate) fn fs_pred(&mut self, pair: Pair, pdir: &mut MDir) -> Result<()> {
        // iterate over all directory directory entries
        pdir.tail = pair::ROOT_PAIR;
        let mut cycle = 0u32;
        while !pair::is_null(&pdir.tail) {
            if cycle >= self.cfg.block_count / 2 {
                // loop detected
                error!("Metadata tail loop at {{{:#x}, {:#x}}}", pdir.tail[0], pdir.tail[1]);
                return Err(LfsError::Corrupt);
            }
            cycle += 1;

            if pair::same(&pdir.tail, &pair) {
                return Ok(());
            }

            let tail = pdir.tail;
            self.dir_fetch(pdir, tail)?;
        }

        Err(LfsError::NoEnt)
    }

    /// Find the directory entry pointing at `pair`, leaving its pair fetched
    /// in `parent` and returning the entry's struct tag.
    pub(crate) fn fs_parent(&mut self, pair: Pair, parent: &mut MDir) -> Result<Tag> {
        // use fetchmatch with callback to find pairs
        parent.tail = pair::ROOT_PAIR;
        let mut cycle = 0u32;
        while !pair::is_null(&parent.tail) {
            if cycle >= self.cfg.block_count / 2 {
                // loop detected
                error!("Metadata tail loop at {{{:#x}, {:#x}}}", parent.tail[0], parent.tail[1]);
                return Err(LfsError::Corrupt);
            }
            cycle += 1;

            let tail = parent.tail;
            match self.dir_fetchmatch(
                parent,
                tail,
                Tag::new(0x7ff, 0, 0x3ff),
                Tag::new(TYPE_DIRSTRUCT, 0, 8),
                None,
                Some(FetchMatcher::ChildPair(pair)),
            ) {
                Ok(tag) if tag != Tag::NOOP => return Ok(tag),
                Ok(_) | Err(LfsError::NoEnt) => {}
                Err(err) => return Err(err),
            }
        }

        Err(LfsError::NoEnt)
    }

    /// Adjust the orphan count of the in-memory gstate.
    pub(crate) fn fs_preporphans(&mut self, orphans: i8) {
        debug_assert!(self.gstate.orphans() > 0 || orphans >= 0);
        self.gstate.add_orphans(orphans);
    }

    /// Record (or clear with `None`) the entry a pending move must delete.
    pub(crate) fn fs_prepmove(&mut self, target: Option<(u16, Pair)>) {
        self.gstate.set_move(target);
    }

    /// Point every reference to `oldpair` at `newpair` after a relocation.
    pub(crate) fn fs_relocate(&mut self, oldpair: Pair, newpair: Pair) -> Result<()> {
        // update internal root
        if pair::same(&oldpair, &self.root) {
            self.root = newpair;
        }

        // update internally tracked dirs
        for (_, h) in self.handles.iter_mut() {
            if pair::same(&oldpair, &h.m().pair) {
                h.m_mut().pair = newpair;
            }
            if let Handle::Dir(d) = h {
                if pair::same(&oldpair, &d.head) {
                    d.head = newpair;
                }
            }
        }

        // find parent
        let mut parent = MDir::default();
        let raw = pair::to_bytes(&newpair);
        match self.fs_parent(oldpair, &mut parent) {
            Ok(mut tag) => {
                // update disk, this creates a desync
                self.fs_preporphans(1);

                // a pending move in the parent is resolved in the same commit,
                // relocating may otherwise leave it pointing at a stale id
                let mut moveid = ID_NONE;
                if self.gstate.has_move_here(&parent.pair) {
                    moveid = self.gstate.move_id();
                    debug!(
                        "Fixing move while relocating {{{:#x}, {:#x}}} {:#x}",
                        parent.pair[0], parent.pair[1], moveid
                    );
                    self.fs_prepmove(None);
                    if moveid < tag.id() {
                        tag = tag.shift_id(-1);
                    }
                }

                self.dir_commit(
                    &mut parent,
                    &[
                        MAttr::bare(Tag::new_if(moveid != ID_NONE, TYPE_DELETE, moveid, 0)),
                        MAttr::bytes(tag, &raw),
                    ],
                )?;

                // next step, clean up orphans
                self.fs_preporphans(-1);
            }
            Err(LfsError::NoEnt) => {}
            Err(err) => return Err(err),
        }

        // find pred
        match self.fs_pred(oldpair, &mut parent) {
            Ok(()) => {
                // fix pending move in this pair?
                let mut moveid = ID_NONE;
                if self.gstate.has_move_here(&parent.pair) {
                    moveid = self.gstate.move_id();
                    debug!(
                        "Fixing move while relocating {{{:#x}, {:#x}}} {:#x}",
                        parent.pair[0], parent.pair[1], moveid
                    );
                    self.fs_prepmove(None);
                }

                // replace bad pair, either we clean up desync, or no desync occured
                let split = parent.split as u16;
                self.dir_commit(
                    &mut parent,
                    &[
                        MAttr::bare(Tag::new_if(moveid != ID_NONE, TYPE_DELETE, moveid, 0)),
                        MAttr::bytes(Tag::new(TYPE_TAIL + split, 0x3ff, 8), &raw),
                    ],
                )?;
            }
            // if we can't find dir, it must be new
            Err(LfsError::NoEnt) => {}
            Err(err) => return Err(err),
        }

        Ok(())
    }

    /// Finish a rename interrupted between creating the new entry and
    /// deleting the old one.
    fn fs_demove(&mut self) -> Result<()> {
        if !self.gdisk.has_move() {
            return Ok(());
        }

        // fix bad moves
        debug!(
            "Fixing move {{{:#x}, {:#x}}} {:#x}",
            self.gdisk.pair[0],
            self.gdisk.pair[1],
            self.gdisk.move_id()
        );

        // fetch and delete the moved entry
        let mut movedir = MDir::default();
        let pair = self.gdisk.pair;
        self.dir_fetch(&mut movedir, pair)?;

        // prep gstate and delete move id
        let moveid = self.gdisk.move_id();
        self.fs_prepmove(None);
        self.dir_commit(
            &mut movedir,
            &[MAttr::bare(Tag::new(TYPE_DELETE, moveid, 0))],
        )
    }

    /// Drop directories no entry refers to anymore and repair tails that
    /// lost track of a relocated pair.
    fn fs_deorphan(&mut self) -> Result<()> {
        if !self.gstate.has_orphans() {
            return Ok(());
        }

        let mut pdir = MDir {
            split: true,
            ..MDir::list_head()
        };
        let mut dir = MDir::default();

        // iterate over all directory directory entries
        while !pair::is_null(&pdir.tail) {
            let tail = pdir.tail;
            self.dir_fetch(&mut dir, tail)?;

            // check head blocks for orphans
            if !pdir.split {
                // check if we have a parent
                let mut parent = MDir::default();
                let tag = match self.fs_parent(pdir.tail, &mut parent) {
                    Ok(tag) => tag,
                    Err(LfsError::NoEnt) => {
                        // we are an orphan
                        debug!("Fixing orphan {{{:#x}, {:#x}}}", pdir.tail[0], pdir.tail[1]);
                        self.dir_drop(&mut pdir, &dir)?;
                        // refetch tail
                        continue;
                    }
                    Err(err) => return Err(err),
                };

                let mut raw = [0u8; 8];
                self.dir_get(&parent, Tag::new(0x7ff, 0x3ff, 0), tag, &mut raw)?;
                let pair = pair::from_bytes(&raw);

                if !pair::sync(&pair, &pdir.tail) {
                    // we have desynced
                    debug!(
                        "Fixing half-orphan {{{:#x}, {:#x}}} -> {{{:#x}, {:#x}}}",
                        pdir.tail[0], pdir.tail[1], pair[0], pair[1]
                    );
                    self.dir_commit(
                        &mut pdir,
                        &[MAttr::bytes(Tag::new(TYPE_SOFTTAIL, 0x3ff, 8), &raw)],
                    )?;
                    // refetch tail
                    continue;
                }
            }

            pdir = dir;
        }

        // mark orphans as fixed
        let orphans = self.gstate.orphans();
        self.fs_preporphans(-(orphans as i8));
        Ok(())
    }

    /// Complete any interrupted move and orphan cleanup. Runs before the
    /// first mutation after mount; a no-op once the volume is consistent.
    pub(crate) fn fs_forceconsistency(&mut self) -> Result<()> {
        self.fs_demove()?;
        self.fs_deorphan()
    }
}
