use alloc::vec::Vec;

use crate::error::{LfsError, Result};
use crate::fs_core::dir::OpenDir;
use crate::fs_core::file::OpenFile;
use crate::fs_core::mdir::MDir;

/// Metadata pair tracked for the duration of one operation, so commits in
/// between keep it pointing at the right pair.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Tracked {
    pub id: u16,
    pub m: MDir,
}

/// Anything that holds a position inside a metadata pair.
///
/// Commits walk the registry to renumber ids, detach deleted entries and
/// follow relocated or split pairs.
#[derive(Debug)]
pub(crate) enum Handle {
    File(OpenFile),
    Dir(OpenDir),
    Tracker(Tracked),
}

impl Handle {
    pub fn id(&self) -> u16 {
        match self {
            Handle::File(f) => f.id,
            Handle::Dir(d) => d.id,
            Handle::Tracker(t) => t.id,
        }
    }

    pub fn set_id(&mut self, id: u16) {
        match self {
            Handle::File(f) => f.id = id,
            Handle::Dir(d) => d.id = id,
            Handle::Tracker(t) => t.id = id,
        }
    }

    pub fn m(&self) -> &MDir {
        match self {
            Handle::File(f) => &f.m,
            Handle::Dir(d) => &d.m,
            Handle::Tracker(t) => &t.m,
        }
    }

    pub fn m_mut(&mut self) -> &mut MDir {
        match self {
            Handle::File(f) => &mut f.m,
            Handle::Dir(d) => &mut d.m,
            Handle::Tracker(t) => &mut t.m,
        }
    }
}

/// Slot table of open handles, indexed by the tokens given to callers.
#[derive(Debug, Default)]
pub(crate) struct HandleRegistry {
    slots: Vec<Option<Handle>>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `handle` in the first free slot.
    pub fn insert(&mut self, handle: Handle) -> usize {
        if let Some(slot) = self.slots.iter().position(Option::is_none) {
            self.slots[slot] = Some(handle);
            return slot;
        }
        self.slots.push(Some(handle));
        self.slots.len() - 1
    }

    pub fn remove(&mut self, slot: usize) -> Option<Handle> {
        let handle = self.slots.get_mut(slot)?.take();
        while matches!(self.slots.last(), Some(None)) {
            self.slots.pop();
        }
        handle
    }

    pub fn get(&self, slot: usize) -> Option<&Handle> {
        self.slots.get(slot)?.as_ref()
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut Handle> {
        self.slots.get_mut(slot)?.as_mut()
    }

    /// Upper bound of slot indices, for index-based walks that need to
    /// call back into the filesystem between handles.
    pub fn slots(&self) -> usize {
        self.slots.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Handle)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, h)| h.as_ref().map(|h| (slot, h)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut Handle)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(slot, h)| h.as_mut().map(|h| (slot, h)))
    }

    pub fn file(&self, slot: usize) -> Result<&OpenFile> {
        match self.get(slot) {
            Some(Handle::File(f)) => Ok(f),
            _ => Err(LfsError::BadF),
        }
    }

    pub fn file_mut(&mut self, slot: usize) -> Result<&mut OpenFile> {
        match self.get_mut(slot) {
            Some(Handle::File(f)) => Ok(f),
            _ => Err(LfsError::BadF),
        }
    }

    pub fn dir_mut(&mut self, slot: usize) -> Result<&mut OpenDir> {
        match self.get_mut(slot) {
            Some(Handle::Dir(d)) => Ok(d),
            _ => Err(LfsError::BadF),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }
}

#[cfg(test)]
mod tests {
    use super::{Handle, HandleRegistry, Tracked};
    use crate::error::LfsError;
    use crate::fs_core::mdir::MDir;

    fn tracker(id: u16) -> Handle {
        Handle::Tracker(Tracked {
            id,
            m: MDir::default(),
        })
    }

    #[test]
    fn test_slots_are_reused() {
        let mut reg = HandleRegistry::new();
        let a = reg.insert(tracker(1));
        let b = reg.insert(tracker(2));
        assert_eq!((a, b), (0, 1));

        assert!(reg.remove(a).is_some());
        assert_eq!(reg.insert(tracker(3)), 0);
        assert_eq!(reg.get(0).map(Handle::id), Some(3));
    }

    #[test]
    fn test_trailing_slots_shrink() {
        let mut reg = HandleRegistry::new();
        let a = reg.insert(tracker(1));
        let b = reg.insert(tracker(2));
        reg.remove(b);
        assert_eq!(reg.slots(), 1);
        reg.remove(a);
        assert!(reg.is_empty());
        assert_eq!(reg.slots(), 0);
    }

    #[test]
    fn test_wrong_kind_is_bad_handle() {
        let mut reg = HandleRegistry::new();
        let a = reg.insert(tracker(0));
        assert_eq!(reg.file(a).err(), Some(LfsError::BadF));
        assert_eq!(reg.dir_mut(a).err(), Some(LfsError::BadF));
        assert_eq!(reg.file(7).err(), Some(LfsError::BadF));
    }
}
