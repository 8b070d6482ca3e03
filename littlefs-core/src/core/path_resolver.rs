use crate::error::{LfsError, Result};
use crate::fs::LittleFs;
use crate::fs_core::mdir::{FetchMatcher, MDir};
use crate::layout::pair;
use crate::layout::tag::{ID_NONE, TYPE_DIR, TYPE_NAME, Tag};
use crate::traits::block_device::BlockDevice;

/// Outcome of resolving a path.
#[derive(Debug)]
pub(crate) struct Lookup<'p> {
    /// Tag of the entry found, or why the walk stopped.
    pub tag: Result<Tag>,
    /// Rest of the path from the last component reached.
    pub name: &'p str,
    /// For a missing last component, the id a new entry would take;
    /// otherwise the id of the entry or [`ID_NONE`].
    pub id: u16,
}

/// Path splitting helpers; paths are `/`-separated, absolute or not.
pub struct PathResolver;

impl PathResolver {
    /// Skip separators, `.` and `..` components, and components cancelled
    /// by a later `..`, returning the path from the next real name.
    ///
    /// `..` never climbs above the root.
    pub fn next_name(mut path: &str) -> &str {
        'next: loop {
            // skip slashes
            path = path.trim_start_matches('/');
            let len = Self::name_len(path);

            // skip '.' and root '..'
            if &path[..len] == "." || &path[..len] == ".." {
                path = &path[len..];
                continue;
            }

            // skip if matched by '..' in name
            let mut suffix = &path[len..];
            let mut depth = 1;
            loop {
                suffix = suffix.trim_start_matches('/');
                let sufflen = Self::name_len(suffix);
                if sufflen == 0 {
                    break;
                }

                if &suffix[..sufflen] == ".." {
                    depth -= 1;
                    if depth == 0 {
                        path = &suffix[sufflen..];
                        continue 'next;
                    }
                } else {
                    depth += 1;
                }

                suffix = &suffix[sufflen..];
            }

            return path;
        }
    }

    /// Length of the first component.
    pub fn name_len(path: &str) -> usize {
        path.find('/').unwrap_or(path.len())
    }
}

impl<D: BlockDevice> LittleFs<D> {
    /// Walk `path` from the root, leaving the pair holding the last entry
    /// reached fetched in `dir`.
    pub(crate) fn dir_find<'p>(&mut self, dir: &mut MDir, path: &'p str) -> Lookup<'p> {
        let mut lookup = Lookup {
            tag: Ok(Tag::NOOP),
            name: path,
            id: ID_NONE,
        };
        lookup.tag = self.dir_find_inner(dir, &mut lookup.name, &mut lookup.id);
        lookup
    }

    fn dir_find_inner<'p>(
        &mut self,
        dir: &mut MDir,
        path: &mut &'p str,
        id: &mut u16,
    ) -> Result<Tag> {
        // default to root dir
        let mut tag = Tag::new(TYPE_DIR, ID_NONE, 0);
        dir.tail = self.root;

        let mut name = *path;
        loop {
            name = PathResolver::next_name(name);
            let namelen = PathResolver::name_len(name);

            // found path
            if name.is_empty() {
                return Ok(tag);
            }

            // update what we've found so far
            *path = name;

            // only continue if we hit a directory
            if tag.type3() != TYPE_DIR {
                return Err(LfsError::NotDir);
            }

            // grab the entry data
            if tag.id() != ID_NONE {
                dir.tail = self.dir_get_pair(dir, tag.id())?;
            }

            // are we last name?
            let last = !name.contains('/');

            // find entry matching name
            loop {
                let tail = dir.tail;
                let found = self.dir_fetchmatch(
                    dir,
                    tail,
                    Tag::new(0x780, 0, 0),
                    Tag::new(TYPE_NAME, 0, namelen as u32),
                    if last { Some(&mut *id) } else { None },
                    Some(FetchMatcher::Name(name[..namelen].as_bytes())),
                )?;
                if found != Tag::NOOP {
                    tag = found;
                    break;
                }
                if !dir.split || pair::is_null(&dir.tail) {
                    return Err(LfsError::NoEnt);
                }
            }

            // to next name
            name = &name[namelen..];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::PathResolver;

    #[test]
    fn test_next_name_skips_separators_and_dots() {
        assert_eq!(PathResolver::next_name("/a/b"), "a/b");
        assert_eq!(PathResolver::next_name("//./a"), "a");
        assert_eq!(PathResolver::next_name("../a"), "a");
        assert_eq!(PathResolver::next_name("/"), "");
    }

    #[test]
    fn test_next_name_cancels_components_with_dotdot() {
        assert_eq!(PathResolver::next_name("a/../b"), "b");
        assert_eq!(PathResolver::next_name("a/b/../../c"), "c");
        // only the first component is resolved here, b stays
        assert_eq!(PathResolver::next_name("a/b/../c"), "a/b/../c");
    }

    #[test]
    fn test_name_len() {
        assert_eq!(PathResolver::name_len("abc/def"), 3);
        assert_eq!(PathResolver::name_len("abc"), 3);
        assert_eq!(PathResolver::name_len(""), 0);
    }
}
