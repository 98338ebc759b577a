//! Path resolution and directory-entry management.
//!
//! A directory is an ordinary file whose data blocks hold an array of
//! fixed-size entries. Free slots (inode 0, empty name) may sit between
//! live ones; the inode's `dentries` field counts the live entries and its
//! `size` stays equal to `dentries * 256`.

use crate::error::{Error, Result};
use crate::fs::Mapfs;
use crate::layout::{Dirent, Inode, PATH_MAX, ROOT_INO};
use std::mem::size_of;

/// Splits an absolute path into its parent path and final component.
///
/// `"/a/b"` becomes `("/a", "b")` and `"/a"` becomes `("/", "a")`.
pub(crate) fn split_parent(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(0) => ("/", &path[1..]),
        Some(i) => (&path[..i], &path[i + 1..]),
        None => ("/", path),
    }
}

impl Mapfs {
    /// Rejects paths at or beyond the platform maximum before any
    /// resolution work.
    pub(crate) fn check_path(&self, path: &str) -> Result<()> {
        if path.len() >= PATH_MAX {
            return Err(Error::NameTooLong);
        }
        Ok(())
    }

    /// Resolves an absolute path to its inode number.
    ///
    /// Each component is matched by a linear scan of the current
    /// directory. An overlong component cannot exist in any directory and
    /// therefore comes back as `NotFound`.
    pub(crate) fn resolve(&self, path: &str) -> Result<u32> {
        self.check_path(path)?;
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        let mut cur = ROOT_INO;
        for (i, component) in components.iter().enumerate() {
            let dir = self.inode(cur);
            let (_, entry) = self
                .lookup_entry(&dir, component.as_bytes())
                .ok_or(Error::NotFound)?;
            if i + 1 < components.len() && !self.inode(entry.ino).is_dir() {
                return Err(Error::NotDir);
            }
            cur = entry.ino;
        }
        Ok(cur)
    }

    /// Scans `dir` for an entry named `name`, returning its image offset
    /// and contents.
    pub(crate) fn lookup_entry(&self, dir: &Inode, name: &[u8]) -> Option<(u64, Dirent)> {
        for off in self.dirent_offsets(dir) {
            let entry: Dirent = self.image().read_at(off);
            if !entry.is_free() && entry.name_bytes() == name {
                return Some((off, entry));
            }
        }
        None
    }

    /// Inserts an entry for `child` under `dir_ino`.
    ///
    /// The first free slot of the directory's blocks is reused; when every
    /// slot is taken, a freshly zeroed block is appended and its first
    /// slot used.
    pub(crate) fn insert_entry(&mut self, dir_ino: u32, name: &[u8], child: u32) -> Result<()> {
        let mut dir = self.inode(dir_ino);
        let free = self
            .dirent_offsets(&dir)
            .into_iter()
            .find(|off| self.image().read_at::<Dirent>(*off).is_free());
        let off = match free {
            Some(off) => off,
            None => {
                let slot = self.append_new_block(dir_ino)?;
                dir = self.inode(dir_ino);
                let ext = self.slot_extent(&dir, slot);
                self.superblock().data_block_offset(ext.start + ext.count - 1)
            }
        };
        self.image_mut().write_at(off, &Dirent::new(child, name));
        dir.dentries += 1;
        dir.size += size_of::<Dirent>() as u64;
        self.set_inode(dir_ino, &dir);
        Ok(())
    }

    /// Removes the entry named `name` from `dir_ino` and returns the inode
    /// number it referenced.
    ///
    /// Only the slot and the directory counts are touched; releasing the
    /// referenced inode is the caller's decision (rename keeps it alive).
    pub(crate) fn remove_entry(&mut self, dir_ino: u32, name: &[u8]) -> Result<u32> {
        let mut dir = self.inode(dir_ino);
        let (off, entry) = self.lookup_entry(&dir, name).ok_or(Error::NotFound)?;
        self.image_mut().write_at(off, &Dirent::zeroed());
        dir.dentries -= 1;
        dir.size -= size_of::<Dirent>() as u64;
        self.set_inode(dir_ino, &dir);
        Ok(entry.ino)
    }

    /// Redirects the entry named `name` in `dir_ino` at another inode.
    pub(crate) fn repoint_entry(&mut self, dir_ino: u32, name: &[u8], child: u32) -> Result<()> {
        let dir = self.inode(dir_ino);
        let (off, mut entry) = self.lookup_entry(&dir, name).ok_or(Error::NotFound)?;
        entry.ino = child;
        self.image_mut().write_at(off, &entry);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fs::test::temp_fs;
    use crate::layout::{TimeSpec, DIRENTS_PER_BLOCK};

    #[test]
    fn split_paths() {
        assert_eq!(split_parent("/a"), ("/", "a"));
        assert_eq!(split_parent("/a/b"), ("/a", "b"));
        assert_eq!(split_parent("/a/b/c"), ("/a/b", "c"));
    }

    #[test]
    fn resolve_root() {
        let (_dir, fs) = temp_fs(16, 32);
        assert_eq!(fs.resolve("/"), Ok(ROOT_INO));
    }

    #[test]
    fn resolve_missing() {
        let (_dir, fs) = temp_fs(16, 32);
        assert_eq!(fs.resolve("/nope"), Err(Error::NotFound));
    }

    #[test]
    fn resolve_through_file_fails() {
        let (_dir, mut fs) = temp_fs(16, 32);
        fs.create("/f", libc::S_IFREG | 0o644).unwrap();
        assert_eq!(fs.resolve("/f/x"), Err(Error::NotDir));
    }

    #[test]
    fn path_length_limit() {
        let (_dir, fs) = temp_fs(16, 32);
        // One byte below the limit resolves far enough to miss the entry;
        // at the limit the path is rejected outright.
        let fits = format!("/{}", "a".repeat(PATH_MAX - 2));
        assert_eq!(fs.resolve(&fits), Err(Error::NotFound));
        let long = format!("/{}", "a".repeat(PATH_MAX - 1));
        assert_eq!(fs.resolve(&long), Err(Error::NameTooLong));
    }

    #[test]
    fn insert_reuses_freed_slot() {
        let (_dir, mut fs) = temp_fs(16, 32);
        let mtime = TimeSpec::now();
        for (i, name) in [b"a" as &[u8], b"b", b"c"].iter().enumerate() {
            let ino = (i + 1) as u32;
            fs.claim_inode_slot(ino, &Inode::new(libc::S_IFREG | 0o644, mtime));
            fs.insert_entry(ROOT_INO, name, ino).unwrap();
        }
        let root = fs.inode(ROOT_INO);
        assert_eq!(root.dentries, 3);
        assert_eq!(root.size, 3 * 256);

        fs.remove_entry(ROOT_INO, b"b").unwrap();
        let root = fs.inode(ROOT_INO);
        assert_eq!(root.dentries, 2);
        assert_eq!(root.size, 2 * 256);

        // The freed middle slot is the first free one and gets reused.
        fs.insert_entry(ROOT_INO, b"d", 4).unwrap();
        let root = fs.inode(ROOT_INO);
        let offs = fs.dirent_offsets(&root);
        let entry: Dirent = fs.image().read_at(offs[1]);
        assert_eq!(entry.name_bytes(), b"d");
    }

    #[test]
    fn insert_appends_block_when_full() {
        let (_dir, mut fs) = temp_fs(64, 64);
        for i in 0..DIRENTS_PER_BLOCK {
            let name = format!("f{i}");
            fs.insert_entry(ROOT_INO, name.as_bytes(), 1 + i as u32).unwrap();
        }
        let one_block = fs.inode(ROOT_INO);
        assert_eq!(fs.capacity(&one_block), crate::layout::BLOCK_SIZE);

        fs.insert_entry(ROOT_INO, b"straggler", 99).unwrap();
        let root = fs.inode(ROOT_INO);
        assert_eq!(fs.capacity(&root), 2 * crate::layout::BLOCK_SIZE);
        assert_eq!(root.dentries as u64, DIRENTS_PER_BLOCK + 1);
        assert!(fs.lookup_entry(&root, b"straggler").is_some());
    }
}
