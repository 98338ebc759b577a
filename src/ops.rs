//! The callback surface served to the FUSE host.
//!
//! Every operation takes an absolute path within the filesystem (leading
//! slash, no trailing slash except for the root itself), performs its own
//! resolution and returns either a value or an [`Error`](crate::Error)
//! that the host negates into an errno. The host serializes calls; nothing
//! here holds state across them.

use crate::dir::split_parent;
use crate::error::{Error, Result};
use crate::fs::Mapfs;
use crate::layout::{Dirent, Inode, TimeSpec, BLOCK_SIZE, NAME_MAX};
use log::debug;

/// File or directory attributes, as reported by `getattr`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Stat {
    /// Inode number.
    pub ino: u32,
    /// File type and permission bits.
    pub mode: u32,
    /// Number of hard links.
    pub links: u32,
    /// Size in bytes.
    pub size: u64,
    /// Size in 512-byte units.
    pub blocks: u64,
    /// Last modification time.
    pub mtime: TimeSpec,
}

/// Filesystem statistics, as reported by `statfs`.
#[derive(Clone, Copy, Debug)]
pub struct StatFs {
    /// Allocation unit in bytes.
    pub block_size: u32,
    /// Total blocks in the image.
    pub blocks: u64,
    /// Free data blocks.
    pub blocks_free: u64,
    /// Total inodes.
    pub inodes: u64,
    /// Free inodes.
    pub inodes_free: u64,
    /// Longest representable name, in bytes.
    pub name_max: u32,
}

impl Mapfs {
    /// Reports filesystem statistics.
    pub fn statfs(&self) -> StatFs {
        let sb = self.superblock();
        StatFs {
            block_size: BLOCK_SIZE as u32,
            blocks: sb.size / BLOCK_SIZE,
            blocks_free: sb.free_blocks_count as u64,
            inodes: sb.inodes_count as u64,
            inodes_free: sb.free_inodes_count as u64,
            name_max: NAME_MAX as u32,
        }
    }

    /// Returns the attributes of the file or directory at `path`.
    pub fn getattr(&self, path: &str) -> Result<Stat> {
        let ino = self.resolve(path)?;
        let inode = self.inode(ino);
        Ok(Stat {
            ino,
            mode: inode.mode,
            links: inode.links,
            size: inode.size,
            blocks: inode.size / 512,
            mtime: inode.mtime(),
        })
    }

    /// Calls `filler` once per live entry of the directory at `path`.
    ///
    /// A `filler` returning `true` signals back-pressure and aborts the
    /// listing with `NoMemory`.
    pub fn readdir<F>(&self, path: &str, mut filler: F) -> Result<()>
    where
        F: FnMut(&[u8], u32) -> bool,
    {
        let ino = self.resolve(path)?;
        let dir = self.inode(ino);
        if !dir.is_dir() {
            return Err(Error::NotDir);
        }
        for off in self.dirent_offsets(&dir) {
            let entry: Dirent = self.image().read_at(off);
            if entry.is_free() {
                continue;
            }
            if filler(entry.name_bytes(), entry.ino) {
                return Err(Error::NoMemory);
            }
        }
        Ok(())
    }

    /// Creates a regular file. `mode` carries the file type bits.
    pub fn create(&mut self, path: &str, mode: u32) -> Result<()> {
        debug!("create {path} mode {mode:o}");
        self.make_node(path, mode)
    }

    /// Creates a directory.
    pub fn mkdir(&mut self, path: &str, mode: u32) -> Result<()> {
        debug!("mkdir {path} mode {mode:o}");
        self.make_node(path, mode | libc::S_IFDIR)
    }

    fn make_node(&mut self, path: &str, mode: u32) -> Result<()> {
        self.check_path(path)?;
        if self.superblock().free_inodes_count == 0 {
            return Err(Error::NoSpace);
        }
        let (parent_path, name) = split_parent(path);
        if name.is_empty() {
            return Err(Error::NotFound);
        }
        if name.len() > NAME_MAX {
            return Err(Error::NameTooLong);
        }
        let parent = self.resolve(parent_path)?;
        if !self.inode(parent).is_dir() {
            return Err(Error::NotDir);
        }
        let ino = self.find_free_inode().ok_or(Error::NoSpace)?;
        self.insert_entry(parent, name.as_bytes(), ino)?;
        self.claim_inode_slot(ino, &Inode::new(mode, TimeSpec::now()));
        Ok(())
    }

    /// Removes the file at `path`, releasing its blocks and inode.
    pub fn unlink(&mut self, path: &str) -> Result<()> {
        debug!("unlink {path}");
        self.check_path(path)?;
        let (parent_path, name) = split_parent(path);
        let parent = self.resolve(parent_path)?;
        let dir = self.inode(parent);
        if !dir.is_dir() {
            return Err(Error::NotDir);
        }
        let (_, entry) = self
            .lookup_entry(&dir, name.as_bytes())
            .ok_or(Error::NotFound)?;
        self.free_inode_blocks(entry.ino);
        self.remove_entry(parent, name.as_bytes())?;
        self.free_inode_slot(entry.ino);
        Ok(())
    }

    /// Removes the directory at `path`, which must be empty.
    pub fn rmdir(&mut self, path: &str) -> Result<()> {
        debug!("rmdir {path}");
        self.check_path(path)?;
        let ino = self.resolve(path)?;
        let inode = self.inode(ino);
        if !inode.is_dir() {
            return Err(Error::NotDir);
        }
        if inode.dentries != 0 || inode.size != 0 {
            return Err(Error::NotEmpty);
        }
        self.unlink(path)
    }

    /// Moves `from` to `to`.
    ///
    /// The destination entry ends up pointing at the source inode; an
    /// existing destination file is released first and an existing
    /// destination directory must be empty. Renaming a path to itself
    /// succeeds without changes.
    pub fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        debug!("rename {from} -> {to}");
        self.check_path(from)?;
        self.check_path(to)?;
        if from == to {
            return Ok(());
        }
        let src_ino = self.resolve(from)?;
        let (to_parent_path, to_name) = split_parent(to);
        if to_name.len() > NAME_MAX {
            return Err(Error::NameTooLong);
        }
        let to_parent = self.resolve(to_parent_path)?;
        let to_dir = self.inode(to_parent);
        if !to_dir.is_dir() {
            return Err(Error::NotDir);
        }
        match self.lookup_entry(&to_dir, to_name.as_bytes()) {
            Some((_, entry)) => {
                let dest = self.inode(entry.ino);
                if dest.is_dir() && (dest.dentries != 0 || dest.size != 0) {
                    return Err(Error::NotEmpty);
                }
                self.free_inode_blocks(entry.ino);
                self.free_inode_slot(entry.ino);
                self.repoint_entry(to_parent, to_name.as_bytes(), src_ino)?;
            }
            None => {
                self.insert_entry(to_parent, to_name.as_bytes(), src_ino)?;
            }
        }
        let (from_parent_path, from_name) = split_parent(from);
        let from_parent = self.resolve(from_parent_path)?;
        self.remove_entry(from_parent, from_name.as_bytes())?;
        Ok(())
    }

    /// Sets the modification time of `path`.
    ///
    /// A missing `times` array or a now-sentinel nanosecond field means
    /// "now"; the omit-sentinel leaves the timestamp unchanged. Only the
    /// second array slot (mtime) is honored.
    pub fn utimens(&mut self, path: &str, times: Option<[TimeSpec; 2]>) -> Result<()> {
        self.check_path(path)?;
        let ino = self.resolve(path)?;
        let mut inode = self.inode(ino);
        match times {
            None => inode.set_mtime(TimeSpec::now()),
            Some(times) => {
                let mtime = times[1];
                if mtime.nsec == libc::UTIME_NOW as i64 {
                    inode.set_mtime(TimeSpec::now());
                } else if mtime.nsec != libc::UTIME_OMIT as i64 {
                    inode.set_mtime(mtime);
                }
            }
        }
        self.set_inode(ino, &inode);
        Ok(())
    }

    /// Sets the size of the file at `path`.
    pub fn truncate(&mut self, path: &str, size: u64) -> Result<()> {
        debug!("truncate {path} to {size}");
        self.check_path(path)?;
        let ino = self.resolve(path)?;
        self.truncate_file(ino, size)
    }

    /// Reads from the file at `path` into `buf`, starting at `offset`.
    pub fn read(&self, path: &str, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.check_path(path)?;
        let ino = self.resolve(path)?;
        self.read_file(ino, buf, offset)
    }

    /// Writes `buf` to the file at `path`, starting at `offset`.
    pub fn write(&mut self, path: &str, buf: &[u8], offset: u64) -> Result<usize> {
        self.check_path(path)?;
        let ino = self.resolve(path)?;
        self.write_file(ino, buf, offset)
    }
}
