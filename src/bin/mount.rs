//! The `mount.mapfs` tool serves a mapfs image over FUSE.
//!
//! The kernel talks in inode numbers while the filesystem's callback
//! surface takes absolute paths, so the host keeps a table from the inode
//! numbers it has handed out to the paths they were resolved from. mapfs
//! inode `i` is exposed to the kernel as `i + 1` (FUSE reserves 1 for the
//! root directory, mapfs reserves 0).

use clap::Parser;
use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use log::{debug, warn};
use mapfs::{Mapfs, Stat, TimeSpec};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::process::exit;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Validity window the kernel may cache attributes for.
const TTL: Duration = Duration::from_secs(1);

/// Command line arguments.
#[derive(Parser)]
#[command(name = "mount.mapfs", about = "Mount a mapfs image over FUSE")]
struct Args {
    /// Sync the image mapping to disk on unmount.
    #[arg(short, long)]
    sync: bool,
    /// Allow other users to access the mount.
    #[arg(long)]
    allow_other: bool,
    /// Path to the image file.
    image: PathBuf,
    /// Directory to mount the filesystem on.
    mountpoint: PathBuf,
}

/// FUSE dispatch bridged onto the path-based callback surface.
struct Host {
    fs: Mapfs,
    /// Paths behind the inode numbers handed to the kernel.
    paths: HashMap<u64, String>,
    sync_on_unmount: bool,
    uid: u32,
    gid: u32,
}

impl Host {
    fn new(fs: Mapfs, sync_on_unmount: bool) -> Self {
        let paths = HashMap::from([(fuser::FUSE_ROOT_ID, "/".to_owned())]);
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        Self {
            fs,
            paths,
            sync_on_unmount,
            uid,
            gid,
        }
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        self.paths.get(&ino).cloned()
    }

    /// Joins a parent inode and an entry name into an absolute path.
    fn child_path(&self, parent: u64, name: &OsStr) -> Option<String> {
        let parent = self.paths.get(&parent)?;
        let name = name.to_str()?;
        if parent == "/" {
            Some(format!("/{name}"))
        } else {
            Some(format!("{parent}/{name}"))
        }
    }

    fn attr(&self, stat: &Stat) -> FileAttr {
        let kind = if stat.mode & libc::S_IFMT == libc::S_IFDIR {
            FileType::Directory
        } else {
            FileType::RegularFile
        };
        FileAttr {
            ino: stat.ino as u64 + 1,
            size: stat.size,
            blocks: stat.blocks,
            atime: system_time(stat.mtime),
            mtime: system_time(stat.mtime),
            ctime: system_time(stat.mtime),
            crtime: UNIX_EPOCH,
            kind,
            perm: (stat.mode & 0o7777) as u16,
            nlink: stat.links,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: mapfs::layout::BLOCK_SIZE as u32,
            flags: 0,
        }
    }

    /// Records the path a fresh attribute was resolved from and builds the
    /// entry reply parameters.
    fn remember(&mut self, path: String, stat: &Stat) -> FileAttr {
        let attr = self.attr(stat);
        self.paths.insert(attr.ino, path);
        attr
    }

    /// Drops table entries referring to a path that no longer exists.
    fn forget_path(&mut self, path: &str) {
        self.paths.retain(|_, p| p != path);
    }

    /// Rewrites table entries after a rename, including everything below a
    /// moved directory.
    fn move_paths(&mut self, from: &str, to: &str) {
        let prefix = format!("{from}/");
        for p in self.paths.values_mut() {
            if p == from {
                *p = to.to_owned();
            } else if let Some(rest) = p.strip_prefix(&prefix) {
                *p = format!("{to}/{rest}");
            }
        }
    }
}

fn system_time(t: TimeSpec) -> SystemTime {
    UNIX_EPOCH + Duration::new(t.sec.max(0) as u64, t.nsec.max(0) as u32)
}

fn timespec(t: SystemTime) -> TimeSpec {
    let d = t.duration_since(UNIX_EPOCH).unwrap_or_default();
    TimeSpec {
        sec: d.as_secs() as i64,
        nsec: d.subsec_nanos() as i64,
    }
}

impl Filesystem for Host {
    fn destroy(&mut self) {
        if self.sync_on_unmount {
            if let Err(e) = self.fs.sync() {
                warn!("sync on unmount failed: {e}");
            }
        }
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.getattr(&path) {
            Ok(stat) => {
                let attr = self.remember(path, &stat);
                reply.entry(&TTL, &attr, 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.getattr(&path) {
            Ok(stat) => reply.attr(&TTL, &self.attr(&stat)),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        if let Some(size) = size {
            if let Err(e) = self.fs.truncate(&path, size) {
                reply.error(e.errno());
                return;
            }
        }
        if let Some(mtime) = mtime {
            let omit = TimeSpec {
                sec: 0,
                nsec: libc::UTIME_OMIT as i64,
            };
            let mtime = match mtime {
                TimeOrNow::SpecificTime(t) => timespec(t),
                TimeOrNow::Now => TimeSpec {
                    sec: 0,
                    nsec: libc::UTIME_NOW as i64,
                },
            };
            if let Err(e) = self.fs.utimens(&path, Some([omit, mtime])) {
                reply.error(e.errno());
                return;
            }
        }
        match self.fs.getattr(&path) {
            Ok(stat) => reply.attr(&TTL, &self.attr(&stat)),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };

        let parent_ino = if path == "/" {
            fuser::FUSE_ROOT_ID
        } else {
            let (parent, _) = path.rsplit_once('/').unwrap_or(("", ""));
            let parent = if parent.is_empty() { "/" } else { parent };
            match self.fs.getattr(parent) {
                Ok(stat) => stat.ino as u64 + 1,
                Err(_) => fuser::FUSE_ROOT_ID,
            }
        };

        let mut entries: Vec<(u64, FileType, Vec<u8>)> = vec![
            (ino, FileType::Directory, b".".to_vec()),
            (parent_ino, FileType::Directory, b"..".to_vec()),
        ];
        let listing = self.fs.readdir(&path, |name, child| {
            entries.push((child as u64 + 1, FileType::RegularFile, name.to_vec()));
            false
        });
        if let Err(e) = listing {
            reply.error(e.errno());
            return;
        }
        // The callback surface reports names and inode numbers; fetch each
        // entry's type through its path.
        for entry in entries.iter_mut().skip(2) {
            let name = OsStr::from_bytes(&entry.2);
            if let Some(child_path) = self.child_path(ino, name) {
                if let Ok(stat) = self.fs.getattr(&child_path) {
                    if stat.mode & libc::S_IFMT == libc::S_IFDIR {
                        entry.1 = FileType::Directory;
                    }
                }
            }
        }

        for (i, (child, kind, name)) in
            entries.iter().enumerate().skip(offset.max(0) as usize)
        {
            debug!("readdir {path}: {:?}", OsStr::from_bytes(name));
            if reply.add(*child, (i + 1) as i64, *kind, OsStr::from_bytes(name)) {
                break;
            }
        }
        reply.ok();
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        if let Err(e) = self.fs.mkdir(&path, mode) {
            reply.error(e.errno());
            return;
        }
        match self.fs.getattr(&path) {
            Ok(stat) => {
                let attr = self.remember(path, &stat);
                reply.entry(&TTL, &attr, 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        let mode = if mode & libc::S_IFMT == 0 {
            mode | libc::S_IFREG
        } else {
            mode
        };
        if let Err(e) = self.fs.create(&path, mode) {
            reply.error(e.errno());
            return;
        }
        match self.fs.getattr(&path) {
            Ok(stat) => {
                let attr = self.remember(path, &stat);
                reply.created(&TTL, &attr, 0, 0, 0);
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.unlink(&path) {
            Ok(()) => {
                self.forget_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.rmdir(&path) {
            Ok(()) => {
                self.forget_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(from), Some(to)) = (
            self.child_path(parent, name),
            self.child_path(newparent, newname),
        ) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.rename(&from, &to) {
            Ok(()) => {
                // A replaced destination inode is gone; then the source
                // subtree moves over.
                self.forget_path(&to);
                self.move_paths(&from, &to);
                reply.ok();
            }
            Err(e) => reply.error(e.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        let mut buf = vec![0u8; size as usize];
        match self.fs.read(&path, &mut buf, offset.max(0) as u64) {
            Ok(n) => reply.data(&buf[..n]),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.fs.write(&path, data, offset.max(0) as u64) {
            Ok(n) => reply.written(n as u32),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.fs.sync() {
            Ok(()) => reply.ok(),
            Err(_) => reply.error(libc::EIO),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let st = self.fs.statfs();
        reply.statfs(
            st.blocks,
            st.blocks_free,
            st.blocks_free,
            st.inodes,
            st.inodes_free,
            st.block_size,
            st.name_max,
            st.block_size,
        );
    }
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let fs = Mapfs::open(&args.image).unwrap_or_else(|e| {
        eprintln!("mount.mapfs: {}: {e}", args.image.display());
        exit(1);
    });

    let mut options = vec![
        MountOption::FSName("mapfs".to_owned()),
        MountOption::DefaultPermissions,
    ];
    if args.allow_other {
        options.push(MountOption::AllowOther);
    }

    let host = Host::new(fs, args.sync);
    if let Err(e) = fuser::mount2(host, &args.mountpoint, &options) {
        eprintln!("mount.mapfs: {}: {e}", args.mountpoint.display());
        exit(1);
    }
}
