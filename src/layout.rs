//! On-disk format of a mapfs image.
//!
//! The image is an array of 4096-byte blocks: the superblock at block 0,
//! then the block bitmap, the inode bitmap, the inode table and finally the
//! data region. Data blocks are addressed relative to the start of the data
//! region. All records are `#[repr(C)]` in the native byte order and every
//! field is naturally aligned.

use std::mem::size_of;
use std::time::{SystemTime, UNIX_EPOCH};

/// The unit of space allocation, in bytes.
pub const BLOCK_SIZE: u64 = 4096;
/// Signature identifying a formatted mapfs image.
pub const MAGIC: u64 = u64::from_le_bytes(*b"mapfs.01");
/// The index of the reserved root directory inode.
pub const ROOT_INO: u32 = 0;

/// Number of direct extent slots in an inode.
pub const DIRECT_EXTENTS: u32 = 10;
/// The extent slot describing the indirect run.
pub const INDIRECT_SLOT: usize = 10;
/// Total extent slots stored in an inode record.
pub const EXTENT_SLOTS: usize = 11;

/// Size of the name field of a directory entry, terminator included.
pub const NAME_LEN: usize = 252;
/// Longest representable name, in bytes.
pub const NAME_MAX: usize = NAME_LEN - 1;
/// Longest accepted path, terminator included.
pub const PATH_MAX: usize = 4096;

/// Extent descriptors held by one block of the indirect run.
pub const EXTENTS_PER_BLOCK: u32 = (BLOCK_SIZE / size_of::<Extent>() as u64) as u32;
/// Directory entries held by one data block.
pub const DIRENTS_PER_BLOCK: u64 = BLOCK_SIZE / size_of::<Dirent>() as u64;
/// Bitmap bits held by one block.
pub const BITS_PER_BLOCK: u32 = (BLOCK_SIZE * 8) as u32;

/// Division rounding towards positive infinity.
pub fn ceil_div(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}

/// A run of `count` consecutive data blocks starting at data-region-relative
/// block `start`. `count == 0` marks an unused slot.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Extent {
    /// First data block of the run.
    pub start: u32,
    /// Number of blocks in the run.
    pub count: u32,
}

/// A `CLOCK_REALTIME` timestamp as stored in an inode.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TimeSpec {
    /// Seconds since the Unix epoch.
    pub sec: i64,
    /// Nanosecond remainder.
    pub nsec: i64,
}

impl TimeSpec {
    /// Returns the current time of the real-time clock.
    pub fn now() -> Self {
        let d = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            sec: d.as_secs() as i64,
            nsec: d.subsec_nanos() as i64,
        }
    }
}

/// An on-disk inode record.
///
/// Slots `0..=9` of `extent` are direct extent descriptors; slot 10
/// describes the indirect run, whose blocks hold a packed `Extent` array
/// for logical extent indexes 10 and up.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct Inode {
    /// File type and permission bits.
    pub mode: u32,
    /// Number of hard links.
    pub links: u32,
    /// File size in bytes.
    pub size: u64,
    /// Seconds part of the last modification timestamp.
    pub mtime_sec: i64,
    /// Nanoseconds part of the last modification timestamp.
    pub mtime_nsec: i64,
    /// Number of live extents in the extent map.
    pub extents: u32,
    /// Number of in-use directory entries. Meaningful for directories only.
    pub dentries: u32,
    /// The extent map.
    pub extent: [Extent; EXTENT_SLOTS],
}

impl Inode {
    /// Returns a fresh inode: empty extent map, zero size, one link.
    pub fn new(mode: u32, mtime: TimeSpec) -> Self {
        Self {
            mode,
            links: 1,
            size: 0,
            mtime_sec: mtime.sec,
            mtime_nsec: mtime.nsec,
            extents: 0,
            dentries: 0,
            extent: [Extent::default(); EXTENT_SLOTS],
        }
    }

    /// An all-zero record, written back when an inode is destroyed.
    pub fn zeroed() -> Self {
        Self {
            mode: 0,
            links: 0,
            size: 0,
            mtime_sec: 0,
            mtime_nsec: 0,
            extents: 0,
            dentries: 0,
            extent: [Extent::default(); EXTENT_SLOTS],
        }
    }

    /// Tells whether the inode is a directory.
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    /// Returns the last modification timestamp.
    pub fn mtime(&self) -> TimeSpec {
        TimeSpec {
            sec: self.mtime_sec,
            nsec: self.mtime_nsec,
        }
    }

    /// Sets the last modification timestamp.
    pub fn set_mtime(&mut self, t: TimeSpec) {
        self.mtime_sec = t.sec;
        self.mtime_nsec = t.nsec;
    }
}

/// A fixed-size directory entry: inode number plus null-terminated name.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Dirent {
    /// Inode number of the entry.
    pub ino: u32,
    /// Null-terminated name.
    pub name: [u8; NAME_LEN],
}

impl Dirent {
    /// Builds an entry for `name`, which must fit `NAME_MAX` bytes.
    pub fn new(ino: u32, name: &[u8]) -> Self {
        let mut d = Self::zeroed();
        d.ino = ino;
        d.name[..name.len()].copy_from_slice(name);
        d
    }

    /// An all-zero (free) entry slot.
    pub fn zeroed() -> Self {
        Self {
            ino: 0,
            name: [0; NAME_LEN],
        }
    }

    /// Tells whether this slot is free.
    pub fn is_free(&self) -> bool {
        self.ino == 0 && self.name[0] == 0
    }

    /// Returns the name bytes up to the terminator.
    pub fn name_bytes(&self) -> &[u8] {
        let end = self
            .name
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(NAME_LEN);
        &self.name[..end]
    }
}

/// The superblock, stored at block 0.
///
/// Written by the formatter; only the two free counts change afterwards.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct Superblock {
    /// Must match `MAGIC`.
    pub magic: u64,
    /// Image size in bytes.
    pub size: u64,
    /// Total number of inodes.
    pub inodes_count: u32,
    /// Total number of data blocks.
    pub blocks_count: u32,
    /// Number of free inodes.
    pub free_inodes_count: u32,
    /// Number of free data blocks.
    pub free_blocks_count: u32,
    /// First block of the block bitmap.
    pub block_bitmap: u32,
    /// First block of the inode bitmap.
    pub inode_bitmap: u32,
    /// First block of the inode table.
    pub inode_table: u32,
    /// First block of the data region.
    pub data_region: u32,
    /// Number of blocks spanned by the block bitmap.
    pub block_bitmap_span: u32,
    /// Number of blocks spanned by the inode bitmap.
    pub inode_bitmap_span: u32,
}

impl Superblock {
    /// Computes the layout for an image of `size` bytes holding
    /// `inodes_count` inodes.
    ///
    /// Returns `None` when the image cannot fit the superblock, both
    /// bitmaps, the inode table and at least one data block.
    pub fn new(size: u64, inodes_count: u32) -> Option<Self> {
        if inodes_count == 0 || size % BLOCK_SIZE != 0 {
            return None;
        }
        let total_blocks = size / BLOCK_SIZE;
        let table_span = ceil_div(inodes_count as u64 * size_of::<Inode>() as u64, BLOCK_SIZE);
        let inode_bitmap_span = ceil_div(inodes_count as u64, BITS_PER_BLOCK as u64);

        // The block bitmap's span depends on the data block count, which in
        // turn depends on the span. One block covers 32768 data blocks, so
        // growing the span only ever shrinks the data region: iterate until
        // the guess stops moving.
        let mut block_bitmap_span = 1;
        let blocks_count = loop {
            let meta = 1 + block_bitmap_span + inode_bitmap_span + table_span;
            if total_blocks < meta + 1 {
                return None;
            }
            let data = total_blocks - meta;
            let need = ceil_div(data, BITS_PER_BLOCK as u64);
            if need <= block_bitmap_span {
                break data;
            }
            block_bitmap_span = need;
        };

        let block_bitmap = 1;
        let inode_bitmap = block_bitmap + block_bitmap_span as u32;
        let inode_table = inode_bitmap + inode_bitmap_span as u32;
        let data_region = inode_table + table_span as u32;
        Some(Self {
            magic: MAGIC,
            size,
            inodes_count,
            blocks_count: blocks_count as u32,
            free_inodes_count: inodes_count,
            free_blocks_count: blocks_count as u32,
            block_bitmap,
            inode_bitmap,
            inode_table,
            data_region,
            block_bitmap_span: block_bitmap_span as u32,
            inode_bitmap_span: inode_bitmap_span as u32,
        })
    }

    /// Tells whether the superblock describes a plausible image of
    /// `image_size` bytes.
    pub fn is_valid(&self, image_size: u64) -> bool {
        let total_blocks = image_size / BLOCK_SIZE;
        self.magic == MAGIC
            && self.size == image_size
            && self.block_bitmap == 1
            && self.inode_bitmap == self.block_bitmap + self.block_bitmap_span
            && self.inode_table == self.inode_bitmap + self.inode_bitmap_span
            && self.data_region as u64 + self.blocks_count as u64 <= total_blocks
            && self.inode_table as u64 * BLOCK_SIZE
                + self.inodes_count as u64 * size_of::<Inode>() as u64
                <= self.data_region as u64 * BLOCK_SIZE
            && self.free_inodes_count <= self.inodes_count
            && self.free_blocks_count <= self.blocks_count
    }

    /// Byte offset of the block bitmap.
    pub fn block_bitmap_offset(&self) -> u64 {
        self.block_bitmap as u64 * BLOCK_SIZE
    }

    /// Byte length of the block bitmap region.
    pub fn block_bitmap_len(&self) -> u64 {
        self.block_bitmap_span as u64 * BLOCK_SIZE
    }

    /// Byte offset of the inode bitmap.
    pub fn inode_bitmap_offset(&self) -> u64 {
        self.inode_bitmap as u64 * BLOCK_SIZE
    }

    /// Byte length of the inode bitmap region.
    pub fn inode_bitmap_len(&self) -> u64 {
        self.inode_bitmap_span as u64 * BLOCK_SIZE
    }

    /// Byte offset of inode record `ino`.
    pub fn inode_offset(&self, ino: u32) -> u64 {
        self.inode_table as u64 * BLOCK_SIZE + ino as u64 * size_of::<Inode>() as u64
    }

    /// Byte offset of data-region-relative block `blk`.
    pub fn data_block_offset(&self, blk: u32) -> u64 {
        (self.data_region as u64 + blk as u64) * BLOCK_SIZE
    }
}

// A block must fit an integral number of inode records and directory
// entries, and the superblock must fit in block 0.
const _: () = assert!(BLOCK_SIZE as usize % size_of::<Inode>() == 0);
const _: () = assert!(size_of::<Dirent>() == 256);
const _: () = assert!(size_of::<Extent>() == 8);
const _: () = assert!(size_of::<Superblock>() as u64 <= BLOCK_SIZE);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn record_sizes() {
        assert_eq!(size_of::<Inode>(), 128);
        assert_eq!(size_of::<Dirent>(), 256);
        assert_eq!(size_of::<Extent>(), 8);
        assert_eq!(EXTENTS_PER_BLOCK, 512);
        assert_eq!(DIRENTS_PER_BLOCK, 16);
    }

    #[test]
    fn layout_64k() {
        // 16 blocks: superblock, one block per bitmap, one inode-table
        // block for 32 inodes, 12 data blocks.
        let sb = Superblock::new(64 * 1024, 32).unwrap();
        assert_eq!(sb.block_bitmap, 1);
        assert_eq!(sb.inode_bitmap, 2);
        assert_eq!(sb.inode_table, 3);
        assert_eq!(sb.data_region, 4);
        assert_eq!(sb.blocks_count, 12);
        assert_eq!(sb.free_blocks_count, 12);
        assert!(sb.is_valid(64 * 1024));
    }

    #[test]
    fn layout_too_small() {
        // Superblock + 2 bitmap blocks + inode table leave no data block.
        assert!(Superblock::new(4 * BLOCK_SIZE, 32).is_none());
        assert!(Superblock::new(64 * 1024 + 1, 32).is_none());
        assert!(Superblock::new(64 * 1024, 0).is_none());
    }

    #[test]
    fn layout_large_image() {
        // 512 MiB needs four block-bitmap blocks.
        let size = 512 * 1024 * 1024;
        let sb = Superblock::new(size, 1024).unwrap();
        assert_eq!(sb.block_bitmap_span, 4);
        assert_eq!(sb.inode_bitmap_span, 1);
        assert!(sb.blocks_count <= BITS_PER_BLOCK * sb.block_bitmap_span);
        assert!(sb.is_valid(size));
    }

    #[test]
    fn dirent_names() {
        let d = Dirent::new(7, b"hello");
        assert_eq!(d.name_bytes(), b"hello");
        assert!(!d.is_free());
        assert!(Dirent::zeroed().is_free());
    }
}
