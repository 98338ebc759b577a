//! The mounted filesystem handle.
//!
//! `Mapfs` owns the image mapping. Records (superblock, inodes, directory
//! entries, indirect extent descriptors) are copied out of the mapping,
//! modified, and written back; nothing holds references into the image
//! across operations.

use crate::bitmap;
use crate::image::Image;
use crate::layout::{
    Dirent, Extent, Inode, Superblock, TimeSpec, BLOCK_SIZE, DIRECT_EXTENTS, EXTENTS_PER_BLOCK,
    INDIRECT_SLOT, MAGIC, ROOT_INO,
};
use std::io;
use std::mem::size_of;
use std::path::Path;

/// A mounted mapfs image.
pub struct Mapfs {
    image: Image,
}

impl Mapfs {
    /// Opens the formatted image at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        Self::from_image(Image::open(path)?)
    }

    /// Wraps an already-mapped image, validating its superblock.
    pub fn from_image(image: Image) -> io::Result<Self> {
        let sb: Superblock = image.read_at(0);
        if sb.magic != MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "image does not contain a mapfs filesystem",
            ));
        }
        if !sb.is_valid(image.len()) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "corrupt superblock layout",
            ));
        }
        Ok(Self { image })
    }

    /// Formats `image` and returns the mounted filesystem.
    ///
    /// Writes the superblock, zeroes both bitmaps and the inode table, and
    /// installs the root inode as an empty directory with the current
    /// mtime. Fails when the image is too small for the requested number
    /// of inodes.
    pub fn format(mut image: Image, inodes_count: u32) -> io::Result<Self> {
        let mut sb = Superblock::new(image.len(), inodes_count).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "image too small for the requested layout",
            )
        })?;

        image.zero(sb.block_bitmap_offset(), sb.block_bitmap_len());
        image.zero(sb.inode_bitmap_offset(), sb.inode_bitmap_len());
        image.zero(
            sb.inode_table as u64 * BLOCK_SIZE,
            (sb.data_region - sb.inode_table) as u64 * BLOCK_SIZE,
        );

        // The root directory starts empty and permanently occupies inode 0.
        let mut root = Inode::new(libc::S_IFDIR | 0o777, TimeSpec::now());
        root.links = 2;
        image.write_at(sb.inode_offset(ROOT_INO), &root);
        let bits = image.bytes_mut(sb.inode_bitmap_offset(), sb.inode_bitmap_len());
        bitmap::set(bits, ROOT_INO, true);
        sb.free_inodes_count -= 1;
        image.write_at(0, &sb);
        Ok(Self { image })
    }

    /// Flushes the mapping to the backing file.
    pub fn sync(&self) -> io::Result<()> {
        self.image.sync()
    }

    pub(crate) fn image(&self) -> &Image {
        &self.image
    }

    pub(crate) fn image_mut(&mut self) -> &mut Image {
        &mut self.image
    }

    /// Returns a copy of the superblock.
    pub fn superblock(&self) -> Superblock {
        self.image.read_at(0)
    }

    pub(crate) fn set_superblock(&mut self, sb: &Superblock) {
        self.image.write_at(0, sb);
    }

    /// Returns a copy of inode record `ino`.
    pub(crate) fn inode(&self, ino: u32) -> Inode {
        self.image.read_at(self.superblock().inode_offset(ino))
    }

    pub(crate) fn set_inode(&mut self, ino: u32, inode: &Inode) {
        let off = self.superblock().inode_offset(ino);
        self.image.write_at(off, inode);
    }

    // Bitmap access. The slices span whole blocks; scans are bounded by the
    // logical counts from the superblock.

    pub(crate) fn block_bit(&self, i: u32) -> bool {
        let sb = self.superblock();
        bitmap::get(
            self.image.bytes(sb.block_bitmap_offset(), sb.block_bitmap_len()),
            i,
        )
    }

    pub(crate) fn set_block_bit(&mut self, i: u32, value: bool) {
        let sb = self.superblock();
        let bits = self
            .image
            .bytes_mut(sb.block_bitmap_offset(), sb.block_bitmap_len());
        bitmap::set(bits, i, value);
    }

    pub(crate) fn inode_bit(&self, i: u32) -> bool {
        let sb = self.superblock();
        bitmap::get(
            self.image.bytes(sb.inode_bitmap_offset(), sb.inode_bitmap_len()),
            i,
        )
    }

    pub(crate) fn set_inode_bit(&mut self, i: u32, value: bool) {
        let sb = self.superblock();
        let bits = self
            .image
            .bytes_mut(sb.inode_bitmap_offset(), sb.inode_bitmap_len());
        bitmap::set(bits, i, value);
    }

    pub(crate) fn find_free_block(&self) -> Option<u32> {
        let sb = self.superblock();
        bitmap::find_free(
            self.image.bytes(sb.block_bitmap_offset(), sb.block_bitmap_len()),
            sb.blocks_count,
        )
    }

    pub(crate) fn find_free_inode(&self) -> Option<u32> {
        let sb = self.superblock();
        bitmap::find_free(
            self.image.bytes(sb.inode_bitmap_offset(), sb.inode_bitmap_len()),
            sb.inodes_count,
        )
    }

    // Extent map access. Logical slot indexes 0..=9 address the inline
    // array; slot index 10 + k addresses descriptor k of the indirect run.
    // Only this layer knows about the split.

    fn indirect_desc_offset(&self, inode: &Inode, k: u32) -> u64 {
        let run = inode.extent[INDIRECT_SLOT];
        self.superblock().data_block_offset(run.start) + k as u64 * size_of::<Extent>() as u64
    }

    pub(crate) fn slot_extent(&self, inode: &Inode, slot: u32) -> Extent {
        if slot < DIRECT_EXTENTS {
            inode.extent[slot as usize]
        } else {
            self.image
                .read_at(self.indirect_desc_offset(inode, slot - DIRECT_EXTENTS))
        }
    }

    /// Writes back the extent at logical slot `slot`. The caller writes the
    /// inode record itself when an inline slot changed.
    pub(crate) fn set_slot_extent(&mut self, inode: &mut Inode, slot: u32, ext: Extent) {
        if slot < DIRECT_EXTENTS {
            inode.extent[slot as usize] = ext;
        } else {
            let off = self.indirect_desc_offset(inode, slot - DIRECT_EXTENTS);
            self.image.write_at(off, &ext);
        }
    }

    /// Highest addressable logical slot index, given the indirect run.
    pub(crate) fn slot_limit(&self, inode: &Inode) -> u32 {
        DIRECT_EXTENTS + inode.extent[INDIRECT_SLOT].count * EXTENTS_PER_BLOCK
    }

    /// The live extents of `inode` in logical order, with their slot
    /// indexes. Unused inline slots are skipped; the walk stops once the
    /// recorded live count has been produced.
    pub(crate) fn live_extents(&self, inode: &Inode) -> Vec<(u32, Extent)> {
        let mut out = Vec::with_capacity(inode.extents as usize);
        let limit = self.slot_limit(inode);
        let mut slot = 0;
        while (out.len() as u32) < inode.extents && slot < limit {
            let ext = self.slot_extent(inode, slot);
            if ext.count > 0 {
                out.push((slot, ext));
            }
            slot += 1;
        }
        out
    }

    /// Total bytes of data blocks allocated to `inode`.
    pub(crate) fn capacity(&self, inode: &Inode) -> u64 {
        self.live_extents(inode)
            .iter()
            .map(|(_, e)| e.count as u64 * BLOCK_SIZE)
            .sum()
    }

    /// Byte offsets of every directory-entry slot of `inode`, in file
    /// order.
    pub(crate) fn dirent_offsets(&self, inode: &Inode) -> Vec<u64> {
        let sb = self.superblock();
        let mut out = Vec::new();
        for (_, ext) in self.live_extents(inode) {
            for b in 0..ext.count {
                let block = sb.data_block_offset(ext.start + b);
                for k in 0..crate::layout::DIRENTS_PER_BLOCK {
                    out.push(block + k * size_of::<Dirent>() as u64);
                }
            }
        }
        out
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use std::fs::File;

    pub(crate) fn temp_fs(blocks: u64, inodes: u32) -> (tempfile::TempDir, Mapfs) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img");
        let file = File::create(&path).unwrap();
        file.set_len(blocks * BLOCK_SIZE).unwrap();
        let fs = Mapfs::format(Image::open(&path).unwrap(), inodes).unwrap();
        (dir, fs)
    }

    #[test]
    fn format_installs_root() {
        let (_dir, fs) = temp_fs(16, 32);
        let sb = fs.superblock();
        assert_eq!(sb.free_inodes_count, 31);
        assert_eq!(sb.free_blocks_count, sb.blocks_count);
        let root = fs.inode(ROOT_INO);
        assert!(root.is_dir());
        assert_eq!(root.size, 0);
        assert_eq!(root.extents, 0);
        assert!(fs.inode_bit(ROOT_INO));
        assert!(!fs.inode_bit(1));
    }

    #[test]
    fn open_rejects_blank_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img");
        let file = File::create(&path).unwrap();
        file.set_len(16 * BLOCK_SIZE).unwrap();
        assert!(Mapfs::open(&path).is_err());
    }

    #[test]
    fn format_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img");
        let file = File::create(&path).unwrap();
        file.set_len(16 * BLOCK_SIZE).unwrap();
        {
            let fs = Mapfs::format(Image::open(&path).unwrap(), 32).unwrap();
            fs.sync().unwrap();
        }
        let fs = Mapfs::open(&path).unwrap();
        assert_eq!(fs.superblock().inodes_count, 32);
        assert_eq!(fs.superblock().free_inodes_count, 31);
    }

    #[test]
    fn live_extents_skip_inline_holes() {
        let (_dir, mut fs) = temp_fs(16, 32);
        let mut inode = Inode::new(libc::S_IFREG | 0o644, TimeSpec::now());
        inode.extent[0] = Extent { start: 0, count: 2 };
        inode.extent[3] = Extent { start: 5, count: 1 };
        inode.extents = 2;
        fs.set_inode(1, &inode);

        let live = fs.live_extents(&fs.inode(1));
        assert_eq!(live, vec![(0, Extent { start: 0, count: 2 }), (3, Extent { start: 5, count: 1 })]);
        assert_eq!(fs.capacity(&inode), 3 * BLOCK_SIZE);
    }
}
