//! File data input/output over the extent map.
//!
//! Reads and writes address bytes in extent order: intra-extent block `k`
//! of an extent starts at image byte
//! `(data_region + extent.start + k) * 4096`. Copies are block-granular but
//! byte-exact at the offset and size boundaries. Bytes between the file
//! size and its allocated capacity are always zero: blocks are zeroed when
//! claimed and shrinking truncates zero what they abandon.

use crate::error::Result;
use crate::fs::Mapfs;
use crate::layout::{TimeSpec, BLOCK_SIZE};
use std::cmp::min;

impl Mapfs {
    /// Reads up to `buf.len()` bytes of file `ino` starting at `offset`.
    ///
    /// Returns the number of file-derived bytes; the remainder of `buf` is
    /// zero-filled. An offset at or past the end of file reads zero bytes.
    pub(crate) fn read_file(&self, ino: u32, buf: &mut [u8], offset: u64) -> Result<usize> {
        let sb = self.superblock();
        let inode = self.inode(ino);
        let want = if offset < inode.size {
            min(buf.len() as u64, inode.size - offset) as usize
        } else {
            0
        };

        let mut copied = 0;
        let mut file_off = 0u64;
        'blocks: for (_, ext) in self.live_extents(&inode) {
            for b in 0..ext.count {
                if copied == want {
                    break 'blocks;
                }
                let block_end = file_off + BLOCK_SIZE;
                if offset < block_end {
                    let skip = offset.saturating_sub(file_off);
                    let n = min(BLOCK_SIZE - skip, (want - copied) as u64);
                    let src = self
                        .image()
                        .bytes(sb.data_block_offset(ext.start + b) + skip, n);
                    buf[copied..copied + n as usize].copy_from_slice(src);
                    copied += n as usize;
                }
                file_off = block_end;
            }
        }
        buf[copied..].fill(0);
        Ok(copied)
    }

    /// Writes `buf` to file `ino` at `offset`, extending the extent map as
    /// needed.
    ///
    /// Freshly claimed blocks are zero, so a write beyond the end of file
    /// leaves a hole that reads back as zeros. The size becomes the larger
    /// of the old size and the end of the written range.
    pub(crate) fn write_file(&mut self, ino: u32, buf: &[u8], offset: u64) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let end = offset + buf.len() as u64;
        let mut capacity = self.capacity(&self.inode(ino));
        while capacity < end {
            self.append_new_block(ino)?;
            capacity += BLOCK_SIZE;
        }

        let sb = self.superblock();
        let mut inode = self.inode(ino);
        let mut copied = 0;
        let mut file_off = 0u64;
        'blocks: for (_, ext) in self.live_extents(&inode) {
            for b in 0..ext.count {
                if copied == buf.len() {
                    break 'blocks;
                }
                let block_end = file_off + BLOCK_SIZE;
                if offset < block_end {
                    let skip = offset.saturating_sub(file_off);
                    let n = min(BLOCK_SIZE - skip, (buf.len() - copied) as u64) as usize;
                    let dst = self
                        .image_mut()
                        .bytes_mut(sb.data_block_offset(ext.start + b) + skip, n as u64);
                    dst.copy_from_slice(&buf[copied..copied + n]);
                    copied += n;
                }
                file_off = block_end;
            }
        }

        if copied > 0 {
            inode.size = inode.size.max(offset + copied as u64);
            inode.set_mtime(TimeSpec::now());
            self.set_inode(ino, &inode);
        }
        Ok(copied)
    }

    /// Sets the size of file `ino` to `size`.
    ///
    /// Growing appends zeroed blocks until the capacity covers the new
    /// size; shrinking zeroes the abandoned bytes and keeps the blocks
    /// allocated. Truncating to the current size changes nothing.
    pub(crate) fn truncate_file(&mut self, ino: u32, size: u64) -> Result<()> {
        let mut inode = self.inode(ino);
        if size == inode.size {
            return Ok(());
        }
        if size > inode.size {
            let mut capacity = self.capacity(&inode);
            while capacity < size {
                self.append_new_block(ino)?;
                capacity += BLOCK_SIZE;
            }
            inode = self.inode(ino);
        } else {
            self.zero_range(&inode, size, inode.size);
        }
        inode.size = size;
        inode.set_mtime(TimeSpec::now());
        self.set_inode(ino, &inode);
        Ok(())
    }

    /// Zeroes file bytes `[from, to)` of `inode`.
    fn zero_range(&mut self, inode: &crate::layout::Inode, from: u64, to: u64) {
        let sb = self.superblock();
        let mut file_off = 0u64;
        for (_, ext) in self.live_extents(inode) {
            for b in 0..ext.count {
                let block_end = file_off + BLOCK_SIZE;
                if from < block_end && file_off < to {
                    let begin = from.saturating_sub(file_off);
                    let end = min(to - file_off, BLOCK_SIZE);
                    if begin < end {
                        let off = sb.data_block_offset(ext.start + b) + begin;
                        self.image_mut().zero(off, end - begin);
                    }
                }
                file_off = block_end;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use crate::fs::test::temp_fs;
    use crate::layout::{Inode, TimeSpec, BLOCK_SIZE};
    use crate::Error;

    fn new_file(fs: &mut crate::Mapfs, ino: u32) {
        fs.claim_inode_slot(ino, &Inode::new(libc::S_IFREG | 0o644, TimeSpec::now()));
    }

    #[test]
    fn write_then_read_back() {
        let (_dir, mut fs) = temp_fs(16, 32);
        new_file(&mut fs, 1);
        assert_eq!(fs.write_file(1, b"hello", 0), Ok(5));
        assert_eq!(fs.inode(1).size, 5);

        let mut buf = [0xffu8; 5];
        assert_eq!(fs.read_file(1, &mut buf, 0), Ok(5));
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn overwrite_keeps_size() {
        let (_dir, mut fs) = temp_fs(16, 32);
        new_file(&mut fs, 1);
        fs.write_file(1, b"hello", 0).unwrap();
        assert_eq!(fs.write_file(1, b"!", 4), Ok(1));
        assert_eq!(fs.inode(1).size, 5);

        let mut buf = [0u8; 5];
        fs.read_file(1, &mut buf, 0).unwrap();
        assert_eq!(&buf, b"hell!");
    }

    #[test]
    fn read_past_eof_is_empty() {
        let (_dir, mut fs) = temp_fs(16, 32);
        new_file(&mut fs, 1);
        fs.write_file(1, b"hi", 0).unwrap();
        let mut buf = [0xffu8; 4];
        assert_eq!(fs.read_file(1, &mut buf, 2), Ok(0));
        assert_eq!(fs.read_file(1, &mut buf, 100), Ok(0));
    }

    #[test]
    fn short_read_zero_fills() {
        let (_dir, mut fs) = temp_fs(16, 32);
        new_file(&mut fs, 1);
        fs.write_file(1, b"abcd", 0).unwrap();
        let mut buf = [0xffu8; 8];
        assert_eq!(fs.read_file(1, &mut buf, 2), Ok(2));
        assert_eq!(&buf, b"cd\0\0\0\0\0\0");
    }

    #[test]
    fn write_beyond_eof_leaves_zero_hole() {
        let (_dir, mut fs) = temp_fs(16, 32);
        new_file(&mut fs, 1);
        fs.write_file(1, b"x", 0).unwrap();
        assert_eq!(fs.write_file(1, b"tail", BLOCK_SIZE + 10), Ok(4));
        assert_eq!(fs.inode(1).size, BLOCK_SIZE + 14);

        let mut buf = vec![0xffu8; 20];
        assert_eq!(fs.read_file(1, &mut buf, 1), Ok(20));
        assert!(buf.iter().all(|b| *b == 0));
        let mut buf = [0u8; 4];
        fs.read_file(1, &mut buf, BLOCK_SIZE + 10).unwrap();
        assert_eq!(&buf, b"tail");
    }

    #[test]
    fn write_spanning_blocks() {
        let (_dir, mut fs) = temp_fs(16, 32);
        new_file(&mut fs, 1);
        let data: Vec<u8> = (0..3 * BLOCK_SIZE as usize).map(|i| i as u8).collect();
        assert_eq!(fs.write_file(1, &data, 7), Ok(data.len()));
        let mut back = vec![0u8; data.len()];
        assert_eq!(fs.read_file(1, &mut back, 7), Ok(data.len()));
        assert_eq!(back, data);
    }

    #[test]
    fn write_without_space_fails() {
        let (_dir, mut fs) = temp_fs(16, 32);
        new_file(&mut fs, 1);
        let blocks = fs.superblock().blocks_count as u64;
        let huge = vec![7u8; (blocks as usize + 1) * BLOCK_SIZE as usize];
        assert_eq!(fs.write_file(1, &huge, 0), Err(Error::NoSpace));
    }

    #[test]
    fn truncate_grow_and_shrink() {
        let (_dir, mut fs) = temp_fs(16, 32);
        new_file(&mut fs, 1);
        fs.write_file(1, b"hello", 0).unwrap();

        fs.truncate_file(1, BLOCK_SIZE).unwrap();
        assert_eq!(fs.inode(1).size, BLOCK_SIZE);
        let mut buf = [0xffu8; 10];
        assert_eq!(fs.read_file(1, &mut buf, BLOCK_SIZE - 6), Ok(6));
        assert!(buf.iter().all(|b| *b == 0));

        fs.truncate_file(1, 2).unwrap();
        let mut buf = [0xffu8; 10];
        assert_eq!(fs.read_file(1, &mut buf, 0), Ok(2));
        assert_eq!(&buf[..2], b"he");

        // The shrink zeroed the tail, so growing again exposes zeros.
        fs.truncate_file(1, 8).unwrap();
        let mut buf = [0xffu8; 8];
        assert_eq!(fs.read_file(1, &mut buf, 0), Ok(8));
        assert_eq!(&buf, b"he\0\0\0\0\0\0");
    }

    #[test]
    fn truncate_same_size_is_noop() {
        let (_dir, mut fs) = temp_fs(16, 32);
        new_file(&mut fs, 1);
        fs.write_file(1, b"hello", 0).unwrap();
        let before = fs.inode(1);
        fs.truncate_file(1, 5).unwrap();
        let after = fs.inode(1);
        assert_eq!(before.size, after.size);
        assert_eq!(before.mtime(), after.mtime());
        assert_eq!(
            fs.superblock().free_blocks_count,
            fs.superblock().blocks_count - 1
        );
    }

    #[test]
    fn truncate_without_space_fails() {
        let (_dir, mut fs) = temp_fs(16, 32);
        new_file(&mut fs, 1);
        let blocks = fs.superblock().blocks_count as u64;
        assert_eq!(
            fs.truncate_file(1, (blocks + 1) * BLOCK_SIZE),
            Err(Error::NoSpace)
        );
    }
}
