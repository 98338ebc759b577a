//! Block and inode slot accounting.
//!
//! Allocation is first-fit from index 0 in both bitmaps. A data block is
//! zeroed at the moment its bitmap bit flips to one, so sparse holes and
//! fresh directory blocks read back as zeros. Existing extents are never
//! reordered or coalesced.

use crate::error::{Error, Result};
use crate::fs::Mapfs;
use crate::layout::{Extent, Inode, BLOCK_SIZE, DIRECT_EXTENTS, EXTENTS_PER_BLOCK, INDIRECT_SLOT};

impl Mapfs {
    /// Marks data block `blk` allocated, zeroing its contents.
    pub(crate) fn claim_block(&mut self, blk: u32) {
        let mut sb = self.superblock();
        self.set_block_bit(blk, true);
        self.image_mut().zero(sb.data_block_offset(blk), BLOCK_SIZE);
        sb.free_blocks_count -= 1;
        self.set_superblock(&sb);
    }

    /// Returns data block `blk` to the free pool.
    pub(crate) fn release_block(&mut self, blk: u32) {
        let mut sb = self.superblock();
        self.set_block_bit(blk, false);
        sb.free_blocks_count += 1;
        self.set_superblock(&sb);
    }

    /// Installs `inode` at slot `ino` and marks the slot allocated.
    pub(crate) fn claim_inode_slot(&mut self, ino: u32, inode: &Inode) {
        let mut sb = self.superblock();
        self.set_inode_bit(ino, true);
        sb.free_inodes_count -= 1;
        self.set_superblock(&sb);
        self.set_inode(ino, inode);
    }

    /// Clears inode slot `ino`: bitmap bit, free count and the record
    /// itself. The inode's blocks must already have been released.
    pub(crate) fn free_inode_slot(&mut self, ino: u32) {
        let mut sb = self.superblock();
        self.set_inode_bit(ino, false);
        sb.free_inodes_count += 1;
        self.set_superblock(&sb);
        self.set_inode(ino, &Inode::zeroed());
    }

    /// Releases every data block of `ino`'s extent map, then the indirect
    /// run itself.
    pub(crate) fn free_inode_blocks(&mut self, ino: u32) {
        let inode = self.inode(ino);
        for (_, ext) in self.live_extents(&inode) {
            for b in 0..ext.count {
                self.release_block(ext.start + b);
            }
        }
        let run = inode.extent[INDIRECT_SLOT];
        for b in 0..run.count {
            self.release_block(run.start + b);
        }
    }

    /// Appends one data block to `ino`'s extent map.
    ///
    /// Returns the logical slot index of the extent that grew or was
    /// created. The tail extent is extended in place when the bitmap bit
    /// right after it is free; otherwise a new single-block extent starts
    /// at the first free block, in the first unused inline slot or, once
    /// those are taken, in the indirect run (materialized on first use).
    pub(crate) fn append_new_block(&mut self, ino: u32) -> Result<u32> {
        let sb = self.superblock();
        let mut inode = self.inode(ino);

        // Exhaustion check up front; the winning bit is located again at
        // the point it is claimed.
        if self.find_free_block().is_none() {
            return Err(Error::NoSpace);
        }

        if let Some(&(slot, tail)) = self.live_extents(&inode).last() {
            let next = tail.start + tail.count;
            if next < sb.blocks_count && !self.block_bit(next) {
                self.claim_block(next);
                let grown = Extent {
                    start: tail.start,
                    count: tail.count + 1,
                };
                self.set_slot_extent(&mut inode, slot, grown);
                self.set_inode(ino, &inode);
                return Ok(slot);
            }
        }

        if let Some(i) = (0..DIRECT_EXTENTS as usize).find(|i| inode.extent[*i].count == 0) {
            let blk = self.find_free_block().ok_or(Error::NoSpace)?;
            self.claim_block(blk);
            inode.extent[i] = Extent { start: blk, count: 1 };
            inode.extents += 1;
            self.set_inode(ino, &inode);
            return Ok(i as u32);
        }

        // All ten inline slots live: the new extent goes through the
        // indirect run. Materializing the run consumes a block of its own.
        if inode.extent[INDIRECT_SLOT].count == 0 {
            let blk = self.find_free_block().ok_or(Error::NoSpace)?;
            self.claim_block(blk);
            inode.extent[INDIRECT_SLOT] = Extent { start: blk, count: 1 };
            self.set_inode(ino, &inode);
        }

        let limit = self.slot_limit(&inode);
        let mut slot = DIRECT_EXTENTS;
        while slot < limit {
            if self.slot_extent(&inode, slot).count == 0 {
                let blk = self.find_free_block().ok_or(Error::NoSpace)?;
                self.claim_block(blk);
                self.set_slot_extent(&mut inode, slot, Extent { start: blk, count: 1 });
                inode.extents += 1;
                self.set_inode(ino, &inode);
                return Ok(slot);
            }
            slot += 1;
        }

        // Every descriptor of the run is in use; grow the run itself by
        // one block when its neighbour bit is free.
        let run = inode.extent[INDIRECT_SLOT];
        let next = run.start + run.count;
        if next < sb.blocks_count && !self.block_bit(next) {
            self.claim_block(next);
            inode.extent[INDIRECT_SLOT] = Extent {
                start: run.start,
                count: run.count + 1,
            };
            self.set_inode(ino, &inode);
            let blk = self.find_free_block().ok_or(Error::NoSpace)?;
            self.claim_block(blk);
            let slot = DIRECT_EXTENTS + run.count * EXTENTS_PER_BLOCK;
            self.set_slot_extent(&mut inode, slot, Extent { start: blk, count: 1 });
            inode.extents += 1;
            self.set_inode(ino, &inode);
            return Ok(slot);
        }
        Err(Error::NoSpace)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fs::test::temp_fs;
    use crate::layout::TimeSpec;

    fn new_file(fs: &mut Mapfs, ino: u32) {
        fs.claim_inode_slot(ino, &Inode::new(libc::S_IFREG | 0o644, TimeSpec::now()));
    }

    #[test]
    fn appends_extend_tail() {
        let (_dir, mut fs) = temp_fs(16, 32);
        new_file(&mut fs, 1);
        assert_eq!(fs.append_new_block(1), Ok(0));
        assert_eq!(fs.append_new_block(1), Ok(0));
        assert_eq!(fs.append_new_block(1), Ok(0));
        let inode = fs.inode(1);
        assert_eq!(inode.extents, 1);
        assert_eq!(inode.extent[0], Extent { start: 0, count: 3 });
        assert_eq!(
            fs.superblock().free_blocks_count,
            fs.superblock().blocks_count - 3
        );
    }

    #[test]
    fn blocked_tail_starts_new_extent() {
        let (_dir, mut fs) = temp_fs(16, 32);
        new_file(&mut fs, 1);
        new_file(&mut fs, 2);
        assert_eq!(fs.append_new_block(1), Ok(0));
        // The neighbour bit now belongs to the other file, so the next
        // append for inode 1 must open a second extent.
        assert_eq!(fs.append_new_block(2), Ok(0));
        assert_eq!(fs.append_new_block(1), Ok(1));
        let inode = fs.inode(1);
        assert_eq!(inode.extents, 2);
        assert_eq!(inode.extent[0], Extent { start: 0, count: 1 });
        assert_eq!(inode.extent[1], Extent { start: 2, count: 1 });
    }

    #[test]
    fn allocated_blocks_are_zeroed() {
        let (_dir, mut fs) = temp_fs(16, 32);
        new_file(&mut fs, 1);
        fs.append_new_block(1).unwrap();
        let off = fs.superblock().data_block_offset(0);
        fs.image_mut().bytes_mut(off, 16).fill(0xaa);
        fs.free_inode_blocks(1);

        // The stale bytes must vanish when the block is claimed again.
        new_file(&mut fs, 2);
        fs.append_new_block(2).unwrap();
        assert!(fs.image().bytes(off, 16).iter().all(|b| *b == 0));
    }

    #[test]
    fn exhaustion_reports_no_space() {
        let (_dir, mut fs) = temp_fs(16, 32);
        new_file(&mut fs, 1);
        let total = fs.superblock().blocks_count;
        for _ in 0..total {
            fs.append_new_block(1).unwrap();
        }
        assert_eq!(fs.append_new_block(1), Err(Error::NoSpace));
        assert_eq!(fs.superblock().free_blocks_count, 0);
    }

    #[test]
    fn fragmentation_reaches_indirect_run() {
        // Interleave appends between two files so no tail can ever grow:
        // eleven extents for the first file pushes it past the ten inline
        // slots and materializes the indirect run.
        let (_dir, mut fs) = temp_fs(64, 32);
        new_file(&mut fs, 1);
        new_file(&mut fs, 2);
        let mut slots = Vec::new();
        for _ in 0..11 {
            slots.push(fs.append_new_block(1).unwrap());
            fs.append_new_block(2).unwrap();
        }
        assert_eq!(slots[9], 9);
        assert_eq!(slots[10], 10);
        let inode = fs.inode(1);
        assert_eq!(inode.extents, 11);
        assert!(inode.extent[INDIRECT_SLOT].count > 0);
        assert_eq!(fs.live_extents(&inode).len(), 11);

        // Eleven data blocks and one run block per file; both files ran
        // out of inline slots.
        let used = 2 * (11 + 1);
        assert_eq!(
            fs.superblock().free_blocks_count,
            fs.superblock().blocks_count - used
        );

        fs.free_inode_blocks(1);
        fs.free_inode_slot(1);
        assert_eq!(
            fs.superblock().free_blocks_count,
            fs.superblock().blocks_count - 12
        );
    }

    #[test]
    fn inode_slots_recycle() {
        let (_dir, mut fs) = temp_fs(16, 4);
        let free0 = fs.superblock().free_inodes_count;
        let ino = fs.find_free_inode().unwrap();
        assert_eq!(ino, 1);
        new_file(&mut fs, ino);
        assert_eq!(fs.superblock().free_inodes_count, free0 - 1);
        fs.free_inode_slot(ino);
        assert_eq!(fs.superblock().free_inodes_count, free0);
        assert_eq!(fs.find_free_inode(), Some(1));
    }
}
