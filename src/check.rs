//! Image invariant checker shared by `fsck.mapfs` and the test-suite.
//!
//! The checker walks the whole image read-only and reports every violation
//! of the structural invariants: bitmap/extent agreement, free-count
//! accounting, directory-entry counts and the permanence of the root
//! directory.

use crate::bitmap;
use crate::fs::Mapfs;
use crate::layout::{Dirent, INDIRECT_SLOT, ROOT_INO};
use std::mem::size_of;

/// Walks `fs` and returns one message per violated invariant. An empty
/// result means the image is clean.
pub fn check_image(fs: &Mapfs) -> Vec<String> {
    let sb = fs.superblock();
    let mut findings = Vec::new();

    if !fs.inode_bit(ROOT_INO) {
        findings.push("root inode is not allocated".to_owned());
    } else if !fs.inode(ROOT_INO).is_dir() {
        findings.push("root inode is not a directory".to_owned());
    }

    // Ownership map of the data region: which inode claims each block.
    let mut owner: Vec<Option<u32>> = vec![None; sb.blocks_count as usize];
    let mut claim = |findings: &mut Vec<String>, ino: u32, blk: u32| {
        if blk >= sb.blocks_count {
            findings.push(format!("inode {ino}: extent references block {blk} out of range"));
            return;
        }
        if !fs.block_bit(blk) {
            findings.push(format!("inode {ino}: block {blk} is not marked allocated"));
        }
        match owner[blk as usize] {
            Some(other) => {
                findings.push(format!("block {blk} owned by inodes {other} and {ino}"))
            }
            None => owner[blk as usize] = Some(ino),
        }
    };

    for ino in 0..sb.inodes_count {
        if !fs.inode_bit(ino) {
            continue;
        }
        let inode = fs.inode(ino);
        let kind = inode.mode & libc::S_IFMT;
        if kind != libc::S_IFDIR && kind != libc::S_IFREG {
            findings.push(format!("inode {ino}: unknown mode {:o}", inode.mode));
            continue;
        }

        let live = fs.live_extents(&inode);
        if live.len() as u32 != inode.extents {
            findings.push(format!(
                "inode {ino}: extent map yields {} of {} recorded extents",
                live.len(),
                inode.extents
            ));
        }
        for (_, ext) in &live {
            for b in 0..ext.count {
                claim(&mut findings, ino, ext.start + b);
            }
        }
        let run = inode.extent[INDIRECT_SLOT];
        for b in 0..run.count {
            claim(&mut findings, ino, run.start + b);
        }

        if inode.is_dir() {
            let mut used = 0u32;
            for off in fs.dirent_offsets(&inode) {
                let entry: Dirent = fs.image().read_at(off);
                if entry.is_free() {
                    continue;
                }
                used += 1;
                if entry.ino >= sb.inodes_count {
                    findings.push(format!(
                        "directory {ino}: entry {:?} references inode {} out of range",
                        String::from_utf8_lossy(entry.name_bytes()),
                        entry.ino
                    ));
                } else if !fs.inode_bit(entry.ino) {
                    findings.push(format!(
                        "directory {ino}: entry {:?} references free inode {}",
                        String::from_utf8_lossy(entry.name_bytes()),
                        entry.ino
                    ));
                }
            }
            if used != inode.dentries {
                findings.push(format!(
                    "directory {ino}: {used} live entries but dentry count {}",
                    inode.dentries
                ));
            }
            if inode.size != inode.dentries as u64 * size_of::<Dirent>() as u64 {
                findings.push(format!(
                    "directory {ino}: size {} does not match {} entries",
                    inode.size, inode.dentries
                ));
            }
        }
    }

    let image = fs.image();
    let set_blocks = bitmap::count_set(
        image.bytes(sb.block_bitmap_offset(), sb.block_bitmap_len()),
        sb.blocks_count,
    );
    if sb.free_blocks_count != sb.blocks_count - set_blocks {
        findings.push(format!(
            "free block count {} but bitmap has {} of {} set",
            sb.free_blocks_count, set_blocks, sb.blocks_count
        ));
    }
    let set_inodes = bitmap::count_set(
        image.bytes(sb.inode_bitmap_offset(), sb.inode_bitmap_len()),
        sb.inodes_count,
    );
    if sb.free_inodes_count != sb.inodes_count - set_inodes {
        findings.push(format!(
            "free inode count {} but bitmap has {} of {} set",
            sb.free_inodes_count, set_inodes, sb.inodes_count
        ));
    }

    findings
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fs::test::temp_fs;

    #[test]
    fn fresh_image_is_clean() {
        let (_dir, fs) = temp_fs(16, 32);
        assert!(check_image(&fs).is_empty());
    }

    #[test]
    fn busy_image_is_clean() {
        let (_dir, mut fs) = temp_fs(64, 32);
        fs.mkdir("/d", 0o755).unwrap();
        for i in 0..8 {
            let p = format!("/d/f{i}");
            fs.create(&p, libc::S_IFREG | 0o644).unwrap();
            fs.write(&p, &vec![i as u8; 5000], 0).unwrap();
        }
        fs.unlink("/d/f3").unwrap();
        fs.rename("/d/f4", "/g").unwrap();
        fs.truncate("/g", 100).unwrap();
        assert!(check_image(&fs).is_empty());
    }

    #[test]
    fn detects_free_count_drift() {
        let (_dir, mut fs) = temp_fs(16, 32);
        let mut sb = fs.superblock();
        sb.free_blocks_count -= 1;
        fs.set_superblock(&sb);
        assert!(!check_image(&fs).is_empty());
    }

    #[test]
    fn detects_lost_bitmap_bit() {
        let (_dir, mut fs) = temp_fs(16, 32);
        fs.create("/f", libc::S_IFREG | 0o644).unwrap();
        fs.write("/f", b"data", 0).unwrap();
        // Corrupt: drop the bitmap bit under the file's only block.
        let inode = fs.inode(fs.resolve("/f").unwrap());
        let blk = inode.extent[0].start;
        fs.set_block_bit(blk, false);
        let findings = check_image(&fs);
        assert!(findings.iter().any(|f| f.contains("not marked allocated")));
    }

    #[test]
    fn detects_dentry_drift() {
        let (_dir, mut fs) = temp_fs(16, 32);
        fs.create("/f", libc::S_IFREG | 0o644).unwrap();
        let mut root = fs.inode(crate::layout::ROOT_INO);
        root.dentries = 5;
        fs.set_inode(crate::layout::ROOT_INO, &root);
        assert!(!check_image(&fs).is_empty());
    }
}
