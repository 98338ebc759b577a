//! Read-write memory mapping of an image file.
//!
//! The mapping is the single shared mutable resource of the filesystem: it
//! is acquired once when the image is opened and released when the `Image`
//! is dropped, on every exit path. `sync` flushes it for the optional
//! durability barrier at unmount.
//!
//! Records are copied in and out of the mapping with unaligned reads and
//! writes through checked slices; callers obtain offsets from the region
//! map in `layout`, which the superblock validation bounds to the mapping.

use crate::layout::BLOCK_SIZE;
use memmap2::MmapMut;
use std::fs::OpenOptions;
use std::io;
use std::mem::size_of;
use std::path::Path;
use std::ptr;

/// An image file mapped into memory.
pub struct Image {
    map: MmapMut,
}

impl Image {
    /// Opens and maps the image file at `path` read-write.
    ///
    /// The file size must be a non-zero multiple of the block size.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len == 0 || len % BLOCK_SIZE != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("image size {len} is not a multiple of {BLOCK_SIZE} bytes"),
            ));
        }
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self { map })
    }

    /// Size of the image in bytes.
    pub fn len(&self) -> u64 {
        self.map.len() as u64
    }

    /// Tells whether the image is empty. Never true for an open image.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Flushes the mapping to the backing file.
    pub fn sync(&self) -> io::Result<()> {
        self.map.flush()
    }

    /// Returns `len` bytes starting at `off`.
    pub fn bytes(&self, off: u64, len: u64) -> &[u8] {
        &self.map[off as usize..(off + len) as usize]
    }

    /// Returns `len` mutable bytes starting at `off`.
    pub fn bytes_mut(&mut self, off: u64, len: u64) -> &mut [u8] {
        &mut self.map[off as usize..(off + len) as usize]
    }

    /// Zeroes `len` bytes starting at `off`.
    pub fn zero(&mut self, off: u64, len: u64) {
        self.bytes_mut(off, len).fill(0);
    }

    /// Copies the record at `off` out of the mapping.
    pub fn read_at<T: Copy>(&self, off: u64) -> T {
        let bytes = self.bytes(off, size_of::<T>() as u64);
        unsafe { ptr::read_unaligned(bytes.as_ptr() as *const T) }
    }

    /// Copies `value` into the mapping at `off`.
    pub fn write_at<T: Copy>(&mut self, off: u64, value: &T) {
        let bytes = self.bytes_mut(off, size_of::<T>() as u64);
        unsafe { ptr::write_unaligned(bytes.as_mut_ptr() as *mut T, *value) };
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs::File;

    fn temp_image(blocks: u64) -> (tempfile::TempDir, Image) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img");
        let file = File::create(&path).unwrap();
        file.set_len(blocks * BLOCK_SIZE).unwrap();
        let image = Image::open(&path).unwrap();
        (dir, image)
    }

    #[test]
    fn roundtrip_records() {
        let (_dir, mut image) = temp_image(2);
        image.write_at(100, &0xdead_beef_u32);
        assert_eq!(image.read_at::<u32>(100), 0xdead_beef);
        image.zero(100, 4);
        assert_eq!(image.read_at::<u32>(100), 0);
    }

    #[test]
    fn rejects_unaligned_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("img");
        let file = File::create(&path).unwrap();
        file.set_len(BLOCK_SIZE + 1).unwrap();
        assert!(Image::open(&path).is_err());
    }
}
