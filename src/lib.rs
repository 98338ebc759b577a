//! mapfs: an extent-based filesystem kept in a single fixed-size image file.
//!
//! The image is memory-mapped read-write and mutated in place; the host's
//! page cache is responsible for persistence. The library implements the
//! on-disk format and every operation of the callback surface served by
//! `mount.mapfs`; `mkfs.mapfs` formats images and `fsck.mapfs` verifies
//! them.

mod alloc;
mod bitmap;
pub mod check;
mod data;
mod dir;
pub mod error;
mod fs;
pub mod image;
pub mod layout;
mod ops;

pub use error::Error;
pub use fs::Mapfs;
pub use layout::TimeSpec;
pub use ops::{Stat, StatFs};
