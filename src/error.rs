//! Error taxonomy of the callback surface.
//!
//! Every operation either succeeds or fails with one of these conditions;
//! the FUSE host negates the corresponding errno at the callback boundary.
//! Partial modifications are not rolled back on failure and the image stays
//! mounted.

use std::error;
use std::ffi::c_int;
use std::fmt;

/// Result type of the filesystem operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A failed filesystem operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Error {
    /// A path or path component exceeds the limit.
    NameTooLong,
    /// A path component does not exist.
    NotFound,
    /// An intermediate path component is not a directory.
    NotDir,
    /// The target directory is not empty.
    NotEmpty,
    /// The inode table or the data region is exhausted.
    NoSpace,
    /// The readdir emitter rejected an entry.
    NoMemory,
}

impl Error {
    /// The POSIX errno value for this condition.
    pub fn errno(&self) -> c_int {
        match self {
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::NotFound => libc::ENOENT,
            Self::NotDir => libc::ENOTDIR,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::NoSpace => libc::ENOSPC,
            Self::NoMemory => libc::ENOMEM,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NameTooLong => "file name too long",
            Self::NotFound => "no such file or directory",
            Self::NotDir => "not a directory",
            Self::NotEmpty => "directory not empty",
            Self::NoSpace => "no space left on image",
            Self::NoMemory => "cannot buffer directory entry",
        };
        fmt.write_str(s)
    }
}

impl error::Error for Error {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(Error::NameTooLong.errno(), libc::ENAMETOOLONG);
        assert_eq!(Error::NotFound.errno(), libc::ENOENT);
        assert_eq!(Error::NotDir.errno(), libc::ENOTDIR);
        assert_eq!(Error::NotEmpty.errno(), libc::ENOTEMPTY);
        assert_eq!(Error::NoSpace.errno(), libc::ENOSPC);
        assert_eq!(Error::NoMemory.errno(), libc::ENOMEM);
    }
}
