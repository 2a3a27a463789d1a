//! Sparse-file primitives
//!
//! Deallocating a range keeps the logical file size unchanged; the filesystem
//! frees the backing extents and reads of the range return zeros. There is no
//! fallback when the filesystem refuses: callers that need zeros without hole
//! support must write them explicitly (preallocation mode).

use std::fs::File;

use anyhow::Result;

use crate::error::SyncError;

/// Deallocate `length` bytes at `offset` in `file`, preserving the file size.
#[cfg(target_os = "linux")]
pub fn punch_hole(file: &File, offset: u64, length: u64) -> Result<()> {
    use std::os::fd::AsRawFd;

    let ret = unsafe {
        libc::fallocate(
            file.as_raw_fd(),
            libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
            offset as libc::off_t,
            length as libc::off_t,
        )
    };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EOPNOTSUPP) {
            return Err(SyncError::HolePunchUnsupported.into());
        }
        return Err(err.into());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn punch_hole(_file: &File, _offset: u64, _length: u64) -> Result<()> {
    Err(SyncError::HolePunchUnsupported.into())
}
