//! Process-local CPU mappings of shared memory.
//!
//! [`MappedRegion`] owns one `mmap` of a shared file descriptor and unmaps it
//! on drop, so an error path that bails out after mapping never leaks the
//! range.

use crate::error::{Error, Result};
use rustix::fd::{AsFd, BorrowedFd};
use rustix::fs::FileType;
use rustix::mm::{MapFlags, MsyncFlags, ProtFlags};
use std::ptr::NonNull;

/// A read/write `MAP_SHARED` mapping owned by this process.
pub struct MappedRegion {
    /// Start of the mapped range.
    ptr: NonNull<u8>,
    /// Length of the mapped range in bytes.
    len: usize,
}

impl MappedRegion {
    /// Map `len` bytes of `fd` starting at byte `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidDescriptor`] for a zero length or a range
    /// past the end of a regular file, and [`Error::Backend`] with the
    /// kernel's errno if `mmap` fails.
    pub fn map_shared<Fd: AsFd>(fd: Fd, len: usize, offset: u64) -> Result<Self> {
        if len == 0 {
            return Err(Error::InvalidDescriptor(
                "cannot map a zero-length buffer".into(),
            ));
        }
        check_backing(fd.as_fd(), len, offset)?;

        // SAFETY: a fresh mapping at a kernel-chosen address aliases nothing
        // that Rust code already references.
        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::SHARED,
                fd,
                offset,
            )?
        };

        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::InvalidDescriptor("mmap returned null".into()))?;

        Ok(Self { ptr, len })
    }

    /// Start of the mapping.
    #[inline]
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Always false, zero-length mappings are rejected at construction.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Overwrite the whole mapping with zeroes.
    pub fn zero(&self) {
        // SAFETY: ptr is valid for len writable bytes for the life of self.
        unsafe { std::ptr::write_bytes(self.ptr.as_ptr(), 0, self.len) };
    }

    /// `msync` the whole range with the given flags.
    pub fn sync(&self, flags: MsyncFlags) -> Result<()> {
        // SAFETY: the range is exactly the one we mapped.
        unsafe { rustix::mm::msync(self.ptr.as_ptr().cast(), self.len, flags)? };
        Ok(())
    }

    /// Unmap now and report the result, instead of silently on drop.
    pub fn unmap(self) -> Result<()> {
        let this = std::mem::ManuallyDrop::new(self);
        // SAFETY: consuming self, Drop will not run a second munmap.
        unsafe { rustix::mm::munmap(this.ptr.as_ptr().cast(), this.len)? };
        Ok(())
    }
}

/// Reject a range that runs past the end of a memfd or shm object.
///
/// Touching such pages raises SIGBUS. Device nodes and dma-bufs report no
/// usable size and are left to the driver.
fn check_backing(fd: BorrowedFd<'_>, len: usize, offset: u64) -> Result<()> {
    let stat = rustix::fs::fstat(fd)?;
    if FileType::from_raw_mode(stat.st_mode) != FileType::RegularFile {
        return Ok(());
    }

    let backing = u64::try_from(stat.st_size).unwrap_or(0);
    let end = offset.checked_add(len as u64);
    if end.is_none_or(|end| end > backing) {
        return Err(Error::InvalidDescriptor(format!(
            "mapping {len} bytes at offset {offset} exceeds the {backing} byte backing file"
        )));
    }
    Ok(())
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        unsafe {
            let _ = rustix::mm::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

// SAFETY: the mapping is plain shared memory; callers synchronize access to
// the bytes themselves, the handle only carries the address and length.
unsafe impl Send for MappedRegion {}
unsafe impl Sync for MappedRegion {}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}
