//! UMP backend over POSIX shared memory.
//!
//! Secure ids are resolved to shared-memory objects named
//! `<prefix><id as 8 hex digits>`. A producer publishes memory with
//! [`ShmUmpDriver::export`]; any process using the same prefix can import it
//! by id, and the import call returns the CPU mapping directly.

use super::{MsyncOp, SecureId, UmpDriver, UmpHandle};
use crate::config::DEFAULT_UMP_SHM_PREFIX;
use crate::error::{Error, Result};
use crate::mapping::MappedRegion;
use rustix::fd::OwnedFd;
use rustix::fs::Mode;
use rustix::io::Errno;
use rustix::mm::MsyncFlags;
use std::sync::atomic::{AtomicU32, Ordering};

/// Counter mixed into generated secure ids.
static EXPORT_COUNTER: AtomicU32 = AtomicU32::new(1);

/// Attempts before [`ShmUmpDriver::export`] gives up on id collisions.
const EXPORT_ATTEMPTS: usize = 64;

/// UMP driver that names buffers through POSIX shared memory.
#[derive(Debug, Clone)]
pub struct ShmUmpDriver {
    prefix: String,
}

impl Default for ShmUmpDriver {
    fn default() -> Self {
        Self::with_prefix(DEFAULT_UMP_SHM_PREFIX)
    }
}

impl ShmUmpDriver {
    /// Driver using the default object prefix.
    pub fn new() -> Self {
        Self::default()
    }

    /// Driver using `prefix` for object names. It must start with `/`.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Shared-memory object name for `id`.
    pub fn object_name(&self, id: SecureId) -> String {
        format!("{}{:08x}", self.prefix, id.0)
    }

    /// Create a `size`-byte buffer and publish it under a fresh secure id.
    ///
    /// The id stays importable until the returned [`UmpExport`] is dropped.
    pub fn export(&self, size: usize) -> Result<UmpExport> {
        if size == 0 {
            return Err(Error::InvalidDescriptor("cannot export an empty buffer".into()));
        }

        let seed = (rustix::process::getpid().as_raw_nonzero().get() as u32)
            .wrapping_mul(0x9E37_79B9);

        for _ in 0..EXPORT_ATTEMPTS {
            let id = SecureId(seed ^ EXPORT_COUNTER.fetch_add(1, Ordering::Relaxed));
            if !id.is_valid() {
                continue;
            }

            let name = self.object_name(id);
            let fd = match rustix::shm::open(
                name.as_str(),
                rustix::shm::OFlags::CREATE | rustix::shm::OFlags::EXCL | rustix::shm::OFlags::RDWR,
                Mode::RUSR | Mode::WUSR,
            ) {
                Ok(fd) => fd,
                Err(Errno::EXIST) => continue,
                Err(e) => return Err(e.into()),
            };

            let export = UmpExport {
                secure_id: id,
                name,
                fd,
            };
            rustix::fs::ftruncate(&export.fd, size as u64)?;

            tracing::debug!(secure_id = %id, size, "exported UMP buffer");
            return Ok(export);
        }

        Err(Error::Backend(Errno::EXIST))
    }
}

impl UmpDriver for ShmUmpDriver {
    fn import(&self, secure_id: SecureId, size: usize) -> Result<UmpHandle> {
        if !secure_id.is_valid() {
            return Err(Error::InvalidDescriptor("invalid UMP secure id".into()));
        }

        let fd = rustix::shm::open(
            self.object_name(secure_id).as_str(),
            rustix::shm::OFlags::RDWR,
            Mode::empty(),
        )?;

        let backing = rustix::fs::fstat(&fd)?.st_size;
        if backing < 0 || (backing as u64) < size as u64 {
            return Err(Error::InvalidDescriptor(format!(
                "secure id {secure_id} backs {backing} bytes, descriptor claims {size}"
            )));
        }

        // The mapping keeps the object alive, the fd is not needed past here.
        let region = MappedRegion::map_shared(&fd, size, 0)?;
        Ok(UmpHandle::new(secure_id, region))
    }

    fn msync(&self, handle: &UmpHandle, op: MsyncOp) -> Result<()> {
        let flags = match op {
            MsyncOp::Clean => MsyncFlags::SYNC,
            MsyncOp::CleanAndInvalidate => MsyncFlags::SYNC | MsyncFlags::INVALIDATE,
            MsyncOp::Invalidate => MsyncFlags::INVALIDATE,
        };
        handle.region().sync(flags)
    }
}

/// A published UMP buffer. Unpublishes the id on drop.
#[derive(Debug)]
pub struct UmpExport {
    secure_id: SecureId,
    name: String,
    fd: OwnedFd,
}

impl UmpExport {
    /// Id importers use.
    #[inline]
    pub fn secure_id(&self) -> SecureId {
        self.secure_id
    }

    /// Producer-side fd of the buffer.
    #[inline]
    pub fn fd(&self) -> &OwnedFd {
        &self.fd
    }
}

impl Drop for UmpExport {
    fn drop(&mut self) {
        let _ = rustix::shm::unlink(self.name.as_str());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver() -> ShmUmpDriver {
        ShmUmpDriver::with_prefix(format!(
            "/gralloc-ump-unit-{}-",
            rustix::process::getpid().as_raw_nonzero()
        ))
    }

    #[test]
    fn test_export_import_share_memory() {
        let driver = driver();
        let export = driver.export(8192).unwrap();

        let a = driver.import(export.secure_id(), 8192).unwrap();
        let b = driver.import(export.secure_id(), 8192).unwrap();
        assert_eq!(a.secure_id(), export.secure_id());
        assert_eq!(a.len(), 8192);

        unsafe { *a.as_ptr().as_ptr().add(17) = 5 };
        assert_eq!(unsafe { *b.as_ptr().as_ptr().add(17) }, 5);

        driver.msync(&a, MsyncOp::CleanAndInvalidate).unwrap();
        driver.release(a).unwrap();
        driver.release(b).unwrap();
    }

    #[test]
    fn test_import_unknown_id_fails() {
        let driver = driver();
        let err = driver.import(SecureId(0x7eed_0001), 4096).unwrap_err();
        assert!(matches!(err, Error::Backend(Errno::NOENT)));
    }

    #[test]
    fn test_import_larger_than_backing_fails() {
        let driver = driver();
        let export = driver.export(4096).unwrap();
        assert!(matches!(
            driver.import(export.secure_id(), 8192),
            Err(Error::InvalidDescriptor(_))
        ));
    }

    #[test]
    fn test_dropping_export_unpublishes() {
        let driver = driver();
        let export = driver.export(4096).unwrap();
        let id = export.secure_id();
        drop(export);
        assert!(driver.import(id, 4096).is_err());
    }

    #[test]
    fn test_invalid_id_rejected() {
        assert!(driver().import(SecureId::INVALID, 4096).is_err());
    }
}
