//! Memory-sharing backends.
//!
//! Two kernel mechanisms can back a buffer:
//!
//! - [`UmpDriver`]: buffers named by a global secure id. Import hands back a
//!   CPU-mapped handle directly, there is no separate map step.
//! - [`IonDevice`]: buffers passed as a dma-buf fd. The fd is mapped with
//!   [`ion::map_share_fd`] after a process-wide client handle is open.
//!
//! A descriptor only ever uses one of them; the registry matches on its
//! [`BackendPayload`](crate::descriptor::BackendPayload) to pick.

pub mod ion;
pub mod ump;

pub use ion::{DmaBufIon, LegacyIon};
pub use ump::{ShmUmpDriver, UmpExport};

use crate::error::Result;
use crate::mapping::MappedRegion;
use rustix::fd::{BorrowedFd, OwnedFd};
use std::fmt;
use std::ptr::NonNull;

/// Global id of a UMP buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SecureId(pub u32);

impl SecureId {
    /// The "no id" value drivers return on failure.
    pub const INVALID: SecureId = SecureId(u32::MAX);

    /// False for [`SecureId::INVALID`].
    #[inline]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Display for SecureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Cache maintenance operations on a UMP mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsyncOp {
    /// Write dirty CPU cache lines back to memory.
    Clean,
    /// Write back, then drop the CPU cache lines.
    CleanAndInvalidate,
    /// Drop CPU cache lines without writing back.
    Invalidate,
}

/// An imported UMP buffer with its CPU mapping.
///
/// Dropping the handle unmaps the memory; drivers that keep a kernel-side
/// reference release it in [`UmpDriver::release`].
#[derive(Debug)]
pub struct UmpHandle {
    secure_id: SecureId,
    region: MappedRegion,
}

impl UmpHandle {
    /// Wrap a mapping a driver produced for `secure_id`.
    pub fn new(secure_id: SecureId, region: MappedRegion) -> Self {
        Self { secure_id, region }
    }

    /// Id the handle was imported from.
    #[inline]
    pub fn secure_id(&self) -> SecureId {
        self.secure_id
    }

    /// CPU address of the buffer.
    #[inline]
    pub fn as_ptr(&self) -> NonNull<u8> {
        self.region.as_ptr()
    }

    /// Mapped length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.region.len()
    }

    /// Always false, see [`MappedRegion::is_empty`].
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.region.is_empty()
    }

    /// The underlying mapping.
    #[inline]
    pub fn region(&self) -> &MappedRegion {
        &self.region
    }

    /// Give up the handle, returning the mapping.
    pub fn into_region(self) -> MappedRegion {
        self.region
    }
}

/// Backend-A: secure-id based sharing.
pub trait UmpDriver: Send + Sync + fmt::Debug {
    /// Open the driver session. Called once per context before the first
    /// import.
    fn open(&self) -> Result<()> {
        Ok(())
    }

    /// Import `secure_id` and map at least `size` bytes of it.
    fn import(&self, secure_id: SecureId, size: usize) -> Result<UmpHandle>;

    /// Cache maintenance over the whole handle.
    fn msync(&self, handle: &UmpHandle, op: MsyncOp) -> Result<()>;

    /// Unmap and drop the backend reference.
    fn release(&self, handle: UmpHandle) -> Result<()> {
        handle.into_region().unmap()
    }
}

/// Backend-B: fd based sharing.
pub trait IonDevice: Send + Sync + fmt::Debug {
    /// Open the process-wide client handle.
    fn open_client(&self) -> Result<OwnedFd>;

    /// Make CPU writes to `share_fd` visible to devices.
    fn sync_for_device(&self, client: BorrowedFd<'_>, share_fd: BorrowedFd<'_>) -> Result<()>;
}
