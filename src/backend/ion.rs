//! ION / dma-buf backend.
//!
//! Buffers arrive as dma-buf fds. Mapping is a plain shared `mmap` of the fd;
//! what differs between kernels is how CPU writes are pushed out to devices:
//!
//! - [`LegacyIon`]: `/dev/ion` client plus `ION_IOC_SYNC`.
//! - [`DmaBufIon`]: dma-heap client plus `DMA_BUF_IOCTL_SYNC` on the buffer.

use super::IonDevice;
use crate::config::{DEFAULT_DMA_HEAP_PATH, DEFAULT_ION_PATH};
use crate::error::{Error, Result};
use crate::mapping::MappedRegion;
use rustix::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use rustix::fs::{Mode, OFlags};
use std::path::{Path, PathBuf};

// Raw ioctls, the ION and dma-buf uapi headers have no rustix bindings.

/// ION_IOC_SYNC: _IOWR('I', 7, struct ion_fd_data)
const ION_IOC_SYNC: libc::c_ulong = 0xC008_4907;

/// DMA_BUF_IOCTL_SYNC: _IOW('b', 0, struct dma_buf_sync)
const DMA_BUF_IOCTL_SYNC: libc::c_ulong = 0x4008_6200;

const DMA_BUF_SYNC_READ: u64 = 1 << 0;
const DMA_BUF_SYNC_WRITE: u64 = 1 << 1;
const DMA_BUF_SYNC_END: u64 = 1 << 2;

/// struct ion_fd_data
#[repr(C)]
struct IonFdData {
    handle: libc::c_int,
    fd: libc::c_int,
}

/// struct dma_buf_sync
#[repr(C)]
struct DmaBufSync {
    flags: u64,
}

/// Map `size` bytes of a share fd read/write.
pub fn map_share_fd<Fd: AsFd>(share_fd: Fd, size: usize) -> Result<MappedRegion> {
    MappedRegion::map_shared(share_fd, size, 0)
}

fn open_device_node(path: &Path) -> Result<OwnedFd> {
    Ok(rustix::fs::open(
        path,
        OFlags::RDONLY | OFlags::CLOEXEC,
        Mode::empty(),
    )?)
}

/// Legacy ION device.
#[derive(Debug, Clone)]
pub struct LegacyIon {
    path: PathBuf,
}

impl Default for LegacyIon {
    fn default() -> Self {
        Self::new(DEFAULT_ION_PATH)
    }
}

impl LegacyIon {
    /// ION device at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl IonDevice for LegacyIon {
    fn open_client(&self) -> Result<OwnedFd> {
        open_device_node(&self.path)
    }

    fn sync_for_device(&self, client: BorrowedFd<'_>, share_fd: BorrowedFd<'_>) -> Result<()> {
        let mut data = IonFdData {
            handle: 0,
            fd: share_fd.as_raw_fd(),
        };
        // SAFETY: ION_IOC_SYNC reads and writes one ion_fd_data, which `data`
        // is, and both fds are live for the call.
        let ret = unsafe { libc::ioctl(client.as_raw_fd(), ION_IOC_SYNC as _, &mut data) };
        if ret < 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }
}

/// dma-heap backed buffers, synced through the dma-buf itself.
#[derive(Debug, Clone)]
pub struct DmaBufIon {
    heap: PathBuf,
}

impl Default for DmaBufIon {
    fn default() -> Self {
        Self::new(DEFAULT_DMA_HEAP_PATH)
    }
}

impl DmaBufIon {
    /// Heap device at `heap`, e.g. `/dev/dma_heap/system`.
    pub fn new(heap: impl Into<PathBuf>) -> Self {
        Self { heap: heap.into() }
    }
}

impl IonDevice for DmaBufIon {
    fn open_client(&self) -> Result<OwnedFd> {
        open_device_node(&self.heap)
    }

    fn sync_for_device(&self, _client: BorrowedFd<'_>, share_fd: BorrowedFd<'_>) -> Result<()> {
        let mut sync = DmaBufSync {
            flags: DMA_BUF_SYNC_END | DMA_BUF_SYNC_READ | DMA_BUF_SYNC_WRITE,
        };
        // SAFETY: DMA_BUF_IOCTL_SYNC reads one dma_buf_sync from `sync`.
        let ret = unsafe { libc::ioctl(share_fd.as_raw_fd(), DMA_BUF_IOCTL_SYNC as _, &mut sync) };
        if ret < 0 {
            return Err(Error::last_os_error());
        }
        Ok(())
    }
}
