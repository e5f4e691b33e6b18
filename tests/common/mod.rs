//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use gralloc::Result;
use gralloc::backend::{IonDevice, ShmUmpDriver};
use rustix::fd::{BorrowedFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// memfd of `size` bytes, standing in for a dma-buf or framebuffer fd.
pub fn memfd(size: usize) -> OwnedFd {
    let fd = rustix::fs::memfd_create("gralloc_test", rustix::fs::MemfdFlags::CLOEXEC).unwrap();
    rustix::fs::ftruncate(&fd, size as u64).unwrap();
    fd
}

/// ION device whose client is a memfd and which counts syncs.
#[derive(Debug, Clone, Default)]
pub struct RecordingIon {
    pub clients: Arc<AtomicUsize>,
    pub syncs: Arc<AtomicUsize>,
}

impl RecordingIon {
    pub fn syncs(&self) -> usize {
        self.syncs.load(Ordering::SeqCst)
    }

    pub fn clients(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }
}

impl IonDevice for RecordingIon {
    fn open_client(&self) -> Result<OwnedFd> {
        self.clients.fetch_add(1, Ordering::SeqCst);
        Ok(memfd(1))
    }

    fn sync_for_device(&self, _client: BorrowedFd<'_>, _share_fd: BorrowedFd<'_>) -> Result<()> {
        self.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// UMP driver with an object prefix private to this test.
pub fn ump_driver(test: &str) -> ShmUmpDriver {
    ShmUmpDriver::with_prefix(format!(
        "/gralloc-{}-{}-",
        test,
        rustix::process::getpid().as_raw_nonzero()
    ))
}
