//! Framebuffer singleton mapping.
//!
//! The framebuffer of a display output is mapped once per context and shared
//! by every descriptor that references that output. The mapping covers the
//! whole allocation, which is divided into fixed-size frame slots tracked by
//! a bitmask.

use crate::backend::SecureId;
use crate::config::{ContextConfig, MAX_FRAME_SLOTS};
use crate::descriptor::{BackendPayload, BufferDescriptor};
use crate::error::{Error, Result};
use crate::mapping::MappedRegion;
use crate::usage::Usage;
use rustix::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::fmt;
use std::ptr::NonNull;

/// IOCTL_GET_FB_UMP_SECURE_ID: _IOWR('m', 0xF8, __u32)
const IOCTL_GET_FB_UMP_SECURE_ID: libc::c_ulong = 0xC004_6DF8;

/// A display output with its own framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DisplayOutput {
    /// Built-in panel.
    Primary,
    /// HDMI or other external display.
    External,
}

impl DisplayOutput {
    /// Output a buffer with `usage` belongs to.
    #[inline]
    pub fn for_usage(usage: Usage) -> Self {
        if usage.targets_external_display() {
            DisplayOutput::External
        } else {
            DisplayOutput::Primary
        }
    }
}

impl fmt::Display for DisplayOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisplayOutput::Primary => f.write_str("primary"),
            DisplayOutput::External => f.write_str("external"),
        }
    }
}

/// Ask the framebuffer driver which UMP secure id backs `fd`.
///
/// Drivers without the query (and non-framebuffer fds) yield `None`.
pub fn query_secure_id(fd: BorrowedFd<'_>) -> Option<SecureId> {
    let mut id: u32 = SecureId::INVALID.0;
    // SAFETY: the ioctl writes one u32 through the pointer.
    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), IOCTL_GET_FB_UMP_SECURE_ID as _, &mut id) };
    let id = SecureId(id);
    (ret >= 0 && id.is_valid()).then_some(id)
}

/// One frame slot handed out by [`FramebufferMapper::acquire_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSlot {
    /// Slot index, bit position in the allocation mask.
    pub index: usize,
    /// Byte offset of the frame in the framebuffer.
    pub offset: usize,
    /// CPU address of the frame.
    pub ptr: NonNull<u8>,
}

/// Snapshot of a mapped framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramebufferInfo {
    /// CPU address of the whole framebuffer.
    pub base: NonNull<u8>,
    /// Total mapped bytes.
    pub size: usize,
    /// Bytes per frame.
    pub frame_size: usize,
    /// Frames that fit in the allocation.
    pub num_buffers: usize,
    /// Allocated frame slots.
    pub buffer_mask: u32,
    /// Secure id reported by the driver, if any.
    pub secure_id: Option<SecureId>,
}

#[derive(Debug)]
struct SharedFramebuffer {
    /// Our own duplicate of the display device's fd.
    fd: OwnedFd,
    region: MappedRegion,
    secure_id: Option<SecureId>,
    generation: u64,
}

/// The framebuffer mapping of one display output.
#[derive(Debug)]
pub struct FramebufferMapper {
    output: DisplayOutput,
    shared: Option<SharedFramebuffer>,
    frame_size: usize,
    num_buffers: usize,
    buffer_mask: u32,
    /// Bumped by every successful map.
    generation: u64,
}

impl FramebufferMapper {
    /// Unmapped mapper for `output`.
    pub fn new(output: DisplayOutput) -> Self {
        Self {
            output,
            shared: None,
            frame_size: 0,
            num_buffers: 0,
            buffer_mask: 0,
            generation: 0,
        }
    }

    /// Output this mapper serves.
    #[inline]
    pub fn output(&self) -> DisplayOutput {
        self.output
    }

    /// True while the shared mapping exists.
    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.shared.is_some()
    }

    /// Generation of the live mapping, `None` when unmapped.
    ///
    /// Each map gets a new generation, so a descriptor can tell whether the
    /// mapping it registered is still the one in place.
    #[inline]
    pub fn generation(&self) -> Option<u64> {
        self.shared.as_ref().map(|shared| shared.generation)
    }

    /// Map the whole framebuffer described by `desc`.
    ///
    /// Fails with [`Error::AlreadyRegistered`] without touching anything when
    /// the output is already mapped. Any failure after the mapping was made
    /// unmaps it again before returning.
    pub fn map(&mut self, desc: &BufferDescriptor, config: &ContextConfig) -> Result<NonNull<u8>> {
        if self.shared.is_some() {
            tracing::error!(output = %self.output, "framebuffer registered again");
            return Err(Error::AlreadyRegistered(self.output));
        }

        let BackendPayload::Framebuffer { fd } = desc.backend() else {
            return Err(Error::UnsupportedBuffer(format!(
                "{:?} buffer is not a framebuffer",
                desc.backend_kind()
            )));
        };

        let frame_size = desc.offset();
        if frame_size == 0 {
            return Err(Error::InvalidDescriptor("framebuffer frame size is 0".into()));
        }

        let fd = rustix::io::fcntl_dupfd_cloexec(fd, 0)?;
        let region = MappedRegion::map_shared(&fd, desc.size(), 0).inspect_err(|e| {
            tracing::error!(
                output = %self.output,
                size = desc.size(),
                "error mapping the framebuffer: {}",
                e
            );
        })?;

        if config.zero_framebuffer {
            region.zero();
        }

        let secure_id = if config.query_framebuffer_secure_id {
            query_secure_id(fd.as_fd())
        } else {
            None
        };
        if let Some(id) = secure_id {
            tracing::info!(
                output = %self.output,
                secure_id = %id,
                "framebuffer accessed with UMP secure id"
            );
        }

        let base = region.as_ptr();
        self.frame_size = frame_size;
        self.num_buffers = desc.size() / frame_size;
        self.buffer_mask = 0;
        self.generation += 1;
        self.shared = Some(SharedFramebuffer {
            fd,
            region,
            secure_id,
            generation: self.generation,
        });

        tracing::debug!(
            output = %self.output,
            num_buffers = self.num_buffers,
            frame_size,
            generation = self.generation,
            "registered framebuffer"
        );
        Ok(base)
    }

    /// Unmap the framebuffer, close its fd, and reset the slot bookkeeping.
    pub fn unmap(&mut self) -> Result<()> {
        let Some(shared) = self.shared.take() else {
            return Err(Error::NothingRegistered(self.output));
        };

        self.frame_size = 0;
        self.num_buffers = 0;
        self.buffer_mask = 0;

        let SharedFramebuffer { fd, region, .. } = shared;
        let result = region.unmap();
        drop(fd);

        tracing::debug!(output = %self.output, "unregistered framebuffer");
        result
    }

    /// Claim the lowest free frame slot.
    pub fn acquire_frame(&mut self) -> Result<FrameSlot> {
        let shared = self.shared.as_ref().ok_or(Error::NotMapped)?;
        let slots = self.num_buffers.min(MAX_FRAME_SLOTS);

        let index = (0..slots)
            .find(|i| self.buffer_mask & (1u32 << i) == 0)
            .ok_or(Error::NoFreeFrame(self.output))?;
        self.buffer_mask |= 1u32 << index;

        let offset = index * self.frame_size;
        // SAFETY: index < num_buffers, so the whole frame lies in the mapping.
        let ptr = unsafe { shared.region.as_ptr().add(offset) };

        Ok(FrameSlot { index, offset, ptr })
    }

    /// Return a slot claimed with [`FramebufferMapper::acquire_frame`].
    pub fn release_frame(&mut self, index: usize) -> Result<()> {
        if index >= MAX_FRAME_SLOTS || self.buffer_mask & (1u32 << index) == 0 {
            return Err(Error::InvalidDescriptor(format!(
                "frame {index} of {} framebuffer is not allocated",
                self.output
            )));
        }
        self.buffer_mask &= !(1u32 << index);
        Ok(())
    }

    /// Snapshot of the mapping, `None` when unmapped.
    pub fn info(&self) -> Option<FramebufferInfo> {
        self.shared.as_ref().map(|shared| FramebufferInfo {
            base: shared.region.as_ptr(),
            size: shared.region.len(),
            frame_size: self.frame_size,
            num_buffers: self.num_buffers,
            buffer_mask: self.buffer_mask,
            secure_id: shared.secure_id,
        })
    }
}
