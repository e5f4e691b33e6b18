//! CPU access windows over registered buffers.
//!
//! [`Context::lock`] opens a window and hands out the CPU address,
//! [`Context::unlock`] closes it and pushes CPU writes out to the device when
//! the window was a write. [`Context::lock_ycbcr`] is the same window for
//! semi-planar 4:2:0 buffers, returning the plane layout instead of a bare
//! pointer.
//!
//! Locks are counted in the descriptor's [`LockState`](crate::LockState):
//! any number of readers, or one writer. Every successful lock must be
//! matched by exactly one unlock.

use crate::backend::MsyncOp;
use crate::context::Context;
use crate::descriptor::{BackendPayload, BufferDescriptor, LocalMapping, Registration};
use crate::error::{Error, Result};
use crate::usage::Usage;
use rustix::fd::AsFd;
use std::ptr::NonNull;

/// Region of interest passed to a lock.
///
/// Accepted for API compatibility; locks always cover the whole buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rect {
    /// Left edge in pixels.
    pub left: i32,
    /// Top edge in pixels.
    pub top: i32,
    /// Width in pixels.
    pub width: i32,
    /// Height in pixels.
    pub height: i32,
}

impl Rect {
    /// Rectangle at `(left, top)` of `width` x `height`.
    pub const fn new(left: i32, top: i32, width: i32, height: i32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }
}

/// Where one plane's samples sit relative to the buffer base.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaneSpan {
    /// Byte offset of the first sample.
    pub offset: usize,
    /// Bytes between the starts of consecutive rows.
    pub stride: usize,
    /// Bytes between consecutive samples within a row.
    pub step: usize,
    /// Samples per row.
    pub samples: usize,
    /// Number of rows.
    pub rows: usize,
}

impl PlaneSpan {
    /// One past the last byte a sample of this plane occupies.
    pub fn end(&self) -> usize {
        if self.rows == 0 || self.samples == 0 {
            return self.offset;
        }
        self.offset + self.stride * (self.rows - 1) + self.step * (self.samples - 1) + 1
    }
}

/// Plane layout returned by [`Context::lock_ycbcr`].
///
/// Chroma is interleaved V/U (NV21): `cr` points at the first V sample and
/// `cb` one byte after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YCbCrLayout {
    /// First luma sample.
    pub y: NonNull<u8>,
    /// First blue-difference sample.
    pub cb: NonNull<u8>,
    /// First red-difference sample.
    pub cr: NonNull<u8>,
    /// Luma row stride in bytes.
    pub y_stride: usize,
    /// Chroma row stride in bytes.
    pub c_stride: usize,
    /// Bytes between chroma samples of the same plane.
    pub chroma_step: usize,
    /// Luma plane.
    pub luma: PlaneSpan,
    /// Blue-difference plane.
    pub cb_plane: PlaneSpan,
    /// Red-difference plane.
    pub cr_plane: PlaneSpan,
    /// Always zero.
    pub reserved: [u32; 8],
}

/// Luma, V and U spans of a `width` x `height` NV21 frame.
fn semi_planar_spans(width: usize, height: usize) -> (PlaneSpan, PlaneSpan, PlaneSpan) {
    let luma = PlaneSpan {
        offset: 0,
        stride: width,
        step: 1,
        samples: width,
        rows: height,
    };
    let cr = PlaneSpan {
        offset: width * height,
        stride: width,
        step: 2,
        samples: width.div_ceil(2),
        rows: height.div_ceil(2),
    };
    let cb = PlaneSpan {
        offset: cr.offset + 1,
        samples: width / 2,
        ..cr
    };
    (luma, cr, cb)
}

impl Context {
    /// Open a CPU access window on `desc`.
    ///
    /// Returns the buffer's CPU address when `usage` asks for software,
    /// camera or video-encoder access, and `None` for pure GPU consumers.
    /// `region` is not validated.
    pub fn lock(
        &self,
        desc: &mut BufferDescriptor,
        usage: Usage,
        region: Rect,
    ) -> Result<Option<NonNull<u8>>> {
        desc.validate().inspect_err(|e| {
            tracing::error!("locking invalid buffer: {}", e);
        })?;
        let base = self.mapped_base(desc)?;

        Self::begin_access(desc, usage)?;
        tracing::trace!(
            usage = ?usage,
            left = region.left,
            top = region.top,
            width = region.width,
            height = region.height,
            "locked buffer"
        );

        Ok(usage.wants_cpu_pointer().then_some(base))
    }

    /// Open a CPU access window on a semi-planar 4:2:0 buffer and describe
    /// its planes.
    ///
    /// `usage` must be a camera write or a software read the buffer was
    /// allocated for.
    pub fn lock_ycbcr(
        &self,
        desc: &mut BufferDescriptor,
        usage: Usage,
        region: Rect,
    ) -> Result<YCbCrLayout> {
        desc.validate().inspect_err(|e| {
            tracing::error!("locking invalid buffer: {}", e);
        })?;

        let sw_read = usage.reads_cpu();
        let camera_write = usage.contains(Usage::HW_CAMERA_WRITE);
        if (!camera_write && !sw_read) || (sw_read && !desc.usage().reads_cpu()) {
            tracing::error!(
                requested = ?usage,
                allowed = ?desc.usage(),
                "invalid usage for planar lock"
            );
            return Err(Error::UsageMismatch {
                requested: usage,
                allowed: desc.usage(),
            });
        }

        if !desc.format().is_semi_planar_420() {
            tracing::error!(format = ?desc.format(), "planar lock on unsupported format");
            return Err(Error::FormatUnsupported(desc.format()));
        }

        let base = self.mapped_base(desc)?;
        let (luma, cr_plane, cb_plane) =
            semi_planar_spans(desc.width() as usize, desc.height() as usize);

        let extent = desc.cpu_extent();
        let end = luma.end().max(cr_plane.end()).max(cb_plane.end());
        if end > extent {
            return Err(Error::InvalidDescriptor(format!(
                "planes end at byte {end}, buffer exposes {extent}"
            )));
        }

        Self::begin_access(desc, usage)?;

        // SAFETY: every plane offset is below `end`, which fits the mapping.
        let (y, cr, cb) = unsafe {
            (
                base.add(luma.offset),
                base.add(cr_plane.offset),
                base.add(cb_plane.offset),
            )
        };

        tracing::trace!(
            width = desc.width(),
            height = desc.height(),
            left = region.left,
            top = region.top,
            "locked planar buffer"
        );

        Ok(YCbCrLayout {
            y,
            cb,
            cr,
            y_stride: luma.stride,
            c_stride: cr_plane.stride,
            chroma_step: cr_plane.step,
            luma,
            cb_plane,
            cr_plane,
            reserved: [0; 8],
        })
    }

    /// CPU address of `desc`, provided the mapping behind it still exists.
    fn mapped_base(&self, desc: &BufferDescriptor) -> Result<NonNull<u8>> {
        let base = desc.base.ok_or_else(|| {
            tracing::error!("locking a buffer that is not registered");
            Error::NotMapped
        })?;

        if let Some(Registration {
            token,
            mapping: LocalMapping::Framebuffer { output, generation },
        }) = &desc.registration
        {
            let live = self.state().framebuffer(*output).generation();
            if *token == self.token() && live != Some(*generation) {
                tracing::error!(
                    output = %output,
                    "locking a framebuffer whose mapping is gone"
                );
                return Err(Error::NotMapped);
            }
        }
        Ok(base)
    }

    fn begin_access(desc: &mut BufferDescriptor, usage: Usage) -> Result<()> {
        let write = usage.writes_cpu();
        let current = desc.lock_state;
        desc.lock_state = current.acquire(write).inspect_err(|_| {
            tracing::debug!(lock_state = ?current, write, "lock conflicts with outstanding lock");
        })?;
        if matches!(
            desc.backend,
            BackendPayload::Ump { .. } | BackendPayload::Ion { .. }
        ) {
            desc.write_owner = write;
        }
        Ok(())
    }

    /// Close one CPU access window.
    ///
    /// When it was a write window the buffer's CPU caches are written back
    /// (UMP) or the dma-buf is synced for the device (ION). The lock is
    /// released even if that sync fails.
    pub fn unlock(&self, desc: &mut BufferDescriptor) -> Result<()> {
        desc.validate().inspect_err(|e| {
            tracing::error!("unlocking invalid buffer: {}", e);
        })?;

        desc.lock_state = desc.lock_state.release().inspect_err(|_| {
            tracing::warn!("unlock without a matching lock");
        })?;
        if !std::mem::take(&mut desc.write_owner) {
            return Ok(());
        }

        let result = match &desc.backend {
            BackendPayload::Ump { .. } => {
                let handle = desc.ump_handle().ok_or(Error::NotMapped)?;
                match &self.ump {
                    Some(driver) => driver.msync(handle, MsyncOp::CleanAndInvalidate),
                    None => Err(Error::NotMapped),
                }
            }
            BackendPayload::Ion { share_fd } => {
                match (&self.ion, self.ion_client.get()) {
                    (Some(device), Some(client)) => {
                        device.sync_for_device(client.as_fd(), share_fd.as_fd())
                    }
                    _ => Err(Error::NotMapped),
                }
            }
            BackendPayload::Framebuffer { .. } | BackendPayload::Unsupported { .. } => Ok(()),
        };

        if let Err(e) = &result {
            tracing::error!("sync after CPU write failed: {}", e);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::PixelFormat;
    use crate::framebuffer::DisplayOutput;

    fn framebuffer(size: usize) -> BufferDescriptor {
        let fd = rustix::fs::memfd_create("test_lock", rustix::fs::MemfdFlags::CLOEXEC).unwrap();
        rustix::fs::ftruncate(&fd, size as u64).unwrap();
        BufferDescriptor::framebuffer(fd, size, 4096)
    }

    #[test]
    fn test_replaced_framebuffer_mapping_is_not_locked() {
        let ctx = Context::new();
        let mut stale = framebuffer(4096);
        ctx.register(&mut stale).unwrap();

        // Replace the mapping behind the descriptor's back
        ctx.state().framebuffer(DisplayOutput::Primary).unmap().unwrap();
        let mut current = framebuffer(2 * 4096);
        ctx.register(&mut current).unwrap();

        assert!(stale.base().is_some());
        assert!(matches!(
            ctx.lock(&mut stale, Usage::SW_READ_OFTEN, Rect::default()),
            Err(Error::NotMapped)
        ));
        assert!(stale.lock_state().is_unlocked());

        assert!(matches!(
            ctx.unregister(&mut stale),
            Err(Error::NothingRegistered(DisplayOutput::Primary))
        ));
        assert!(stale.base().is_none());
        assert_eq!(ctx.framebuffer(DisplayOutput::Primary).unwrap().num_buffers, 2);

        assert_eq!(
            ctx.lock(&mut current, Usage::SW_READ_OFTEN, Rect::default()).unwrap(),
            current.base()
        );
        ctx.unlock(&mut current).unwrap();
        ctx.unregister(&mut current).unwrap();
    }

    #[test]
    fn test_nv21_spans() {
        let (luma, cr, cb) = semi_planar_spans(640, 480);
        assert_eq!(luma.end(), 307_200);
        assert_eq!((cr.offset, cr.stride, cr.step), (307_200, 640, 2));
        assert_eq!((cb.offset, cb.stride, cb.step), (307_201, 640, 2));
        assert_eq!(cb.end(), 460_800);
        assert!(cr.end() < cb.end());
    }

    #[test]
    fn test_odd_height_spans() {
        // 4x3: three luma rows, two chroma rows
        let (luma, cr, cb) = semi_planar_spans(4, 3);
        assert_eq!(luma.end(), 12);
        assert_eq!(cr.rows, 2);
        assert_eq!(cb.end(), 20);
        assert_eq!(PixelFormat::YCrCb420Sp.frame_bytes(4, 3), Some(20));
    }

    #[test]
    fn test_empty_span_ends_at_offset() {
        let (luma, cr, _) = semi_planar_spans(0, 0);
        assert_eq!(luma.end(), 0);
        assert_eq!(cr.end(), 0);
    }
}
