//! Integration tests for opening devices by name.

mod common;

use common::{RecordingIon, memfd};
use gralloc::device::{AllocDevice, DeviceOpener, DisplayDevice};
use gralloc::{
    BufferDescriptor, Context, Device, DeviceKind, Error, PixelFormat, Rect, Result, Usage,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Allocator handing out memfd-backed ION buffers.
struct MemfdAllocator;

impl AllocDevice for MemfdAllocator {
    fn alloc(
        &mut self,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: Usage,
    ) -> Result<BufferDescriptor> {
        let size = format
            .frame_bytes(width, height)
            .ok_or_else(|| Error::UnsupportedBuffer(format!("{format:?}")))?;
        Ok(BufferDescriptor::ion(memfd(size), size)
            .with_dimensions(width, height, format)
            .with_usage(usage))
    }

    fn free(&mut self, desc: BufferDescriptor) -> Result<()> {
        drop(desc);
        Ok(())
    }
}

struct MemfdDisplay {
    posts: Arc<AtomicUsize>,
}

impl DisplayDevice for MemfdDisplay {
    fn framebuffer(&mut self) -> Result<BufferDescriptor> {
        Ok(BufferDescriptor::framebuffer(memfd(2 * 4096), 2 * 4096, 4096))
    }

    fn post(&mut self, desc: &BufferDescriptor) -> Result<()> {
        desc.validate()?;
        self.posts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Opener {
    posts: Arc<AtomicUsize>,
}

impl DeviceOpener for Opener {
    fn open_allocator(&self, _ctx: &Context) -> Result<Box<dyn AllocDevice>> {
        Ok(Box::new(MemfdAllocator))
    }

    fn open_display(&self, _ctx: &Context) -> Result<Box<dyn DisplayDevice>> {
        Ok(Box::new(MemfdDisplay {
            posts: Arc::clone(&self.posts),
        }))
    }
}

#[test]
fn test_allocate_register_lock() {
    let ctx = Context::builder()
        .ion(RecordingIon::default())
        .devices(Opener::default())
        .build();

    let Device::Allocator(mut gpu) = ctx.open_device("gpu0").unwrap() else {
        panic!("gpu0 must open the allocator");
    };
    let mut desc = gpu
        .alloc(32, 32, PixelFormat::YCrCb420Sp, Usage::SW_READ_OFTEN)
        .unwrap();

    ctx.register(&mut desc).unwrap();
    let layout = ctx
        .lock_ycbcr(&mut desc, Usage::SW_READ_OFTEN, Rect::default())
        .unwrap();
    assert_eq!(layout.c_stride, 32);
    ctx.unlock(&mut desc).unwrap();
    ctx.unregister(&mut desc).unwrap();

    gpu.free(desc).unwrap();
}

#[test]
fn test_display_framebuffer_and_post() {
    let opener = Opener::default();
    let posts = Arc::clone(&opener.posts);
    let ctx = Context::builder().devices(opener).build();

    let device = ctx.open_device("fb0").unwrap();
    assert_eq!(device.kind(), DeviceKind::Display);
    let Device::Display(mut fb0) = device else {
        unreachable!();
    };

    let mut fb = fb0.framebuffer().unwrap();
    ctx.register(&mut fb).unwrap();
    fb0.post(&fb).unwrap();
    assert_eq!(posts.load(Ordering::SeqCst), 1);
    ctx.unregister(&mut fb).unwrap();
}

#[test]
fn test_unknown_device_name() {
    let ctx = Context::builder().devices(Opener::default()).build();
    let err = ctx.open_device("fb1").unwrap_err();
    assert!(matches!(err, Error::UnknownDevice(_)));
    assert_eq!(err.errno(), libc::EINVAL);
}
