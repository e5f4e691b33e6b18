//! Device entry points.
//!
//! Buffer allocation and display presentation live outside this crate. They
//! plug in through [`DeviceOpener`], and [`Context::open_device`] dispatches
//! to them by name.
//!
//! [`Context::open_device`]: crate::Context::open_device

use crate::config::{FB0, GPU0};
use crate::context::Context;
use crate::descriptor::BufferDescriptor;
use crate::error::{Error, Result};
use crate::format::PixelFormat;
use crate::usage::Usage;
use std::fmt;

/// Which device a name refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    /// Buffer allocator (`"gpu0"`).
    Allocator,
    /// Display / framebuffer device (`"fb0"`).
    Display,
}

impl DeviceKind {
    /// Parse a device name.
    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            GPU0 => Ok(DeviceKind::Allocator),
            FB0 => Ok(DeviceKind::Display),
            other => Err(Error::UnknownDevice(other.to_string())),
        }
    }
}

/// Produces descriptors for new buffers.
pub trait AllocDevice: Send {
    /// Allocate a buffer.
    fn alloc(
        &mut self,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: Usage,
    ) -> Result<BufferDescriptor>;

    /// Free a buffer this device allocated.
    fn free(&mut self, desc: BufferDescriptor) -> Result<()>;
}

/// Produces the framebuffer descriptor and presents frames.
pub trait DisplayDevice: Send {
    /// Descriptor of the whole framebuffer.
    fn framebuffer(&mut self) -> Result<BufferDescriptor>;

    /// Show `desc` on screen.
    fn post(&mut self, desc: &BufferDescriptor) -> Result<()>;
}

/// Opens the external devices.
pub trait DeviceOpener: Send + Sync + fmt::Debug {
    /// Open the allocator device.
    fn open_allocator(&self, ctx: &Context) -> Result<Box<dyn AllocDevice>>;

    /// Open the display device.
    fn open_display(&self, ctx: &Context) -> Result<Box<dyn DisplayDevice>>;
}

/// An opened device.
pub enum Device {
    /// Result of opening `"gpu0"`.
    Allocator(Box<dyn AllocDevice>),
    /// Result of opening `"fb0"`.
    Display(Box<dyn DisplayDevice>),
}

impl Device {
    /// Kind of this device.
    pub fn kind(&self) -> DeviceKind {
        match self {
            Device::Allocator(_) => DeviceKind::Allocator,
            Device::Display(_) => DeviceKind::Display,
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Device").field(&self.kind()).finish()
    }
}
