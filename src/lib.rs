//! # gralloc
//!
//! Cross-process buffer mapper for GPU-visible shared memory.
//!
//! A buffer allocated by one process reaches another as an opaque
//! [`BufferDescriptor`]. This crate turns that descriptor into a
//! process-local CPU mapping, keeps CPU and device views of the memory
//! coherent across lock/unlock windows, and tears the mapping down again.
//!
//! ## Features
//!
//! - **Two sharing backends**: UMP buffers named by secure id, ION / dma-buf
//!   buffers passed as fds
//! - **Framebuffer singleton**: one shared mapping per display output,
//!   split into frame slots
//! - **Ownership checks**: only the context that mapped a buffer can unmap it
//! - **Descriptor IPC**: wire record plus `SCM_RIGHTS` over Unix sockets
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use gralloc::prelude::*;
//!
//! let ctx = Context::new();
//! let mut desc = gralloc::ipc::recv_descriptor(&socket)?;
//!
//! ctx.register(&mut desc)?;
//! if let Some(ptr) = ctx.lock(&mut desc, Usage::SW_WRITE_OFTEN, Rect::default())? {
//!     // write pixels through ptr
//! }
//! ctx.unlock(&mut desc)?;
//! ctx.unregister(&mut desc)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod backend;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod format;
pub mod framebuffer;
pub mod ipc;
pub mod lock;
pub mod mapping;
mod registry;
pub mod usage;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::backend::{IonDevice, SecureId, UmpDriver};
    pub use crate::context::{Context, ContextBuilder};
    pub use crate::descriptor::{BackendKind, BufferDescriptor};
    pub use crate::error::{Error, Result};
    pub use crate::format::PixelFormat;
    pub use crate::framebuffer::DisplayOutput;
    pub use crate::lock::{Rect, YCbCrLayout};
    pub use crate::usage::Usage;
}

pub use backend::{MsyncOp, SecureId};
pub use config::ContextConfig;
pub use context::{Context, ContextBuilder, OwnerToken};
pub use descriptor::{BackendKind, BackendPayload, BufferDescriptor, LockState};
pub use device::{Device, DeviceKind};
pub use error::{Error, Result};
pub use format::PixelFormat;
pub use framebuffer::{DisplayOutput, FrameSlot, FramebufferInfo};
pub use lock::{PlaneSpan, Rect, YCbCrLayout};
pub use usage::Usage;
