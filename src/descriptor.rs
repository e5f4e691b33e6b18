//! Buffer descriptors.
//!
//! A [`BufferDescriptor`] is what travels between processes: identity,
//! geometry, usage and the backend payload (a UMP secure id, or a file
//! descriptor). Its runtime fields (CPU base, lock state, write owner) are
//! local to the context that registered it and never cross the wire.
//!
//! # Wire format
//!
//! [`BufferDescriptor::to_wire`] produces a fixed 56-byte little-endian
//! record; the share/framebuffer fd travels next to it as `SCM_RIGHTS`
//! (see [`crate::ipc`]).
//!
//! | offset | field      | type |
//! |--------|------------|------|
//! | 0      | magic      | u32  |
//! | 4      | version    | u32  |
//! | 8      | flags      | u32  |
//! | 12     | usage      | u32  |
//! | 16     | format     | u32  |
//! | 20     | width      | u32  |
//! | 24     | height     | u32  |
//! | 28     | owner pid  | i32  |
//! | 32     | size       | u64  |
//! | 40     | offset     | u64  |
//! | 48     | secure id  | u32  |
//! | 52     | fd count   | u32  |

use crate::backend::{SecureId, UmpHandle};
use crate::context::OwnerToken;
use crate::error::{Error, Result};
use crate::format::PixelFormat;
use crate::framebuffer::DisplayOutput;
use crate::mapping::MappedRegion;
use crate::usage::Usage;
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use std::ptr::NonNull;

/// Tag every valid descriptor carries.
pub const DESCRIPTOR_MAGIC: u32 = 0x0314_1592;

/// Version of the wire record.
pub const WIRE_VERSION: u32 = 1;

/// Size of the wire record in bytes.
pub const WIRE_LEN: usize = 56;

/// Backend flag: framebuffer memory.
pub const FLAG_FRAMEBUFFER: u32 = 0x1;
/// Backend flag: UMP memory.
pub const FLAG_USES_UMP: u32 = 0x2;
/// Backend flag: ION / dma-buf memory.
pub const FLAG_USES_ION: u32 = 0x4;

const BACKEND_FLAGS: u32 = FLAG_FRAMEBUFFER | FLAG_USES_UMP | FLAG_USES_ION;

/// Which mechanism backs a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// UMP, imported by secure id.
    Ump,
    /// ION / dma-buf, imported by share fd.
    Ion,
    /// The display's framebuffer.
    Framebuffer,
    /// No recognised backend flag.
    Unsupported,
}

/// Backend-specific part of a descriptor.
#[derive(Debug)]
pub enum BackendPayload {
    /// UMP buffer.
    Ump {
        /// Global id the buffer is imported by.
        secure_id: SecureId,
    },
    /// ION / dma-buf buffer.
    Ion {
        /// Transferable dma-buf fd.
        share_fd: OwnedFd,
    },
    /// Framebuffer of a display output.
    Framebuffer {
        /// The display device's framebuffer fd.
        fd: OwnedFd,
    },
    /// Descriptor whose flags name no backend.
    Unsupported {
        /// The raw flags as received.
        flags: u32,
    },
}

impl BackendPayload {
    /// Tag of this payload.
    pub fn kind(&self) -> BackendKind {
        match self {
            BackendPayload::Ump { .. } => BackendKind::Ump,
            BackendPayload::Ion { .. } => BackendKind::Ion,
            BackendPayload::Framebuffer { .. } => BackendKind::Framebuffer,
            BackendPayload::Unsupported { .. } => BackendKind::Unsupported,
        }
    }

    fn flags(&self) -> u32 {
        match self {
            BackendPayload::Ump { .. } => FLAG_USES_UMP,
            BackendPayload::Ion { .. } => FLAG_USES_ION,
            BackendPayload::Framebuffer { .. } => FLAG_FRAMEBUFFER,
            BackendPayload::Unsupported { flags } => *flags,
        }
    }

    fn transfer_fd(&self) -> Option<BorrowedFd<'_>> {
        match self {
            BackendPayload::Ion { share_fd } => Some(share_fd.as_fd()),
            BackendPayload::Framebuffer { fd } => Some(fd.as_fd()),
            BackendPayload::Ump { .. } | BackendPayload::Unsupported { .. } => None,
        }
    }
}

/// Read/write lock accounting for a buffer.
///
/// Bit 31 marks an exclusive write lock; the low 30 bits count readers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockState(u32);

impl LockState {
    const WRITE: u32 = 1 << 31;
    const READ_MASK: u32 = 0x3FFF_FFFF;

    /// Raw bitfield.
    #[inline]
    pub fn bits(self) -> u32 {
        self.0
    }

    /// No outstanding lock of either kind.
    #[inline]
    pub fn is_unlocked(self) -> bool {
        self.0 == 0
    }

    /// An exclusive write lock is held.
    #[inline]
    pub fn is_write_locked(self) -> bool {
        self.0 & Self::WRITE != 0
    }

    /// Number of outstanding read locks.
    #[inline]
    pub fn readers(self) -> u32 {
        self.0 & Self::READ_MASK
    }

    pub(crate) fn acquire(self, write: bool) -> Result<Self> {
        if self.is_write_locked() {
            return Err(Error::Busy(self));
        }
        if write {
            if self.readers() != 0 {
                return Err(Error::Busy(self));
            }
            return Ok(Self(Self::WRITE));
        }
        if self.readers() == Self::READ_MASK {
            return Err(Error::Busy(self));
        }
        Ok(Self(self.0 + 1))
    }

    pub(crate) fn release(self) -> Result<Self> {
        if self.is_write_locked() {
            Ok(Self(0))
        } else if self.readers() > 0 {
            Ok(Self(self.0 - 1))
        } else {
            Err(Error::NotLocked)
        }
    }
}

/// The process-local mapping behind a registered descriptor.
#[derive(Debug)]
pub(crate) enum LocalMapping {
    Ump(UmpHandle),
    Ion(MappedRegion),
    /// Shared output mapping, valid while its generation is the live one.
    Framebuffer {
        output: DisplayOutput,
        generation: u64,
    },
}

/// Proof that a context mapped this descriptor.
#[derive(Debug)]
pub(crate) struct Registration {
    pub(crate) token: OwnerToken,
    pub(crate) mapping: LocalMapping,
}

/// A shared graphics buffer as seen by this process.
#[derive(Debug)]
pub struct BufferDescriptor {
    magic: u32,
    pub(crate) owner_pid: i32,
    size: usize,
    width: u32,
    height: u32,
    format: PixelFormat,
    usage: Usage,
    offset: usize,
    pub(crate) backend: BackendPayload,

    pub(crate) base: Option<NonNull<u8>>,
    pub(crate) lock_state: LockState,
    pub(crate) write_owner: bool,
    pub(crate) registration: Option<Registration>,
}

// SAFETY: `base` is an address into a mapping that outlives the descriptor's
// registration; the descriptor never dereferences it on its own.
unsafe impl Send for BufferDescriptor {}
unsafe impl Sync for BufferDescriptor {}

impl BufferDescriptor {
    fn with_backend(backend: BackendPayload, size: usize) -> Self {
        Self {
            magic: DESCRIPTOR_MAGIC,
            owner_pid: 0,
            size,
            width: 0,
            height: 0,
            format: PixelFormat::default(),
            usage: Usage::empty(),
            offset: 0,
            backend,
            base: None,
            lock_state: LockState::default(),
            write_owner: false,
            registration: None,
        }
    }

    /// Descriptor for a UMP buffer identified by `secure_id`.
    pub fn ump(secure_id: SecureId, size: usize) -> Self {
        Self::with_backend(BackendPayload::Ump { secure_id }, size)
    }

    /// Descriptor for an ION / dma-buf buffer.
    pub fn ion(share_fd: OwnedFd, size: usize) -> Self {
        Self::with_backend(BackendPayload::Ion { share_fd }, size)
    }

    /// Descriptor for a display framebuffer of `size` bytes split into
    /// frames of `frame_size` bytes.
    ///
    /// The frame size is carried in the offset field, which is where display
    /// devices put it.
    pub fn framebuffer(fd: OwnedFd, size: usize, frame_size: usize) -> Self {
        let mut desc = Self::with_backend(BackendPayload::Framebuffer { fd }, size);
        desc.offset = frame_size;
        desc.usage = Usage::HW_FB;
        desc
    }

    /// Set width, height and pixel format.
    pub fn with_dimensions(mut self, width: u32, height: u32, format: PixelFormat) -> Self {
        self.width = width;
        self.height = height;
        self.format = format;
        self
    }

    /// Set the usage mask.
    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    /// Set the byte offset into the backing allocation.
    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Check that the descriptor is structurally sound.
    ///
    /// Every public operation calls this first. It has no side effects.
    pub fn validate(&self) -> Result<()> {
        if self.magic != DESCRIPTOR_MAGIC {
            return Err(Error::InvalidDescriptor(format!(
                "bad magic {:#010x}",
                self.magic
            )));
        }
        if self.size == 0 {
            return Err(Error::InvalidDescriptor("zero-sized buffer".into()));
        }

        match self.backend {
            BackendPayload::Ion { .. } if self.offset >= self.size => {
                return Err(Error::InvalidDescriptor(format!(
                    "offset {} outside {}-byte buffer",
                    self.offset, self.size
                )));
            }
            BackendPayload::Framebuffer { .. }
                if self.offset == 0 || self.offset > self.size =>
            {
                return Err(Error::InvalidDescriptor(format!(
                    "frame size {} does not fit {}-byte framebuffer",
                    self.offset, self.size
                )));
            }
            _ => {}
        }

        match self.format.frame_bytes(self.width, self.height) {
            Some(needed) if needed > self.cpu_extent() => {
                return Err(Error::InvalidDescriptor(format!(
                    "{}x{} {:?} needs {} bytes, buffer exposes {}",
                    self.width,
                    self.height,
                    self.format,
                    needed,
                    self.cpu_extent()
                )));
            }
            None if !self.format.is_opaque() => {
                return Err(Error::InvalidDescriptor(format!(
                    "{}x{} overflows the address space",
                    self.width, self.height
                )));
            }
            _ => {}
        }

        Ok(())
    }

    /// Bytes reachable from the CPU base once mapped.
    pub fn cpu_extent(&self) -> usize {
        match self.backend {
            BackendPayload::Ion { .. } => self.size.saturating_sub(self.offset),
            BackendPayload::Framebuffer { .. } => self.offset,
            BackendPayload::Ump { .. } | BackendPayload::Unsupported { .. } => self.size,
        }
    }

    /// Backend tag.
    #[inline]
    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Backend payload.
    #[inline]
    pub fn backend(&self) -> &BackendPayload {
        &self.backend
    }

    /// Process that last registered this descriptor, 0 if never registered.
    #[inline]
    pub fn owner_pid(&self) -> i32 {
        self.owner_pid
    }

    /// Size of the backing allocation in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Width in pixels.
    #[inline]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Height in pixels.
    #[inline]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Pixel format.
    #[inline]
    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Usage the buffer was allocated with.
    #[inline]
    pub fn usage(&self) -> Usage {
        self.usage
    }

    /// Byte offset into the allocation (frame size for framebuffers).
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// CPU address of the buffer, `None` until registered.
    #[inline]
    pub fn base(&self) -> Option<NonNull<u8>> {
        self.base
    }

    /// Current lock accounting.
    #[inline]
    pub fn lock_state(&self) -> LockState {
        self.lock_state
    }

    /// Whether the most recent lock asked for CPU writes.
    #[inline]
    pub fn write_owner(&self) -> bool {
        self.write_owner
    }

    /// True when a context holds a live mapping of this descriptor.
    #[inline]
    pub fn is_registered(&self) -> bool {
        self.registration.is_some()
    }

    /// The imported UMP handle, once registered.
    pub fn ump_handle(&self) -> Option<&UmpHandle> {
        match &self.registration {
            Some(Registration {
                mapping: LocalMapping::Ump(handle),
                ..
            }) => Some(handle),
            _ => None,
        }
    }

    /// The fd that travels with this descriptor, if any.
    pub fn transfer_fd(&self) -> Option<BorrowedFd<'_>> {
        self.backend.transfer_fd()
    }

    pub(crate) fn clear_runtime(&mut self) {
        self.base = None;
        self.lock_state = LockState::default();
        self.write_owner = false;
        self.registration = None;
    }

    /// Encode the identity fields into the wire record.
    pub fn to_wire(&self) -> [u8; WIRE_LEN] {
        let secure_id = match self.backend {
            BackendPayload::Ump { secure_id } => secure_id.0,
            _ => SecureId::INVALID.0,
        };
        let fd_count = u32::from(self.transfer_fd().is_some());

        let mut out = [0u8; WIRE_LEN];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..8].copy_from_slice(&WIRE_VERSION.to_le_bytes());
        out[8..12].copy_from_slice(&self.backend.flags().to_le_bytes());
        out[12..16].copy_from_slice(&self.usage.bits().to_le_bytes());
        out[16..20].copy_from_slice(&self.format.as_raw().to_le_bytes());
        out[20..24].copy_from_slice(&self.width.to_le_bytes());
        out[24..28].copy_from_slice(&self.height.to_le_bytes());
        out[28..32].copy_from_slice(&self.owner_pid.to_le_bytes());
        out[32..40].copy_from_slice(&(self.size as u64).to_le_bytes());
        out[40..48].copy_from_slice(&(self.offset as u64).to_le_bytes());
        out[48..52].copy_from_slice(&secure_id.to_le_bytes());
        out[52..56].copy_from_slice(&fd_count.to_le_bytes());
        out
    }

    /// Decode a wire record plus the fds received with it.
    ///
    /// The result has no CPU mapping; pass it to
    /// [`Context::register`](crate::Context::register).
    pub fn from_wire(bytes: &[u8], fds: Vec<OwnedFd>) -> Result<Self> {
        if bytes.len() != WIRE_LEN {
            return Err(Error::InvalidDescriptor(format!(
                "wire record is {} bytes, expected {}",
                bytes.len(),
                WIRE_LEN
            )));
        }

        let u32_at = |at: usize| {
            u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
        };
        let u64_at = |at: usize| u64::from(u32_at(at)) | (u64::from(u32_at(at + 4)) << 32);

        let magic = u32_at(0);
        if magic != DESCRIPTOR_MAGIC {
            return Err(Error::InvalidDescriptor(format!("bad magic {magic:#010x}")));
        }
        let version = u32_at(4);
        if version != WIRE_VERSION {
            return Err(Error::InvalidDescriptor(format!(
                "unsupported wire version {version}"
            )));
        }

        let flags = u32_at(8);
        let raw_format = u32_at(16);
        let format = PixelFormat::from_raw(raw_format).ok_or_else(|| {
            Error::InvalidDescriptor(format!("unknown pixel format {raw_format:#x}"))
        })?;
        let size = usize::try_from(u64_at(32))
            .map_err(|_| Error::InvalidDescriptor("size overflows usize".into()))?;
        let offset = usize::try_from(u64_at(40))
            .map_err(|_| Error::InvalidDescriptor("offset overflows usize".into()))?;
        let fd_count = u32_at(52) as usize;

        if fd_count != fds.len() {
            return Err(Error::InvalidDescriptor(format!(
                "record announces {} fds, received {}",
                fd_count,
                fds.len()
            )));
        }

        let backend_flags = flags & BACKEND_FLAGS;
        if backend_flags.count_ones() > 1 {
            return Err(Error::InvalidDescriptor(format!(
                "conflicting backend flags {flags:#x}"
            )));
        }

        let mut fds = fds.into_iter();
        let mut take_fd = |what: &str| {
            fds.next()
                .ok_or_else(|| Error::InvalidDescriptor(format!("{what} descriptor without fd")))
        };
        let backend = match backend_flags {
            FLAG_USES_UMP => BackendPayload::Ump {
                secure_id: SecureId(u32_at(48)),
            },
            FLAG_USES_ION => BackendPayload::Ion {
                share_fd: take_fd("ION")?,
            },
            FLAG_FRAMEBUFFER => BackendPayload::Framebuffer {
                fd: take_fd("framebuffer")?,
            },
            _ => BackendPayload::Unsupported { flags },
        };
        if fds.next().is_some() {
            return Err(Error::InvalidDescriptor(format!(
                "unexpected fd for flags {flags:#x}"
            )));
        }

        Ok(Self {
            magic,
            owner_pid: u32_at(28) as i32,
            size,
            width: u32_at(20),
            height: u32_at(24),
            format,
            usage: Usage::from_bits_retain(u32_at(12)),
            offset,
            backend,
            base: None,
            lock_state: LockState::default(),
            write_owner: false,
            registration: None,
        })
    }
}
