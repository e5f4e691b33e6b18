//! Error types for gralloc.

use crate::descriptor::LockState;
use crate::format::PixelFormat;
use crate::framebuffer::DisplayOutput;
use crate::usage::Usage;
use thiserror::Error;

/// Result type alias using gralloc's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for buffer mapping operations.
///
/// None of these conditions are retried internally. Use [`Error::errno`] when
/// the result has to cross a C boundary.
#[derive(Error, Debug)]
pub enum Error {
    /// The descriptor failed structural validation.
    #[error("invalid buffer descriptor: {0}")]
    InvalidDescriptor(String),

    /// The descriptor is well formed but no backend can handle it.
    #[error("unsupported buffer: {0}")]
    UnsupportedBuffer(String),

    /// The framebuffer for this output is already mapped.
    #[error("{0} framebuffer is already registered")]
    AlreadyRegistered(DisplayOutput),

    /// The descriptor already carries a mapping made by this context.
    #[error("buffer is already registered in this process")]
    DuplicateRegistration,

    /// There is no framebuffer mapping to tear down.
    #[error("{0} framebuffer has no mapping to unregister")]
    NothingRegistered(DisplayOutput),

    /// The mapping was created by another process or context.
    #[error("buffer mapped by process {owner} cannot be released from process {current}")]
    OwnershipMismatch {
        /// Process id recorded in the descriptor.
        owner: i32,
        /// Process id of the caller.
        current: i32,
    },

    /// An import, map, sync or open call failed in the backend.
    #[error("backend failure: {0}")]
    Backend(#[from] rustix::io::Errno),

    /// Planar lock requested on a format without a semi-planar layout.
    #[error("pixel format {0:?} cannot be locked as semi-planar YCbCr")]
    FormatUnsupported(PixelFormat),

    /// The lock usage is not allowed for this buffer.
    #[error("lock usage {requested:?} not permitted by buffer usage {allowed:?}")]
    UsageMismatch {
        /// Usage passed to the lock call.
        requested: Usage,
        /// Usage the buffer was allocated with.
        allowed: Usage,
    },

    /// The buffer has no CPU mapping in this process.
    #[error("buffer has no CPU mapping")]
    NotMapped,

    /// The requested lock conflicts with an outstanding one.
    #[error("buffer is busy: {0:?}")]
    Busy(LockState),

    /// Unlock without a matching lock.
    #[error("buffer is not locked")]
    NotLocked,

    /// Every frame slot of the framebuffer is in use.
    #[error("no free frame slot on {0} framebuffer")]
    NoFreeFrame(DisplayOutput),

    /// `open_device` was called with a name that is neither device.
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    /// No opener is available for the requested device.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Positive errno equivalent of this error.
    pub fn errno(&self) -> i32 {
        match self {
            Error::InvalidDescriptor(_)
            | Error::UnsupportedBuffer(_)
            | Error::FormatUnsupported(_)
            | Error::UsageMismatch { .. }
            | Error::NotMapped
            | Error::NotLocked
            | Error::UnknownDevice(_) => libc::EINVAL,
            Error::AlreadyRegistered(_) | Error::DuplicateRegistration | Error::Busy(_) => {
                libc::EBUSY
            }
            Error::NothingRegistered(_) => libc::ENOENT,
            Error::OwnershipMismatch { .. } => libc::EPERM,
            Error::NoFreeFrame(_) => libc::ENOMEM,
            Error::DeviceUnavailable(_) => libc::ENODEV,
            Error::Backend(errno) => errno.raw_os_error(),
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    /// Build a backend error from the calling thread's `errno`.
    pub(crate) fn last_os_error() -> Self {
        let raw = std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::EIO);
        Error::Backend(rustix::io::Errno::from_raw_os_error(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(Error::NotMapped.errno(), libc::EINVAL);
        assert_eq!(
            Error::AlreadyRegistered(DisplayOutput::Primary).errno(),
            libc::EBUSY
        );
        assert_eq!(
            Error::OwnershipMismatch {
                owner: 1,
                current: 2
            }
            .errno(),
            libc::EPERM
        );
        assert_eq!(
            Error::Backend(rustix::io::Errno::NOENT).errno(),
            libc::ENOENT
        );
    }

    #[test]
    fn test_display_names_output() {
        let msg = Error::NothingRegistered(DisplayOutput::External).to_string();
        assert!(msg.contains("external"));
    }
}
