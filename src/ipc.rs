//! Passing buffer descriptors between processes.
//!
//! A descriptor travels as its fixed-size wire record with the share or
//! framebuffer fd attached as an `SCM_RIGHTS` ancillary message. The
//! receiving side gets an unmapped descriptor and must
//! [`register`](crate::Context::register) it before use.

use crate::descriptor::{BufferDescriptor, WIRE_LEN};
use crate::error::{Error, Result};
use rustix::fd::{AsFd, BorrowedFd, OwnedFd};
use rustix::net::{
    RecvAncillaryBuffer, RecvAncillaryMessage, RecvFlags, ReturnFlags, SendAncillaryBuffer,
    SendAncillaryMessage, SendFlags, recvmsg, sendmsg,
};
use std::io::{self, IoSlice, IoSliceMut};
use std::mem::MaybeUninit;
use std::os::unix::net::UnixStream;

/// Most fds one message may carry.
pub const MAX_FDS_PER_MESSAGE: usize = 4;

/// Control buffer for up to [`MAX_FDS_PER_MESSAGE`] fds.
const CMSG_SPACE: usize = 64;

fn socket_error(kind: io::ErrorKind, msg: impl Into<String>) -> Error {
    Error::Io(io::Error::new(kind, msg.into()))
}

/// Send `data` with `fds` attached over a Unix socket.
///
/// `fds` may be empty, UMP descriptors carry no fd.
///
/// # Example
///
/// ```rust,ignore
/// use std::os::unix::net::UnixStream;
/// use gralloc::ipc::send_fds;
///
/// let (sender, receiver) = UnixStream::pair()?;
/// send_fds(&sender, &[share_fd], b"hello")?;
/// ```
pub fn send_fds<Fd: AsFd>(socket: &UnixStream, fds: &[Fd], data: &[u8]) -> Result<()> {
    if fds.len() > MAX_FDS_PER_MESSAGE {
        return Err(socket_error(
            io::ErrorKind::InvalidInput,
            format!("{} fds in one message, at most {MAX_FDS_PER_MESSAGE}", fds.len()),
        ));
    }

    // The fds ride on the data, an empty payload would drop them
    let data = if data.is_empty() { &[0u8] } else { data };
    let borrowed: Vec<BorrowedFd<'_>> = fds.iter().map(AsFd::as_fd).collect();

    let mut space = [MaybeUninit::<u8>::uninit(); CMSG_SPACE];
    let mut control = SendAncillaryBuffer::new(&mut space);
    if !borrowed.is_empty() && !control.push(SendAncillaryMessage::ScmRights(&borrowed)) {
        return Err(socket_error(
            io::ErrorKind::OutOfMemory,
            "fds do not fit the control buffer",
        ));
    }

    sendmsg(socket, &[IoSlice::new(data)], &mut control, SendFlags::empty())?;
    Ok(())
}

/// Receive one message and the fds attached to it.
///
/// Returns the number of data bytes read and the received fds. A message
/// whose fds did not all fit is an error, the partial set is closed.
pub fn recv_fds(socket: &UnixStream, data_buf: &mut [u8]) -> Result<(usize, Vec<OwnedFd>)> {
    if data_buf.is_empty() {
        return Err(socket_error(
            io::ErrorKind::InvalidInput,
            "receive buffer is empty",
        ));
    }

    let mut space = [MaybeUninit::<u8>::uninit(); CMSG_SPACE];
    let mut control = RecvAncillaryBuffer::new(&mut space);
    let mut iov = [IoSliceMut::new(data_buf)];
    let msg = recvmsg(socket, &mut iov, &mut control, RecvFlags::CMSG_CLOEXEC)?;

    let fds: Vec<OwnedFd> = control
        .drain()
        .filter_map(|cmsg| match cmsg {
            RecvAncillaryMessage::ScmRights(rights) => Some(rights),
            _ => None,
        })
        .flatten()
        .collect();

    if msg.flags.contains(ReturnFlags::CTRUNC) {
        tracing::error!(kept = fds.len(), "control message truncated, fds were dropped");
        return Err(socket_error(
            io::ErrorKind::InvalidData,
            format!("control message truncated after {} fds", fds.len()),
        ));
    }

    Ok((msg.bytes, fds))
}

/// Send `desc` to the peer.
///
/// Only the identity fields cross, including the sender's pid for
/// diagnostics. The local mapping and lock state stay in this process.
pub fn send_descriptor(socket: &UnixStream, desc: &BufferDescriptor) -> Result<()> {
    desc.validate()?;
    let record = desc.to_wire();
    let fds: Vec<BorrowedFd<'_>> = desc.transfer_fd().into_iter().collect();
    send_fds(socket, &fds, &record)?;
    tracing::trace!(backend = ?desc.backend_kind(), size = desc.size(), "sent descriptor");
    Ok(())
}

/// Receive a descriptor sent with [`send_descriptor`].
pub fn recv_descriptor(socket: &UnixStream) -> Result<BufferDescriptor> {
    let mut record = [0u8; WIRE_LEN];
    let (bytes_read, fds) = recv_fds(socket, &mut record)?;
    if bytes_read != WIRE_LEN {
        return Err(Error::InvalidDescriptor(format!(
            "expected {WIRE_LEN} bytes for the record, got {bytes_read}"
        )));
    }

    let desc = BufferDescriptor::from_wire(&record, fds)?;
    desc.validate()?;
    tracing::trace!(backend = ?desc.backend_kind(), size = desc.size(), "received descriptor");
    Ok(desc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SecureId;
    use crate::descriptor::BackendKind;
    use crate::mapping::MappedRegion;

    fn memfd(size: usize) -> OwnedFd {
        let fd = rustix::fs::memfd_create("test_ipc", rustix::fs::MemfdFlags::CLOEXEC).unwrap();
        rustix::fs::ftruncate(&fd, size as u64).unwrap();
        fd
    }

    #[test]
    fn test_send_recv_fds() {
        let (sender, receiver) = UnixStream::pair().unwrap();
        let fd = memfd(4096);
        let region = MappedRegion::map_shared(&fd, 4096, 0).unwrap();
        unsafe { *region.as_ptr().as_ptr().add(1000) = 123 };

        send_fds(&sender, &[&fd], b"hello").unwrap();

        let mut buf = [0u8; 16];
        let (len, fds) = recv_fds(&receiver, &mut buf).unwrap();
        assert_eq!(len, 5);
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(fds.len(), 1);

        let received = MappedRegion::map_shared(&fds[0], 4096, 0).unwrap();
        assert_eq!(unsafe { *received.as_ptr().as_ptr().add(1000) }, 123);
    }

    #[test]
    fn test_send_without_fds() {
        let (sender, receiver) = UnixStream::pair().unwrap();
        let empty: &[BorrowedFd<'_>] = &[];
        send_fds(&sender, empty, b"data").unwrap();

        let mut buf = [0u8; 8];
        let (len, fds) = recv_fds(&receiver, &mut buf).unwrap();
        assert_eq!(len, 4);
        assert!(fds.is_empty());
    }

    #[test]
    fn test_too_many_fds() {
        let (sender, _receiver) = UnixStream::pair().unwrap();
        let fds: Vec<OwnedFd> = (0..=MAX_FDS_PER_MESSAGE).map(|_| memfd(1)).collect();
        assert!(matches!(
            send_fds(&sender, &fds, b"x"),
            Err(Error::Io(e)) if e.kind() == io::ErrorKind::InvalidInput
        ));
    }

    #[test]
    fn test_truncated_fds_reported() {
        let (sender, receiver) = UnixStream::pair().unwrap();
        // More fds than the receiver's control buffer holds
        let owned: Vec<OwnedFd> = (0..16).map(|_| memfd(1)).collect();
        let fds: Vec<BorrowedFd<'_>> = owned.iter().map(AsFd::as_fd).collect();
        let mut space = [MaybeUninit::<u8>::uninit(); 256];
        let mut control = SendAncillaryBuffer::new(&mut space);
        assert!(control.push(SendAncillaryMessage::ScmRights(&fds)));
        sendmsg(&sender, &[IoSlice::new(b"x")], &mut control, SendFlags::empty()).unwrap();

        let mut buf = [0u8; 1];
        assert!(matches!(
            recv_fds(&receiver, &mut buf),
            Err(Error::Io(e)) if e.kind() == io::ErrorKind::InvalidData
        ));
    }

    #[test]
    fn test_ump_descriptor_crosses_without_fd() {
        let (sender, receiver) = UnixStream::pair().unwrap();
        let desc = BufferDescriptor::ump(SecureId(0x42), 8192);
        send_descriptor(&sender, &desc).unwrap();

        let received = recv_descriptor(&receiver).unwrap();
        assert_eq!(received.backend_kind(), BackendKind::Ump);
        assert_eq!(received.size(), 8192);
        assert!(received.transfer_fd().is_none());
        assert!(received.base().is_none());
    }

    #[test]
    fn test_short_record_rejected() {
        let (sender, receiver) = UnixStream::pair().unwrap();
        let empty: &[BorrowedFd<'_>] = &[];
        send_fds(&sender, empty, &[0u8; 8]).unwrap();
        assert!(matches!(
            recv_descriptor(&receiver),
            Err(Error::InvalidDescriptor(_))
        ));
    }
}
