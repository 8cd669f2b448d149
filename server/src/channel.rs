//! Master↔worker descriptor channel.
//!
//! One connected local-domain socket pair per worker carries two rails: the
//! in-band control messages of [`crate::ipc`], and out-of-band descriptor
//! hand-offs where the accepted client socket rides as `SCM_RIGHTS`
//! ancillary data next to its metadata frame. The pair uses
//! `SOCK_SEQPACKET` so every frame is delivered whole and ancillary
//! descriptors can never straddle frame boundaries.

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::errno::Errno;
use nix::sys::socket::{
    recvmsg, sendmsg, socketpair, AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags,
    SockFlag, SockType,
};

use crate::ipc::{Handoff, IpcMessage};

/// Upper bound on a single control frame.
const MAX_FRAME: usize = 64 * 1024;

/// One frame received from the peer endpoint.
#[derive(Debug)]
pub enum Received {
    /// In-band control message.
    Control(IpcMessage),
    /// Descriptor hand-off: metadata plus the freshly installed socket.
    Handoff(Handoff, OwnedFd),
}

/// One endpoint of the bidirectional master↔worker pair.
///
/// Both endpoints are nonblocking; a send that would block reports
/// `WouldBlock` and is treated by callers as transient back-pressure.
#[derive(Debug)]
pub struct Channel {
    fd: OwnedFd,
}

impl Channel {
    /// Creates a connected nonblocking endpoint pair. The master keeps one
    /// end, the worker inherits the other across fork (or takes it onto its
    /// thread in single-process mode).
    pub fn pair() -> io::Result<(Channel, Channel)> {
        let (master, worker) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        )
        .map_err(to_io)?;

        Ok((Channel { fd: master }, Channel { fd: worker }))
    }

    /// Whether this platform can transfer descriptors between processes.
    /// Where it cannot, the core degrades to single-process mode.
    pub fn supports_descriptor_passing() -> bool {
        cfg!(unix)
    }

    /// Sends an in-band control message.
    pub fn send(&self, message: &IpcMessage) -> io::Result<()> {
        self.send_frame(&message.encode(), &[])
    }

    /// Sends a hand-off frame carrying the accepted client descriptor as
    /// ancillary data. The kernel installs an independent descriptor for
    /// the same socket at the receiving end.
    pub fn send_handoff(&self, meta: &Handoff, fd: RawFd) -> io::Result<()> {
        self.send_frame(&meta.encode(), &[fd])
    }

    fn send_frame(&self, frame: &[u8], fds: &[RawFd]) -> io::Result<()> {
        let iov = [IoSlice::new(frame)];
        let mut cmsgs = Vec::with_capacity(1);
        if !fds.is_empty() {
            cmsgs.push(ControlMessage::ScmRights(fds));
        }

        loop {
            match sendmsg::<()>(
                self.fd.as_raw_fd(),
                &iov,
                &cmsgs,
                MsgFlags::empty(),
                None,
            ) {
                Ok(_) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(to_io(errno)),
            }
        }
    }

    /// Receives one frame.
    ///
    /// `WouldBlock` means the channel is drained for this tick. A
    /// zero-length read means the peer endpoint is gone and surfaces as
    /// `UnexpectedEof`.
    pub fn recv(&self) -> io::Result<Received> {
        let mut buf = vec![0u8; MAX_FRAME];
        let mut cmsg_space = nix::cmsg_space!([RawFd; 2]);

        let (bytes, fd) = loop {
            let mut iov = [IoSliceMut::new(&mut buf)];

            match recvmsg::<()>(
                self.fd.as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_space),
                MsgFlags::empty(),
            ) {
                Ok(msg) => {
                    let mut received = None;
                    if let Ok(cmsgs) = msg.cmsgs() {
                        for cmsg in cmsgs {
                            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                                for raw in fds {
                                    // SAFETY: the kernel installed this
                                    // descriptor for us during recvmsg; we
                                    // are its sole owner.
                                    let owned = unsafe { OwnedFd::from_raw_fd(raw) };
                                    if received.is_none() {
                                        received = Some(owned);
                                    }
                                }
                            }
                        }
                    }
                    break (msg.bytes, received);
                }
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(to_io(errno)),
            }
        };

        if bytes == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "channel peer closed",
            ));
        }

        let frame = &buf[..bytes];
        match fd {
            Some(fd) => Ok(Received::Handoff(Handoff::decode(frame)?, fd)),
            None => Ok(Received::Control(IpcMessage::decode(frame)?)),
        }
    }
}

impl AsRawFd for Channel {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

fn to_io(errno: Errno) -> io::Error {
    io::Error::from_raw_os_error(errno as i32)
}
