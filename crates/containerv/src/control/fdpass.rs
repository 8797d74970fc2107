//! Datagram send/receive with `SCM_RIGHTS` descriptors and peer addresses.

use super::proto::{MAX_FDS, MAX_MESSAGE};
use nix::cmsg_space;
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::socket::{
    ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr, recvmsg, sendmsg,
};
use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{BorrowedFd, FromRawFd, OwnedFd, RawFd};

/// Address of an unconnected sender, used to route the reply.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct Peer(UnixAddr);

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.path() {
            Some(path) => write!(f, "Peer({})", path.display()),
            None => write!(f, "Peer({})", self.0),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Datagram {
    pub bytes: Vec<u8>,
    pub fds: Vec<OwnedFd>,
    pub peer: Option<Peer>,
}

/// Sends one datagram, attaching `fds`; `peer` is needed on unconnected
/// sockets.
pub(crate) fn send(socket: RawFd, peer: Option<&Peer>, bytes: &[u8], fds: &[RawFd]) -> io::Result<()> {
    if fds.len() > MAX_FDS {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} descriptors exceed the limit of {MAX_FDS}", fds.len()),
        ));
    }
    let iov = [IoSlice::new(bytes)];
    let rights = [ControlMessage::ScmRights(fds)];
    let cmsgs: &[ControlMessage<'_>] = if fds.is_empty() { &[] } else { &rights };
    let addr = peer.map(|peer| &peer.0);
    loop {
        match sendmsg(socket, &iov, cmsgs, MsgFlags::MSG_NOSIGNAL, addr) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(errno.into()),
        }
    }
}

/// Receives one datagram with any attached descriptors; the descriptors
/// are close-on-exec.
pub(crate) fn recv(socket: RawFd) -> io::Result<Datagram> {
    let mut bytes = vec![0u8; MAX_MESSAGE];
    let mut control = cmsg_space!([RawFd; MAX_FDS]);
    let (received, fds, peer, flags) = loop {
        let mut iov = [IoSliceMut::new(&mut bytes)];
        let msg = match recvmsg::<UnixAddr>(
            socket,
            &mut iov,
            Some(&mut control),
            MsgFlags::MSG_CMSG_CLOEXEC,
        ) {
            Ok(msg) => msg,
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(errno.into()),
        };
        let mut fds = Vec::new();
        for cmsg in msg.cmsgs()? {
            if let ControlMessageOwned::ScmRights(raw) = cmsg {
                // SAFETY: the kernel just installed these descriptors for us.
                fds.extend(raw.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
            }
        }
        break (msg.bytes, fds, msg.address.map(Peer), msg.flags);
    };
    if flags.intersects(MsgFlags::MSG_TRUNC | MsgFlags::MSG_CTRUNC) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "datagram or descriptors truncated",
        ));
    }
    bytes.truncate(received);
    let peer = peer.filter(|peer| peer.0.path().is_some());
    Ok(Datagram { bytes, fds, peer })
}

/// Waits until `socket` is readable; false on timeout.
pub(crate) fn wait_readable(socket: BorrowedFd<'_>, timeout_ms: u16) -> io::Result<bool> {
    let mut fds = [PollFd::new(socket, PollFlags::POLLIN)];
    loop {
        match poll(&mut fds, PollTimeout::from(timeout_ms)) {
            Ok(ready) => return Ok(ready > 0),
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(errno.into()),
        }
    }
}
