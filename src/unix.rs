//! Seqpacket Unix-socket plumbing shared by the client and server sides of
//! the messaging layer.
//!
//! All sockets are created non-blocking; blocking behavior (the connect
//! handshake, synchronous calls) is built with `poll(2)` plus a deadline on
//! top of the non-blocking primitives.

use std::os::fd::{AsFd, AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::socket::{self, AddressFamily, Backlog, MsgFlags, SockFlag, SockType, UnixAddr};

use crate::error::{Error, Result};

pub(crate) fn seqpacket() -> Result<OwnedFd> {
    socket::socket(
        AddressFamily::Unix,
        SockType::SeqPacket,
        SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
        None,
    )
    .map_err(Error::from)
}

/// Connects to `path`, mapping the usual "nobody is listening" errors to
/// [`Error::Unavailable`].
pub(crate) fn connect(fd: &OwnedFd, path: &Path) -> Result<()> {
    let addr = UnixAddr::new(path).map_err(Error::from)?;
    match socket::connect(fd.as_raw_fd(), &addr) {
        Ok(()) => Ok(()),
        // Backlog full behaves like a not-yet-ready server.
        Err(Errno::ENOENT | Errno::ECONNREFUSED | Errno::EAGAIN) => Err(Error::Unavailable),
        Err(Errno::EINPROGRESS) => {
            // Rare for unix sockets; wait until the kernel finishes.
            wait_for(fd, PollFlags::POLLOUT, Some(Instant::now() + Duration::from_secs(5)))?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn bind_listen(fd: &OwnedFd, path: &Path) -> Result<()> {
    let addr = UnixAddr::new(path).map_err(Error::from)?;
    socket::bind(fd.as_raw_fd(), &addr).map_err(Error::from)?;
    socket::listen(fd, Backlog::MAXCONN).map_err(Error::from)?;
    Ok(())
}

pub(crate) fn accept(listener: &OwnedFd) -> nix::Result<OwnedFd> {
    let fd = socket::accept4(
        listener.as_raw_fd(),
        SockFlag::SOCK_CLOEXEC | SockFlag::SOCK_NONBLOCK,
    )?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Non-blocking send of one datagram. `Ok(false)` means the socket buffer
/// is full and the frame was not sent.
///
/// `MSG_NOSIGNAL` keeps a dead peer from raising `SIGPIPE`; it surfaces as
/// `EPIPE` and becomes [`Error::Closed`].
pub(crate) fn try_send(fd: &OwnedFd, frame: &[u8]) -> Result<bool> {
    match socket::send(fd.as_raw_fd(), frame, MsgFlags::MSG_NOSIGNAL) {
        Ok(_) => Ok(true),
        Err(Errno::EAGAIN) => Ok(false),
        Err(Errno::EPIPE | Errno::ECONNRESET) => Err(Error::Closed),
        Err(e) => Err(e.into()),
    }
}

/// Non-blocking receive of one datagram into `buf`.
///
/// `Ok(None)` when nothing is queued; `Err(Closed)` on end-of-stream. An
/// empty datagram is indistinguishable from EOF on seqpacket, which is fine
/// here: no valid frame is shorter than the header.
pub(crate) fn try_recv(fd: &OwnedFd, buf: &mut [u8]) -> Result<Option<usize>> {
    match socket::recv(fd.as_raw_fd(), buf, MsgFlags::empty()) {
        Ok(0) => Err(Error::Closed),
        Ok(n) => Ok(Some(n)),
        Err(Errno::EAGAIN) => Ok(None),
        Err(Errno::ECONNRESET) => Err(Error::Closed),
        Err(e) => Err(e.into()),
    }
}

/// Blocking send with a deadline, for the handshake phase only.
pub(crate) fn send_deadline(fd: &OwnedFd, frame: &[u8], deadline: Option<Instant>) -> Result<()> {
    loop {
        if try_send(fd, frame)? {
            return Ok(());
        }
        wait_for(fd, PollFlags::POLLOUT, deadline)?;
    }
}

/// Blocking receive with a deadline, for the handshake phase only.
pub(crate) fn recv_deadline(
    fd: &OwnedFd,
    buf: &mut [u8],
    deadline: Option<Instant>,
) -> Result<usize> {
    loop {
        if let Some(n) = try_recv(fd, buf)? {
            return Ok(n);
        }
        wait_for(fd, PollFlags::POLLIN, deadline)?;
    }
}

/// Waits until `flags` (or an error/hangup condition) is ready, or the
/// deadline passes.
pub(crate) fn wait_for(fd: &OwnedFd, flags: PollFlags, deadline: Option<Instant>) -> Result<()> {
    loop {
        let timeout = poll_timeout(deadline);
        let mut fds = [PollFd::new(fd.as_fd(), flags)];
        match poll(&mut fds, timeout) {
            Ok(0) => return Err(Error::Timeout),
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

pub(crate) fn poll_timeout(deadline: Option<Instant>) -> PollTimeout {
    match deadline {
        None => PollTimeout::NONE,
        Some(d) => {
            let remaining = d.saturating_duration_since(Instant::now());
            let ms = remaining.as_millis().min(i32::MAX as u128) as i32;
            PollTimeout::try_from(ms).unwrap_or(PollTimeout::MAX)
        }
    }
}

pub(crate) fn shutdown(fd: &OwnedFd) {
    let _ = socket::shutdown(fd.as_raw_fd(), socket::Shutdown::Both);
}
