//! Thin wrapper around the thread's readiness-multiplexing primitive.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::ptr;
use std::time::Duration;

use nix::libc;

use crate::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollTimeout};
use crate::{Interest, Readiness};

/// Operations an event loop needs from its readiness primitive.
///
/// [`Poller`] is the real implementor; `MockPollerOps` (behind the `mock`
/// feature) lets the registration and dispatch logic be unit-tested without
/// touching the kernel.
#[cfg_attr(feature = "mock", mockall::automock)]
pub trait PollerOps {
    fn add(&mut self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()>;
    fn modify(&mut self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()>;
    fn delete(&mut self, fd: RawFd) -> io::Result<()>;
    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Vec<(u64, Readiness)>>;
}

pub(crate) struct Poller {
    epoll: Epoll,
    event_buf: Vec<EpollEvent>,
}

impl Poller {
    pub(crate) fn new(capacity: usize) -> io::Result<Self> {
        Ok(Self {
            epoll: Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC).map_err(io::Error::from)?,
            event_buf: vec![EpollEvent::empty(); capacity],
        })
    }
}

impl PollerOps for Poller {
    fn add(&mut self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        let event = EpollEvent::new(interest.bitflags(), token);
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll.add(fd, event).map_err(io::Error::from)
    }

    fn modify(&mut self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        let mut event = EpollEvent::new(interest.bitflags(), token);
        let fd = unsafe { BorrowedFd::borrow_raw(fd) };
        self.epoll.modify(fd, &mut event).map_err(io::Error::from)
    }

    fn delete(&mut self, fd: RawFd) -> io::Result<()> {
        // nix's safe delete wants a BorrowedFd that may already be closed by
        // the caller; go through epoll_ctl directly with a null event.
        let ret = unsafe {
            libc::epoll_ctl(
                self.epoll.0.as_raw_fd(),
                libc::EPOLL_CTL_DEL,
                fd,
                ptr::null_mut(),
            )
        };
        if ret == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Vec<(u64, Readiness)>> {
        let timeout = match timeout {
            None => EpollTimeout::NONE,
            // Beyond-i32-milliseconds waits round down to "no timeout".
            Some(d) => EpollTimeout::try_from(d).unwrap_or(EpollTimeout::NONE),
        };

        let n = self
            .epoll
            .wait(&mut self.event_buf, timeout)
            .map_err(io::Error::from)?;

        Ok(self.event_buf[..n]
            .iter()
            .map(|ev| (ev.data(), Readiness::new(ev.events())))
            .collect())
    }
}
