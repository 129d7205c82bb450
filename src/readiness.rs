use crate::epoll::EpollFlags;

/// The set of conditions that actually became ready on a monitored file
/// descriptor, as delivered to an fd monitor callback.
///
/// "Event" in this crate refers to a named notification channel, so the
/// epoll-delivered mask gets its own unambiguous name.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct Readiness(pub(crate) EpollFlags);

impl From<Readiness> for EpollFlags {
    fn from(value: Readiness) -> Self {
        value.bitflags()
    }
}

impl Readiness {
    pub(crate) const fn new(flags: EpollFlags) -> Self {
        Self(flags)
    }

    /// Returns the underlying `EpollFlags` bitmask.
    pub const fn bitflags(&self) -> EpollFlags {
        self.0
    }

    /// Returns `true` if the descriptor is readable.
    ///
    /// This corresponds to the `EPOLLIN` flag.
    pub const fn is_readable(&self) -> bool {
        self.0.contains(EpollFlags::EPOLLIN)
    }

    /// Returns `true` if the descriptor is writable.
    ///
    /// This corresponds to the `EPOLLOUT` flag.
    pub const fn is_writable(&self) -> bool {
        self.0.contains(EpollFlags::EPOLLOUT)
    }

    /// Returns `true` if urgent out-of-band data is pending.
    ///
    /// This corresponds to the `EPOLLPRI` flag.
    pub const fn is_priority(&self) -> bool {
        self.0.contains(EpollFlags::EPOLLPRI)
    }

    /// Returns `true` if an error condition was delivered.
    ///
    /// This corresponds to the `EPOLLERR` flag. Note that this condition is
    /// always reported on a file descriptor, even if not requested in the
    /// interest set.
    pub const fn is_error(&self) -> bool {
        self.0.contains(EpollFlags::EPOLLERR)
    }

    /// Returns `true` if a "hang up" happened on the descriptor.
    ///
    /// This corresponds to the `EPOLLHUP` flag. This can mean the peer has
    /// closed the connection, or the write end of a pipe is closed. Note
    /// that this condition is always reported on a file descriptor, even if
    /// not requested in the interest set.
    pub const fn is_hangup(&self) -> bool {
        self.0.contains(EpollFlags::EPOLLHUP)
    }

    /// Returns `true` if the peer has closed their writing end of the
    /// connection.
    ///
    /// This corresponds to the `EPOLLRDHUP` flag.
    pub const fn is_read_closed(&self) -> bool {
        self.0.contains(EpollFlags::EPOLLRDHUP)
    }

    /// Returns `true` if any condition indicating the peer is gone is set.
    pub const fn is_closed(&self) -> bool {
        self.is_hangup() || self.is_read_closed() || self.is_error()
    }
}
