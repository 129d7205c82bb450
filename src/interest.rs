//! This module defines `Interest`, the type used to specify which readiness
//! conditions of a file descriptor an [`FdMonitorRef`](crate::FdMonitorRef)
//! watches for.
//!
//! `Interest` is a type-safe wrapper around raw `epoll` flags, providing a
//! fluent builder-style API to construct the desired set of conditions.

use crate::epoll::EpollFlags;

/// Represents interest in I/O readiness conditions.
///
/// This is a wrapper around `EpollFlags` that provides a fluent API for
/// building an interest set: what conditions (readable, writable, ...) a
/// monitor wants delivered for its file descriptor.
///
/// Error and hangup conditions are always delivered by the kernel whether or
/// not they are requested here.
#[derive(Copy, Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[repr(transparent)]
pub struct Interest(EpollFlags);

impl Default for Interest {
    /// Creates a default `Interest` with no conditions set.
    fn default() -> Self {
        Self(EpollFlags::empty())
    }
}

impl From<EpollFlags> for Interest {
    fn from(value: EpollFlags) -> Self {
        Self::new(value)
    }
}

impl From<Interest> for EpollFlags {
    fn from(value: Interest) -> Self {
        value.bitflags()
    }
}

impl Interest {
    /// Creates a new `Interest` from raw `EpollFlags`.
    pub const fn new(flags: EpollFlags) -> Self {
        Self(flags)
    }

    /// Returns the underlying `EpollFlags` bitmask.
    pub const fn bitflags(&self) -> EpollFlags {
        self.0
    }

    /// A private helper to add flags in a const context.
    const fn add(self, flags: EpollFlags) -> Self {
        Self(EpollFlags::from_bits_retain(self.0.bits() | flags.bits()))
    }

    /// A private helper to remove flags in a const context.
    const fn remove(self, flags: EpollFlags) -> Self {
        Self(self.0.difference(flags))
    }

    /// Adds readable interest (`EPOLLIN`).
    pub const fn read(self) -> Self {
        self.add(EpollFlags::EPOLLIN)
    }

    /// Adds writable interest (`EPOLLOUT`).
    pub const fn write(self) -> Self {
        self.add(EpollFlags::EPOLLOUT)
    }

    /// Adds both readable and writable interest.
    pub const fn read_write(self) -> Self {
        self.add(EpollFlags::EPOLLIN).add(EpollFlags::EPOLLOUT)
    }

    /// Adds interest in the peer closing the write half of the connection
    /// (`EPOLLRDHUP`).
    pub const fn rdhup(self) -> Self {
        self.add(EpollFlags::EPOLLRDHUP)
    }

    /// Adds interest in priority events (`EPOLLPRI`).
    pub const fn pri(self) -> Self {
        self.add(EpollFlags::EPOLLPRI)
    }

    /// Sets edge-triggered mode (`EPOLLET`).
    ///
    /// Note: Level-triggered mode is the default and cannot be explicitly
    /// added.
    pub const fn edge_triggered(self) -> Self {
        self.add(EpollFlags::EPOLLET)
    }

    /// Sets one-shot mode (`EPOLLONESHOT`).
    ///
    /// After a condition is delivered for the file descriptor, it is disabled
    /// until it is re-armed.
    pub const fn oneshot(self) -> Self {
        self.add(EpollFlags::EPOLLONESHOT)
    }

    /// Removes readable interest (`EPOLLIN`).
    pub const fn remove_read(self) -> Self {
        self.remove(EpollFlags::EPOLLIN)
    }

    /// Removes writable interest (`EPOLLOUT`).
    pub const fn remove_write(self) -> Self {
        self.remove(EpollFlags::EPOLLOUT)
    }

    /// Removes interest in the peer closing the write half of the connection
    /// (`EPOLLRDHUP`).
    pub const fn remove_rdhup(self) -> Self {
        self.remove(EpollFlags::EPOLLRDHUP)
    }

    /// Removes interest in priority events (`EPOLLPRI`).
    pub const fn remove_pri(self) -> Self {
        self.remove(EpollFlags::EPOLLPRI)
    }

    /// Returns `true` if every condition in `other` is also set in `self`.
    pub const fn contains(&self, other: Interest) -> bool {
        self.0.contains(other.0)
    }

    /// Merges the conditions of `other` into `self`.
    pub const fn union(self, other: Interest) -> Self {
        self.add(other.0)
    }

    /// Removes the conditions of `other` from `self`.
    pub const fn difference(self, other: Interest) -> Self {
        self.remove(other.0)
    }
}

/// Creates a new, empty `Interest` set.
///
/// This is a convenience function equivalent to `Interest::default()`.
/// It's the starting point for building an interest set using the fluent API.
pub const fn interest() -> Interest {
    Interest::new(EpollFlags::empty())
}
