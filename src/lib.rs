//! Per-thread cooperative event loops for Linux, with named events, fd
//! monitors, timers, deferred cross-thread calls, and a Unix-socket
//! service/session messaging layer on top.
//!
//! Each thread runs at most one [`EventLoop`]. Everything registered on a
//! thread — fd monitors, timers, event handlers, sessions, services — is
//! owned by that thread's loop and dispatched by it, one callback at a
//! time. The only two points of inter-thread interaction are reporting a
//! named event (fan-out crosses threads through each owner's
//! deferred-function queue) and [`LoopHandle`], which queues closures onto
//! another thread's loop.
//!
//! ```no_run
//! use eventline::{event, EventLoop};
//!
//! let ev = EventLoop::new()?;
//! let temp = event::create_id("temperature", 4);
//! event::add_handler("display", temp, |report| {
//!     let raw = i32::from_ne_bytes(report.bytes().try_into().unwrap());
//!     println!("{raw} degrees");
//! });
//!
//! // Handlers on this thread run before report() returns.
//! event::report(temp, &25i32.to_ne_bytes());
//! ev.run()?;
//! # Ok::<(), std::io::Error>(())
//! ```

mod context;
mod error;
mod event_loop;
mod interest;
mod poller;
mod readiness;
mod service;
mod session;
mod unix;
mod wire;

pub mod config;
pub mod event;
pub mod fd_monitor;
pub mod queue;
pub mod timer;

/// Re-exports of the underlying epoll types for callers that need to step
/// outside the [`Interest`]/[`Readiness`] wrappers.
pub mod epoll {
    pub use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};
}

pub use crate::error::{Error, Result};
pub use crate::event::{EventId, EventPayload, HandlerRef, Report};
pub use crate::event_loop::EventLoop;
pub use crate::fd_monitor::FdMonitorRef;
pub use crate::interest::{interest, Interest};
#[cfg(feature = "mock")]
#[cfg_attr(docsrs, doc(cfg(feature = "mock")))]
pub use crate::poller::MockPollerOps;
pub use crate::poller::PollerOps;
pub use crate::queue::{queue_function, LoopHandle};
pub use crate::readiness::Readiness;
pub use crate::service::{ClientId, ServerMessage, Service};
pub use crate::session::Session;
pub use crate::timer::{Repeat, TimerRef};
