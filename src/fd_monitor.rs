//! File-descriptor monitors: integrate a descriptor's readiness into the
//! calling thread's event loop.
//!
//! A monitor does not own its descriptor; the caller keeps the fd open for
//! as long as the monitor exists. At most one monitor per descriptor per
//! thread. Monitors are thread-confined: every operation on a
//! [`FdMonitorRef`] must happen on the thread that created it.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::os::fd::RawFd;
use std::rc::Rc;

use log::{debug, trace};

use crate::context::{self, CurrentCallback};
use crate::error::{Error, Result};
use crate::event_loop::{self, LoopCore};
use crate::{Interest, Readiness};

/// Reference to a registered fd monitor.
///
/// Using a reference after [`delete`] is a defect and panics.
#[derive(Copy, Clone, Debug)]
pub struct FdMonitorRef {
    token: u64,
    loop_id: u64,
}

pub(crate) struct MonitorEntry {
    pub(crate) token: u64,
    name: String,
    fd: RawFd,
    interest: Cell<Interest>,
    callback: RefCell<Box<dyn FnMut(RawFd, Readiness)>>,
    pub(crate) context: RefCell<Option<Rc<dyn Any>>>,
    removed: Cell<bool>,
    running: Cell<bool>,
}

/// Registers `fd` with the calling thread's event loop.
///
/// `f` is invoked with the descriptor and the subset of conditions that
/// became ready. Error and hangup conditions are delivered whether or not
/// they were requested.
///
/// # Panics
///
/// Panics if the calling thread has no event loop, or if this thread
/// already monitors `fd`.
///
/// # Errors
///
/// [`Error::Comm`] if the descriptor cannot be registered with the
/// readiness primitive (e.g. it is not pollable).
pub fn create(
    name: &str,
    fd: RawFd,
    interest: Interest,
    f: impl FnMut(RawFd, Readiness) + 'static,
) -> Result<FdMonitorRef> {
    event_loop::with_current(|core| {
        if core.fd_index.borrow().contains_key(&fd) {
            panic!("fd {fd} is already monitored by this thread (monitor '{name}')");
        }

        let token = core.next_token();
        core.poller
            .borrow_mut()
            .add(fd, token, interest)
            .map_err(Error::Comm)?;

        let entry = Rc::new(MonitorEntry {
            token,
            name: name.to_string(),
            fd,
            interest: Cell::new(interest),
            callback: RefCell::new(Box::new(f)),
            context: RefCell::new(None),
            removed: Cell::new(false),
            running: Cell::new(false),
        });
        core.monitors.borrow_mut().insert(token, entry);
        core.fd_index.borrow_mut().insert(fd, token);
        trace!("fd monitor '{name}' created for fd {fd}");

        Ok(FdMonitorRef {
            token,
            loop_id: core.loop_id,
        })
    })
}

/// Deregisters and releases a monitor.
///
/// Safe to call from within the monitor's own callback: the callback is
/// never invoked again once `delete` returns, even if the descriptor was
/// ready in the same wake batch.
///
/// # Panics
///
/// Panics on a stale reference (double delete) or when called from a
/// foreign thread.
pub fn delete(monitor: FdMonitorRef) {
    event_loop::with_current(|core| {
        if core.loop_id != monitor.loop_id {
            panic!("fd monitor deleted from a foreign thread");
        }
        let entry = core
            .monitors
            .borrow_mut()
            .remove(&monitor.token)
            .unwrap_or_else(|| panic!("stale fd monitor reference (double delete?)"));

        entry.removed.set(true);
        core.fd_index.borrow_mut().remove(&entry.fd);

        // The caller may have closed the fd already, in which case the
        // kernel dropped the registration on its own.
        if let Err(e) = core.poller.borrow_mut().delete(entry.fd) {
            debug!("epoll deregistration of fd {} failed: {e}", entry.fd);
        }
        trace!("fd monitor '{}' deleted", entry.name);
    })
}

/// Adds `conditions` to the monitor's interest set.
pub fn enable(monitor: FdMonitorRef, conditions: Interest) -> Result<()> {
    update_interest(monitor, |i| i.union(conditions))
}

/// Removes `conditions` from the monitor's interest set.
pub fn disable(monitor: FdMonitorRef, conditions: Interest) -> Result<()> {
    update_interest(monitor, |i| i.difference(conditions))
}

fn update_interest(
    monitor: FdMonitorRef,
    apply: impl FnOnce(Interest) -> Interest,
) -> Result<()> {
    event_loop::with_current(|core| {
        if core.loop_id != monitor.loop_id {
            panic!("fd monitor reconfigured from a foreign thread");
        }
        let entry = core
            .monitors
            .borrow()
            .get(&monitor.token)
            .cloned()
            .unwrap_or_else(|| panic!("stale fd monitor reference"));

        let updated = apply(entry.interest.get());
        core.poller
            .borrow_mut()
            .modify(entry.fd, entry.token, updated)
            .map_err(Error::Comm)?;
        entry.interest.set(updated);
        Ok(())
    })
}

/// Associates opaque context with the monitor, retrievable from inside its
/// callback via [`context`].
pub fn set_context(monitor: FdMonitorRef, ctx: Rc<dyn Any>) {
    event_loop::with_current(|core| {
        if core.loop_id != monitor.loop_id {
            panic!("fd monitor context set from a foreign thread");
        }
        let entry = core
            .monitors
            .borrow()
            .get(&monitor.token)
            .cloned()
            .unwrap_or_else(|| panic!("stale fd monitor reference"));
        *entry.context.borrow_mut() = Some(ctx);
    })
}

/// The context of the monitor whose callback is currently executing.
///
/// # Panics
///
/// Panics when called from anywhere other than inside an fd monitor
/// callback.
pub fn context() -> Option<Rc<dyn Any>> {
    let entry = context::current_monitor()
        .unwrap_or_else(|| panic!("fd_monitor::context() called outside a monitor callback"));
    let ctx = entry.context.borrow().clone();
    ctx
}

/// Invoked by the loop for each ready token.
pub(crate) fn dispatch(core: &LoopCore, token: u64, ready: Readiness) {
    let entry = match core.monitors.borrow().get(&token) {
        Some(e) => Rc::clone(e),
        // Deleted earlier in this wake batch.
        None => return,
    };
    if entry.removed.get() {
        return;
    }
    if entry.running.replace(true) {
        panic!("fd monitor '{}' re-entered", entry.name);
    }

    trace!(
        "fd monitor '{}': fd {} ready {:?}",
        entry.name,
        entry.fd,
        ready.bitflags()
    );
    let fd = entry.fd;
    context::enter(CurrentCallback::Monitor(Rc::clone(&entry)), || {
        let mut callback = entry.callback.borrow_mut();
        (*callback)(fd, ready);
    });
    entry.running.set(false);
}
