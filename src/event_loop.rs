//! The per-thread cooperative event loop.
//!
//! A thread creates at most one [`EventLoop`]; module-level entry points
//! (`fd_monitor::create`, `timer::start`, `event::add_handler`,
//! `queue::queue_function`, session and service construction) implicitly
//! bind to the calling thread's loop. The loop multiplexes fd monitors,
//! timers, and the deferred-function wake descriptor, dispatching each
//! ready source's callback to completion before servicing the next — no two
//! callbacks on one thread ever overlap.

use std::cell::{Cell, RefCell};
use std::io;
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace};
use rustc_hash::FxHashMap;

use crate::interest::interest;
use crate::poller::{Poller, PollerOps};
use crate::queue::{LoopHandle, WakeQueue};
use crate::timer::TimerTable;
use crate::{event, fd_monitor, service, session, timer};

/// Token reserved for the deferred-function wake descriptor; real monitors
/// start at 1.
const WAKE_TOKEN: u64 = 0;

const EVENT_BUF_CAPACITY: usize = 256;

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: RefCell<Option<Rc<LoopCore>>> = const { RefCell::new(None) };
}

pub(crate) struct LoopCore {
    pub(crate) loop_id: u64,
    pub(crate) poller: RefCell<Box<dyn PollerOps>>,
    pub(crate) monitors: RefCell<FxHashMap<u64, Rc<fd_monitor::MonitorEntry>>>,
    pub(crate) fd_index: RefCell<FxHashMap<i32, u64>>,
    pub(crate) timers: RefCell<TimerTable>,
    pub(crate) handlers: RefCell<FxHashMap<u64, Rc<event::HandlerEntry>>>,
    pub(crate) sessions: RefCell<FxHashMap<u64, Rc<session::SessionCore>>>,
    pub(crate) services: RefCell<FxHashMap<u64, Rc<service::ServiceCore>>>,
    wake: WakeQueue,
    handle: LoopHandle,
    running: Cell<bool>,
    next_token: Cell<u64>,
    next_aux_id: Cell<u64>,
}

impl LoopCore {
    pub(crate) fn handle(&self) -> &LoopHandle {
        &self.handle
    }

    pub(crate) fn next_token(&self) -> u64 {
        let t = self.next_token.get();
        self.next_token.set(t + 1);
        t
    }

    /// Ids for loop-owned objects that are not monitors (sessions,
    /// services, clients).
    pub(crate) fn next_aux_id(&self) -> u64 {
        let t = self.next_aux_id.get();
        self.next_aux_id.set(t + 1);
        t
    }

    fn run_once_opt(&self, caller_timeout: Option<Duration>) -> io::Result<()> {
        if self.running.replace(true) {
            panic!("recursive call to EventLoop::run from inside a callback");
        }
        let _guard = RunningGuard(&self.running);

        let timeout = timer::poll_timeout(self, caller_timeout);
        let ready = self.poller.borrow_mut().wait(timeout)?;

        timer::fire_due(self);

        for (token, readiness) in ready {
            if token == WAKE_TOKEN {
                self.wake.drain_and_run();
            } else {
                fd_monitor::dispatch(self, token, readiness);
            }
        }

        Ok(())
    }
}

struct RunningGuard<'a>(&'a Cell<bool>);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// A single thread's event loop.
///
/// `!Send`: the loop lives and dies on the thread that created it.
pub struct EventLoop {
    core: Rc<LoopCore>,
}

impl EventLoop {
    /// Creates the loop and installs it as the calling thread's loop.
    ///
    /// # Panics
    ///
    /// Panics if this thread already has an event loop.
    pub fn new() -> io::Result<EventLoop> {
        Self::with_poller(Box::new(Poller::new(EVENT_BUF_CAPACITY)?))
    }

    pub(crate) fn with_poller(mut poller: Box<dyn PollerOps>) -> io::Result<EventLoop> {
        let (wake, tx) = WakeQueue::new()?;
        let loop_id = NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed);
        let handle = LoopHandle::new(loop_id, Arc::clone(wake.wake_fd()), tx);

        poller.add(wake.wake_fd().as_raw_fd(), WAKE_TOKEN, interest().read())?;

        let core = Rc::new(LoopCore {
            loop_id,
            poller: RefCell::new(poller),
            monitors: RefCell::new(FxHashMap::default()),
            fd_index: RefCell::new(FxHashMap::default()),
            timers: RefCell::new(TimerTable::default()),
            handlers: RefCell::new(FxHashMap::default()),
            sessions: RefCell::new(FxHashMap::default()),
            services: RefCell::new(FxHashMap::default()),
            wake,
            handle,
            running: Cell::new(false),
            next_token: Cell::new(WAKE_TOKEN + 1),
            next_aux_id: Cell::new(1),
        });

        CURRENT.with(|slot| {
            let mut slot = slot.borrow_mut();
            if slot.is_some() {
                panic!("this thread already has an event loop");
            }
            *slot = Some(Rc::clone(&core));
        });
        trace!("event loop {loop_id} created");

        Ok(EventLoop { core })
    }

    /// Returns a cloneable, sendable handle to this loop.
    pub fn handle(&self) -> LoopHandle {
        self.core.handle.clone()
    }

    /// Runs the loop until the thread is torn down.
    ///
    /// Only `EINTR` is swallowed; any other poll-level failure is returned.
    pub fn run(&self) -> io::Result<()> {
        loop {
            match self.run_once() {
                Ok(()) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Waits (indefinitely) for at least one source to become ready and
    /// services everything that did.
    pub fn run_once(&self) -> io::Result<()> {
        self.core.run_once_opt(None)
    }

    /// Like [`run_once`](Self::run_once), but gives up after `timeout` if
    /// nothing became ready.
    pub fn run_once_timeout(&self, timeout: Duration) -> io::Result<()> {
        self.core.run_once_opt(Some(timeout))
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // Teardown runs while this loop is still the thread's current loop,
        // because pending-call flushes and close handlers may call back in.
        session::teardown_for_loop(&self.core);
        service::teardown_for_loop(&self.core);
        event::unregister_loop_handlers(&self.core);

        self.core.handle.mark_dead();

        CURRENT.with(|slot| {
            let mut slot = slot.borrow_mut();
            if let Some(current) = &*slot {
                if current.loop_id == self.core.loop_id {
                    *slot = None;
                }
            }
        });
        debug!("event loop {} torn down", self.core.loop_id);
    }
}

/// Runs `f` with the calling thread's loop.
///
/// # Panics
///
/// Panics if the thread has no event loop.
pub(crate) fn with_current<R>(f: impl FnOnce(&LoopCore) -> R) -> R {
    CURRENT.with(|slot| {
        let slot = slot.borrow();
        let core = slot
            .as_ref()
            .unwrap_or_else(|| panic!("this thread has no event loop"));
        f(core)
    })
}

pub(crate) fn try_with_current<R>(f: impl FnOnce(&LoopCore) -> R) -> Option<R> {
    CURRENT.with(|slot| {
        let slot = slot.borrow();
        slot.as_ref().map(|core| f(core))
    })
}

pub(crate) fn try_current_id() -> Option<u64> {
    CURRENT.with(|slot| slot.borrow().as_ref().map(|core| core.loop_id))
}
