//! Client side of the messaging layer: a session to a named service.
//!
//! A session is bound to the event loop of the thread that opened it. The
//! session socket is watched by an fd monitor; replies to asynchronous
//! calls and unsolicited server pushes are delivered by the loop.
//! Synchronous calls never re-enter the loop: they block on `poll(2)` on
//! the session socket alone, and any unrelated frame that arrives while
//! blocked is parked and re-queued to the loop for normal delivery. That
//! is also why a handler may itself make a synchronous call — it blocks
//! its thread, nothing more.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use nix::poll::PollFlags;
use rustc_hash::FxHashMap;

use crate::config;
use crate::error::{Error, Result};
use crate::event_loop::{self, LoopCore};
use crate::fd_monitor::{self, FdMonitorRef};
use crate::interest::interest;
use crate::queue;
use crate::timer::{self, Repeat, TimerRef};
use crate::unix;
use crate::wire::{self, FrameKind, NackReason, HEADER_LEN};
use crate::Readiness;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum State {
    Connected,
    Closed,
}

struct Pending {
    callback: Box<dyn FnOnce(Result<Vec<u8>>)>,
    timeout: Option<TimerRef>,
}

pub(crate) struct SessionCore {
    session_id: u64,
    loop_id: u64,
    service: String,
    fd: OwnedFd,
    max_payload: usize,
    state: Cell<State>,
    monitor: Cell<Option<FdMonitorRef>>,
    next_txn: Cell<u32>,
    pending: RefCell<FxHashMap<u32, Pending>>,
    recv_handler: RefCell<Option<Box<dyn FnMut(Vec<u8>)>>>,
    disconnect_handler: RefCell<Option<Box<dyn FnOnce()>>>,
    transmit: RefCell<VecDeque<Vec<u8>>>,
    /// Frames received while a synchronous call was blocked, awaiting
    /// normal delivery on the loop.
    deferred: RefCell<VecDeque<Vec<u8>>>,
}

/// A client session to a named service.
///
/// Thread-confined: every method must be called on the thread whose event
/// loop the session was opened on. Dropping the session disconnects it.
pub struct Session {
    core: Rc<SessionCore>,
}

impl Session {
    /// Connects to `service`, waiting for it to become available.
    ///
    /// Retries while the service is not being offered; every other failure
    /// is returned immediately.
    pub fn connect(service: &str) -> Result<Session> {
        Self::connect_with(service, config::DEFAULT_MAX_PAYLOAD)
    }

    /// [`connect`](Self::connect) with an explicit per-message payload
    /// limit.
    pub fn connect_with(service: &str, max_payload: usize) -> Result<Session> {
        loop {
            match Self::try_connect_with(service, max_payload) {
                Err(Error::Unavailable) => std::thread::sleep(CONNECT_RETRY_DELAY),
                other => return other,
            }
        }
    }

    /// Attempts to connect to `service` without waiting for it to appear.
    ///
    /// # Errors
    ///
    /// - [`Error::Unavailable`]: no server is offering the service.
    /// - [`Error::NotPermitted`]: bindings are configured and `service` is
    ///   not bound.
    /// - [`Error::Comm`]: the service directory is unreachable or the
    ///   transport failed.
    /// - [`Error::Fault`]: the server rejected the handshake.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread has no event loop.
    pub fn try_connect(service: &str) -> Result<Session> {
        Self::try_connect_with(service, config::DEFAULT_MAX_PAYLOAD)
    }

    /// [`try_connect`](Self::try_connect) with an explicit payload limit.
    pub fn try_connect_with(service: &str, max_payload: usize) -> Result<Session> {
        // Fail fast off the loop thread instead of registering a monitor
        // that could never fire.
        event_loop::with_current(|_| ());

        let (target, path) = config::resolve(service)?;
        let fd = unix::seqpacket()?;
        unix::connect(&fd, &path)?;

        let deadline = Some(Instant::now() + HANDSHAKE_TIMEOUT);
        unix::send_deadline(
            &fd,
            &wire::encode_open(FrameKind::Open, max_payload as u32, &target),
            deadline,
        )?;

        let mut buf = vec![0u8; HEADER_LEN + 4 + 256];
        let n = match unix::recv_deadline(&fd, &mut buf, deadline) {
            Ok(n) => n,
            // The listener vanished mid-handshake.
            Err(Error::Closed) => return Err(Error::Unavailable),
            Err(e) => return Err(e),
        };
        let frame = wire::decode(&buf[..n])?;
        match frame.kind {
            FrameKind::OpenAck => {}
            FrameKind::OpenNack => {
                return Err(match wire::decode_nack(frame.payload) {
                    NackReason::PayloadTooBig => {
                        Error::Fault("requested payload size exceeds the service's limit".into())
                    }
                    NackReason::ProtocolMismatch => {
                        Error::Fault("service rejected the protocol".into())
                    }
                });
            }
            other => {
                return Err(Error::Comm(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unexpected {other:?} frame during handshake"),
                )));
            }
        }

        event_loop::with_current(|lc| {
            let session_id = lc.next_aux_id();
            let core = Rc::new(SessionCore {
                session_id,
                loop_id: lc.loop_id,
                service: target.clone(),
                fd,
                max_payload,
                state: Cell::new(State::Connected),
                monitor: Cell::new(None),
                next_txn: Cell::new(1),
                pending: RefCell::new(FxHashMap::default()),
                recv_handler: RefCell::new(None),
                disconnect_handler: RefCell::new(None),
                transmit: RefCell::new(VecDeque::new()),
                deferred: RefCell::new(VecDeque::new()),
            });
            lc.sessions.borrow_mut().insert(session_id, Rc::clone(&core));

            let monitor = fd_monitor::create(
                &format!("session:{target}"),
                core.fd.as_raw_fd(),
                interest().read().rdhup(),
                move |_fd, ready| on_session_ready(session_id, ready),
            );
            match monitor {
                Ok(m) => core.monitor.set(Some(m)),
                Err(e) => {
                    lc.sessions.borrow_mut().remove(&session_id);
                    return Err(e);
                }
            }

            debug!("session to '{target}' connected");
            Ok(Session { core })
        })
    }

    /// The (binding-resolved) name of the service this session talks to.
    pub fn service_name(&self) -> &str {
        &self.core.service
    }

    /// Synchronous request/response.
    ///
    /// Blocks the calling thread until the matching reply arrives, the
    /// deadline expires, or the session closes. With `timeout: None` the
    /// configured default applies
    /// ([`config::set_default_call_timeout`](crate::config::set_default_call_timeout)),
    /// which itself defaults to waiting indefinitely.
    ///
    /// A reply arriving after a timeout is discarded; it can never be
    /// mistaken for the reply to a later call.
    ///
    /// # Errors
    ///
    /// [`Error::Timeout`], [`Error::Closed`] (session closed or peer died
    /// while blocked), [`Error::Fault`] (the server failed to handle the
    /// request), [`Error::Comm`].
    pub fn call(&self, payload: &[u8], timeout: Option<Duration>) -> Result<Vec<u8>> {
        let core = &self.core;
        core.assert_owner();
        if core.state.get() == State::Closed {
            return Err(Error::Closed);
        }
        core.check_payload(payload);

        let txn = core.alloc_txn();
        core.send_frame(wire::encode(FrameKind::Request, txn, payload))?;

        let timeout = timeout.or(config::default_call_timeout());
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut buf = vec![0u8; HEADER_LEN + core.max_payload];

        loop {
            if core.flush_transmit().is_err() {
                return core.sync_peer_death();
            }
            match unix::try_recv(&core.fd, &mut buf) {
                Ok(Some(n)) => {
                    let frame = wire::decode(&buf[..n])?;
                    if frame.txn == txn && frame.kind == FrameKind::Response {
                        return Ok(frame.payload.to_vec());
                    }
                    if frame.txn == txn && frame.kind == FrameKind::Fault {
                        return Err(fault_error(frame.payload));
                    }
                    core.defer_frame(&buf[..n]);
                }
                Ok(None) => {
                    let mut flags = PollFlags::POLLIN;
                    if !core.transmit.borrow().is_empty() {
                        flags |= PollFlags::POLLOUT;
                    }
                    match unix::wait_for(&core.fd, flags, deadline) {
                        Ok(()) => {}
                        Err(Error::Timeout) => {
                            debug!(
                                "call on '{}' timed out (txn {txn}); any late reply will be dropped",
                                core.service
                            );
                            return Err(Error::Timeout);
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(Error::Closed) => return core.sync_peer_death(),
                Err(e) => return Err(e),
            }
        }
    }

    /// Asynchronous request/response: returns immediately, `f` is invoked
    /// by the event loop with the reply, a timeout, or `Closed` if the
    /// session dies first.
    pub fn call_async<F>(&self, payload: &[u8], timeout: Option<Duration>, f: F)
    where
        F: FnOnce(Result<Vec<u8>>) + 'static,
    {
        let core = &self.core;
        core.assert_owner();
        if core.state.get() == State::Closed {
            f(Err(Error::Closed));
            return;
        }
        core.check_payload(payload);

        let txn = core.alloc_txn();
        if let Err(e) = core.send_frame(wire::encode(FrameKind::Request, txn, payload)) {
            f(Err(e));
            return;
        }

        let timeout = timeout.or(config::default_call_timeout());
        let timer = timeout.map(|t| {
            let session_id = core.session_id;
            timer::start(t, Repeat::Times(1), move || on_call_timeout(session_id, txn))
        });
        core.pending.borrow_mut().insert(
            txn,
            Pending {
                callback: Box::new(f),
                timeout: timer,
            },
        );
        trace!("async call txn {txn} pending on '{}'", core.service);
    }

    /// Fire-and-forget message to the server (no reply expected).
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        let core = &self.core;
        core.assert_owner();
        if core.state.get() == State::Closed {
            return Err(Error::Closed);
        }
        core.check_payload(payload);
        core.send_frame(wire::encode(FrameKind::Push, 0, payload))
    }

    /// Handler for unsolicited server-to-client messages.
    pub fn set_recv_handler(&self, f: impl FnMut(Vec<u8>) + 'static) {
        self.core.assert_owner();
        *self.core.recv_handler.borrow_mut() = Some(Box::new(f));
    }

    /// Handler invoked exactly once if the server closes the session
    /// unexpectedly.
    ///
    /// Without one, an unexpected server death is fatal to the process:
    /// the handler exists to salvage state (fail pending work, reconnect,
    /// shut down in order) before anything else happens.
    pub fn set_disconnect_handler(&self, f: impl FnOnce() + 'static) {
        self.core.assert_owner();
        *self.core.disconnect_handler.borrow_mut() = Some(Box::new(f));
    }

    /// Closes the session locally. Every pending call fails with
    /// [`Error::Closed`]. Idempotent; never invokes the disconnect
    /// handler.
    pub fn disconnect(&self) {
        self.core.assert_owner();
        self.core.close_local();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.core.close_local();
    }
}

impl SessionCore {
    fn assert_owner(&self) {
        if event_loop::try_current_id() != Some(self.loop_id) {
            panic!(
                "session to '{}' used from a thread other than its owner",
                self.service
            );
        }
    }

    fn check_payload(&self, payload: &[u8]) {
        if payload.len() > self.max_payload {
            panic!(
                "payload of {} bytes exceeds the session's negotiated maximum of {}",
                payload.len(),
                self.max_payload
            );
        }
    }

    fn alloc_txn(&self) -> u32 {
        loop {
            let txn = self.next_txn.get();
            self.next_txn.set(txn.wrapping_add(1));
            if txn != 0 {
                return txn;
            }
        }
    }

    /// Sends or parks one encoded frame. Frames already parked keep the
    /// queue ordered; a send failure that means "peer gone" runs the
    /// peer-death path.
    fn send_frame(&self, frame: Vec<u8>) -> Result<()> {
        if !self.transmit.borrow().is_empty() {
            self.transmit.borrow_mut().push_back(frame);
            return Ok(());
        }
        match unix::try_send(&self.fd, &frame) {
            Ok(true) => Ok(()),
            Ok(false) => {
                self.transmit.borrow_mut().push_back(frame);
                self.set_write_interest(true)
            }
            Err(Error::Closed) => {
                self.peer_died();
                Err(Error::Closed)
            }
            Err(e) => Err(e),
        }
    }

    fn flush_transmit(&self) -> Result<()> {
        {
            let mut queue = self.transmit.borrow_mut();
            if queue.is_empty() {
                return Ok(());
            }
            while let Some(frame) = queue.front() {
                match unix::try_send(&self.fd, frame) {
                    Ok(true) => {
                        queue.pop_front();
                    }
                    Ok(false) => return Ok(()),
                    Err(e) => return Err(e),
                }
            }
        }
        self.set_write_interest(false)
    }

    fn set_write_interest(&self, on: bool) -> Result<()> {
        if let Some(monitor) = self.monitor.get() {
            if on {
                fd_monitor::enable(monitor, interest().write())?;
            } else {
                fd_monitor::disable(monitor, interest().write())?;
            }
        }
        Ok(())
    }

    fn handle_ready(self: &Rc<Self>, ready: Readiness) {
        if ready.is_writable() && self.flush_transmit().is_err() {
            self.peer_died();
            return;
        }
        if !(ready.is_readable() || ready.is_closed()) {
            return;
        }

        let mut buf = vec![0u8; HEADER_LEN + self.max_payload];
        loop {
            if self.state.get() == State::Closed {
                return;
            }
            match unix::try_recv(&self.fd, &mut buf) {
                Ok(Some(n)) => self.route_frame(&buf[..n]),
                Ok(None) => return,
                Err(e) => {
                    if !matches!(e, Error::Closed) {
                        debug!("session '{}' receive error: {e}", self.service);
                    }
                    self.peer_died();
                    return;
                }
            }
        }
    }

    fn route_frame(&self, buf: &[u8]) {
        let frame = match wire::decode(buf) {
            Ok(f) => f,
            Err(e) => {
                debug!("malformed frame on session '{}': {e}", self.service);
                return;
            }
        };
        match frame.kind {
            FrameKind::Response | FrameKind::Fault => {
                let pending = self.pending.borrow_mut().remove(&frame.txn);
                match pending {
                    Some(p) => {
                        if let Some(t) = p.timeout {
                            timer::stop(t);
                        }
                        let result = if frame.kind == FrameKind::Response {
                            Ok(frame.payload.to_vec())
                        } else {
                            Err(fault_error(frame.payload))
                        };
                        (p.callback)(result);
                    }
                    None => debug!(
                        "late reply for txn {} on '{}' discarded",
                        frame.txn, self.service
                    ),
                }
            }
            FrameKind::Push => {
                // Take-and-restore so the handler can replace itself.
                let handler = self.recv_handler.borrow_mut().take();
                match handler {
                    Some(mut h) => {
                        h(frame.payload.to_vec());
                        let mut slot = self.recv_handler.borrow_mut();
                        if slot.is_none() {
                            *slot = Some(h);
                        }
                    }
                    None => debug!(
                        "unsolicited message from '{}' dropped (no recv handler)",
                        self.service
                    ),
                }
            }
            other => debug!(
                "unexpected {other:?} frame on established session '{}'",
                self.service
            ),
        }
    }

    fn defer_frame(&self, buf: &[u8]) {
        self.deferred.borrow_mut().push_back(buf.to_vec());
        let session_id = self.session_id;
        queue::queue_function(move || process_deferred(session_id));
    }

    fn sync_peer_death(&self) -> Result<Vec<u8>> {
        self.peer_died();
        Err(Error::Closed)
    }

    /// Unexpected peer death: flush pending calls, then either hand control
    /// to the registered disconnect handler (exactly once) or abort.
    fn peer_died(&self) {
        if self.state.get() == State::Closed {
            return;
        }
        self.state.set(State::Closed);
        self.teardown();
        self.flush_pending();

        match self.disconnect_handler.borrow_mut().take() {
            Some(handler) => {
                warn!("service '{}' closed the session unexpectedly", self.service);
                handler();
            }
            None => panic!(
                "service '{}' closed the session unexpectedly and no disconnect handler is registered",
                self.service
            ),
        }
    }

    fn close_local(&self) {
        if self.state.get() == State::Closed {
            return;
        }
        self.state.set(State::Closed);
        debug!("session to '{}' disconnected", self.service);
        self.teardown();
        self.flush_pending();
    }

    fn teardown(&self) {
        let loop_alive = event_loop::try_current_id() == Some(self.loop_id);
        if let Some(monitor) = self.monitor.take() {
            if loop_alive {
                fd_monitor::delete(monitor);
            }
        }
        let session_id = self.session_id;
        event_loop::try_with_current(|lc| {
            lc.sessions.borrow_mut().remove(&session_id);
        });
        unix::shutdown(&self.fd);
    }

    fn flush_pending(&self) {
        let entries: Vec<Pending> = {
            let mut pending = self.pending.borrow_mut();
            pending.drain().map(|(_, p)| p).collect()
        };
        for p in entries {
            if let Some(t) = p.timeout {
                timer::stop(t);
            }
            (p.callback)(Err(Error::Closed));
        }
    }
}

fn fault_error(payload: &[u8]) -> Error {
    if payload.is_empty() {
        Error::Fault("service failed to handle the request".into())
    } else {
        Error::Fault(String::from_utf8_lossy(payload).into_owned())
    }
}

fn resolve(session_id: u64) -> Option<Rc<SessionCore>> {
    event_loop::try_with_current(|lc| lc.sessions.borrow().get(&session_id).cloned()).flatten()
}

fn on_session_ready(session_id: u64, ready: Readiness) {
    if let Some(core) = resolve(session_id) {
        core.handle_ready(ready);
    }
}

fn on_call_timeout(session_id: u64, txn: u32) {
    let Some(core) = resolve(session_id) else { return };
    let pending = core.pending.borrow_mut().remove(&txn);
    if let Some(p) = pending {
        debug!(
            "async call txn {txn} on '{}' timed out; any late reply will be dropped",
            core.service
        );
        (p.callback)(Err(Error::Timeout));
    }
}

fn process_deferred(session_id: u64) {
    let Some(core) = resolve(session_id) else { return };
    loop {
        let frame = core.deferred.borrow_mut().pop_front();
        match frame {
            Some(f) if core.state.get() == State::Connected => core.route_frame(&f),
            _ => return,
        }
    }
}

/// Loop teardown: close every session still registered with the dying
/// loop. Local close semantics — pending calls fail with `Closed`, no
/// disconnect handlers run.
pub(crate) fn teardown_for_loop(core: &LoopCore) {
    let sessions = std::mem::take(&mut *core.sessions.borrow_mut());
    for (_, session) in sessions {
        session.close_local();
    }
}
