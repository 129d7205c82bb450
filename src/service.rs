//! Server side of the messaging layer: advertise a named service and talk
//! to its clients.
//!
//! Advertising binds a seqpacket listener in the service directory and
//! registers it with the calling thread's event loop. Each accepted client
//! gets its own fd monitor and must complete the `Open` handshake before
//! any traffic is delivered; a client hangup tears its session down
//! automatically and runs the close handlers. Advertised names are
//! recorded in a process-wide table so the same name cannot be offered
//! twice from one process.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fs;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::OnceLock;

use log::{debug, trace, warn};
use nix::errno::Errno;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::config;
use crate::error::{Error, Result};
use crate::event_loop::{self, LoopCore};
use crate::fd_monitor::{self, FdMonitorRef};
use crate::interest::interest;
use crate::unix;
use crate::wire::{self, FrameKind, NackReason, HEADER_LEN};
use crate::Readiness;

fn advertised() -> &'static Mutex<FxHashMap<String, u64>> {
    static ADVERTISED: OnceLock<Mutex<FxHashMap<String, u64>>> = OnceLock::new();
    ADVERTISED.get_or_init(Default::default)
}

/// Identifies one connected client of a [`Service`].
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ClientId(u64);

struct ClientConn {
    id: u64,
    fd: OwnedFd,
    monitor: Cell<Option<FdMonitorRef>>,
    transmit: RefCell<VecDeque<Vec<u8>>>,
    /// Handshake completed.
    open: Cell<bool>,
}

pub(crate) struct ServiceCore {
    service_id: u64,
    loop_id: u64,
    name: String,
    path: PathBuf,
    max_payload: usize,
    listener: OwnedFd,
    listener_monitor: Cell<Option<FdMonitorRef>>,
    clients: RefCell<FxHashMap<u64, Rc<ClientConn>>>,
    next_client: Cell<u64>,
    open_handlers: RefCell<Vec<Box<dyn FnMut(ClientId)>>>,
    close_handlers: RefCell<Vec<Box<dyn FnMut(ClientId)>>>,
    recv_handler: RefCell<Option<Box<dyn FnMut(ServerMessage)>>>,
    hidden: Cell<bool>,
}

/// An advertised service.
///
/// Thread-confined to the loop it was advertised on. Dropping the service
/// hides it and tears down every client session.
pub struct Service {
    core: Rc<ServiceCore>,
}

/// One message received from a client.
///
/// A message carrying a correlation id expects exactly one
/// [`respond`](Self::respond). Dropping such a message unanswered logs a
/// warning and sends the client a fault so its call fails instead of
/// hanging.
pub struct ServerMessage {
    service_id: u64,
    client: ClientId,
    txn: u32,
    payload: Vec<u8>,
    responded: bool,
}

impl Service {
    /// Advertises `name` with the default payload limit.
    pub fn advertise(name: &str) -> Result<Service> {
        Self::advertise_with(name, config::DEFAULT_MAX_PAYLOAD)
    }

    /// Advertises `name`, accepting requests up to `max_payload` bytes.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread has no event loop, if `name` is not a
    /// valid service name, or if this process already advertises `name`.
    ///
    /// # Errors
    ///
    /// [`Error::Comm`] if the service directory cannot be created or the
    /// listener cannot be bound.
    pub fn advertise_with(name: &str, max_payload: usize) -> Result<Service> {
        config::validate_name(name);
        event_loop::with_current(|lc| {
            {
                let mut adv = advertised().lock();
                if adv.contains_key(name) {
                    panic!("service '{name}' is already advertised in this process");
                }
                adv.insert(name.to_string(), lc.loop_id);
            }

            let result = Self::bind_and_register(lc, name, max_payload);
            if result.is_err() {
                advertised().lock().remove(name);
            }
            result
        })
    }

    fn bind_and_register(lc: &LoopCore, name: &str, max_payload: usize) -> Result<Service> {
        let dir = config::service_dir();
        fs::create_dir_all(&dir).map_err(Error::Comm)?;
        let path = config::socket_path(name);
        // A stale socket file from a dead process blocks bind; there is no
        // directory daemon to reap it, so the new advertiser does.
        match fs::remove_file(&path) {
            Ok(()) => debug!("removed stale socket {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Comm(e)),
        }

        let listener = unix::seqpacket()?;
        unix::bind_listen(&listener, &path)?;

        let service_id = lc.next_aux_id();
        let core = Rc::new(ServiceCore {
            service_id,
            loop_id: lc.loop_id,
            name: name.to_string(),
            path,
            max_payload,
            listener,
            listener_monitor: Cell::new(None),
            clients: RefCell::new(FxHashMap::default()),
            next_client: Cell::new(1),
            open_handlers: RefCell::new(Vec::new()),
            close_handlers: RefCell::new(Vec::new()),
            recv_handler: RefCell::new(None),
            hidden: Cell::new(false),
        });
        lc.services.borrow_mut().insert(service_id, Rc::clone(&core));

        let monitor = fd_monitor::create(
            &format!("service:{name}"),
            core.listener.as_raw_fd(),
            interest().read(),
            move |_fd, _ready| on_accept_ready(service_id),
        );
        match monitor {
            Ok(m) => core.listener_monitor.set(Some(m)),
            Err(e) => {
                lc.services.borrow_mut().remove(&service_id);
                return Err(e);
            }
        }

        debug!("service '{name}' advertised at {}", core.path.display());
        Ok(Service { core })
    }

    /// The advertised service name.
    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Registers a handler invoked when a client completes the handshake.
    pub fn add_open_handler(&self, f: impl FnMut(ClientId) + 'static) {
        self.core.assert_owner();
        self.core.open_handlers.borrow_mut().push(Box::new(f));
    }

    /// Registers a handler invoked when a client session ends, however it
    /// ends.
    pub fn add_close_handler(&self, f: impl FnMut(ClientId) + 'static) {
        self.core.assert_owner();
        self.core.close_handlers.borrow_mut().push(Box::new(f));
    }

    /// Handler for every request and push arriving from any client.
    ///
    /// Without one, requests are answered with a fault and pushes are
    /// dropped.
    pub fn set_recv_handler(&self, f: impl FnMut(ServerMessage) + 'static) {
        self.core.assert_owner();
        *self.core.recv_handler.borrow_mut() = Some(Box::new(f));
    }

    /// Server-initiated message to one client (no reply expected).
    ///
    /// # Errors
    ///
    /// [`Error::Closed`] if the client is gone.
    pub fn push(&self, client: ClientId, payload: &[u8]) -> Result<()> {
        self.core.assert_owner();
        if payload.len() > self.core.max_payload {
            panic!(
                "payload of {} bytes exceeds the service's maximum of {}",
                payload.len(),
                self.core.max_payload
            );
        }
        send_to_client(
            self.core.service_id,
            client.0,
            wire::encode(FrameKind::Push, 0, payload),
        )
    }

    /// Stops accepting new clients and removes the socket file. Existing
    /// client sessions stay up. Idempotent.
    pub fn hide(&self) {
        self.core.assert_owner();
        self.core.hide();
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.core.shut_down();
        let service_id = self.core.service_id;
        event_loop::try_with_current(|lc| {
            lc.services.borrow_mut().remove(&service_id);
        });
    }
}

impl ServiceCore {
    fn assert_owner(&self) {
        if event_loop::try_current_id() != Some(self.loop_id) {
            panic!(
                "service '{}' used from a thread other than its owner",
                self.name
            );
        }
    }

    fn loop_alive(&self) -> bool {
        event_loop::try_current_id() == Some(self.loop_id)
    }

    fn hide(&self) {
        if self.hidden.replace(true) {
            return;
        }
        if let Some(m) = self.listener_monitor.take() {
            if self.loop_alive() {
                fd_monitor::delete(m);
            }
        }
        unix::shutdown(&self.listener);
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!("could not remove {}: {e}", self.path.display());
            }
        }
        advertised().lock().remove(&self.name);
        debug!("service '{}' hidden", self.name);
    }

    /// Full teardown: hide, then end every client session.
    fn shut_down(self: &Rc<Self>) {
        self.hide();
        let ids: Vec<u64> = self.clients.borrow().keys().copied().collect();
        for id in ids {
            self.drop_client(id);
        }
    }

    fn accept_ready(self: &Rc<Self>) {
        loop {
            match unix::accept(&self.listener) {
                Ok(cfd) => self.add_client(cfd),
                Err(Errno::EAGAIN) => return,
                Err(Errno::ECONNABORTED) => continue,
                Err(e) => {
                    warn!("accept on service '{}' failed: {e}", self.name);
                    return;
                }
            }
        }
    }

    fn add_client(self: &Rc<Self>, cfd: OwnedFd) {
        let client_id = self.next_client.get();
        self.next_client.set(client_id + 1);

        let conn = Rc::new(ClientConn {
            id: client_id,
            fd: cfd,
            monitor: Cell::new(None),
            transmit: RefCell::new(VecDeque::new()),
            open: Cell::new(false),
        });

        let service_id = self.service_id;
        let monitor = fd_monitor::create(
            &format!("service:{}:client:{client_id}", self.name),
            conn.fd.as_raw_fd(),
            interest().read().rdhup(),
            move |_fd, ready| on_client_ready(service_id, client_id, ready),
        );
        match monitor {
            Ok(m) => conn.monitor.set(Some(m)),
            Err(e) => {
                debug!("could not monitor new client of '{}': {e}", self.name);
                return;
            }
        }
        self.clients.borrow_mut().insert(client_id, conn);
        trace!("service '{}': client {client_id} accepted", self.name);
    }

    fn client_ready(self: &Rc<Self>, client_id: u64, ready: Readiness) {
        let conn = match self.clients.borrow().get(&client_id) {
            Some(c) => Rc::clone(c),
            None => return,
        };

        if ready.is_writable() && self.flush_client(&conn).is_err() {
            self.drop_client(client_id);
            return;
        }
        if !(ready.is_readable() || ready.is_closed()) {
            return;
        }

        let mut buf = vec![0u8; HEADER_LEN + self.max_payload.max(4 + 256)];
        loop {
            if !self.clients.borrow().contains_key(&client_id) {
                return;
            }
            match unix::try_recv(&conn.fd, &mut buf) {
                Ok(Some(n)) => {
                    if !self.handle_client_frame(&conn, &buf[..n]) {
                        return;
                    }
                }
                Ok(None) => return,
                Err(_) => {
                    self.drop_client(client_id);
                    return;
                }
            }
        }
    }

    /// Returns `false` once the client is gone.
    fn handle_client_frame(self: &Rc<Self>, conn: &Rc<ClientConn>, buf: &[u8]) -> bool {
        let frame = match wire::decode(buf) {
            Ok(f) => f,
            Err(e) => {
                debug!("malformed frame from client {} of '{}': {e}", conn.id, self.name);
                self.drop_client(conn.id);
                return false;
            }
        };

        match frame.kind {
            FrameKind::Open if !conn.open.get() => {
                let (client_max, protocol) = match wire::decode_open(frame.payload) {
                    Ok(v) => v,
                    Err(_) => {
                        self.drop_client(conn.id);
                        return false;
                    }
                };
                if protocol != self.name {
                    warn!(
                        "client {} of '{}' opened with protocol '{protocol}'",
                        conn.id, self.name
                    );
                    let _ = self.send_client(conn, wire::encode_nack(NackReason::ProtocolMismatch));
                    self.drop_client(conn.id);
                    return false;
                }
                if client_max as usize > self.max_payload {
                    let _ = self.send_client(conn, wire::encode_nack(NackReason::PayloadTooBig));
                    self.drop_client(conn.id);
                    return false;
                }
                let ack =
                    wire::encode_open(FrameKind::OpenAck, self.max_payload as u32, &self.name);
                if self.send_client(conn, ack).is_err() {
                    self.drop_client(conn.id);
                    return false;
                }
                conn.open.set(true);
                trace!("service '{}': client {} session open", self.name, conn.id);
                run_handlers(&self.open_handlers, ClientId(conn.id));
                true
            }
            FrameKind::Request | FrameKind::Push if conn.open.get() => {
                let message = ServerMessage {
                    service_id: self.service_id,
                    client: ClientId(conn.id),
                    txn: if frame.kind == FrameKind::Request {
                        frame.txn
                    } else {
                        0
                    },
                    payload: frame.payload.to_vec(),
                    responded: false,
                };
                let handler = self.recv_handler.borrow_mut().take();
                match handler {
                    Some(mut h) => {
                        h(message);
                        let mut slot = self.recv_handler.borrow_mut();
                        if slot.is_none() {
                            *slot = Some(h);
                        }
                    }
                    // Dropping the message faults the request back.
                    None => debug!(
                        "service '{}' has no recv handler; message from client {} dropped",
                        self.name, conn.id
                    ),
                }
                true
            }
            other => {
                debug!(
                    "unexpected {other:?} frame from client {} of '{}'",
                    conn.id, self.name
                );
                self.drop_client(conn.id);
                false
            }
        }
    }

    fn send_client(&self, conn: &Rc<ClientConn>, frame: Vec<u8>) -> Result<()> {
        if !conn.transmit.borrow().is_empty() {
            conn.transmit.borrow_mut().push_back(frame);
            return Ok(());
        }
        match unix::try_send(&conn.fd, &frame) {
            Ok(true) => Ok(()),
            Ok(false) => {
                conn.transmit.borrow_mut().push_back(frame);
                self.set_client_write_interest(conn, true)
            }
            Err(e) => Err(e),
        }
    }

    fn flush_client(&self, conn: &Rc<ClientConn>) -> Result<()> {
        {
            let mut queue = conn.transmit.borrow_mut();
            if queue.is_empty() {
                return Ok(());
            }
            while let Some(frame) = queue.front() {
                match unix::try_send(&conn.fd, frame) {
                    Ok(true) => {
                        queue.pop_front();
                    }
                    Ok(false) => return Ok(()),
                    Err(e) => return Err(e),
                }
            }
        }
        self.set_client_write_interest(conn, false)
    }

    fn set_client_write_interest(&self, conn: &Rc<ClientConn>, on: bool) -> Result<()> {
        if let Some(monitor) = conn.monitor.get() {
            if on {
                fd_monitor::enable(monitor, interest().write())?;
            } else {
                fd_monitor::disable(monitor, interest().write())?;
            }
        }
        Ok(())
    }

    fn drop_client(self: &Rc<Self>, client_id: u64) {
        let conn = match self.clients.borrow_mut().remove(&client_id) {
            Some(c) => c,
            None => return,
        };
        if let Some(m) = conn.monitor.take() {
            if self.loop_alive() {
                fd_monitor::delete(m);
            }
        }
        unix::shutdown(&conn.fd);
        trace!("service '{}': client {client_id} gone", self.name);
        if conn.open.get() {
            run_handlers(&self.close_handlers, ClientId(client_id));
        }
    }
}

impl ServerMessage {
    /// The message payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// The client this message came from.
    pub fn client(&self) -> ClientId {
        self.client
    }

    /// `true` if the client is blocked (or has a continuation registered)
    /// waiting for [`respond`](Self::respond).
    pub fn needs_response(&self) -> bool {
        self.txn != 0
    }

    /// Sends the reply for this request.
    ///
    /// # Panics
    ///
    /// Panics if the message expects no reply.
    ///
    /// # Errors
    ///
    /// [`Error::Closed`] if the client is gone.
    pub fn respond(mut self, payload: &[u8]) -> Result<()> {
        if self.txn == 0 {
            panic!("respond() called on a message that expects no reply");
        }
        self.responded = true;
        send_to_client(
            self.service_id,
            self.client.0,
            wire::encode(FrameKind::Response, self.txn, payload),
        )
    }
}

impl Drop for ServerMessage {
    fn drop(&mut self) {
        if self.txn != 0 && !self.responded {
            warn!(
                "request txn {} from client {:?} dropped without a response; faulting it",
                self.txn, self.client
            );
            let _ = send_to_client(
                self.service_id,
                self.client.0,
                wire::encode(FrameKind::Fault, self.txn, &[]),
            );
        }
    }
}

fn run_handlers(list: &RefCell<Vec<Box<dyn FnMut(ClientId)>>>, id: ClientId) {
    // Take-and-restore so a handler can register further handlers.
    let mut handlers = std::mem::take(&mut *list.borrow_mut());
    for h in handlers.iter_mut() {
        h(id);
    }
    let mut slot = list.borrow_mut();
    let added = std::mem::take(&mut *slot);
    handlers.extend(added);
    *slot = handlers;
}

fn resolve_service(service_id: u64) -> Option<Rc<ServiceCore>> {
    event_loop::try_with_current(|lc| lc.services.borrow().get(&service_id).cloned()).flatten()
}

fn send_to_client(service_id: u64, client_id: u64, frame: Vec<u8>) -> Result<()> {
    let service = resolve_service(service_id).ok_or(Error::Closed)?;
    let conn = service
        .clients
        .borrow()
        .get(&client_id)
        .cloned()
        .ok_or(Error::Closed)?;
    match service.send_client(&conn, frame) {
        Ok(()) => Ok(()),
        Err(e) => {
            service.drop_client(client_id);
            Err(e)
        }
    }
}

fn on_accept_ready(service_id: u64) {
    if let Some(service) = resolve_service(service_id) {
        service.accept_ready();
    }
}

fn on_client_ready(service_id: u64, client_id: u64, ready: Readiness) {
    if let Some(service) = resolve_service(service_id) {
        service.client_ready(client_id, ready);
    }
}

/// Loop teardown: shut down every service still registered with the dying
/// loop so its sockets and acceptor-table entries are released.
pub(crate) fn teardown_for_loop(core: &LoopCore) {
    let services = std::mem::take(&mut *core.services.borrow_mut());
    for (_, service) in services {
        service.shut_down();
    }
}
