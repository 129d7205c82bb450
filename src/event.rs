//! Named events: a process-wide registry of notification channels, with
//! ordered handler dispatch across threads.
//!
//! An [`EventId`] names a channel and fixes its payload mode at creation:
//! either a plain fixed-size byte payload that is copied per report, or a
//! ref-counted heap payload shared by all receiving handlers. Handlers are
//! owned by the thread that registered them; reporting from the owning
//! thread invokes them synchronously in registration order, reporting from
//! anywhere else queues the dispatch to the owning loop through its
//! deferred-function queue.
//!
//! The global registry holds only routing metadata (handler id + owning
//! loop handle); the callbacks themselves live in each loop's thread-
//! confined table, so dispatch never runs under the registry lock.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::{Arc, OnceLock};

use downcast_rs::{impl_downcast, DowncastSync};
use log::{debug, trace};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::context::{self, CurrentCallback};
use crate::event_loop::{self, LoopCore};
use crate::queue::LoopHandle;

/// Marker trait for ref-counted event payloads.
///
/// Blanket-implemented for every `'static + Send + Sync` type; receivers
/// recover the concrete type with [`Report::payload`].
pub trait EventPayload: DowncastSync {}
impl_downcast!(sync EventPayload);
impl<T: Any + Send + Sync> EventPayload for T {}

/// Opaque handle identifying a named notification channel.
///
/// Created once via [`create_id`] or [`create_id_with_ref_counting`]; lives
/// for the process lifetime.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct EventId(u32);

/// Reference to a registered handler, used only for removal and context
/// association.
#[derive(Copy, Clone, Debug)]
pub struct HandlerRef {
    event: EventId,
    handler_id: u64,
    loop_id: u64,
}

/// The payload delivered to a handler.
///
/// Cloning is cheap (reference-counted either way). For a ref-counted
/// report, a handler *retains* the payload past its own invocation simply
/// by keeping a clone; the payload's `Drop` impl is its destructor and runs
/// exactly once, when the last holder releases.
#[derive(Clone)]
pub enum Report {
    /// Plain fixed-size payload, copied once at report time.
    Bytes(Arc<[u8]>),
    /// Ref-counted heap payload, shared by every receiving handler.
    Shared(Arc<dyn EventPayload>),
}

impl Report {
    /// The byte payload of a plain report.
    ///
    /// # Panics
    ///
    /// Panics on a ref-counted report.
    pub fn bytes(&self) -> &[u8] {
        match self {
            Report::Bytes(b) => b,
            Report::Shared(_) => panic!("ref-counted report has no byte payload"),
        }
    }

    /// Downcasts a ref-counted payload to its concrete type.
    pub fn payload<T: EventPayload>(&self) -> Option<Arc<T>> {
        match self {
            Report::Shared(p) => Arc::clone(p).downcast_arc::<T>().ok(),
            Report::Bytes(_) => None,
        }
    }
}

impl fmt::Debug for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Report::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Report::Shared(_) => f.debug_tuple("Shared").finish(),
        }
    }
}

#[derive(Debug, Eq, PartialEq)]
enum PayloadKind {
    Plain(usize),
    RefCounted,
}

struct HandlerSlot {
    handler_id: u64,
    owner: LoopHandle,
}

struct EventRecord {
    name: String,
    kind: PayloadKind,
    /// Registration order; dispatch walks this list front to back.
    handlers: Vec<HandlerSlot>,
}

#[derive(Default)]
struct EventRegistry {
    by_name: FxHashMap<String, EventId>,
    events: Vec<EventRecord>,
    next_handler_id: u64,
}

fn registry() -> &'static Mutex<EventRegistry> {
    static REGISTRY: OnceLock<Mutex<EventRegistry>> = OnceLock::new();
    REGISTRY.get_or_init(Default::default)
}

pub(crate) struct HandlerEntry {
    handler_id: u64,
    name: String,
    event: EventId,
    first: RefCell<Box<dyn FnMut(Report, &mut dyn Any)>>,
    second: RefCell<Box<dyn Any>>,
    context: RefCell<Option<Rc<dyn Any>>>,
    removed: Cell<bool>,
    running: Cell<bool>,
}

/// Creates (or looks up) the event with `name` carrying plain payloads of
/// exactly `payload_size` bytes.
///
/// Registration is idempotent: re-creating with the identical size returns
/// the existing id.
///
/// # Panics
///
/// Panics if `name` is already registered with a different payload size or
/// as a ref-counted event.
pub fn create_id(name: &str, payload_size: usize) -> EventId {
    create(name, PayloadKind::Plain(payload_size))
}

/// Creates (or looks up) the event with `name` carrying ref-counted heap
/// payloads.
///
/// Same idempotency and mismatch rules as [`create_id`].
pub fn create_id_with_ref_counting(name: &str) -> EventId {
    create(name, PayloadKind::RefCounted)
}

fn create(name: &str, kind: PayloadKind) -> EventId {
    let mut reg = registry().lock();
    if let Some(&id) = reg.by_name.get(name) {
        let record = &reg.events[id.0 as usize];
        if record.kind != kind {
            panic!(
                "event '{name}' already registered as {:?}, re-registration as {kind:?} rejected",
                record.kind
            );
        }
        debug!("event '{name}' re-registered (idempotent)");
        return id;
    }

    let id = EventId(reg.events.len() as u32);
    reg.events.push(EventRecord {
        name: name.to_string(),
        kind,
        handlers: Vec::new(),
    });
    reg.by_name.insert(name.to_string(), id);
    trace!("event '{name}' created as {id:?}");
    id
}

/// Registers `f` for `id`, bound to the calling thread's event loop.
///
/// Implemented as the one-layer special case of [`add_layered_handler`]:
/// the caller's closure rides along as the second layer and a generic
/// first layer downcasts and invokes it.
///
/// # Panics
///
/// Panics if the calling thread has no event loop.
pub fn add_handler<F>(name: &str, id: EventId, f: F) -> HandlerRef
where
    F: FnMut(Report) + 'static,
{
    add_layered_handler(
        name,
        id,
        |report, second: &mut dyn Any| {
            let f = second
                .downcast_mut::<F>()
                .expect("second layer holds the registered closure");
            f(report)
        },
        Box::new(f),
    )
}

/// Registers a two-layer handler: `first` receives each report plus the
/// opaque `second` value, transforms the payload however it likes, and
/// invokes the inner callback it downcasts out of `second`.
///
/// This is how one API layer converts a low-level payload into a
/// differently-typed public callback signature without a new registration
/// mechanism per conversion.
pub fn add_layered_handler<F>(
    name: &str,
    id: EventId,
    first: F,
    second: Box<dyn Any>,
) -> HandlerRef
where
    F: FnMut(Report, &mut dyn Any) + 'static,
{
    event_loop::with_current(|core| {
        let handler_id = {
            let mut reg = registry().lock();
            reg.next_handler_id += 1;
            let handler_id = reg.next_handler_id;
            let record = reg
                .events
                .get_mut(id.0 as usize)
                .unwrap_or_else(|| panic!("unregistered event id {id:?}"));
            record.handlers.push(HandlerSlot {
                handler_id,
                owner: core.handle().clone(),
            });
            handler_id
        };

        let entry = Rc::new(HandlerEntry {
            handler_id,
            name: name.to_string(),
            event: id,
            first: RefCell::new(Box::new(first)),
            second: RefCell::new(second),
            context: RefCell::new(None),
            removed: Cell::new(false),
            running: Cell::new(false),
        });
        core.handlers.borrow_mut().insert(handler_id, entry);
        trace!("handler '{name}' added to {id:?}");

        HandlerRef {
            event: id,
            handler_id,
            loop_id: core.loop_id,
        }
    })
}

/// Removes a handler.
///
/// Safe to call from inside the handler's own invocation; the removal is
/// observed by every subsequent dispatch, including later handlers of the
/// same in-flight report batch.
///
/// # Panics
///
/// Panics on a stale reference (double remove) or when called from a
/// thread other than the registering one.
pub fn remove_handler(handler: HandlerRef) {
    event_loop::with_current(|core| {
        if core.loop_id != handler.loop_id {
            panic!("handler removed from a foreign thread");
        }
        let entry = core
            .handlers
            .borrow_mut()
            .remove(&handler.handler_id)
            .unwrap_or_else(|| panic!("stale handler reference (double remove?)"));
        entry.removed.set(true);

        let mut reg = registry().lock();
        if let Some(record) = reg.events.get_mut(handler.event.0 as usize) {
            record.handlers.retain(|s| s.handler_id != handler.handler_id);
        }
        trace!("handler '{}' removed", entry.name);
    })
}

/// Associates opaque context with a handler, retrievable from inside its
/// callback via [`context`].
///
/// # Panics
///
/// Panics on a stale reference or a foreign thread.
pub fn set_context(handler: HandlerRef, ctx: Rc<dyn Any>) {
    event_loop::with_current(|core| {
        if core.loop_id != handler.loop_id {
            panic!("handler context set from a foreign thread");
        }
        let entry = core
            .handlers
            .borrow()
            .get(&handler.handler_id)
            .cloned()
            .unwrap_or_else(|| panic!("stale handler reference"));
        *entry.context.borrow_mut() = Some(ctx);
    })
}

/// The context of the handler whose callback is currently executing.
///
/// # Panics
///
/// Panics when called from anywhere other than inside an event handler
/// callback.
pub fn context() -> Option<Rc<dyn Any>> {
    let entry = context::current_handler()
        .unwrap_or_else(|| panic!("event::context() called outside a handler callback"));
    let ctx = entry.context.borrow().clone();
    ctx
}

/// Reports a plain event.
///
/// The payload is copied once; handlers owned by the calling thread run
/// synchronously, in registration order, before `report` returns. Handlers
/// owned by other threads are queued to their loops, preserving
/// registration order per loop.
///
/// # Panics
///
/// Panics if `id` was created with ref counting, or if `payload` does not
/// match the registered payload size.
pub fn report(id: EventId, payload: &[u8]) {
    let slots = {
        let reg = registry().lock();
        let record = reg
            .events
            .get(id.0 as usize)
            .unwrap_or_else(|| panic!("unregistered event id {id:?}"));
        match record.kind {
            PayloadKind::Plain(size) => {
                if payload.len() != size {
                    panic!(
                        "event '{}' reported with {} bytes, registered payload size is {size}",
                        record.name,
                        payload.len()
                    );
                }
            }
            PayloadKind::RefCounted => panic!(
                "event '{}' was created with ref counting; use report_shared",
                record.name
            ),
        }
        snapshot(record)
    };
    fan_out(slots, Report::Bytes(Arc::from(payload)));
}

/// Reports a ref-counted event.
///
/// Every receiving handler shares the payload; the payload's `Drop` runs
/// exactly once, after the last handler (and any clones it retained) have
/// released it.
///
/// # Panics
///
/// Panics if `id` was not created with ref counting.
pub fn report_shared(id: EventId, payload: Arc<dyn EventPayload>) {
    let slots = {
        let reg = registry().lock();
        let record = reg
            .events
            .get(id.0 as usize)
            .unwrap_or_else(|| panic!("unregistered event id {id:?}"));
        if record.kind != PayloadKind::RefCounted {
            panic!(
                "event '{}' was created with a plain payload; use report",
                record.name
            );
        }
        snapshot(record)
    };
    fan_out(slots, Report::Shared(payload));
}

fn snapshot(record: &EventRecord) -> Vec<(u64, LoopHandle)> {
    record
        .handlers
        .iter()
        .map(|s| (s.handler_id, s.owner.clone()))
        .collect()
}

fn fan_out(slots: Vec<(u64, LoopHandle)>, report: Report) {
    let current = event_loop::try_current_id();
    for (handler_id, owner) in slots {
        if Some(owner.loop_id()) == current {
            dispatch_local(handler_id, report.clone());
        } else {
            let report = report.clone();
            if let Err(e) = owner.queue(move || dispatch_local(handler_id, report)) {
                debug!("dropping report for handler {handler_id} on a dead loop: {e}");
            }
        }
    }
}

/// Runs one handler on its owning thread. Also the body of the closures
/// queued for cross-thread dispatch, which is why it re-resolves the entry:
/// the handler may have been removed (or its loop torn down) between
/// queuing and execution.
pub(crate) fn dispatch_local(handler_id: u64, report: Report) {
    let entry = match event_loop::try_with_current(|core| {
        core.handlers.borrow().get(&handler_id).cloned()
    }) {
        Some(Some(entry)) => entry,
        _ => {
            trace!("dropping report for removed handler {handler_id}");
            return;
        }
    };
    if entry.removed.get() {
        return;
    }
    if entry.running.replace(true) {
        panic!(
            "handler '{}' re-entered; a handler must not synchronously report its own event",
            entry.name
        );
    }

    context::enter(CurrentCallback::Handler(Rc::clone(&entry)), || {
        let mut second = entry.second.borrow_mut();
        let mut first = entry.first.borrow_mut();
        (*first)(report, &mut **second);
    });
    entry.running.set(false);
}

/// Loop teardown: drop this loop's callbacks and unregister their routing
/// slots so reports stop targeting a dead loop.
pub(crate) fn unregister_loop_handlers(core: &LoopCore) {
    let handlers = std::mem::take(&mut *core.handlers.borrow_mut());
    if handlers.is_empty() {
        return;
    }
    let mut reg = registry().lock();
    for (handler_id, entry) in handlers {
        entry.removed.set(true);
        if let Some(record) = reg.events.get_mut(entry.event.0 as usize) {
            record.handlers.retain(|s| s.handler_id != handler_id);
        }
    }
}
