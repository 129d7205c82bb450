//! Thread-local record of the callback currently executing on this thread.
//!
//! Set immediately before a handler or fd monitor callback is invoked and
//! cleared immediately after, so that `event::context()` and
//! `fd_monitor::context()` can resolve "the current callback's" context
//! without threading it through every signature. Kept as a stack because a
//! handler may synchronously report another event.

use std::cell::RefCell;
use std::rc::Rc;

use crate::event::HandlerEntry;
use crate::fd_monitor::MonitorEntry;

pub(crate) enum CurrentCallback {
    Handler(Rc<HandlerEntry>),
    Monitor(Rc<MonitorEntry>),
}

thread_local! {
    static STACK: RefCell<Vec<CurrentCallback>> = const { RefCell::new(Vec::new()) };
}

struct PopGuard;

impl Drop for PopGuard {
    fn drop(&mut self) {
        STACK.with(|s| {
            s.borrow_mut().pop();
        });
    }
}

/// Runs `f` with `current` as the innermost executing callback.
pub(crate) fn enter<R>(current: CurrentCallback, f: impl FnOnce() -> R) -> R {
    STACK.with(|s| s.borrow_mut().push(current));
    let _guard = PopGuard;
    f()
}

/// The handler entry whose callback is currently executing, if the innermost
/// callback on this thread is an event handler.
pub(crate) fn current_handler() -> Option<Rc<HandlerEntry>> {
    STACK.with(|s| match s.borrow().last() {
        Some(CurrentCallback::Handler(e)) => Some(Rc::clone(e)),
        _ => None,
    })
}

/// The monitor entry whose callback is currently executing, if the innermost
/// callback on this thread is an fd monitor callback.
pub(crate) fn current_monitor() -> Option<Rc<MonitorEntry>> {
    STACK.with(|s| match s.borrow().last() {
        Some(CurrentCallback::Monitor(e)) => Some(Rc::clone(e)),
        _ => None,
    })
}
