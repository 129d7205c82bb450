//! Timers bound to the calling thread's event loop.
//!
//! Expiries are driven off the loop's poll timeout rather than a timerfd:
//! the loop sleeps until the nearest deadline and fires whatever came due.
//! A repeating timer re-arms from its previous deadline, so the period does
//! not accumulate callback latency as drift.

use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::rc::Rc;
use std::time::{Duration, Instant};

use log::trace;
use rustc_hash::FxHashMap;

use crate::event_loop::{self, LoopCore};

/// How many times a timer fires before its reference goes stale.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Repeat {
    Times(u32),
    Forever,
}

/// Reference to a running timer, used only to stop it.
///
/// A `TimerRef` is single-use: once the timer has fired its last expiry the
/// reference goes stale, and [`stop`] on a stale reference is a no-op (an
/// expired timer is indistinguishable from an already-stopped one).
#[derive(Copy, Clone, Debug)]
pub struct TimerRef {
    timer_id: u64,
    loop_id: u64,
}

pub(crate) struct TimerEntry {
    timer_id: u64,
    interval: Duration,
    /// `None` = forever.
    remaining: Cell<Option<u32>>,
    deadline: Cell<Instant>,
    callback: RefCell<Box<dyn FnMut()>>,
    cancelled: Cell<bool>,
    running: Cell<bool>,
}

#[derive(Default)]
pub(crate) struct TimerTable {
    entries: FxHashMap<u64, Rc<TimerEntry>>,
    /// Lazily cleaned: re-arming pushes a fresh node and leaves the old one
    /// to be skipped when it surfaces.
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    next_id: u64,
}

/// Starts a timer on the calling thread's event loop.
///
/// `f` is invoked by the loop at each expiry. `Repeat::Times(n)` fires
/// exactly `n` times and then the reference goes stale.
///
/// # Panics
///
/// Panics if the calling thread has no event loop, or if `repeat` is
/// `Repeat::Times(0)`.
pub fn start(interval: Duration, repeat: Repeat, f: impl FnMut() + 'static) -> TimerRef {
    let remaining = match repeat {
        Repeat::Times(0) => panic!("timer started with a repeat count of zero"),
        Repeat::Times(n) => Some(n),
        Repeat::Forever => None,
    };

    event_loop::with_current(|core| {
        let mut table = core.timers.borrow_mut();
        table.next_id += 1;
        let timer_id = table.next_id;
        let deadline = Instant::now() + interval;

        let entry = Rc::new(TimerEntry {
            timer_id,
            interval,
            remaining: Cell::new(remaining),
            deadline: Cell::new(deadline),
            callback: RefCell::new(Box::new(f)),
            cancelled: Cell::new(false),
            running: Cell::new(false),
        });
        table.entries.insert(timer_id, entry);
        table.heap.push(Reverse((deadline, timer_id)));
        trace!("timer {timer_id} armed: {interval:?}, {repeat:?}");

        TimerRef {
            timer_id,
            loop_id: core.loop_id,
        }
    })
}

/// Stops a timer. No-op if it already expired or was already stopped.
///
/// # Panics
///
/// Panics if called from a thread other than the one the timer was started
/// on.
pub fn stop(timer: TimerRef) {
    event_loop::with_current(|core| {
        if core.loop_id != timer.loop_id {
            panic!("timer stopped from a foreign thread");
        }
        if let Some(entry) = core.timers.borrow_mut().entries.remove(&timer.timer_id) {
            entry.cancelled.set(true);
            trace!("timer {} stopped", timer.timer_id);
        }
    })
}

/// Whether the timer is still armed.
pub fn is_active(timer: TimerRef) -> bool {
    event_loop::with_current(|core| {
        if core.loop_id != timer.loop_id {
            panic!("timer queried from a foreign thread");
        }
        core.timers.borrow().entries.contains_key(&timer.timer_id)
    })
}

/// The nearest armed deadline, used as the loop's poll timeout.
pub(crate) fn next_deadline(core: &LoopCore) -> Option<Instant> {
    let mut table = core.timers.borrow_mut();
    loop {
        let &Reverse((deadline, timer_id)) = table.heap.peek()?;
        match table.entries.get(&timer_id) {
            Some(entry) if entry.deadline.get() == deadline => return Some(deadline),
            // Stale node: stopped, expired, or superseded by a re-arm.
            _ => {
                table.heap.pop();
            }
        }
    }
}

/// Fires every timer whose deadline has passed. Re-arms repeating timers
/// before invoking any callback, so a callback observing `is_active` sees
/// the post-expiry state.
pub(crate) fn fire_due(core: &LoopCore) {
    let now = Instant::now();
    let mut due: Vec<Rc<TimerEntry>> = Vec::new();

    {
        let mut table = core.timers.borrow_mut();
        loop {
            match table.heap.peek() {
                Some(&Reverse((deadline, _))) if deadline <= now => {}
                _ => break,
            }
            let Reverse((deadline, timer_id)) = table.heap.pop().expect("peeked entry");

            let entry = match table.entries.get(&timer_id) {
                Some(e) if e.deadline.get() == deadline => Rc::clone(e),
                _ => continue,
            };

            match entry.remaining.get() {
                Some(1) => {
                    // Last expiry: the ref goes stale, but this firing still
                    // happens.
                    entry.remaining.set(Some(0));
                    table.entries.remove(&timer_id);
                }
                Some(n) => {
                    entry.remaining.set(Some(n - 1));
                    let next = deadline + entry.interval;
                    entry.deadline.set(next);
                    table.heap.push(Reverse((next, timer_id)));
                }
                None => {
                    let next = deadline + entry.interval;
                    entry.deadline.set(next);
                    table.heap.push(Reverse((next, timer_id)));
                }
            }
            due.push(entry);
        }
    }

    for entry in due {
        // A callback earlier in this batch may have stopped it.
        if entry.cancelled.get() {
            continue;
        }
        if entry.running.replace(true) {
            panic!("timer {} expiry re-entered", entry.timer_id);
        }
        trace!("timer {} fired", entry.timer_id);
        {
            let mut callback = entry.callback.borrow_mut();
            (*callback)();
        }
        entry.running.set(false);
    }
}

pub(crate) fn poll_timeout(core: &LoopCore, caller: Option<Duration>) -> Option<Duration> {
    let now = Instant::now();
    let timer = next_deadline(core).map(|d| d.saturating_duration_since(now));
    match (timer, caller) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}
