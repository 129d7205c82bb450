//! Loop-level behavior: fd monitors, timers, and the deferred-function
//! queue.

use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use eventline::{fd_monitor, interest, queue_function, timer, EventLoop, FdMonitorRef, Repeat};

fn pump_until(ev: &EventLoop, deadline: Duration, mut done: impl FnMut() -> bool) {
    let start = Instant::now();
    while !done() {
        assert!(
            start.elapsed() < deadline,
            "condition not reached within {deadline:?}"
        );
        ev.run_once_timeout(Duration::from_millis(50)).unwrap();
    }
}

#[test]
fn monitor_delivers_bytes_written_by_another_thread() {
    let ev = EventLoop::new().unwrap();

    let (local, remote) = UnixStream::pair().unwrap();
    local.set_nonblocking(true).unwrap();

    let invocations = Rc::new(Cell::new(0u32));
    let received = Rc::new(RefCell::new(Vec::new()));

    let fd = local.as_raw_fd();
    let monitor = {
        let invocations = Rc::clone(&invocations);
        let received = Rc::clone(&received);
        let mut local = local;
        fd_monitor::create("stream-read", fd, interest().read(), move |_fd, ready| {
            assert!(ready.is_readable());
            invocations.set(invocations.get() + 1);
            let mut buf = [0u8; 16];
            let n = local.read(&mut buf).unwrap();
            received.borrow_mut().extend_from_slice(&buf[..n]);
        })
        .unwrap()
    };

    let remote = thread::spawn(move || {
        let mut remote = remote;
        remote.write_all(b"hello").unwrap();
        remote
    })
    .join()
    .unwrap();

    ev.run_once_timeout(Duration::from_secs(2)).unwrap();

    assert_eq!(invocations.get(), 1);
    assert_eq!(&*received.borrow(), b"hello");

    fd_monitor::delete(monitor);
    drop(remote);
}

#[test]
fn monitor_is_silent_until_enabled_and_after_disable() {
    let ev = EventLoop::new().unwrap();

    let (local, mut remote) = UnixStream::pair().unwrap();
    local.set_nonblocking(true).unwrap();

    let invocations = Rc::new(Cell::new(0u32));
    let fd = local.as_raw_fd();
    let monitor = {
        let invocations = Rc::clone(&invocations);
        let mut local = local;
        fd_monitor::create("gated", fd, interest(), move |_fd, _ready| {
            invocations.set(invocations.get() + 1);
            let mut buf = [0u8; 64];
            let _ = local.read(&mut buf);
        })
        .unwrap()
    };

    remote.write_all(b"first").unwrap();
    ev.run_once_timeout(Duration::from_millis(100)).unwrap();
    assert_eq!(invocations.get(), 0, "no interest requested yet");

    fd_monitor::enable(monitor, interest().read()).unwrap();
    ev.run_once_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(invocations.get(), 1);

    fd_monitor::disable(monitor, interest().read()).unwrap();
    remote.write_all(b"second").unwrap();
    ev.run_once_timeout(Duration::from_millis(100)).unwrap();
    assert_eq!(invocations.get(), 1, "disabled monitor must stay silent");

    fd_monitor::delete(monitor);
}

#[test]
fn deleting_a_monitor_from_its_own_callback_silences_it() {
    let ev = EventLoop::new().unwrap();

    let (local, mut remote) = UnixStream::pair().unwrap();
    local.set_nonblocking(true).unwrap();

    let invocations = Rc::new(Cell::new(0u32));
    let slot: Rc<Cell<Option<FdMonitorRef>>> = Rc::new(Cell::new(None));

    let monitor = {
        let invocations = Rc::clone(&invocations);
        let slot = Rc::clone(&slot);
        // Deliberately never reads, so a surviving registration would fire
        // again on the next poll.
        fd_monitor::create("self-delete", local.as_raw_fd(), interest().read(), move |_fd, _ready| {
            invocations.set(invocations.get() + 1);
            fd_monitor::delete(slot.get().expect("ref stored before run"));
        })
        .unwrap()
    };
    slot.set(Some(monitor));

    remote.write_all(b"data").unwrap();
    ev.run_once_timeout(Duration::from_secs(2)).unwrap();
    ev.run_once_timeout(Duration::from_millis(100)).unwrap();

    assert_eq!(invocations.get(), 1);
    drop(local);
}

#[test]
fn queued_functions_run_in_fifo_order_across_threads() {
    let ev = EventLoop::new().unwrap();
    let handle = ev.handle();

    let order = Arc::new(Mutex::new(Vec::new()));
    let sender = {
        let order = Arc::clone(&order);
        thread::spawn(move || {
            for i in 0..100u32 {
                let order = Arc::clone(&order);
                handle.queue(move || order.lock().unwrap().push(i)).unwrap();
            }
        })
    };
    sender.join().unwrap();

    pump_until(&ev, Duration::from_secs(2), || order.lock().unwrap().len() == 100);
    let order = order.lock().unwrap();
    assert_eq!(&*order, &(0..100).collect::<Vec<_>>());
}

#[test]
fn self_queued_function_runs_on_the_next_iteration() {
    let ev = EventLoop::new().unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    {
        let order = Arc::clone(&order);
        queue_function(move || {
            order.lock().unwrap().push("outer");
            let order = Arc::clone(&order);
            queue_function(move || order.lock().unwrap().push("inner"));
        });
    }

    ev.run_once_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(&*order.lock().unwrap(), &["outer"], "inner waits a turn");

    ev.run_once_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(&*order.lock().unwrap(), &["outer", "inner"]);
}

#[test]
fn call_blocking_returns_the_closure_result() {
    let stop = Arc::new(AtomicBool::new(false));
    let (handle_tx, handle_rx) = mpsc::channel();

    let worker = {
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let ev = EventLoop::new().unwrap();
            handle_tx.send(ev.handle()).unwrap();
            while !stop.load(Ordering::Acquire) {
                ev.run_once_timeout(Duration::from_millis(20)).unwrap();
            }
        })
    };

    let handle = handle_rx.recv().unwrap();
    let answer: u32 = handle.call_blocking(|| 40 + 2).unwrap();
    assert_eq!(answer, 42);

    stop.store(true, Ordering::Release);
    worker.join().unwrap();

    assert!(matches!(
        handle.call_blocking(|| 0u32),
        Err(eventline::Error::Closed)
    ));
}

#[test]
fn repeating_timer_fires_the_requested_number_of_times() {
    let ev = EventLoop::new().unwrap();
    let fired = Rc::new(Cell::new(0u32));

    let timer = {
        let fired = Rc::clone(&fired);
        timer::start(Duration::from_millis(10), Repeat::Times(2), move || {
            fired.set(fired.get() + 1);
        })
    };

    pump_until(&ev, Duration::from_secs(2), || fired.get() == 2);
    assert!(!timer::is_active(timer), "exhausted timer goes stale");

    // The stale ref stays safe to stop.
    timer::stop(timer);

    ev.run_once_timeout(Duration::from_millis(50)).unwrap();
    assert_eq!(fired.get(), 2);
}

#[test]
fn stopping_a_timer_suppresses_later_expiries() {
    let ev = EventLoop::new().unwrap();
    let fired = Rc::new(Cell::new(0u32));

    let timer = {
        let fired = Rc::clone(&fired);
        timer::start(Duration::from_millis(10), Repeat::Forever, move || {
            fired.set(fired.get() + 1);
        })
    };

    pump_until(&ev, Duration::from_secs(2), || fired.get() >= 1);
    timer::stop(timer);
    let seen = fired.get();

    for _ in 0..3 {
        ev.run_once_timeout(Duration::from_millis(30)).unwrap();
    }
    assert_eq!(fired.get(), seen);
}

#[test]
#[should_panic(expected = "recursive call")]
fn reentering_the_loop_from_a_callback_is_fatal() {
    let ev = Rc::new(EventLoop::new().unwrap());

    let (local, mut remote) = UnixStream::pair().unwrap();
    local.set_nonblocking(true).unwrap();

    {
        let ev = Rc::clone(&ev);
        fd_monitor::create("reenter", local.as_raw_fd(), interest().read(), move |_fd, _ready| {
            ev.run_once().unwrap();
        })
        .unwrap();
    }

    remote.write_all(b"x").unwrap();
    ev.run_once_timeout(Duration::from_secs(2)).unwrap();
}

#[test]
#[should_panic(expected = "already has an event loop")]
fn second_loop_on_one_thread_is_fatal() {
    let _first = EventLoop::new().unwrap();
    let _second = EventLoop::new();
}
