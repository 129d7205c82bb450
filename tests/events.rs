//! Named-event semantics: ordering, context, layering, removal during
//! dispatch, and ref-counted payload lifetime.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use eventline::{event, EventLoop, HandlerRef};

#[test]
fn handlers_run_in_registration_order_exactly_once() {
    let _ev = EventLoop::new().unwrap();
    let id = event::create_id("order", 4);

    let order = Rc::new(RefCell::new(Vec::new()));
    for name in ["h1", "h2", "h3"] {
        let order = Rc::clone(&order);
        event::add_handler(name, id, move |_report| order.borrow_mut().push(name));
    }

    event::report(id, &0u32.to_ne_bytes());
    assert_eq!(&*order.borrow(), &["h1", "h2", "h3"]);
}

#[test]
fn same_thread_report_is_synchronous_and_context_is_visible() {
    let _ev = EventLoop::new().unwrap();
    let id = event::create_id("Temp", 4);

    let seen = Rc::new(Cell::new(None));
    let handler = {
        let seen = Rc::clone(&seen);
        event::add_handler("H", id, move |report| {
            let value = i32::from_ne_bytes(report.bytes().try_into().unwrap());
            let ctx = event::context().expect("context was set");
            let ctx = ctx.downcast::<&str>().expect("context type");
            seen.set(Some((value, *ctx)));
        })
    };
    event::set_context(handler, Rc::new("ctxA"));

    event::report(id, &0x2Ai32.to_ne_bytes());

    // No loop iteration ran; the handler fired inside report().
    assert_eq!(seen.get(), Some((0x2A, "ctxA")));
}

#[test]
fn duplicate_registration_with_identical_shape_is_idempotent() {
    let _ev = EventLoop::new().unwrap();
    let a = event::create_id("dup", 8);
    let b = event::create_id("dup", 8);
    assert_eq!(a, b);
}

#[test]
#[should_panic(expected = "already registered")]
fn duplicate_registration_with_different_size_is_fatal() {
    let _ev = EventLoop::new().unwrap();
    event::create_id("dup-mismatch", 4);
    event::create_id("dup-mismatch", 8);
}

#[test]
fn removal_during_dispatch_is_observed_without_corruption() {
    let _ev = EventLoop::new().unwrap();
    let id = event::create_id("removal", 0);

    let counts: Rc<RefCell<Vec<&str>>> = Rc::new(RefCell::new(Vec::new()));
    let h1_slot: Rc<Cell<Option<HandlerRef>>> = Rc::new(Cell::new(None));
    let h3_slot: Rc<Cell<Option<HandlerRef>>> = Rc::new(Cell::new(None));

    // h1 removes itself; h2 removes h3 before the dispatch reaches it.
    let h1 = {
        let counts = Rc::clone(&counts);
        let h1_slot = Rc::clone(&h1_slot);
        event::add_handler("h1", id, move |_| {
            counts.borrow_mut().push("h1");
            event::remove_handler(h1_slot.get().unwrap());
        })
    };
    h1_slot.set(Some(h1));

    {
        let counts = Rc::clone(&counts);
        let h3_slot = Rc::clone(&h3_slot);
        event::add_handler("h2", id, move |_| {
            counts.borrow_mut().push("h2");
            if let Some(h3) = h3_slot.take() {
                event::remove_handler(h3);
            }
        });
    }

    let h3 = {
        let counts = Rc::clone(&counts);
        event::add_handler("h3", id, move |_| counts.borrow_mut().push("h3"))
    };
    h3_slot.set(Some(h3));

    event::report(id, &[]);
    assert_eq!(&*counts.borrow(), &["h1", "h2"], "h3 was removed in flight");

    event::report(id, &[]);
    assert_eq!(
        &*counts.borrow(),
        &["h1", "h2", "h2"],
        "h1 removed itself, h3 stays gone"
    );
}

struct Probe {
    drops: Arc<AtomicUsize>,
}

impl Drop for Probe {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn ref_counted_payload_is_destroyed_exactly_once_after_all_handlers() {
    let _ev = EventLoop::new().unwrap();
    let id = event::create_id_with_ref_counting("rc-plain");

    let invoked = Rc::new(Cell::new(0u32));
    for name in ["a", "b", "c"] {
        let invoked = Rc::clone(&invoked);
        event::add_handler(name, id, move |report| {
            assert!(report.payload::<Probe>().is_some());
            invoked.set(invoked.get() + 1);
        });
    }

    let drops = Arc::new(AtomicUsize::new(0));
    event::report_shared(id, Arc::new(Probe { drops: Arc::clone(&drops) }));

    assert_eq!(invoked.get(), 3);
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn retained_payload_outlives_dispatch() {
    let _ev = EventLoop::new().unwrap();
    let id = event::create_id_with_ref_counting("rc-retained");

    let retained: Rc<RefCell<Option<Arc<Probe>>>> = Rc::new(RefCell::new(None));
    {
        let retained = Rc::clone(&retained);
        event::add_handler("keeper", id, move |report| {
            *retained.borrow_mut() = report.payload::<Probe>();
        });
    }

    let drops = Arc::new(AtomicUsize::new(0));
    event::report_shared(id, Arc::new(Probe { drops: Arc::clone(&drops) }));

    assert_eq!(drops.load(Ordering::SeqCst), 0, "handler kept a reference");
    retained.borrow_mut().take();
    assert_eq!(drops.load(Ordering::SeqCst), 1);
}

#[test]
fn layered_handler_transforms_the_payload_for_its_inner_callback() {
    let _ev = EventLoop::new().unwrap();
    let id = event::create_id("temp-celsius", 4);

    let seen: Rc<RefCell<Vec<f64>>> = Rc::new(RefCell::new(Vec::new()));
    let inner: Box<dyn FnMut(f64)> = {
        let seen = Rc::clone(&seen);
        Box::new(move |fahrenheit| seen.borrow_mut().push(fahrenheit))
    };

    event::add_layered_handler(
        "celsius-to-fahrenheit",
        id,
        |report, second| {
            let celsius = i32::from_ne_bytes(report.bytes().try_into().unwrap());
            let fahrenheit = f64::from(celsius) * 9.0 / 5.0 + 32.0;
            let inner = second
                .downcast_mut::<Box<dyn FnMut(f64)>>()
                .expect("inner callback type");
            inner(fahrenheit);
        },
        Box::new(inner),
    );

    event::report(id, &100i32.to_ne_bytes());
    event::report(id, &0i32.to_ne_bytes());
    assert_eq!(&*seen.borrow(), &[212.0, 32.0]);
}

#[test]
fn cross_thread_report_reaches_the_owning_loop() {
    let id = event::create_id("xthread", 4);
    let values = Arc::new(Mutex::new(Vec::new()));
    let (ready_tx, ready_rx) = mpsc::channel();

    let owner = {
        let values = Arc::clone(&values);
        thread::spawn(move || {
            let ev = EventLoop::new().unwrap();
            {
                let values = Arc::clone(&values);
                event::add_handler("collector", id, move |report| {
                    let v = i32::from_ne_bytes(report.bytes().try_into().unwrap());
                    values.lock().unwrap().push(v);
                });
            }
            ready_tx.send(()).unwrap();

            let start = Instant::now();
            while values.lock().unwrap().len() < 2 {
                assert!(start.elapsed() < Duration::from_secs(2));
                ev.run_once_timeout(Duration::from_millis(50)).unwrap();
            }
        })
    };

    ready_rx.recv().unwrap();
    // This thread has no loop at all; both reports cross over.
    event::report(id, &7i32.to_ne_bytes());
    event::report(id, &8i32.to_ne_bytes());

    owner.join().unwrap();
    assert_eq!(&*values.lock().unwrap(), &[7, 8]);
}

#[test]
#[should_panic(expected = "ref counting")]
fn byte_report_on_a_ref_counted_event_is_fatal() {
    let _ev = EventLoop::new().unwrap();
    let id = event::create_id_with_ref_counting("rc-misuse");
    event::report(id, &[0, 0, 0, 0]);
}

#[test]
#[should_panic(expected = "payload size")]
fn wrong_payload_size_is_fatal() {
    let _ev = EventLoop::new().unwrap();
    let id = event::create_id("sized", 4);
    event::report(id, &[1, 2]);
}
