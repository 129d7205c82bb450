//! Client/server messaging over the service directory: handshake, sync and
//! async calls, timeouts, peer death, pushes, and backpressure.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use serial_test::serial;

use eventline::{config, ClientId, Error, EventLoop, ServerMessage, Service, Session};

fn test_dir() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    config::set_service_dir(dir.path());
    config::clear_bindings();
    dir
}

fn pump_until(ev: &EventLoop, deadline: Duration, mut done: impl FnMut() -> bool) {
    let start = Instant::now();
    while !done() {
        assert!(
            start.elapsed() < deadline,
            "condition not reached within {deadline:?}"
        );
        ev.run_once_timeout(Duration::from_millis(20)).unwrap();
    }
}

/// An echo service on its own thread, answering every request with its own
/// payload.
struct EchoServer {
    stop: Arc<AtomicBool>,
    join: Option<thread::JoinHandle<()>>,
}

impl EchoServer {
    fn start(name: &'static str, max_payload: usize) -> EchoServer {
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::channel();
        let join = {
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let ev = EventLoop::new().unwrap();
                let service = Service::advertise_with(name, max_payload).unwrap();
                service.set_recv_handler(|msg: ServerMessage| {
                    if msg.needs_response() {
                        let payload = msg.payload().to_vec();
                        let _ = msg.respond(&payload);
                    }
                });
                ready_tx.send(()).unwrap();
                while !stop.load(Ordering::Acquire) {
                    ev.run_once_timeout(Duration::from_millis(20)).unwrap();
                }
            })
        };
        ready_rx.recv().unwrap();
        EchoServer {
            stop,
            join: Some(join),
        }
    }
}

impl Drop for EchoServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.join.take().unwrap().join().unwrap();
    }
}

#[test]
#[serial]
fn synchronous_call_round_trips() {
    let _dir = test_dir();
    let _server = EchoServer::start("echo", config::DEFAULT_MAX_PAYLOAD);

    let _ev = EventLoop::new().unwrap();
    let session = Session::connect("echo").unwrap();
    assert_eq!(session.service_name(), "echo");

    let reply = session.call(b"ping", Some(Duration::from_secs(2))).unwrap();
    assert_eq!(reply, b"ping");

    let reply = session.call(b"again", Some(Duration::from_secs(2))).unwrap();
    assert_eq!(reply, b"again");

    session.disconnect();
    assert!(matches!(
        session.call(b"closed", Some(Duration::from_secs(1))),
        Err(Error::Closed)
    ));
}

#[test]
#[serial]
fn timed_out_call_discards_the_late_reply() {
    let _dir = test_dir();

    let stop = Arc::new(AtomicBool::new(false));
    let (ready_tx, ready_rx) = mpsc::channel();
    let server = {
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let ev = EventLoop::new().unwrap();
            let service = Service::advertise("late").unwrap();
            let parked: Rc<RefCell<Option<ServerMessage>>> = Rc::new(RefCell::new(None));
            {
                let parked = Rc::clone(&parked);
                service.set_recv_handler(move |msg: ServerMessage| {
                    if msg.payload() == b"slow" {
                        // Sit on it until the next request arrives.
                        *parked.borrow_mut() = Some(msg);
                    } else {
                        if let Some(old) = parked.borrow_mut().take() {
                            let _ = old.respond(b"stale");
                        }
                        let _ = msg.respond(b"fresh");
                    }
                });
            }
            ready_tx.send(()).unwrap();
            while !stop.load(Ordering::Acquire) {
                ev.run_once_timeout(Duration::from_millis(20)).unwrap();
            }
        })
    };
    ready_rx.recv().unwrap();

    let ev = EventLoop::new().unwrap();
    let session = Session::try_connect("late").unwrap();

    assert!(matches!(
        session.call(b"slow", Some(Duration::from_millis(150))),
        Err(Error::Timeout)
    ));

    // The stale reply for the timed-out call arrives before the fresh one
    // and must not be mistaken for it.
    let reply = session.call(b"next", Some(Duration::from_secs(2))).unwrap();
    assert_eq!(reply, b"fresh");

    // Let the loop route the parked stale frame; it has nowhere to go and
    // is dropped quietly.
    ev.run_once_timeout(Duration::from_millis(100)).unwrap();

    drop(session);
    stop.store(true, Ordering::Release);
    server.join().unwrap();
}

#[test]
#[serial]
fn peer_death_fails_a_blocked_call_with_closed() {
    let _dir = test_dir();

    let (ready_tx, ready_rx) = mpsc::channel();
    let server = thread::spawn(move || {
        let ev = EventLoop::new().unwrap();
        let service = Service::advertise("dying").unwrap();
        let seen = Rc::new(RefCell::new(None));
        let done = Arc::new(AtomicBool::new(false));
        {
            let seen = Rc::clone(&seen);
            let done = Arc::clone(&done);
            service.set_recv_handler(move |msg: ServerMessage| {
                // Keep the request unanswered; dropping it would fault it
                // back to the caller instead of leaving it pending.
                *seen.borrow_mut() = Some(msg);
                done.store(true, Ordering::Release);
            });
        }
        ready_tx.send(()).unwrap();
        while !done.load(Ordering::Acquire) {
            ev.run_once_timeout(Duration::from_millis(20)).unwrap();
        }
        drop(service);
    });
    ready_rx.recv().unwrap();

    let _ev = EventLoop::new().unwrap();
    let session = Session::try_connect("dying").unwrap();

    let disconnected = Rc::new(RefCell::new(false));
    {
        let disconnected = Rc::clone(&disconnected);
        session.set_disconnect_handler(move || *disconnected.borrow_mut() = true);
    }

    assert!(matches!(
        session.call(b"block", Some(Duration::from_secs(5))),
        Err(Error::Closed)
    ));
    assert!(*disconnected.borrow());

    assert!(matches!(
        session.call(b"after", Some(Duration::from_secs(1))),
        Err(Error::Closed)
    ));

    server.join().unwrap();
}

#[test]
#[serial]
fn asynchronous_call_completes_through_the_loop() {
    let _dir = test_dir();
    let _server = EchoServer::start("async-echo", config::DEFAULT_MAX_PAYLOAD);

    let ev = EventLoop::new().unwrap();
    let session = Session::try_connect("async-echo").unwrap();

    let outcome: Rc<RefCell<Option<eventline::Result<Vec<u8>>>>> = Rc::new(RefCell::new(None));
    {
        let outcome = Rc::clone(&outcome);
        session.call_async(b"ping", Some(Duration::from_secs(2)), move |result| {
            *outcome.borrow_mut() = Some(result);
        });
    }

    pump_until(&ev, Duration::from_secs(2), || outcome.borrow().is_some());
    let result = outcome.borrow_mut().take().unwrap();
    match result {
        Ok(reply) => assert_eq!(reply, b"ping"),
        Err(e) => panic!("async call failed: {e}"),
    }
}

#[test]
#[serial]
fn server_push_reaches_the_session_recv_handler() {
    let _dir = test_dir();

    let stop = Arc::new(AtomicBool::new(false));
    let (ready_tx, ready_rx) = mpsc::channel();
    let server = {
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let ev = EventLoop::new().unwrap();
            let service = Service::advertise("pusher").unwrap();
            let opened: Rc<RefCell<Option<ClientId>>> = Rc::new(RefCell::new(None));
            {
                let opened = Rc::clone(&opened);
                service.add_open_handler(move |client| *opened.borrow_mut() = Some(client));
            }
            ready_tx.send(()).unwrap();
            while !stop.load(Ordering::Acquire) {
                ev.run_once_timeout(Duration::from_millis(20)).unwrap();
                if let Some(client) = opened.borrow_mut().take() {
                    service.push(client, b"hi there").unwrap();
                }
            }
        })
    };
    ready_rx.recv().unwrap();

    let ev = EventLoop::new().unwrap();
    let session = Session::try_connect("pusher").unwrap();

    let inbox: Rc<RefCell<Vec<Vec<u8>>>> = Rc::new(RefCell::new(Vec::new()));
    {
        let inbox = Rc::clone(&inbox);
        session.set_recv_handler(move |payload| inbox.borrow_mut().push(payload));
    }

    pump_until(&ev, Duration::from_secs(2), || !inbox.borrow().is_empty());
    assert_eq!(inbox.borrow()[0], b"hi there");

    drop(session);
    stop.store(true, Ordering::Release);
    server.join().unwrap();
}

#[test]
#[serial]
fn connect_error_taxonomy() {
    let dir = test_dir();
    let _ev = EventLoop::new().unwrap();

    assert!(matches!(
        Session::try_connect("ghost"),
        Err(Error::Unavailable)
    ));

    config::bind("only-this", "ghost");
    assert!(matches!(
        Session::try_connect("unbound"),
        Err(Error::NotPermitted)
    ));
    config::clear_bindings();

    config::set_service_dir("/nonexistent/eventline-sockets");
    assert!(matches!(Session::try_connect("ghost"), Err(Error::Comm(_))));
    config::set_service_dir(dir.path());
}

#[test]
#[serial]
fn bindings_route_an_alias_to_the_real_service() {
    let _dir = test_dir();
    let _server = EchoServer::start("real-echo", config::DEFAULT_MAX_PAYLOAD);

    config::bind("alias", "real-echo");
    let _ev = EventLoop::new().unwrap();
    let session = Session::try_connect("alias").unwrap();
    assert_eq!(session.service_name(), "real-echo");

    let reply = session.call(b"via-alias", Some(Duration::from_secs(2))).unwrap();
    assert_eq!(reply, b"via-alias");

    config::clear_bindings();
}

#[test]
#[serial]
fn oversized_payload_request_is_nacked_at_the_handshake() {
    let _dir = test_dir();
    let _server = EchoServer::start("tiny", 16);

    let _ev = EventLoop::new().unwrap();
    assert!(matches!(
        Session::try_connect_with("tiny", 1024),
        Err(Error::Fault(_))
    ));

    let session = Session::try_connect_with("tiny", 16).unwrap();
    let reply = session.call(b"0123456789", Some(Duration::from_secs(2))).unwrap();
    assert_eq!(reply, b"0123456789");
}

#[test]
#[serial]
fn a_push_burst_larger_than_the_socket_buffer_arrives_completely() {
    const MESSAGES: usize = 1000;
    const SIZE: usize = 900;

    let _dir = test_dir();

    let stop = Arc::new(AtomicBool::new(false));
    let (ready_tx, ready_rx) = mpsc::channel();
    let server = {
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let ev = EventLoop::new().unwrap();
            let service = Service::advertise("firehose").unwrap();
            let opened: Rc<RefCell<Option<ClientId>>> = Rc::new(RefCell::new(None));
            {
                let opened = Rc::clone(&opened);
                service.add_open_handler(move |client| *opened.borrow_mut() = Some(client));
            }
            ready_tx.send(()).unwrap();
            while !stop.load(Ordering::Acquire) {
                ev.run_once_timeout(Duration::from_millis(20)).unwrap();
                if let Some(client) = opened.borrow_mut().take() {
                    // Far more than the socket buffer holds; the transmit
                    // queue absorbs the rest and drains on writability.
                    for i in 0..MESSAGES {
                        let frame = vec![(i % 251) as u8; SIZE];
                        service.push(client, &frame).unwrap();
                    }
                }
            }
        })
    };
    ready_rx.recv().unwrap();

    let ev = EventLoop::new().unwrap();
    let session = Session::try_connect("firehose").unwrap();

    let received = Rc::new(RefCell::new(0usize));
    {
        let received = Rc::clone(&received);
        session.set_recv_handler(move |payload| {
            let i = *received.borrow();
            assert_eq!(payload.len(), SIZE);
            assert_eq!(payload[0], (i % 251) as u8, "pushes arrive in order");
            *received.borrow_mut() += 1;
        });
    }

    pump_until(&ev, Duration::from_secs(10), || *received.borrow() == MESSAGES);

    drop(session);
    stop.store(true, Ordering::Release);
    server.join().unwrap();
}
