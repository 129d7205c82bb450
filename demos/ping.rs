//! Minimal service round trip: a "ping" server on one thread, a client on
//! the main thread.
//!
//! Run with `cargo run --example ping`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

use eventline::{config, EventLoop, Service, Session};

fn main() -> eventline::Result<()> {
    env_logger::init();
    config::set_service_dir(std::env::temp_dir().join("eventline-ping-demo"));

    let stop = Arc::new(AtomicBool::new(false));
    let (ready_tx, ready_rx) = mpsc::channel();
    let server = {
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let ev = EventLoop::new().expect("server event loop");
            let service = Service::advertise("ping").expect("advertise");
            service.set_recv_handler(|msg| {
                if msg.needs_response() {
                    let _ = msg.respond(b"pong");
                }
            });
            ready_tx.send(()).unwrap();
            while !stop.load(Ordering::Acquire) {
                ev.run_once_timeout(Duration::from_millis(20)).expect("server loop");
            }
        })
    };
    ready_rx.recv().unwrap();

    let _ev = EventLoop::new()?;
    let session = Session::connect("ping")?;
    for i in 0..3 {
        let start = Instant::now();
        let reply = session.call(b"ping", Some(Duration::from_secs(2)))?;
        println!(
            "#{i}: {} in {:?}",
            String::from_utf8_lossy(&reply),
            start.elapsed()
        );
    }

    drop(session);
    stop.store(true, Ordering::Release);
    server.join().unwrap();
    Ok(())
}
