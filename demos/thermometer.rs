//! Named-event fan-out: a timer reports temperature readings, one handler
//! prints them as-is and a layered handler converts them for a
//! differently-typed callback.
//!
//! Run with `cargo run --example thermometer`.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use eventline::{event, timer, EventLoop, Repeat};

fn main() -> std::io::Result<()> {
    env_logger::init();

    let ev = EventLoop::new()?;
    let celsius = event::create_id("temperature", 4);

    event::add_handler("display-celsius", celsius, |report| {
        let c = i32::from_ne_bytes(report.bytes().try_into().unwrap());
        println!("{c} degrees C");
    });

    // The public callback wants Fahrenheit as f64; the layer in between
    // converts without the low-level event knowing.
    let display_fahrenheit: Box<dyn FnMut(f64)> = Box::new(|f| println!("{f:.1} degrees F"));
    event::add_layered_handler(
        "celsius-to-fahrenheit",
        celsius,
        |report, second| {
            let c = i32::from_ne_bytes(report.bytes().try_into().unwrap());
            let f = f64::from(c) * 9.0 / 5.0 + 32.0;
            (second
                .downcast_mut::<Box<dyn FnMut(f64)>>()
                .expect("inner callback"))(f);
        },
        Box::new(display_fahrenheit),
    );

    let readings: [i32; 10] = [18, 19, 21, 24, 28, 33, 39, 46, 54, 63];
    let step = Rc::new(Cell::new(0usize));
    {
        let step = Rc::clone(&step);
        timer::start(Duration::from_millis(200), Repeat::Times(10), move || {
            let i = step.get();
            step.set(i + 1);
            event::report(celsius, &readings[i].to_ne_bytes());
        });
    }

    while step.get() < readings.len() {
        ev.run_once()?;
    }
    Ok(())
}
