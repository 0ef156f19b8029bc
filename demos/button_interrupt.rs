//! Counts presses of a button wired between physical pin #11 and ground.
//!
//! The internal pull-up keeps the input HIGH, a press pulls it LOW.

use sbc_mmap_gpio::{Edge, Gpio, GpioConfig, Mode, Numbering, Pull};
use std::error::Error;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

fn main() -> Result<(), Box<dyn Error>> {
    let gpio = Gpio::new(GpioConfig::default())?;
    gpio.open()?;

    let button = gpio.pin_by(Numbering::Physical, 11)?;
    button.set_mode(Mode::Input)?;
    button.set_pull(Pull::Up)?;
    button.set_debounce(Duration::from_millis(20))?;

    let presses = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&presses);
    button.attach_interrupt(Edge::Falling, move |event| {
        let count = counter.fetch_add(1, Ordering::SeqCst) + 1;
        println!("press #{} at {:?}", count, event.timestamp);
    })?;

    sleep(Duration::from_secs(30));
    button.detach_interrupt()?;
    println!("{} presses", presses.load(Ordering::SeqCst));
    Ok(())
}
