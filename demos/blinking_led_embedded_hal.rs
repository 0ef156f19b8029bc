//! This example demonstrates the usage of embedded_hal trait usage.
//!
//! The main benefit over the blinking_led example is that `blink_led`
//! can be used for _any_ device with embedded-hal digital pins abstraction.
//!
//! This example assumes that physical pin #7 is connected to diode's anode (+).
//! Make sure to put resistor to reduce current flowing through the diode.

use embedded_hal::digital::v2::*;
use sbc_mmap_gpio::{Gpio, GpioConfig, Mode, Numbering, Pin};
use std::error::Error;
use std::thread::sleep;
use std::time::Duration;

fn blink_led<T: OutputPin<Error = impl Error + 'static>>(mut pin: T) -> Result<(), Box<dyn Error>> {
    let blink_interval = Duration::from_millis(500);

    loop {
        pin.set_high()?;
        sleep(blink_interval);
        pin.set_low()?;
        sleep(blink_interval);
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let gpio = Gpio::new(GpioConfig::default())?;
    gpio.open()?;
    let led_pin: &Pin = gpio.pin_by(Numbering::Physical, 7)?;
    led_pin.set_mode(Mode::Output)?;

    blink_led(led_pin)?;
    Ok(())
}
