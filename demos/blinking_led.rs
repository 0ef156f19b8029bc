//! A very basic example of a program blinking a LED diode using native library API.
//!
//! This example assumes that physical pin #7 is connected to diode's anode (+).
//! Make sure to put resistor to reduce current flowing through the diode.

use sbc_mmap_gpio::{Gpio, GpioConfig, Mode, Numbering};
use std::error::Error;
use std::thread::sleep;
use std::time::Duration;

fn main() -> Result<(), Box<dyn Error>> {
    let gpio = Gpio::new(GpioConfig::default())?;
    gpio.open()?;
    let led_pin = gpio.pin_by(Numbering::Physical, 7)?;
    led_pin.set_mode(Mode::Output)?;
    let blink_interval = Duration::from_millis(500);

    loop {
        led_pin.write(true)?;
        sleep(blink_interval);
        led_pin.write(false)?;
        sleep(blink_interval);
    }
}
