//! Fades a LED in and out with the realtime software PWM.
//!
//! Any GPIO works; this example uses physical pin #7. Run as root to get the realtime
//! scheduling priority, otherwise the PWM still runs with more jitter.

use sbc_mmap_gpio::pwm::{self, Converter, OpenMode, Registry};
use sbc_mmap_gpio::{Gpio, GpioConfig, Numbering};
use std::error::Error;
use std::thread::sleep;
use std::time::Duration;

fn main() -> Result<(), Box<dyn Error>> {
    let gpio = Gpio::new(GpioConfig::default())?;
    gpio.open()?;

    let mut registry = Registry::new();
    pwm::register_builtin(&mut registry);
    let mut led = registry.create("softpwm", &gpio, gpio.pin_by(Numbering::Physical, 7)?)?;
    led.open(OpenMode::Write)?;
    led.set_range(100)?;
    led.set_enable(true)?;

    let step = Duration::from_millis(10);
    for _ in 0..5 {
        for value in (0..=100).chain((0..100).rev()) {
            led.write(value)?;
            sleep(step);
        }
    }

    led.close()?;
    Ok(())
}
