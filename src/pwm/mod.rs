//! Pulse-width modulation engines.
//!
//! Three ways of producing a PWM signal on a pin:
//!
//! * `SoftPwm` - a realtime-priority thread toggling the pin with microsecond ticks.
//! * `GpioPwm` - same idea at normal priority, timed in nanoseconds.
//! * `SocPwm` - the PWM peripheral of the SoC, reachable from a few pins only.
//!
//! All of them implement `Converter` and, through the `Pwm` enum, `embedded_hal::PwmPin`.
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use embedded_hal as eh;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::gpio::Gpio;
use crate::device::error::PinError;
use crate::pin::Pin;
use crate::{GpioError, GpioResult};

mod gpio_pwm;
pub mod soc;
mod soft;

pub use gpio_pwm::GpioPwm;
pub use soc::SocPwm;
pub use soft::SoftPwm;

/// Range of a freshly opened engine.
pub const DEFAULT_RANGE: u32 = 1024;
/// Frequency of a freshly opened engine, in Hz.
pub const DEFAULT_FREQUENCY: f64 = 200.0;

/// Direction a converter is opened for.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OpenMode {
    Read,
    Write,
    ReadWrite,
}

/// Common contract of analog converters. PWM engines are output converters: `write`
/// sets the duty value and `read` returns the last value written.
pub trait Converter {
    fn open(&mut self, mode: OpenMode) -> GpioResult<()>;

    /// Stops the output and leaves the pin LOW.
    fn close(&mut self) -> GpioResult<()>;

    fn is_open(&self) -> bool;

    fn read(&self) -> GpioResult<u32>;

    /// Sets the duty value, `0..=range()`.
    fn write(&mut self, value: u32) -> GpioResult<()>;

    fn set_enable(&mut self, enable: bool) -> GpioResult<()>;

    fn is_enabled(&self) -> bool;

    fn range(&self) -> u32;

    fn set_range(&mut self, range: u32) -> GpioResult<()>;

    /// Frequency actually produced, in Hz.
    fn frequency(&self) -> f64;

    /// Asks for `frequency` Hz; the closest achievable one is used.
    fn set_frequency(&mut self, frequency: f64) -> GpioResult<()>;
}

/// Any of the PWM engines.
#[derive(Debug)]
pub enum Pwm {
    Soft(SoftPwm),
    Gpio(GpioPwm),
    Soc(SocPwm),
}

macro_rules! delegate {
    ($self:ident, $engine:ident => $call:expr) => {
        match $self {
            Pwm::Soft($engine) => $call,
            Pwm::Gpio($engine) => $call,
            Pwm::Soc($engine) => $call,
        }
    };
}

impl Converter for Pwm {
    fn open(&mut self, mode: OpenMode) -> GpioResult<()> {
        delegate!(self, pwm => pwm.open(mode))
    }

    fn close(&mut self) -> GpioResult<()> {
        delegate!(self, pwm => pwm.close())
    }

    fn is_open(&self) -> bool {
        delegate!(self, pwm => pwm.is_open())
    }

    fn read(&self) -> GpioResult<u32> {
        delegate!(self, pwm => pwm.read())
    }

    fn write(&mut self, value: u32) -> GpioResult<()> {
        delegate!(self, pwm => pwm.write(value))
    }

    fn set_enable(&mut self, enable: bool) -> GpioResult<()> {
        delegate!(self, pwm => pwm.set_enable(enable))
    }

    fn is_enabled(&self) -> bool {
        delegate!(self, pwm => pwm.is_enabled())
    }

    fn range(&self) -> u32 {
        delegate!(self, pwm => pwm.range())
    }

    fn set_range(&mut self, range: u32) -> GpioResult<()> {
        delegate!(self, pwm => pwm.set_range(range))
    }

    fn frequency(&self) -> f64 {
        delegate!(self, pwm => pwm.frequency())
    }

    fn set_frequency(&mut self, frequency: f64) -> GpioResult<()> {
        delegate!(self, pwm => pwm.set_frequency(frequency))
    }
}

impl eh::PwmPin for Pwm {
    type Duty = u32;

    fn disable(&mut self) {
        if let Err(err) = self.set_enable(false) {
            log::warn!("failed to disable pwm: {}", err);
        }
    }

    fn enable(&mut self) {
        if let Err(err) = self.set_enable(true) {
            log::warn!("failed to enable pwm: {}", err);
        }
    }

    fn get_duty(&self) -> u32 {
        self.read().unwrap_or(0)
    }

    fn get_max_duty(&self) -> u32 {
        self.range()
    }

    fn set_duty(&mut self, duty: u32) {
        if let Err(err) = self.write(duty) {
            log::warn!("failed to set pwm duty: {}", err);
        }
    }
}

/// Builds an engine on `pin` of `gpio`.
pub type PwmFactory = fn(&Gpio, &Arc<Pin>) -> GpioResult<Pwm>;

/// Named PWM engine factories.
///
/// ```no_run
/// use sbc_mmap_gpio::pwm::{self, Converter, OpenMode, Registry};
/// use sbc_mmap_gpio::{Gpio, GpioConfig};
///
/// # fn main() -> sbc_mmap_gpio::GpioResult<()> {
/// let mut registry = Registry::new();
/// pwm::register_builtin(&mut registry);
///
/// let gpio = Gpio::new(GpioConfig::default())?;
/// gpio.open()?;
/// let mut led = registry.create("softpwm", &gpio, gpio.pin(0)?)?;
/// led.open(OpenMode::Write)?;
/// led.write(512)?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct Registry {
    factories: BTreeMap<String, PwmFactory>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.factories.keys()).finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the factory called `name`.
    pub fn register(&mut self, name: &str, factory: PwmFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn create(&self, name: &str, gpio: &Gpio, pin: &Arc<Pin>) -> GpioResult<Pwm> {
        let factory = self.factories.get(name).ok_or_else(|| {
            GpioError::ConfigError(crate::device::error::ConfigError::InvalidDescriptor(format!(
                "no pwm engine called {}",
                name
            )))
        })?;
        factory(gpio, pin)
    }
}

/// Registers `softpwm`, `gpiopwm` and `socpwm`.
pub fn register_builtin(registry: &mut Registry) {
    registry.register("softpwm", |gpio, pin| {
        Ok(Pwm::Soft(SoftPwm::new(Arc::clone(pin), gpio.config().soft_pwm_priority)))
    });
    registry.register("gpiopwm", |_, pin| Ok(Pwm::Gpio(GpioPwm::new(Arc::clone(pin)))));
    registry.register("socpwm", |gpio, pin| {
        Ok(Pwm::Soc(SocPwm::new(Arc::clone(pin), Arc::clone(gpio.memory()))?))
    });
}

/// Background thread of a bit-banging engine.
#[derive(Debug)]
pub(crate) struct Generator {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl Generator {
    /// Spawns `body`, which must return once the receiver yields or disconnects.
    pub fn spawn<F>(name: String, body: F) -> GpioResult<Self>
    where
        F: FnOnce(Receiver<()>) + Send + 'static,
    {
        let (stop, stopped) = crossbeam_channel::bounded(1);
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || body(stopped))
            .map_err(GpioError::ThreadSpawnFailed)?;
        Ok(Self { stop, handle })
    }

    /// Signals the thread and waits for it.
    pub fn stop(self) {
        let _ = self.stop.send(());
        if self.handle.join().is_err() {
            log::error!("pwm generator thread panicked");
        }
    }
}

/// Waits until `deadline` or a stop request. `None` waits for the stop request only.
///
/// Returns true when the generator has to stop.
pub(crate) fn pause_until(stopped: &Receiver<()>, deadline: Option<Instant>) -> bool {
    match deadline {
        Some(deadline) => !matches!(stopped.recv_deadline(deadline), Err(RecvTimeoutError::Timeout)),
        None => {
            let _ = stopped.recv();
            true
        }
    }
}

pub(crate) fn pause(stopped: &Receiver<()>, duration: Duration) -> bool {
    pause_until(stopped, Instant::now().checked_add(duration))
}

pub(crate) fn check_frequency(frequency: f64) -> GpioResult<f64> {
    if frequency.is_finite() && frequency > 0.0 {
        Ok(frequency)
    } else {
        Err(GpioError::PinError(PinError::InvalidFrequency(frequency)))
    }
}

/// Logs `err` and aborts. Generator threads have nobody to report to.
pub(crate) fn abort_generator(pin: &str, err: GpioError) -> ! {
    log::error!("pwm on {}: output failed: {}", pin, err);
    std::process::abort()
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::BoardDatabase;
    use crate::device::chardev::testing::FakeLines;
    use crate::device::memory::SimulatedMemory;
    use crate::pin_map::BuiltinBoards;
    use crate::GpioConfig;

    #[test]
    fn builtin_engines_are_registered() {
        let mut registry = Registry::new();
        assert!(!registry.contains("softpwm"));
        register_builtin(&mut registry);
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["gpiopwm", "socpwm", "softpwm"]);
    }

    #[test]
    fn registry_builds_engines_by_name() {
        let mut registry = Registry::new();
        register_builtin(&mut registry);
        let board = BuiltinBoards.board("rpi4b").unwrap();
        let gpio = Gpio::with_parts(
            board,
            GpioConfig::default(),
            Arc::new(SimulatedMemory::new()),
            Arc::new(FakeLines::default()),
        )
        .unwrap();
        gpio.open().unwrap();

        // Logical 22 is GPIO12, logical 0 is GPIO17.
        let pwm = registry.create("socpwm", &gpio, gpio.pin(22).unwrap()).unwrap();
        assert!(matches!(pwm, Pwm::Soc(_)));
        assert!(registry.create("socpwm", &gpio, gpio.pin(0).unwrap()).is_err());
        let pwm = registry.create("softpwm", &gpio, gpio.pin(0).unwrap()).unwrap();
        assert!(matches!(pwm, Pwm::Soft(_)));
        assert!(registry.create("analog", &gpio, gpio.pin(0).unwrap()).is_err());
    }

    #[test]
    fn pwm_pin_drives_converter() {
        use embedded_hal::PwmPin;

        let (pin, window, _) = testing::bcm2711_pin(17);
        let mut pwm = Pwm::Gpio(GpioPwm::new(pin));
        pwm.open(OpenMode::Write).unwrap();
        assert_eq!(pwm.get_max_duty(), DEFAULT_RANGE);
        pwm.set_duty(DEFAULT_RANGE);
        assert_eq!(pwm.get_duty(), DEFAULT_RANGE);
        pwm.enable();
        assert!(pwm.is_enabled());
        pwm.disable();
        assert!(!pwm.is_enabled());
        assert!(!window.level(17));
        pwm.close().unwrap();
    }
}
