use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use crossbeam_channel::Receiver;
use std::time::{Duration, Instant};

use super::{
    abort_generator, check_frequency, pause_until, Converter, Generator, OpenMode, DEFAULT_FREQUENCY, DEFAULT_RANGE,
};
use crate::device::error::PinError;
use crate::pin::{Mode, Pin, PinOutput};
use crate::{GpioError, GpioResult};

#[derive(Debug)]
struct Shared {
    value: AtomicU32,
    range: AtomicU32,
    period_ns: AtomicU64,
}

impl Shared {
    /// HIGH and LOW durations of one period, in nanoseconds.
    fn split(&self) -> (u64, u64) {
        let range = self.range.load(Ordering::SeqCst).max(1) as u64;
        let value = (self.value.load(Ordering::SeqCst) as u64).min(range);
        let period = self.period_ns.load(Ordering::SeqCst);
        let high = (period as u128 * value as u128 / range as u128) as u64;
        (high, period - high)
    }
}

/// Bit-banged PWM on any output pin, timed in nanoseconds at normal priority.
///
/// The generator keeps a target instant advanced by exactly one half cycle at a time,
/// so jitter of a single wake-up does not accumulate.
#[derive(Debug)]
pub struct GpioPwm {
    pin: Arc<Pin>,
    shared: Arc<Shared>,
    frequency: f64,
    generator: Option<Generator>,
    open: bool,
}

fn period_for(frequency: f64) -> u64 {
    let period = (1e9 / frequency).round();
    if period.is_finite() && period >= 1.0 {
        period as u64
    } else {
        1
    }
}

/// Runs half cycles until a stop request arrives, which cuts the current one short.
fn generate(shared: &Shared, output: &PinOutput, label: &str, stopped: &Receiver<()>) {
    let mut level = None;
    let mut drive = |value: bool| {
        if level != Some(value) {
            if let Err(err) = output.write(value) {
                abort_generator(label, err);
            }
            level = Some(value);
        }
    };

    let mut target = Instant::now();
    // Advances the target by `nanos`; a target past the clock's end waits for stop.
    let mut hold = |nanos: u64| {
        let next = target.checked_add(Duration::from_nanos(nanos));
        target = next.unwrap_or(target);
        pause_until(stopped, next)
    };

    loop {
        let (high, low) = shared.split();
        if high > 0 {
            drive(true);
            if hold(high) {
                return;
            }
        }
        if low > 0 {
            drive(false);
            if hold(low) {
                return;
            }
        }
    }
}

impl GpioPwm {
    pub fn new(pin: Arc<Pin>) -> Self {
        Self {
            pin,
            shared: Arc::new(Shared {
                value: AtomicU32::new(0),
                range: AtomicU32::new(DEFAULT_RANGE),
                period_ns: AtomicU64::new(period_for(DEFAULT_FREQUENCY)),
            }),
            frequency: DEFAULT_FREQUENCY,
            generator: None,
            open: false,
        }
    }

    pub fn pin(&self) -> &Arc<Pin> {
        &self.pin
    }

    pub fn period(&self) -> Duration {
        Duration::from_nanos(self.shared.period_ns.load(Ordering::SeqCst))
    }

    fn check_open(&self) -> GpioResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(GpioError::PinError(PinError::NotOpen(self.pin.label().to_string())))
        }
    }

    fn start(&mut self) -> GpioResult<()> {
        let output = self.pin.output()?;
        let shared = Arc::clone(&self.shared);
        let label = self.pin.label().to_string();
        let name = format!("gpiopwm-{}", self.pin.mcu());

        self.generator = Some(Generator::spawn(name, move |stopped| {
            generate(&shared, &output, &label, &stopped);
        })?);
        Ok(())
    }

    fn stop(&mut self) -> GpioResult<()> {
        if let Some(generator) = self.generator.take() {
            generator.stop();
        }
        self.pin.write(false)
    }
}

impl Converter for GpioPwm {
    fn open(&mut self, _mode: OpenMode) -> GpioResult<()> {
        if self.open {
            return Ok(());
        }
        self.pin.set_mode(Mode::Output)?;
        self.pin.write(false)?;
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> GpioResult<()> {
        if !self.open {
            return Ok(());
        }
        let result = self.stop();
        self.open = false;
        result
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn read(&self) -> GpioResult<u32> {
        Ok(self.shared.value.load(Ordering::SeqCst))
    }

    fn write(&mut self, value: u32) -> GpioResult<()> {
        self.check_open()?;
        self.shared.value.store(value, Ordering::SeqCst);
        Ok(())
    }

    fn set_enable(&mut self, enable: bool) -> GpioResult<()> {
        self.check_open()?;
        match (enable, self.generator.is_some()) {
            (true, false) => self.start(),
            (false, true) => self.stop(),
            _ => Ok(()),
        }
    }

    fn is_enabled(&self) -> bool {
        self.generator.is_some()
    }

    fn range(&self) -> u32 {
        self.shared.range.load(Ordering::SeqCst)
    }

    fn set_range(&mut self, range: u32) -> GpioResult<()> {
        self.shared.range.store(range.max(1), Ordering::SeqCst);
        Ok(())
    }

    fn frequency(&self) -> f64 {
        self.frequency
    }

    fn set_frequency(&mut self, frequency: f64) -> GpioResult<()> {
        let period = period_for(check_frequency(frequency)?);
        self.shared.period_ns.store(period, Ordering::SeqCst);
        self.frequency = 1e9 / period as f64;
        Ok(())
    }
}

impl Drop for GpioPwm {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::warn!("gpiopwm on {}: close failed: {}", self.pin.label(), err);
        }
    }
}
