use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use crossbeam_channel::Receiver;
use std::time::Duration;

use super::{
    abort_generator, check_frequency, pause, Converter, Generator, OpenMode, DEFAULT_FREQUENCY, DEFAULT_RANGE,
};
use crate::device::error::PinError;
use crate::pin::{Mode, Pin, PinOutput};
use crate::{GpioError, GpioResult};

/// Smallest range a software PWM accepts.
pub const MIN_RANGE: u32 = 2;

/// State shared with the generator thread. Re-read once per period.
#[derive(Debug)]
struct Shared {
    mark: AtomicU32,
    range: AtomicU32,
    /// Microseconds per range step.
    tick: AtomicU64,
}

/// Bit-banged PWM with microsecond resolution, run from a SCHED_FIFO thread.
///
/// Each period is `range` ticks long; the pin is HIGH for `value` of them. The output
/// only changes when the level does, so a value of 0 or `range` produces no edges.
#[derive(Debug)]
pub struct SoftPwm {
    pin: Arc<Pin>,
    priority: i32,
    shared: Arc<Shared>,
    generator: Option<Generator>,
    open: bool,
}

fn tick_for(frequency: f64, range: u32) -> u64 {
    let tick = (1e6 / (frequency * range as f64)).ceil();
    if tick.is_finite() && tick >= 1.0 {
        tick as u64
    } else {
        1
    }
}

impl SoftPwm {
    pub fn new(pin: Arc<Pin>, priority: i32) -> Self {
        Self {
            pin,
            priority,
            shared: Arc::new(Shared {
                mark: AtomicU32::new(0),
                range: AtomicU32::new(DEFAULT_RANGE),
                tick: AtomicU64::new(tick_for(DEFAULT_FREQUENCY, DEFAULT_RANGE)),
            }),
            generator: None,
            open: false,
        }
    }

    pub fn pin(&self) -> &Arc<Pin> {
        &self.pin
    }

    /// Length of one range step.
    pub fn tick(&self) -> Duration {
        Duration::from_micros(self.shared.tick.load(Ordering::SeqCst))
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
        let priority = self.priority;
        let label = self.pin.label().to_string();
        let name = format!("softpwm-{}", self.pin.mcu());

        self.generator = Some(Generator::spawn(name, move |stopped| {
            set_realtime_priority(priority);
            generate(&shared, &output, &label, &stopped);
        })?);
        log::debug!("softpwm on {} started", self.pin.label());
        Ok(())
    }

    fn stop(&mut self) -> GpioResult<()> {
        if let Some(generator) = self.generator.take() {
            generator.stop();
            log::debug!("softpwm on {} stopped", self.pin.label());
        }
        self.pin.write(false)
    }
}

fn set_realtime_priority(priority: i32) {
    if priority <= 0 {
        return;
    }
    let param = libc::sched_param {
        sched_priority: priority,
    };
    // SAFETY: `param` outlives the call and pthread_self() is always a valid thread.
    let result = unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) };
    if result != 0 {
        log::warn!(
            "softpwm: SCHED_FIFO priority {} refused ({}), running at normal priority",
            priority,
            std::io::Error::from_raw_os_error(result)
        );
    }
}

/// Runs periods until a stop request arrives. The request cuts the current phase short.
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

    loop {
        let range = shared.range.load(Ordering::SeqCst);
        let mark = shared.mark.load(Ordering::SeqCst).min(range);
        let tick = shared.tick.load(Ordering::SeqCst);

        if mark > 0 {
            drive(true);
            if pause(stopped, Duration::from_micros((mark as u64).saturating_mul(tick))) {
                return;
            }
        }
        if mark < range {
            drive(false);
            if pause(stopped, Duration::from_micros(((range - mark) as u64).saturating_mul(tick))) {
                return;
            }
        }
    }
}

impl Converter for SoftPwm {
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
        Ok(self.shared.mark.load(Ordering::SeqCst))
    }

    /// Values above the range saturate to a constant HIGH.
    fn write(&mut self, value: u32) -> GpioResult<()> {
        self.check_open()?;
        self.shared.mark.store(value, Ordering::SeqCst);
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

    /// Ranges below `MIN_RANGE` are raised to it. Keeps the current frequency.
    fn set_range(&mut self, range: u32) -> GpioResult<()> {
        let frequency = self.frequency();
        let range = range.max(MIN_RANGE);
        self.shared.range.store(range, Ordering::SeqCst);
        self.shared.tick.store(tick_for(frequency, range), Ordering::SeqCst);
        Ok(())
    }

    fn frequency(&self) -> f64 {
        1e6 / (self.shared.tick.load(Ordering::SeqCst) as f64 * self.range() as f64)
    }

    /// The period is rounded up to a whole number of microsecond ticks.
    fn set_frequency(&mut self, frequency: f64) -> GpioResult<()> {
        let frequency = check_frequency(frequency)?;
        self.shared.tick.store(tick_for(frequency, self.range()), Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for SoftPwm {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::warn!("softpwm on {}: close failed: {}", self.pin.label(), err);
        }
    }
}
