//! Hardware PWM peripherals.
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::{check_frequency, Converter, OpenMode, DEFAULT_FREQUENCY, DEFAULT_RANGE};
use crate::board::SocFamily;
use crate::device::error::{DeviceError, PinError};
use crate::device::memory::MemoryDevice;
use crate::gpio::AccessLayer;
use crate::pin::{Mode, Pin};
use crate::{GpioError, GpioResult};

mod allwinner_hx;
mod bcm2835;
mod rp1;

pub use allwinner_hx::AllWinnerHxPwm;
pub use bcm2835::Bcm2835Pwm;
pub use rp1::Rp1Pwm;

const HANDSHAKE_POLLS: u32 = 1000;
const HANDSHAKE_INTERVAL: Duration = Duration::from_micros(10);

/// Clock divisors a peripheral can be programmed with.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Divisors {
    /// Any integer in `min..=max`.
    Linear { min: u32, max: u32 },
    /// A fixed set of values.
    Steps(&'static [u32]),
}

impl Divisors {
    /// Divisor giving the frequency closest to `frequency` at `range`.
    ///
    /// Integer divisors are rounded up, so the result never exceeds the request unless
    /// clamped to `min`.
    pub fn choose(&self, clock: f64, frequency: f64, range: u32) -> u32 {
        match *self {
            Divisors::Linear { min, max } => {
                let divisor = (clock / frequency / range as f64).ceil();
                if divisor.is_nan() {
                    max
                } else {
                    // Saturating cast, then clamp.
                    (divisor as u32).clamp(min, max)
                }
            }
            Divisors::Steps(steps) => {
                let error = |divisor: u32| (clock / (divisor as f64 * range as f64) - frequency).abs();
                let mut best = steps.first().copied().unwrap_or(1);
                for &divisor in steps {
                    if error(divisor) < error(best) {
                        best = divisor;
                    }
                }
                best
            }
        }
    }
}

/// One channel of a SoC PWM peripheral.
pub trait PwmDevice: fmt::Debug + Send + Sync {
    /// Source clock of the channel, in Hz.
    fn clock(&self) -> f64;

    fn divisors(&self) -> Divisors;

    fn max_range(&self) -> u32;

    fn open(&self) -> GpioResult<()>;

    fn close(&self);

    fn set_enable(&self, enable: bool) -> GpioResult<()>;

    /// Programs the clock divisor and waits for the peripheral to accept it.
    /// Called with the channel disabled.
    fn set_divisor(&self, divisor: u32) -> GpioResult<()>;

    fn set_range(&self, range: u32) -> GpioResult<()>;

    fn set_value(&self, value: u32) -> GpioResult<()>;
}

/// Polls `ready` until it holds, failing with `HandshakeTimeout(what)`.
pub(crate) fn handshake<F>(what: &'static str, mut ready: F) -> GpioResult<()>
where
    F: FnMut() -> GpioResult<bool>,
{
    for _ in 0..HANDSHAKE_POLLS {
        if ready()? {
            return Ok(());
        }
        thread::sleep(HANDSHAKE_INTERVAL);
    }
    Err(GpioError::DeviceError(DeviceError::HandshakeTimeout(what)))
}

/// PWM driven by the SoC peripheral.
///
/// Only the memory-mapped access layer can reach the peripheral, and only pins routed
/// to a channel can carry it.
#[derive(Debug)]
pub struct SocPwm {
    pin: Arc<Pin>,
    device: Box<dyn PwmDevice>,
    /// Mode restored on close.
    previous: Option<Mode>,
    open: bool,
    enabled: bool,
    value: u32,
    range: u32,
    divisor: u32,
}

impl SocPwm {
    pub fn new(pin: Arc<Pin>, memory: Arc<dyn MemoryDevice>) -> GpioResult<Self> {
        if pin.access_layer() != AccessLayer::Memory {
            return Err(GpioError::DeviceError(DeviceError::Unsupported(
                "hardware pwm through the character device",
            )));
        }
        let not_supported = || GpioError::PinError(PinError::PwmNotSupported(pin.label().to_string()));
        if !pin.supports(Mode::Pwm) {
            return Err(not_supported());
        }
        let mcu = u32::try_from(pin.mcu()).map_err(|_| not_supported())?;
        let soc = pin.soc();

        let device: Box<dyn PwmDevice> = match soc.family() {
            SocFamily::Bcm2835 => Box::new(Bcm2835Pwm::new(soc, mcu, memory).ok_or_else(not_supported)?),
            SocFamily::AllWinnerHx => Box::new(AllWinnerHxPwm::new(mcu, memory).ok_or_else(not_supported)?),
            SocFamily::Rp1 => Box::new(Rp1Pwm::new(mcu, memory).ok_or_else(not_supported)?),
            SocFamily::AmlogicS905 | SocFamily::Unknown => return Err(not_supported()),
        };
        Ok(Self::with_device(pin, device))
    }

    /// Binds an already constructed channel to `pin`.
    pub fn with_device(pin: Arc<Pin>, device: Box<dyn PwmDevice>) -> Self {
        let range = DEFAULT_RANGE.min(device.max_range());
        let divisor = device.divisors().choose(device.clock(), DEFAULT_FREQUENCY, range);
        Self {
            pin,
            device,
            previous: None,
            open: false,
            enabled: false,
            value: 0,
            range,
            divisor,
        }
    }

    pub fn pin(&self) -> &Arc<Pin> {
        &self.pin
    }

    pub fn divisor(&self) -> u32 {
        self.divisor
    }

    fn check_open(&self) -> GpioResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(GpioError::PinError(PinError::NotOpen(self.pin.label().to_string())))
        }
    }

    /// Disables the channel around `change` and restores the enable state afterwards.
    fn reprogram<F>(&mut self, change: F) -> GpioResult<()>
    where
        F: FnOnce(&dyn PwmDevice) -> GpioResult<()>,
    {
        if self.enabled {
            self.device.set_enable(false)?;
        }
        change(self.device.as_ref())?;
        if self.enabled {
            self.device.set_enable(true)?;
        }
        Ok(())
    }
}

impl Converter for SocPwm {
    fn open(&mut self, _mode: OpenMode) -> GpioResult<()> {
        if self.open {
            return Ok(());
        }
        let previous = self.pin.mode()?;
        self.device.open()?;
        let (divisor, range) = (self.divisor, self.range);
        let setup = self.reprogram(|device| {
            device.set_enable(false)?;
            device.set_divisor(divisor)?;
            device.set_range(range)?;
            device.set_value(0)
        });
        if let Err(err) = setup.and_then(|_| self.pin.set_mode(Mode::Pwm)) {
            self.device.close();
            return Err(err);
        }
        self.previous = Some(previous);
        self.value = 0;
        self.open = true;
        log::debug!("socpwm on {} opened", self.pin.label());
        Ok(())
    }

    fn close(&mut self) -> GpioResult<()> {
        if !self.open {
            return Ok(());
        }
        let mut result = self.device.set_enable(false).and_then(|_| self.device.set_value(0));
        self.enabled = false;
        self.value = 0;
        if let Some(previous) = self.previous.take() {
            if previous != Mode::Pwm && self.pin.supports(previous) {
                result = result.and(self.pin.set_mode(previous));
            }
        }
        self.device.close();
        self.open = false;
        log::debug!("socpwm on {} closed", self.pin.label());
        result
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn read(&self) -> GpioResult<u32> {
        Ok(self.value)
    }

    fn write(&mut self, value: u32) -> GpioResult<()> {
        self.check_open()?;
        let value = value.min(self.range);
        self.device.set_value(value)?;
        self.value = value;
        Ok(())
    }

    fn set_enable(&mut self, enable: bool) -> GpioResult<()> {
        self.check_open()?;
        if enable != self.enabled {
            self.device.set_enable(enable)?;
            self.enabled = enable;
        }
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn range(&self) -> u32 {
        self.range
    }

    /// Changes the range keeping the frequency as close as possible.
    fn set_range(&mut self, range: u32) -> GpioResult<()> {
        let range = range.clamp(1, self.device.max_range());
        let frequency = self.frequency();
        let divisor = self.device.divisors().choose(self.device.clock(), frequency, range);
        if self.open {
            let value = self.value.min(range);
            self.reprogram(|device| {
                device.set_divisor(divisor)?;
                device.set_range(range)?;
                device.set_value(value)
            })?;
            self.value = value;
        }
        self.range = range;
        self.divisor = divisor;
        Ok(())
    }

    fn frequency(&self) -> f64 {
        self.device.clock() / (self.divisor as f64 * self.range as f64)
    }

    fn set_frequency(&mut self, frequency: f64) -> GpioResult<()> {
        let frequency = check_frequency(frequency)?;
        let divisor = self.device.divisors().choose(self.device.clock(), frequency, self.range);
        if self.open && divisor != self.divisor {
            self.reprogram(|device| device.set_divisor(divisor))?;
        }
        self.divisor = divisor;
        Ok(())
    }
}

impl Drop for SocPwm {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::warn!("socpwm on {}: close failed: {}", self.pin.label(), err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::bcm2711_pin;
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn linear_divisor_rounds_up_and_clamps() {
        let divisors = Divisors::Linear { min: 2, max: 4095 };
        assert_eq!(divisors.choose(750e6, 1000.0, 1024), 733);
        assert_eq!(divisors.choose(750e6, 1e9, 1024), 2);
        assert_eq!(divisors.choose(750e6, 0.001, 1024), 4095);
        assert_eq!(divisors.choose(750e6, 0.0, 1024), 4095);
    }

    #[test]
    fn steps_pick_closest_frequency() {
        let divisors = Divisors::Steps(&[1, 120, 180, 240]);
        assert_eq!(divisors.choose(24e6, 1000.0, 100), 240);
        assert_eq!(divisors.choose(24e6, 1800.0, 100), 120);
        assert_eq!(divisors.choose(24e6, 1e6, 100), 1);
    }

    #[test]
    fn pins_without_channel_are_refused() {
        let (pin, _, memory) = bcm2711_pin(17);
        // Mode table claims pwm but GPIO17 has no channel.
        assert!(matches!(
            SocPwm::new(pin, memory),
            Err(GpioError::PinError(PinError::PwmNotSupported(_)))
        ));
    }

    #[test]
    fn bad_frequencies_leave_divisor_alone() {
        let (pin, _, memory) = bcm2711_pin(18);
        let mut pwm = SocPwm::new(pin, memory).unwrap();
        pwm.set_frequency(1000.0).unwrap();
        let frequency = pwm.frequency();
        for bad in [0.0, -1000.0, f64::NAN] {
            assert!(matches!(
                pwm.set_frequency(bad),
                Err(GpioError::PinError(PinError::InvalidFrequency(_)))
            ));
        }
        assert_eq!(pwm.frequency(), frequency);
    }

    #[test]
    fn handshake_times_out() {
        let mut polls = 0;
        let result = handshake("test", || {
            polls += 1;
            Ok(false)
        });
        assert!(matches!(
            result,
            Err(GpioError::DeviceError(DeviceError::HandshakeTimeout("test")))
        ));
        assert_eq!(polls, HANDSHAKE_POLLS);
    }

    proptest! {
        #[test]
        fn linear_frequency_within_one_step(frequency in 10.0f64..100_000.0, range in 16u32..4096) {
            let clock = 500e6;
            let divisors = Divisors::Linear { min: 2, max: 4095 };
            let divisor = divisors.choose(clock, frequency, range);
            prop_assume!(divisor > 2 && divisor < 4095);
            let actual = clock / (divisor as f64 * range as f64);
            let coarser = clock / ((divisor - 1) as f64 * range as f64);
            prop_assert!(actual <= frequency * (1.0 + 1e-12));
            prop_assert!(coarser > frequency);
        }
    }
}
