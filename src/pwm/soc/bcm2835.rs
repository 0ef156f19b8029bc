use std::sync::Arc;

use super::{handshake, Divisors, PwmDevice};
use crate::board::SocModel;
use crate::device::bcm2835::peripheral_base;
use crate::device::memory::{MemoryDevice, PAGE_SIZE};
use crate::device::Mapping;
use crate::GpioResult;

const PWM_OFFSET: u64 = 0x20_C000;
const CLOCK_OFFSET: u64 = 0x10_1000;

// PWM block.
const CTL: usize = 0;
const RNG1: usize = 4;
const DAT1: usize = 5;
const RNG2: usize = 8;
const DAT2: usize = 9;

const PWEN1: u32 = 1 << 0;
const MSEN1: u32 = 1 << 7;
/// Channel 2 bits sit this far above channel 1 bits.
const CHANNEL_SHIFT: u32 = 8;

// Clock manager.
const CM_PWMCTL: usize = 40;
const CM_PWMDIV: usize = 41;
const CM_PASSWORD: u32 = 0x5A00_0000;
const CM_ENAB: u32 = 1 << 4;
const CM_BUSY: u32 = 1 << 7;
const CM_SRC_PLLD: u32 = 6;

/// PWM0 of the BCM2835 family, in mark-space mode, clocked from PLLD.
#[derive(Debug)]
pub struct Bcm2835Pwm {
    soc: SocModel,
    channel: u32,
    pwm: Mapping,
    clock: Mapping,
}

impl Bcm2835Pwm {
    /// Channel reachable from `mcu`, `None` if there is none.
    pub fn new(soc: SocModel, mcu: u32, memory: Arc<dyn MemoryDevice>) -> Option<Self> {
        let channel = match mcu {
            12 | 18 => 0,
            13 | 19 => 1,
            _ => return None,
        };
        let base = peripheral_base(soc);
        Some(Self {
            soc,
            channel,
            pwm: Mapping::new("bcm2835-pwm", base + PWM_OFFSET, PAGE_SIZE, memory.clone()),
            clock: Mapping::new("bcm2835-cm", base + CLOCK_OFFSET, PAGE_SIZE, memory),
        })
    }

    pub fn channel(&self) -> u32 {
        self.channel
    }

    fn registers(&self) -> (usize, usize) {
        if self.channel == 0 {
            (RNG1, DAT1)
        } else {
            (RNG2, DAT2)
        }
    }

    fn wait_clock_idle(&self) -> GpioResult<()> {
        handshake("pwm clock", || Ok(self.clock.read(CM_PWMCTL)? & CM_BUSY == 0))
    }
}

impl PwmDevice for Bcm2835Pwm {
    /// PLLD runs at 750 MHz on the BCM2711 and 500 MHz on older models.
    fn clock(&self) -> f64 {
        if self.soc == SocModel::Bcm2711 {
            750e6
        } else {
            500e6
        }
    }

    fn divisors(&self) -> Divisors {
        Divisors::Linear { min: 2, max: 4095 }
    }

    fn max_range(&self) -> u32 {
        u32::MAX
    }

    fn open(&self) -> GpioResult<()> {
        self.pwm.open()?;
        if let Err(err) = self.clock.open() {
            self.pwm.close();
            return Err(err);
        }
        Ok(())
    }

    fn close(&self) {
        self.clock.close();
        self.pwm.close();
    }

    fn set_enable(&self, enable: bool) -> GpioResult<()> {
        let shift = self.channel * CHANNEL_SHIFT;
        let ctl = self.pwm.read(CTL)?;
        let ctl = if enable {
            ctl | (PWEN1 | MSEN1) << shift
        } else {
            ctl & !(PWEN1 << shift)
        };
        self.pwm.write(CTL, ctl)
    }

    /// Stops the clock, waits for it to go idle, loads DIVI and restarts it.
    fn set_divisor(&self, divisor: u32) -> GpioResult<()> {
        self.clock.write(CM_PWMCTL, CM_PASSWORD | CM_SRC_PLLD)?;
        self.wait_clock_idle()?;
        self.clock.write(CM_PWMDIV, CM_PASSWORD | (divisor & 0xFFF) << 12)?;
        self.clock.write(CM_PWMCTL, CM_PASSWORD | CM_ENAB | CM_SRC_PLLD)
    }

    fn set_range(&self, range: u32) -> GpioResult<()> {
        let (rng, _) = self.registers();
        self.pwm.write(rng, range)
    }

    fn set_value(&self, value: u32) -> GpioResult<()> {
        let (_, dat) = self.registers();
        self.pwm.write(dat, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::memory::SimulatedMemory;

    const BCM2711_PWM: u64 = 0xFE20_C000;
    const BCM2711_CM: u64 = 0xFE10_1000;

    fn channel(mcu: u32) -> (Bcm2835Pwm, Arc<SimulatedMemory>) {
        let memory = Arc::new(SimulatedMemory::new());
        let pwm = Bcm2835Pwm::new(SocModel::Bcm2711, mcu, memory.clone()).unwrap();
        pwm.open().unwrap();
        (pwm, memory)
    }

    #[test]
    fn channels_by_pin() {
        let memory = Arc::new(SimulatedMemory::new());
        assert_eq!(Bcm2835Pwm::new(SocModel::Bcm2837, 18, memory.clone()).unwrap().channel(), 0);
        assert_eq!(Bcm2835Pwm::new(SocModel::Bcm2837, 13, memory.clone()).unwrap().channel(), 1);
        assert!(Bcm2835Pwm::new(SocModel::Bcm2837, 17, memory).is_none());
    }

    #[test]
    fn clock_is_programmed_with_password() {
        let (pwm, memory) = channel(12);
        pwm.set_divisor(733).unwrap();
        let cm = memory.window(BCM2711_CM).unwrap();
        assert_eq!(cm.read(CM_PWMDIV), 0x5A00_0000 | 733 << 12);
        assert_eq!(cm.read(CM_PWMCTL), 0x5A00_0016);
    }

    #[test]
    fn second_channel_uses_its_own_registers() {
        let (pwm, memory) = channel(19);
        pwm.set_range(1024).unwrap();
        pwm.set_value(256).unwrap();
        pwm.set_enable(true).unwrap();

        let regs = memory.window(BCM2711_PWM).unwrap();
        assert_eq!(regs.read(RNG2), 1024);
        assert_eq!(regs.read(DAT2), 256);
        assert_eq!(regs.read(RNG1), 0);
        assert_eq!(regs.read(CTL), (PWEN1 | MSEN1) << 8);

        pwm.set_enable(false).unwrap();
        assert_eq!(regs.read(CTL), MSEN1 << 8);
    }
}
