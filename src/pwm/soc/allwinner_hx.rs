use std::sync::Arc;

use super::{handshake, Divisors, PwmDevice};
use crate::device::memory::{MemoryDevice, PAGE_SIZE};
use crate::device::Mapping;
use crate::GpioResult;

const PWM_PAGE: u64 = 0x01C2_1000;
const CTRL: usize = 0x400 / 4;
const CH0_PERIOD: usize = CTRL + 1;

const PRESCALE_MASK: u32 = 0xF;
const EN: u32 = 1 << 4;
const ACT_STA: u32 = 1 << 5;
const SCLK_GATING: u32 = 1 << 6;
const PERIOD_BUSY: u32 = 1 << 28;

/// Prescaler code and the divisor it selects, from the 24 MHz oscillator.
const PRESCALERS: [(u32, u32); 11] = [
    (15, 1),
    (0, 120),
    (1, 180),
    (2, 240),
    (3, 360),
    (4, 480),
    (8, 12000),
    (9, 24000),
    (10, 36000),
    (11, 48000),
    (12, 72000),
];

const DIVISORS: [u32; 11] = [1, 120, 180, 240, 360, 480, 12000, 24000, 36000, 48000, 72000];

/// PWM0 of the H3/H5, routed to PA5.
///
/// Period and duty share one register, `(entire_cycles - 1) << 16 | active_cycles`, so
/// the range is limited to 65536.
#[derive(Debug)]
pub struct AllWinnerHxPwm {
    registers: Mapping,
}

impl AllWinnerHxPwm {
    pub fn new(mcu: u32, memory: Arc<dyn MemoryDevice>) -> Option<Self> {
        if mcu != 5 {
            return None;
        }
        Some(Self {
            registers: Mapping::new("sunxi-pwm", PWM_PAGE, PAGE_SIZE, memory),
        })
    }

    fn wait_period_ready(&self) -> GpioResult<()> {
        handshake("pwm period register", || {
            Ok(self.registers.read(CTRL)? & PERIOD_BUSY == 0)
        })
    }

    fn write_period(&self, entire: u32, active: u32) -> GpioResult<()> {
        self.wait_period_ready()?;
        // Active cycles share the 16-bit field, so the period stops at 0xFFFF to keep
        // full duty reachable.
        let entire = entire.clamp(1, 0xFFFF);
        let active = active.min(entire);
        self.registers.write(CH0_PERIOD, (entire - 1) << 16 | active)?;
        self.wait_period_ready()
    }

    fn period(&self) -> GpioResult<(u32, u32)> {
        let word = self.registers.read(CH0_PERIOD)?;
        Ok(((word >> 16) + 1, word & 0xFFFF))
    }
}

impl PwmDevice for AllWinnerHxPwm {
    fn clock(&self) -> f64 {
        24e6
    }

    fn divisors(&self) -> Divisors {
        Divisors::Steps(&DIVISORS)
    }

    fn max_range(&self) -> u32 {
        0xFFFF
    }

    fn open(&self) -> GpioResult<()> {
        self.registers.open()
    }

    fn close(&self) {
        self.registers.close()
    }

    fn set_enable(&self, enable: bool) -> GpioResult<()> {
        let ctrl = self.registers.read(CTRL)?;
        let ctrl = if enable {
            ctrl | EN | ACT_STA | SCLK_GATING
        } else {
            ctrl & !(EN | SCLK_GATING)
        };
        self.registers.write(CTRL, ctrl)
    }

    fn set_divisor(&self, divisor: u32) -> GpioResult<()> {
        let code = PRESCALERS
            .iter()
            .find(|(_, candidate)| *candidate == divisor)
            .map_or(PRESCALE_MASK, |(code, _)| *code);
        self.registers.write_field(CTRL, 0, 4, code)?;
        self.wait_period_ready()
    }

    fn set_range(&self, range: u32) -> GpioResult<()> {
        let (_, active) = self.period()?;
        self.write_period(range, active)
    }

    fn set_value(&self, value: u32) -> GpioResult<()> {
        let (entire, _) = self.period()?;
        self.write_period(entire, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::memory::SimulatedMemory;

    fn channel() -> (AllWinnerHxPwm, Arc<SimulatedMemory>) {
        let memory = Arc::new(SimulatedMemory::new());
        let pwm = AllWinnerHxPwm::new(5, memory.clone()).unwrap();
        pwm.open().unwrap();
        (pwm, memory)
    }

    #[test]
    fn only_pa5() {
        let memory = Arc::new(SimulatedMemory::new());
        assert!(AllWinnerHxPwm::new(5, memory.clone()).is_some());
        assert!(AllWinnerHxPwm::new(6, memory).is_none());
    }

    #[test]
    fn divisor_tables_agree() {
        for ((_, divisor), listed) in PRESCALERS.iter().zip(DIVISORS.iter()) {
            assert_eq!(divisor, listed);
        }
    }

    #[test]
    fn period_register_packs_range_and_value() {
        let (pwm, memory) = channel();
        pwm.set_range(100).unwrap();
        pwm.set_value(25).unwrap();
        let regs = memory.window(PWM_PAGE).unwrap();
        assert_eq!(regs.read(CH0_PERIOD), 99 << 16 | 25);

        pwm.set_range(20).unwrap();
        assert_eq!(regs.read(CH0_PERIOD), 19 << 16 | 20);
        pwm.set_range(0x1_0000).unwrap();
        assert_eq!(regs.read(CH0_PERIOD) >> 16, 0xFFFE);
    }

    #[test]
    fn full_duty_at_largest_range() {
        let (pwm, memory) = channel();
        pwm.set_range(pwm.max_range()).unwrap();
        pwm.set_value(pwm.max_range()).unwrap();
        let regs = memory.window(PWM_PAGE).unwrap();
        assert_eq!(regs.read(CH0_PERIOD), 0xFFFE << 16 | 0xFFFF);
    }

    #[test]
    fn prescaler_and_enable_bits() {
        let (pwm, memory) = channel();
        pwm.set_divisor(240).unwrap();
        pwm.set_enable(true).unwrap();
        let regs = memory.window(PWM_PAGE).unwrap();
        assert_eq!(regs.read(CTRL), 2 | EN | ACT_STA | SCLK_GATING);

        pwm.set_divisor(1).unwrap();
        assert_eq!(regs.read(CTRL) & PRESCALE_MASK, 15);
        pwm.set_enable(false).unwrap();
        assert_eq!(regs.read(CTRL) & (EN | SCLK_GATING), 0);
    }
}
