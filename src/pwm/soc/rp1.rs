use std::sync::Arc;

use super::{handshake, Divisors, PwmDevice};
use crate::device::memory::{MemoryDevice, PAGE_SIZE};
use crate::device::Mapping;
use crate::GpioResult;

const PWM0_BASE: u64 = 0x1f_0009_8000;
const CLOCKS_BASE: u64 = 0x1f_0001_8000;

// PWM0 block.
const GLOBAL_CTRL: usize = 0;
const SET_UPDATE: u32 = 1 << 31;
const CHANNEL_BLOCK: usize = 0x14 / 4;
const CHANNEL_STRIDE: usize = 0x10 / 4;
const CHAN_CTRL: usize = 0;
const CHAN_RANGE: usize = 1;
const CHAN_PHASE: usize = 2;
const CHAN_DUTY: usize = 3;
const MODE_TRAILING_EDGE: u32 = 1;
const FIFO_POP_MASK: u32 = 1 << 8;

// Clock block, CLK_PWM0.
const CLK_PWM0_CTRL: usize = 0x74 / 4;
const CLK_PWM0_DIV_INT: usize = 0x78 / 4;
const CLK_PWM0_DIV_FRAC: usize = 0x7c / 4;
const CLK_PWM0_SEL: usize = 0x80 / 4;

// Observed control values; the meaning of the individual bits is not documented.
const CLK_CTRL_STOP: u32 = 0x1000_0000;
const CLK_CTRL_RUN: u32 = 0x1100_0840;
const CLK_SEL_XOSC: u32 = 1;

/// PWM0 of the RP1, four channels on GPIO12, 13, 18 and 19.
#[derive(Debug)]
pub struct Rp1Pwm {
    channel: u32,
    pwm: Mapping,
    clocks: Mapping,
}

impl Rp1Pwm {
    pub fn new(mcu: u32, memory: Arc<dyn MemoryDevice>) -> Option<Self> {
        let channel = match mcu {
            12 => 0,
            13 => 1,
            18 => 2,
            19 => 3,
            _ => return None,
        };
        Some(Self {
            channel,
            pwm: Mapping::new("rp1-pwm0", PWM0_BASE, PAGE_SIZE, memory.clone()),
            clocks: Mapping::new("rp1-clocks", CLOCKS_BASE, PAGE_SIZE, memory),
        })
    }

    pub fn channel(&self) -> u32 {
        self.channel
    }

    fn register(&self, offset: usize) -> usize {
        CHANNEL_BLOCK + self.channel as usize * CHANNEL_STRIDE + offset
    }

    /// Latches channel registers into the running counters.
    fn update(&self) -> GpioResult<()> {
        let ctrl = self.pwm.read(GLOBAL_CTRL)?;
        self.pwm.write(GLOBAL_CTRL, ctrl | SET_UPDATE)
    }
}

impl PwmDevice for Rp1Pwm {
    /// 50 MHz crystal oscillator.
    fn clock(&self) -> f64 {
        50e6
    }

    fn divisors(&self) -> Divisors {
        Divisors::Linear { min: 1, max: 65535 }
    }

    fn max_range(&self) -> u32 {
        u32::MAX
    }

    fn open(&self) -> GpioResult<()> {
        self.pwm.open()?;
        if let Err(err) = self.clocks.open() {
            self.pwm.close();
            return Err(err);
        }
        self.pwm
            .write(self.register(CHAN_CTRL), MODE_TRAILING_EDGE | FIFO_POP_MASK)?;
        self.pwm.write(self.register(CHAN_PHASE), 0)?;
        self.update()
    }

    fn close(&self) {
        self.clocks.close();
        self.pwm.close();
    }

    fn set_enable(&self, enable: bool) -> GpioResult<()> {
        let ctrl = self.pwm.read(GLOBAL_CTRL)?;
        let bit = 1 << self.channel;
        let ctrl = if enable { ctrl | bit } else { ctrl & !bit };
        self.pwm.write(GLOBAL_CTRL, ctrl | SET_UPDATE)
    }

    fn set_divisor(&self, divisor: u32) -> GpioResult<()> {
        self.clocks.write(CLK_PWM0_CTRL, CLK_CTRL_STOP)?;
        self.clocks.write(CLK_PWM0_DIV_INT, divisor)?;
        self.clocks.write(CLK_PWM0_DIV_FRAC, 0)?;
        self.clocks.write(CLK_PWM0_SEL, CLK_SEL_XOSC)?;
        handshake("pwm clock selector", || {
            Ok(self.clocks.read(CLK_PWM0_SEL)? == CLK_SEL_XOSC)
        })?;
        self.clocks.write(CLK_PWM0_CTRL, CLK_CTRL_RUN)
    }

    fn set_range(&self, range: u32) -> GpioResult<()> {
        self.pwm.write(self.register(CHAN_RANGE), range)?;
        self.update()
    }

    fn set_value(&self, value: u32) -> GpioResult<()> {
        self.pwm.write(self.register(CHAN_DUTY), value)?;
        self.update()
    }
}
