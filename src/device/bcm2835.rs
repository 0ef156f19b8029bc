//! Broadcom BCM2835 family (BCM2835/6/7 and BCM2711) GPIO block.
use derive_try_from_primitive::TryFromPrimitive;
use std::convert::TryFrom;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::error::PinError;
use super::memory::{MemoryDevice, PAGE_SIZE};
use super::{pwm_alternate, unsupported_platform, Capabilities, GpioDevice, Mapping};
use crate::board::{SocFamily, SocModel};
use crate::pin::{Mode, Pull};
use crate::{GpioError, GpioResult};

const GPFSEL0: usize = 0x00;
const GPSET0: usize = 0x07;
const GPCLR0: usize = 0x0A;
const GPLEV0: usize = 0x0D;
const GPPUD: usize = 0x25;
const GPPUDCLK0: usize = 0x26;
/// BCM2711 only.
const GPIO_PUP_PDN_CNTRL_REG0: usize = 0x39;

const PULL_SETTLE: Duration = Duration::from_micros(5);

/// Pins routed to PWM0 channel 0/1 and the function doing so.
pub(crate) const PWM_PINS: [(u32, Mode); 4] = [(12, Mode::Alt0), (13, Mode::Alt0), (18, Mode::Alt5), (19, Mode::Alt5)];

/// Base of the peripheral address space, as seen by the ARM cores.
pub(crate) fn peripheral_base(soc: SocModel) -> u64 {
    match soc {
        SocModel::Bcm2835 => 0x2000_0000,
        SocModel::Bcm2711 => 0xFE00_0000,
        _ => 0x3F00_0000,
    }
}

pub fn gpio_base(soc: SocModel) -> u64 {
    peripheral_base(soc) + 0x20_0000
}

/// GPFSEL function codes.
#[repr(u8)]
#[derive(TryFromPrimitive, Copy, Clone, Debug, Eq, PartialEq)]
enum Function {
    Input = 0b000,
    Output = 0b001,
    Alt0 = 0b100,
    Alt1 = 0b101,
    Alt2 = 0b110,
    Alt3 = 0b111,
    Alt4 = 0b011,
    Alt5 = 0b010,
}

impl Function {
    fn mode(self) -> Mode {
        use Function::*;
        match self {
            Input => Mode::Input,
            Output => Mode::Output,
            Alt0 => Mode::Alt0,
            Alt1 => Mode::Alt1,
            Alt2 => Mode::Alt2,
            Alt3 => Mode::Alt3,
            Alt4 => Mode::Alt4,
            Alt5 => Mode::Alt5,
        }
    }

    fn from_mode(mode: Mode) -> Option<Self> {
        use Function::*;
        Some(match mode {
            Mode::Input => Input,
            Mode::Output => Output,
            Mode::Alt0 => Alt0,
            Mode::Alt1 => Alt1,
            Mode::Alt2 => Alt2,
            Mode::Alt3 => Alt3,
            Mode::Alt4 => Alt4,
            Mode::Alt5 => Alt5,
            _ => return None,
        })
    }
}

/// GPIO backend for the Raspberry Pi 1 to 4.
#[derive(Debug)]
pub struct Bcm2835Gpio {
    soc: SocModel,
    registers: Mapping,
}

impl Bcm2835Gpio {
    pub fn new(soc: SocModel, memory: Arc<dyn MemoryDevice>) -> GpioResult<Self> {
        if soc.family() != SocFamily::Bcm2835 {
            return Err(unsupported_platform(soc));
        }
        Ok(Self {
            soc,
            registers: Mapping::new("bcm2835-gpio", gpio_base(soc), PAGE_SIZE, memory),
        })
    }

    fn is_bcm2711(&self) -> bool {
        self.soc == SocModel::Bcm2711
    }

    fn check(&self, mcu: u32) -> GpioResult<()> {
        let pins = if self.is_bcm2711() { 58 } else { 54 };
        if mcu < pins {
            Ok(())
        } else {
            Err(GpioError::PinError(PinError::WrongPinNumber(mcu as i32)))
        }
    }

    fn invalid_mode(mcu: u32, mode: Mode) -> GpioError {
        GpioError::PinError(PinError::InvalidMode {
            pin: format!("GPIO{}", mcu),
            mode,
        })
    }
}

impl GpioDevice for Bcm2835Gpio {
    fn soc(&self) -> SocModel {
        self.soc
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            drive: false,
            pull_readback: self.is_bcm2711(),
            atomic_toggle: false,
        }
    }

    fn open(&self) -> GpioResult<()> {
        self.registers.open()
    }

    fn close(&self) {
        self.registers.close()
    }

    fn is_open(&self) -> bool {
        self.registers.is_open()
    }

    fn set_debug(&self, enable: bool) {
        self.registers.set_debug(enable)
    }

    fn mode(&self, mcu: u32) -> GpioResult<Mode> {
        self.check(mcu)?;
        let code = self
            .registers
            .read_field(GPFSEL0 + (mcu / 10) as usize, (mcu % 10) * 3, 3)?;
        let mode = Function::try_from(code as u8).map_or(Mode::Unknown, Function::mode);

        if pwm_alternate(&PWM_PINS, mcu) == Some(mode) {
            Ok(Mode::Pwm)
        } else {
            Ok(mode)
        }
    }

    fn set_mode(&self, mcu: u32, mode: Mode) -> GpioResult<()> {
        self.check(mcu)?;
        let hardware_mode = if mode == Mode::Pwm {
            pwm_alternate(&PWM_PINS, mcu).ok_or_else(|| Self::invalid_mode(mcu, mode))?
        } else {
            mode
        };
        let function = Function::from_mode(hardware_mode).ok_or_else(|| Self::invalid_mode(mcu, mode))?;

        self.registers.write_field(
            GPFSEL0 + (mcu / 10) as usize,
            (mcu % 10) * 3,
            3,
            function as u32,
        )
    }

    fn pull(&self, mcu: u32) -> GpioResult<Pull> {
        self.check(mcu)?;
        if !self.is_bcm2711() {
            // Legacy pull control is write-only.
            return Ok(Pull::Unknown);
        }
        let code = self.registers.read_field(
            GPIO_PUP_PDN_CNTRL_REG0 + (mcu / 16) as usize,
            (mcu % 16) * 2,
            2,
        )?;
        Ok(match code {
            0 => Pull::Off,
            1 => Pull::Up,
            2 => Pull::Down,
            _ => Pull::Unknown,
        })
    }

    fn set_pull(&self, mcu: u32, pull: Pull) -> GpioResult<()> {
        self.check(mcu)?;
        if self.is_bcm2711() {
            let code = match pull {
                Pull::Off => 0,
                Pull::Up => 1,
                Pull::Down => 2,
                Pull::Unknown => {
                    return Err(GpioError::PinError(PinError::InvalidPull {
                        pin: format!("GPIO{}", mcu),
                        pull,
                    }))
                }
            };
            let register = GPIO_PUP_PDN_CNTRL_REG0 + (mcu / 16) as usize;
            let shift = (mcu % 16) * 2;
            self.registers.write_field(register, shift, 2, 0)?;
            thread::sleep(PULL_SETTLE);
            return self.registers.write_field(register, shift, 2, code);
        }

        let code = match pull {
            Pull::Off => 0b00,
            Pull::Down => 0b01,
            Pull::Up => 0b10,
            Pull::Unknown => {
                return Err(GpioError::PinError(PinError::InvalidPull {
                    pin: format!("GPIO{}", mcu),
                    pull,
                }))
            }
        };
        let clock = GPPUDCLK0 + (mcu / 32) as usize;
        self.registers.write(GPPUD, code)?;
        thread::sleep(PULL_SETTLE);
        self.registers.write(clock, 1 << (mcu % 32))?;
        thread::sleep(PULL_SETTLE);
        self.registers.write(GPPUD, 0)?;
        self.registers.write(clock, 0)
    }

    fn read(&self, mcu: u32) -> GpioResult<bool> {
        self.check(mcu)?;
        let level = self.registers.read(GPLEV0 + (mcu / 32) as usize)?;
        Ok(level & (1 << (mcu % 32)) != 0)
    }

    fn write(&self, mcu: u32, value: bool) -> GpioResult<()> {
        self.check(mcu)?;
        let register = if value { GPSET0 } else { GPCLR0 };
        self.registers.write(register + (mcu / 32) as usize, 1 << (mcu % 32))
    }
}
