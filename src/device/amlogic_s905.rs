//! Amlogic S905 (ODROID-C2) GPIO block.
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::error::PinError;
use super::memory::{MemoryDevice, PAGE_SIZE};
use super::{unsupported_platform, Capabilities, GpioDevice, Mapping};
use crate::board::{SocFamily, SocModel};
use crate::pin::{Mode, Pull};
use crate::{GpioError, GpioResult};

pub const GPIO_BASE: u64 = 0xC883_4000;

const PULL_SETTLE: Duration = Duration::from_micros(5);

/// Register bank a pin belongs to.
///
/// On the S905 GPIO registers are spread over three parts of the block (DV, Y and X
/// banks), with a direct mapping between the pin number and its bank.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Bank {
    DV,
    Y,
    X,
}

#[derive(Copy, Clone, Debug)]
struct RegistersOffsets {
    bank: Bank,
    bit: u32,
}

impl RegistersOffsets {
    const PIN_BASE: u32 = 136;
    const DV_PINS_RANGE: RangeInclusive<u32> = (Self::PIN_BASE + 45)..=(Self::PIN_BASE + 74);
    const Y_PINS_RANGE: RangeInclusive<u32> = (Self::PIN_BASE + 75)..=(Self::PIN_BASE + 91);
    const X_PINS_RANGE: RangeInclusive<u32> = (Self::PIN_BASE + 92)..=(Self::PIN_BASE + 114);

    fn new(mcu: u32) -> Option<Self> {
        use Bank::*;

        let (bank, range) = if Self::DV_PINS_RANGE.contains(&mcu) {
            (DV, &Self::DV_PINS_RANGE)
        } else if Self::Y_PINS_RANGE.contains(&mcu) {
            (Y, &Self::Y_PINS_RANGE)
        } else if Self::X_PINS_RANGE.contains(&mcu) {
            (X, &Self::X_PINS_RANGE)
        } else {
            return None;
        };
        Some(Self {
            bank,
            bit: mcu - range.start(),
        })
    }

    /// Output enable, active low.
    fn oen(&self) -> usize {
        use Bank::*;
        match self.bank {
            DV => 0x10C,
            Y => 0x10F,
            X => 0x118,
        }
    }

    fn out(&self) -> usize {
        use Bank::*;
        match self.bank {
            DV => 0x10D,
            Y => 0x110,
            X => 0x119,
        }
    }

    fn input(&self) -> usize {
        use Bank::*;
        match self.bank {
            DV => 0x10E,
            Y => 0x111,
            X => 0x11A,
        }
    }

    fn puen(&self) -> usize {
        use Bank::*;
        match self.bank {
            DV => 0x13A,
            Y => 0x149,
            X => 0x14C,
        }
    }

    fn pupd(&self) -> usize {
        use Bank::*;
        match self.bank {
            DV => 0x148,
            Y => 0x13B,
            X => 0x13E,
        }
    }
}

/// GPIO backend for the ODROID-C2. Pins are either inputs or outputs.
#[derive(Debug)]
pub struct AmlogicS905Gpio {
    soc: SocModel,
    registers: Mapping,
}

impl AmlogicS905Gpio {
    pub fn new(soc: SocModel, memory: Arc<dyn MemoryDevice>) -> GpioResult<Self> {
        if soc.family() != SocFamily::AmlogicS905 {
            return Err(unsupported_platform(soc));
        }
        Ok(Self {
            soc,
            registers: Mapping::new("s905-gpio", GPIO_BASE, PAGE_SIZE, memory),
        })
    }

    fn offsets(&self, mcu: u32) -> GpioResult<RegistersOffsets> {
        RegistersOffsets::new(mcu).ok_or(GpioError::PinError(PinError::WrongPinNumber(mcu as i32)))
    }
}

impl GpioDevice for AmlogicS905Gpio {
    fn soc(&self) -> SocModel {
        self.soc
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            drive: false,
            pull_readback: true,
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
        let offsets = self.offsets(mcu)?;
        Ok(match self.registers.read_field(offsets.oen(), offsets.bit, 1)? {
            1 => Mode::Input,
            _ => Mode::Output,
        })
    }

    fn set_mode(&self, mcu: u32, mode: Mode) -> GpioResult<()> {
        let offsets = self.offsets(mcu)?;
        match mode {
            Mode::Input => self.registers.write_field(offsets.oen(), offsets.bit, 1, 1),
            Mode::Output => self.registers.write_field(offsets.oen(), offsets.bit, 1, 0),
            _ => Err(GpioError::PinError(PinError::InvalidMode {
                pin: format!("GPIO{}", mcu),
                mode,
            })),
        }
    }

    fn pull(&self, mcu: u32) -> GpioResult<Pull> {
        let offsets = self.offsets(mcu)?;
        if self.registers.read_field(offsets.puen(), offsets.bit, 1)? == 0 {
            return Ok(Pull::Off);
        }
        Ok(match self.registers.read_field(offsets.pupd(), offsets.bit, 1)? {
            1 => Pull::Up,
            _ => Pull::Down,
        })
    }

    fn set_pull(&self, mcu: u32, pull: Pull) -> GpioResult<()> {
        let offsets = self.offsets(mcu)?;
        self.registers.write_field(offsets.puen(), offsets.bit, 1, 0)?;
        let up = match pull {
            Pull::Off => return Ok(()),
            Pull::Up => 1,
            Pull::Down => 0,
            Pull::Unknown => {
                return Err(GpioError::PinError(PinError::InvalidPull {
                    pin: format!("GPIO{}", mcu),
                    pull,
                }))
            }
        };
        thread::sleep(PULL_SETTLE);
        self.registers.write_field(offsets.pupd(), offsets.bit, 1, up)?;
        self.registers.write_field(offsets.puen(), offsets.bit, 1, 1)
    }

    fn read(&self, mcu: u32) -> GpioResult<bool> {
        let offsets = self.offsets(mcu)?;
        Ok(self.registers.read_field(offsets.input(), offsets.bit, 1)? == 1)
    }

    fn write(&self, mcu: u32, value: bool) -> GpioResult<()> {
        let offsets = self.offsets(mcu)?;
        self.registers.write_field(offsets.out(), offsets.bit, 1, value as u32)
    }

    /// Flips the output latch; the input register only follows on real hardware.
    fn toggle(&self, mcu: u32) -> GpioResult<()> {
        let offsets = self.offsets(mcu)?;
        let value = self.registers.read_field(offsets.out(), offsets.bit, 1)?;
        self.registers.write_field(offsets.out(), offsets.bit, 1, value ^ 1)
    }
}
