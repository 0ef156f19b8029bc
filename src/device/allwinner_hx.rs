//! AllWinner H3/H5 PIO controller.
//!
//! Ports A to G live in the main PIO block, port L in the R_PIO block of the CPUs
//! power domain. Both blocks share the same per-port layout of nine words.
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

const PIO_PAGE: u64 = 0x01C2_0000;
const PIO_OFFSET: usize = 0x800 / 4;
const R_PIO_PAGE: u64 = 0x01F0_2000;
const R_PIO_OFFSET: usize = 0xC00 / 4;

const PORT_WORDS: usize = 0x24 / 4;
const CFG0: usize = 0;
const DAT: usize = 4;
const DRV0: usize = 5;
const PUL0: usize = 7;

const PORT_L: u32 = 11;

const PULL_SETTLE: Duration = Duration::from_micros(5);

/// PA5 carries PWM0 on function 3.
pub(crate) const PWM_PINS: [(u32, Mode); 1] = [(5, Mode::Alt3)];

/// Number of pins of each port, by port index. Missing ports have none.
const PORT_PINS: [u32; 12] = [22, 0, 17, 18, 16, 7, 14, 0, 0, 0, 0, 12];

/// CFG function codes.
#[repr(u8)]
#[derive(TryFromPrimitive, Copy, Clone, Debug, Eq, PartialEq)]
enum Function {
    Input = 0,
    Output = 1,
    Alt2 = 2,
    Alt3 = 3,
    Alt4 = 4,
    Alt5 = 5,
    Alt6 = 6,
    Disabled = 7,
}

impl Function {
    fn mode(self) -> Mode {
        use Function::*;
        match self {
            Input => Mode::Input,
            Output => Mode::Output,
            Alt2 => Mode::Alt2,
            Alt3 => Mode::Alt3,
            Alt4 => Mode::Alt4,
            Alt5 => Mode::Alt5,
            Alt6 => Mode::Alt6,
            Disabled => Mode::Disabled,
        }
    }

    fn from_mode(mode: Mode) -> Option<Self> {
        use Function::*;
        Some(match mode {
            Mode::Input => Input,
            Mode::Output => Output,
            Mode::Alt2 => Alt2,
            Mode::Alt3 => Alt3,
            Mode::Alt4 => Alt4,
            Mode::Alt5 => Alt5,
            Mode::Alt6 => Alt6,
            Mode::Disabled => Disabled,
            _ => return None,
        })
    }
}

/// Register coordinates of one pin.
#[derive(Copy, Clone, Debug)]
struct PortPin {
    port_l: bool,
    /// First word of the port block inside its window.
    block: usize,
    index: u32,
}

impl PortPin {
    fn cfg(&self) -> (usize, u32) {
        (self.block + CFG0 + (self.index / 8) as usize, (self.index % 8) * 4)
    }

    fn dat(&self) -> (usize, u32) {
        (self.block + DAT, self.index)
    }

    fn drv(&self) -> (usize, u32) {
        (self.block + DRV0 + (self.index / 16) as usize, (self.index % 16) * 2)
    }

    fn pul(&self) -> (usize, u32) {
        (self.block + PUL0 + (self.index / 16) as usize, (self.index % 16) * 2)
    }
}

/// GPIO backend for NanoPi, Orange Pi and other H3/H5 boards.
#[derive(Debug)]
pub struct AllWinnerHxGpio {
    soc: SocModel,
    pio: Mapping,
    r_pio: Mapping,
}

impl AllWinnerHxGpio {
    pub fn new(soc: SocModel, memory: Arc<dyn MemoryDevice>) -> GpioResult<Self> {
        if soc.family() != SocFamily::AllWinnerHx {
            return Err(unsupported_platform(soc));
        }
        Ok(Self {
            soc,
            pio: Mapping::new("sunxi-pio", PIO_PAGE, PAGE_SIZE, memory.clone()),
            r_pio: Mapping::new("sunxi-r-pio", R_PIO_PAGE, PAGE_SIZE, memory),
        })
    }

    fn locate(&self, mcu: u32) -> GpioResult<(&Mapping, PortPin)> {
        let port = mcu / 32;
        let index = mcu % 32;
        match PORT_PINS.get(port as usize) {
            Some(count) if index < *count => {}
            _ => return Err(GpioError::PinError(PinError::WrongPinNumber(mcu as i32))),
        }

        if port == PORT_L {
            Ok((
                &self.r_pio,
                PortPin {
                    port_l: true,
                    block: R_PIO_OFFSET,
                    index,
                },
            ))
        } else {
            Ok((
                &self.pio,
                PortPin {
                    port_l: false,
                    block: PIO_OFFSET + port as usize * PORT_WORDS,
                    index,
                },
            ))
        }
    }

    fn label(mcu: u32) -> String {
        let port = mcu / 32;
        let letter = if port == PORT_L { 'L' } else { (b'A' + port as u8) as char };
        format!("P{}{}", letter, mcu % 32)
    }
}

impl GpioDevice for AllWinnerHxGpio {
    fn soc(&self) -> SocModel {
        self.soc
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            drive: true,
            pull_readback: true,
            atomic_toggle: false,
        }
    }

    fn open(&self) -> GpioResult<()> {
        self.pio.open()?;
        if let Err(err) = self.r_pio.open() {
            self.pio.close();
            return Err(err);
        }
        Ok(())
    }

    fn close(&self) {
        self.r_pio.close();
        self.pio.close();
    }

    fn is_open(&self) -> bool {
        self.pio.is_open() && self.r_pio.is_open()
    }

    fn set_debug(&self, enable: bool) {
        self.pio.set_debug(enable);
        self.r_pio.set_debug(enable);
    }

    fn mode(&self, mcu: u32) -> GpioResult<Mode> {
        let (registers, pin) = self.locate(mcu)?;
        let (offset, shift) = pin.cfg();
        let code = registers.read_field(offset, shift, 3)?;
        let mode = Function::try_from(code as u8).map_or(Mode::Unknown, Function::mode);

        if !pin.port_l && pwm_alternate(&PWM_PINS, mcu) == Some(mode) {
            Ok(Mode::Pwm)
        } else {
            Ok(mode)
        }
    }

    fn set_mode(&self, mcu: u32, mode: Mode) -> GpioResult<()> {
        let (registers, pin) = self.locate(mcu)?;
        let invalid = || {
            GpioError::PinError(PinError::InvalidMode {
                pin: Self::label(mcu),
                mode,
            })
        };
        let hardware_mode = if mode == Mode::Pwm {
            pwm_alternate(&PWM_PINS, mcu).ok_or_else(invalid)?
        } else {
            mode
        };
        let function = Function::from_mode(hardware_mode).ok_or_else(invalid)?;

        let (offset, shift) = pin.cfg();
        registers.write_field(offset, shift, 3, function as u32)
    }

    fn pull(&self, mcu: u32) -> GpioResult<Pull> {
        let (registers, pin) = self.locate(mcu)?;
        let (offset, shift) = pin.pul();
        Ok(match registers.read_field(offset, shift, 2)? {
            0 => Pull::Off,
            1 => Pull::Up,
            2 => Pull::Down,
            _ => Pull::Unknown,
        })
    }

    fn set_pull(&self, mcu: u32, pull: Pull) -> GpioResult<()> {
        let (registers, pin) = self.locate(mcu)?;
        let code = match pull {
            Pull::Off => 0,
            Pull::Up => 1,
            Pull::Down => 2,
            Pull::Unknown => {
                return Err(GpioError::PinError(PinError::InvalidPull {
                    pin: Self::label(mcu),
                    pull,
                }))
            }
        };
        let (offset, shift) = pin.pul();
        registers.write_field(offset, shift, 2, 0)?;
        thread::sleep(PULL_SETTLE);
        registers.write_field(offset, shift, 2, code)
    }

    fn read(&self, mcu: u32) -> GpioResult<bool> {
        let (registers, pin) = self.locate(mcu)?;
        let (offset, bit) = pin.dat();
        Ok(registers.read(offset)? & (1 << bit) != 0)
    }

    fn write(&self, mcu: u32, value: bool) -> GpioResult<()> {
        let (registers, pin) = self.locate(mcu)?;
        let (offset, bit) = pin.dat();
        registers.write_field(offset, bit, 1, value as u32)
    }

    fn drive(&self, mcu: u32) -> GpioResult<u32> {
        let (registers, pin) = self.locate(mcu)?;
        let (offset, shift) = pin.drv();
        registers.read_field(offset, shift, 2)
    }

    /// Drive levels 0 to 3 (10, 20, 30 and 40 mA).
    fn set_drive(&self, mcu: u32, level: u32) -> GpioResult<()> {
        let (registers, pin) = self.locate(mcu)?;
        if level > 3 {
            return Err(GpioError::PinError(PinError::InvalidDrive {
                pin: Self::label(mcu),
                level,
            }));
        }
        let (offset, shift) = pin.drv();
        registers.write_field(offset, shift, 2, level)
    }
}
