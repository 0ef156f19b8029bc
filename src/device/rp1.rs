//! RP1 I/O controller of the Raspberry Pi 5, bank 0 as exposed by `/dev/gpiomem0`.
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::error::PinError;
use super::memory::MemoryDevice;
use super::{pwm_alternate, unsupported_platform, Capabilities, GpioDevice, Mapping};
use crate::board::{SocFamily, SocModel};
use crate::pin::{Mode, Pull};
use crate::{GpioError, GpioResult};

pub const GPIO_BASE: u64 = 0x1f_000d_0000;
pub const GPIO_SIZE: usize = 0x30000;

const PIN_COUNT: u32 = 28;

// Word offsets inside the window.
const IO_BANK0: usize = 0;
const RIO0: usize = 0x10000 / 4;
const PADS_BANK0: usize = 0x20000 / 4;

const RIO_OUT: usize = RIO0;
const RIO_OE: usize = RIO0 + 1;
const RIO_IN: usize = RIO0 + 2;

const XOR_ALIAS: usize = 0x1000 / 4;
const SET_ALIAS: usize = 0x2000 / 4;
const CLR_ALIAS: usize = 0x3000 / 4;

const FUNCSEL_WIDTH: u32 = 5;
const FUNCSEL_RIO: u32 = 5;
const FUNCSEL_NULL: u32 = 0x1f;

const PAD_PDE: u32 = 2;
const PAD_PUE: u32 = 3;
const PAD_DRIVE: u32 = 4;
const PAD_IE: u32 = 6;
const PAD_OD: u32 = 7;

const PULL_SETTLE: Duration = Duration::from_micros(5);

/// PWM0 channels: Alt0 on GPIO12/13, Alt3 on GPIO18/19.
pub(crate) const PWM_PINS: [(u32, Mode); 4] = [
    (12, Mode::Alt0),
    (13, Mode::Alt0),
    (18, Mode::Alt3),
    (19, Mode::Alt3),
];

fn ctrl(mcu: u32) -> usize {
    IO_BANK0 + mcu as usize * 2 + 1
}

fn pad(mcu: u32) -> usize {
    PADS_BANK0 + 1 + mcu as usize
}

/// GPIO backend for the Raspberry Pi 5.
///
/// Output levels go through the SET/CLR/XOR aliases of the RIO block, so `write` and
/// `toggle` never race with other pins of the bank.
#[derive(Debug)]
pub struct Rp1Gpio {
    soc: SocModel,
    registers: Mapping,
}

impl Rp1Gpio {
    pub fn new(soc: SocModel, memory: Arc<dyn MemoryDevice>) -> GpioResult<Self> {
        if soc.family() != SocFamily::Rp1 {
            return Err(unsupported_platform(soc));
        }
        Ok(Self {
            soc,
            registers: Mapping::new("rp1-gpio", GPIO_BASE, GPIO_SIZE, memory),
        })
    }

    fn check(&self, mcu: u32) -> GpioResult<()> {
        if mcu < PIN_COUNT {
            Ok(())
        } else {
            Err(GpioError::PinError(PinError::WrongPinNumber(mcu as i32)))
        }
    }

    /// Enables the input buffer and disables the output-disable override.
    fn enable_pad(&self, mcu: u32) -> GpioResult<()> {
        let window = self.registers.window()?;
        let word = window.read(pad(mcu));
        self.registers
            .write(pad(mcu), (word | 1 << PAD_IE) & !(1 << PAD_OD))
    }

    fn set_output_enable(&self, mcu: u32, enable: bool) -> GpioResult<()> {
        self.registers.write_field(RIO_OE, mcu, 1, enable as u32)
    }
}

impl GpioDevice for Rp1Gpio {
    fn soc(&self) -> SocModel {
        self.soc
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            drive: true,
            pull_readback: true,
            atomic_toggle: true,
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
        let mode = match self.registers.read_field(ctrl(mcu), 0, FUNCSEL_WIDTH)? {
            FUNCSEL_RIO => {
                if self.registers.read_field(RIO_OE, mcu, 1)? == 1 {
                    Mode::Output
                } else {
                    Mode::Input
                }
            }
            FUNCSEL_NULL => Mode::Disabled,
            code => Mode::alternate(code).unwrap_or(Mode::Unknown),
        };

        if pwm_alternate(&PWM_PINS, mcu) == Some(mode) {
            Ok(Mode::Pwm)
        } else {
            Ok(mode)
        }
    }

    fn set_mode(&self, mcu: u32, mode: Mode) -> GpioResult<()> {
        self.check(mcu)?;
        let invalid = || {
            GpioError::PinError(PinError::InvalidMode {
                pin: format!("GPIO{}", mcu),
                mode,
            })
        };
        let hardware_mode = if mode == Mode::Pwm {
            pwm_alternate(&PWM_PINS, mcu).ok_or_else(invalid)?
        } else {
            mode
        };

        match hardware_mode {
            Mode::Input | Mode::Output => {
                self.enable_pad(mcu)?;
                self.set_output_enable(mcu, hardware_mode == Mode::Output)?;
                self.registers.write_field(ctrl(mcu), 0, FUNCSEL_WIDTH, FUNCSEL_RIO)
            }
            Mode::Disabled => self.registers.write_field(ctrl(mcu), 0, FUNCSEL_WIDTH, FUNCSEL_NULL),
            alternate => match alternate.alternate_index() {
                // Function 5 is the RIO block itself, selected through Input/Output.
                Some(code) if code <= 8 && code != FUNCSEL_RIO => {
                    self.enable_pad(mcu)?;
                    self.registers.write_field(ctrl(mcu), 0, FUNCSEL_WIDTH, code)
                }
                _ => Err(invalid()),
            },
        }
    }

    fn pull(&self, mcu: u32) -> GpioResult<Pull> {
        self.check(mcu)?;
        let word = self.registers.read(pad(mcu))?;
        let down = word & (1 << PAD_PDE) != 0;
        let up = word & (1 << PAD_PUE) != 0;
        Ok(match (up, down) {
            (false, false) => Pull::Off,
            (true, false) => Pull::Up,
            (false, true) => Pull::Down,
            (true, true) => Pull::Unknown,
        })
    }

    fn set_pull(&self, mcu: u32, pull: Pull) -> GpioResult<()> {
        self.check(mcu)?;
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
        self.registers.write_field(pad(mcu), PAD_PDE, 2, 0)?;
        thread::sleep(PULL_SETTLE);
        self.registers.write_field(pad(mcu), PAD_PDE, 2, code)
    }

    fn read(&self, mcu: u32) -> GpioResult<bool> {
        self.check(mcu)?;
        Ok(self.registers.read(RIO_IN)? & (1 << mcu) != 0)
    }

    fn write(&self, mcu: u32, value: bool) -> GpioResult<()> {
        self.check(mcu)?;
        let alias = if value { SET_ALIAS } else { CLR_ALIAS };
        self.registers.write(RIO_OUT + alias, 1 << mcu)
    }

    fn toggle(&self, mcu: u32) -> GpioResult<()> {
        self.check(mcu)?;
        self.registers.write(RIO_OUT + XOR_ALIAS, 1 << mcu)
    }

    fn drive(&self, mcu: u32) -> GpioResult<u32> {
        self.check(mcu)?;
        self.registers.read_field(pad(mcu), PAD_DRIVE, 2)
    }

    /// Drive codes 0 to 3 select 2, 4, 8 and 12 mA.
    fn set_drive(&self, mcu: u32, level: u32) -> GpioResult<()> {
        self.check(mcu)?;
        if level > 3 {
            return Err(GpioError::PinError(PinError::InvalidDrive {
                pin: format!("GPIO{}", mcu),
                level,
            }));
        }
        self.registers.write_field(pad(mcu), PAD_DRIVE, 2, level)
    }
}

#[cfg(test)]
mod tests {
    use super::super::memory::SimulatedMemory;
    use super::super::testing::assert_modes_round_trip;
    use super::*;

    fn device() -> (Rp1Gpio, Arc<SimulatedMemory>) {
        let memory = Arc::new(SimulatedMemory::new());
        let device = Rp1Gpio::new(SocModel::Bcm2712, memory.clone()).unwrap();
        device.open().unwrap();
        (device, memory)
    }

    #[test]
    fn rejects_other_families() {
        let memory = Arc::new(SimulatedMemory::new());
        assert!(Rp1Gpio::new(SocModel::Bcm2711, memory).is_err());
    }

    #[test]
    fn modes_round_trip() {
        let (device, _) = device();
        let modes = [
            Mode::Input,
            Mode::Output,
            Mode::Alt1,
            Mode::Alt2,
            Mode::Alt4,
            Mode::Alt6,
            Mode::Alt8,
            Mode::Disabled,
        ];
        for mcu in 0..PIN_COUNT {
            assert_modes_round_trip(&device, mcu, &modes);
        }
    }

    #[test]
    fn gpio_function_goes_through_rio() {
        let (device, memory) = device();
        let window = memory.window(GPIO_BASE).unwrap();

        device.set_mode(17, Mode::Output).unwrap();
        assert_eq!(window.read(ctrl(17)) & 0x1f, FUNCSEL_RIO);
        assert_eq!(window.read(RIO_OE), 1 << 17);
        assert_ne!(window.read(pad(17)) & (1 << PAD_IE), 0);

        device.set_mode(17, Mode::Input).unwrap();
        assert_eq!(window.read(RIO_OE), 0);
        assert!(device.set_mode(17, Mode::Alt5).is_err());
        assert!(device.set_mode(17, Mode::Alt9).is_err());
    }

    #[test]
    fn pwm_remaps_per_pin() {
        let (device, memory) = device();
        let window = memory.window(GPIO_BASE).unwrap();

        device.set_mode(12, Mode::Pwm).unwrap();
        device.set_mode(18, Mode::Pwm).unwrap();
        assert_eq!(window.read(ctrl(12)) & 0x1f, 0);
        assert_eq!(window.read(ctrl(18)) & 0x1f, 3);
        assert_eq!(device.mode(12).unwrap(), Mode::Pwm);
        assert_eq!(device.mode(18).unwrap(), Mode::Pwm);

        assert!(matches!(
            device.set_mode(17, Mode::Pwm),
            Err(GpioError::PinError(PinError::InvalidMode { .. }))
        ));
    }

    #[test]
    fn levels_use_atomic_aliases() {
        let (device, memory) = device();
        let window = memory.window(GPIO_BASE).unwrap();

        device.write(4, true).unwrap();
        assert_eq!(window.read(RIO_OUT + SET_ALIAS), 1 << 4);
        device.write(4, false).unwrap();
        assert_eq!(window.read(RIO_OUT + CLR_ALIAS), 1 << 4);
        device.toggle(5).unwrap();
        assert_eq!(window.read(RIO_OUT + XOR_ALIAS), 1 << 5);

        window.write(RIO_IN, 1 << 6);
        assert!(device.read(6).unwrap());
        assert!(!device.read(4).unwrap());
    }

    #[test]
    fn pads_carry_pull_and_drive() {
        let (device, _) = device();
        device.set_pull(22, Pull::Up).unwrap();
        assert_eq!(device.pull(22).unwrap(), Pull::Up);
        device.set_pull(22, Pull::Down).unwrap();
        assert_eq!(device.pull(22).unwrap(), Pull::Down);
        device.set_drive(22, 2).unwrap();
        assert_eq!(device.drive(22).unwrap(), 2);
        assert_eq!(device.pull(22).unwrap(), Pull::Down);
        assert!(device.set_drive(22, 4).is_err());
        assert!(device.read(PIN_COUNT).is_err());
    }
}
