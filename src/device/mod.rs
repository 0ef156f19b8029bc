//! Register-level GPIO backends, one per SoC family.
//!
//! A backend is nearly stateless: it owns the register window(s) of its GPIO block and
//! an open/debug flag, nothing else. Every query goes back to the hardware, so two
//! handles on the same pin always agree.
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::board::{SocFamily, SocModel};
use crate::pin::{Mode, Pull};
use crate::{GpioError, GpioResult};

pub mod allwinner_hx;
pub mod amlogic_s905;
pub mod bcm2835;
pub mod chardev;
pub mod error;
pub mod memory;
pub mod rp1;

pub use allwinner_hx::AllWinnerHxGpio;
pub use amlogic_s905::AmlogicS905Gpio;
pub use bcm2835::Bcm2835Gpio;
pub use rp1::Rp1Gpio;

use error::{ConfigError, DeviceError};
use memory::{DevMem, MemoryDevice, RegisterWindow};

/// Optional features a backend may offer on top of mode, pull and level.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Capabilities {
    /// `drive()`/`set_drive()` are implemented.
    pub drive: bool,
    /// `pull()` reports the configured resistor instead of `Pull::Unknown`.
    pub pull_readback: bool,
    /// `toggle()` is a single register write instead of read-then-write.
    pub atomic_toggle: bool,
}

/// Register-level access to the GPIO block of one SoC.
///
/// Pins are identified by their MCU number. Concurrent writes to two pins sharing a
/// register word from different threads are not serialized.
pub trait GpioDevice: fmt::Debug + Send + Sync {
    fn soc(&self) -> SocModel;

    fn capabilities(&self) -> Capabilities;

    /// Maps the register window(s). Opening an open device does nothing.
    fn open(&self) -> GpioResult<()>;

    fn close(&self);

    fn is_open(&self) -> bool;

    fn set_debug(&self, enable: bool);

    fn mode(&self, mcu: u32) -> GpioResult<Mode>;

    fn set_mode(&self, mcu: u32, mode: Mode) -> GpioResult<()>;

    fn pull(&self, mcu: u32) -> GpioResult<Pull>;

    fn set_pull(&self, mcu: u32, pull: Pull) -> GpioResult<()>;

    fn read(&self, mcu: u32) -> GpioResult<bool>;

    fn write(&self, mcu: u32, value: bool) -> GpioResult<()>;

    fn toggle(&self, mcu: u32) -> GpioResult<()> {
        let value = self.read(mcu)?;
        self.write(mcu, !value)
    }

    fn drive(&self, _mcu: u32) -> GpioResult<u32> {
        Err(GpioError::DeviceError(DeviceError::Unsupported("drive")))
    }

    fn set_drive(&self, _mcu: u32, _level: u32) -> GpioResult<()> {
        Err(GpioError::DeviceError(DeviceError::Unsupported("drive")))
    }
}

type DeviceConstructor = fn(SocModel, Arc<dyn MemoryDevice>) -> GpioResult<Arc<dyn GpioDevice>>;

/// Backend chosen for each SoC family.
const BACKENDS: &[(SocFamily, DeviceConstructor)] = &[
    (SocFamily::Bcm2835, new_bcm2835),
    (SocFamily::AllWinnerHx, new_allwinner_hx),
    (SocFamily::Rp1, new_rp1),
    (SocFamily::AmlogicS905, new_amlogic_s905),
];

fn new_bcm2835(soc: SocModel, memory: Arc<dyn MemoryDevice>) -> GpioResult<Arc<dyn GpioDevice>> {
    Ok(Arc::new(Bcm2835Gpio::new(soc, memory)?))
}

fn new_allwinner_hx(soc: SocModel, memory: Arc<dyn MemoryDevice>) -> GpioResult<Arc<dyn GpioDevice>> {
    Ok(Arc::new(AllWinnerHxGpio::new(soc, memory)?))
}

fn new_rp1(soc: SocModel, memory: Arc<dyn MemoryDevice>) -> GpioResult<Arc<dyn GpioDevice>> {
    Ok(Arc::new(Rp1Gpio::new(soc, memory)?))
}

fn new_amlogic_s905(soc: SocModel, memory: Arc<dyn MemoryDevice>) -> GpioResult<Arc<dyn GpioDevice>> {
    Ok(Arc::new(AmlogicS905Gpio::new(soc, memory)?))
}

/// Instantiates the register-level backend for `soc`.
pub fn create_device(soc: SocModel, memory: Arc<dyn MemoryDevice>) -> GpioResult<Arc<dyn GpioDevice>> {
    let family = soc.family();
    let (_, constructor) = BACKENDS
        .iter()
        .find(|(candidate, _)| *candidate == family)
        .ok_or_else(|| unsupported_platform(soc))?;
    log::debug!("using {:?} backend for {:?}", family, soc);
    constructor(soc, memory)
}

/// Memory device giving the current user access to the GPIO block of `soc`.
pub fn default_memory(soc: SocModel) -> Arc<dyn MemoryDevice> {
    match soc.family() {
        SocFamily::Bcm2835 => Arc::new(DevMem::for_current_user(
            "/dev/gpiomem",
            bcm2835::gpio_base(soc),
            memory::PAGE_SIZE,
        )),
        SocFamily::Rp1 => Arc::new(DevMem::for_current_user(
            "/dev/gpiomem0",
            rp1::GPIO_BASE,
            rp1::GPIO_SIZE,
        )),
        SocFamily::AmlogicS905 => Arc::new(DevMem::for_current_user(
            "/dev/gpiomem",
            amlogic_s905::GPIO_BASE,
            memory::PAGE_SIZE,
        )),
        SocFamily::AllWinnerHx | SocFamily::Unknown => Arc::new(DevMem::mem()),
    }
}

pub(crate) fn unsupported_platform(soc: SocModel) -> GpioError {
    GpioError::ConfigError(ConfigError::UnsupportedPlatform(format!("{:?}", soc)))
}

/// One register window of a backend, mapped on `open` and dropped on `close`.
#[derive(Debug)]
pub(crate) struct Mapping {
    name: &'static str,
    base: u64,
    size: usize,
    memory: Arc<dyn MemoryDevice>,
    window: RwLock<Option<Arc<dyn RegisterWindow>>>,
    debug: AtomicBool,
}

impl Mapping {
    pub fn new(name: &'static str, base: u64, size: usize, memory: Arc<dyn MemoryDevice>) -> Self {
        Self {
            name,
            base,
            size,
            memory,
            window: RwLock::new(None),
            debug: AtomicBool::new(false),
        }
    }

    pub fn open(&self) -> GpioResult<()> {
        let mut window = self
            .window
            .write()
            .map_err(|_| GpioError::DeviceError(DeviceError::NotOpen))?;
        if window.is_none() {
            *window = Some(self.memory.map(self.base, self.size)?);
            log::debug!("{}: opened window at {:#x}", self.name, self.base);
        }
        Ok(())
    }

    pub fn close(&self) {
        if let Ok(mut window) = self.window.write() {
            if window.take().is_some() {
                log::debug!("{}: closed window at {:#x}", self.name, self.base);
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.window.read().map(|window| window.is_some()).unwrap_or(false)
    }

    pub fn set_debug(&self, enable: bool) {
        self.debug.store(enable, Ordering::Relaxed);
    }

    pub fn window(&self) -> GpioResult<Arc<dyn RegisterWindow>> {
        self.window
            .read()
            .ok()
            .and_then(|window| window.clone())
            .ok_or(GpioError::DeviceError(DeviceError::NotOpen))
    }

    pub fn read(&self, offset: usize) -> GpioResult<u32> {
        Ok(self.window()?.read(offset))
    }

    pub fn write(&self, offset: usize, value: u32) -> GpioResult<()> {
        if self.debug.load(Ordering::Relaxed) {
            log::trace!("{}: [{:#06x}] <- {:#010x}", self.name, offset * 4, value);
        }
        self.window()?.write(offset, value);
        Ok(())
    }

    /// Rewrites a `width`-bit field starting at bit `shift`.
    pub fn write_field(&self, offset: usize, shift: u32, width: u32, value: u32) -> GpioResult<()> {
        let window = self.window()?;
        let mask = field_mask(width) << shift;
        let word = (window.read(offset) & !mask) | ((value << shift) & mask);
        if self.debug.load(Ordering::Relaxed) {
            log::trace!("{}: [{:#06x}] <- {:#010x}", self.name, offset * 4, word);
        }
        window.write(offset, word);
        Ok(())
    }

    pub fn read_field(&self, offset: usize, shift: u32, width: u32) -> GpioResult<u32> {
        Ok((self.read(offset)? >> shift) & field_mask(width))
    }
}

fn field_mask(width: u32) -> u32 {
    if width >= 32 {
        u32::MAX
    } else {
        (1 << width) - 1
    }
}

/// Maps the virtual `Mode::Pwm` to the alternate function wired to a PWM channel.
///
/// Returns `None` if `mcu` has no PWM function on this SoC.
pub(crate) fn pwm_alternate(table: &[(u32, Mode)], mcu: u32) -> Option<Mode> {
    table.iter().find(|(pin, _)| *pin == mcu).map(|(_, alt)| *alt)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::memory::SimulatedMemory;
    use super::*;

    /// Sets every mode of `modes` on `mcu` and expects each to read back unchanged.
    pub fn assert_modes_round_trip(device: &dyn GpioDevice, mcu: u32, modes: &[Mode]) {
        for mode in modes {
            device.set_mode(mcu, *mode).unwrap();
            assert_eq!(device.mode(mcu).unwrap(), *mode, "mcu {} mode {:?}", mcu, mode);
        }
    }

    pub fn simulated() -> Arc<SimulatedMemory> {
        Arc::new(SimulatedMemory::new())
    }
}
