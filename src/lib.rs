//! Arduino-style GPIO and PWM access for Linux single-board computers.
//!
//! Supported SoC families are Broadcom BCM2835/6/7 and BCM2711 (Raspberry Pi up to 4),
//! the RP1 south bridge of the Raspberry Pi 5, AllWinner H3/H5 (NanoPi, Orange Pi) and
//! Amlogic S905 (ODROID-C2). Pins are reached either through memory-mapped registers
//! (`/dev/gpiomem` for regular users, `/dev/mem` for root) or through the GPIO
//! character device, which also delivers edge interrupts.
//!
//! ```no_run
//! use sbc_mmap_gpio::{Gpio, GpioConfig, Mode};
//!
//! # fn main() -> sbc_mmap_gpio::GpioResult<()> {
//! let gpio = Gpio::new(GpioConfig::default())?;
//! gpio.open()?;
//! let led = gpio.pin(0)?;
//! led.set_mode(Mode::Output)?;
//! led.write(true)?;
//! gpio.close()
//! # }
//! ```
//!
//! Pins implement the relevant [`embedded_hal`](https://crates.io/crates/embedded-hal)
//! digital traits and PWM engines implement `PwmPin`, so the crate can be used with
//! drivers written against `embedded_hal` generic traits.
//!
//! The library never installs a logger. Register writes are traced at `trace` level
//! when a device's debug flag is set.

use std::io;
use thiserror::Error;

pub mod board;
pub mod config;
pub mod connector;
pub mod device;
pub mod gpio;
pub mod pin;
pub mod pin_map;
pub mod pwm;

pub use board::{BoardDatabase, BoardDescriptor, SocFamily, SocModel, TomlBoards};
pub use config::GpioConfig;
pub use connector::Connector;
pub use device::chardev::LineError;
pub use device::error::{ConfigError, DeviceError, PinError};
pub use gpio::{AccessLayer, Gpio};
pub use pin::{Edge, Mode, Numbering, Pin, PinType, Pull};
pub use pin_map::BuiltinBoards;
pub use pwm::{Converter, Pwm};

/// Main error type for this crate.
///
/// For more details, see `PinError`, `DeviceError`, `ConfigError` and `LineError`
/// documentation.
#[derive(Error, Debug)]
pub enum GpioError {
    #[error("error while operating on a pin")]
    PinError(#[from] PinError),
    #[error("error while operating on a device")]
    DeviceError(#[from] DeviceError),
    #[error("invalid configuration")]
    ConfigError(#[from] ConfigError),
    #[error("character device line failed")]
    LineError(#[from] LineError),
    #[error("failed to spawn background thread")]
    ThreadSpawnFailed(#[source] io::Error),
}

pub type GpioResult<T> = Result<T, GpioError>;
