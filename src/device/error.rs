use std::io;
use thiserror::Error;

use crate::pin::{Mode, Pull};

/// Enum representing possible failures when opening or driving a register-level device.
///
/// - DeviceAccessFailed - There is no access to the device file, either because of insufficient permissions or operating system misconfiguration.
/// - MemoryMapFailed - There is an error when trying to create a mmaped piece of memory to represent device file.
/// - HandshakeTimeout - A peripheral did not raise its ready bit after being reprogrammed.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("failed to open memory device {0}")]
    DeviceAccessFailed(String, #[source] nix::Error),
    #[error("failed to map device memory at {0:#x}")]
    MemoryMapFailed(u64, #[source] io::Error),
    #[error("physical range {base:#x}+{size:#x} is not page aligned")]
    Unaligned { base: u64, size: usize },
    #[error("physical address {0:#x} is not reachable through this memory device")]
    Unreachable(u64),
    #[error("device is not open")]
    NotOpen,
    #[error("timed out waiting for {0} to become ready")]
    HandshakeTimeout(&'static str),
    #[error("{0} is not supported by this device")]
    Unsupported(&'static str),
}

/// Enum representing possible failures when working with abstract GPIO pins.
///
/// - NotGpio - The pin is a power, ground or otherwise unconnected header position.
/// - InvalidMode - The mode is absent from the pin's mode table, or the backend can't produce it on this pin.
/// - PwmNotSupported - No hardware PWM channel is reachable from this pin.
#[derive(Error, Debug)]
pub enum PinError {
    #[error("pin {0} is not a GPIO pin")]
    NotGpio(String),
    #[error("mode {mode:?} is not supported by pin {pin}")]
    InvalidMode { pin: String, mode: Mode },
    #[error("pull {pull:?} is not supported by pin {pin}")]
    InvalidPull { pin: String, pull: Pull },
    #[error("drive level {level} is out of range for pin {pin}")]
    InvalidDrive { pin: String, level: u32 },
    #[error("pin {0} is not open")]
    NotOpen(String),
    #[error("pin {0} must be an input to detect edges")]
    NotInput(String),
    #[error("pwm frequency must be finite and positive, got {0}")]
    InvalidFrequency(f64),
    #[error("pwm is not supported on pin {0}")]
    PwmNotSupported(String),
    #[error("unrecognized pin number: {0}")]
    WrongPinNumber(i32),
    #[error("pin state lock poisoned")]
    StatePoisoned,
}

/// Enum representing failures detected while configuring the library for a board.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),
    #[error("unknown board: {0}")]
    UnknownBoard(String),
    #[error("invalid board descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("failed to read {0}")]
    Read(String, #[source] io::Error),
    #[error("failed to parse configuration")]
    Parse(#[source] toml::de::Error),
}
