//! The board as a whole: every connector, every pin and the backend driving them.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::board::{BoardDatabase, BoardDescriptor, SocModel};
use crate::config::GpioConfig;
use crate::connector::Connector;
use crate::device::chardev::{CdevLines, LineProvider};
use crate::device::error::PinError;
use crate::device::memory::MemoryDevice;
use crate::device::{self, GpioDevice};
use crate::pin::{Numbering, Pin, PinBackend, PinType};
use crate::pin_map::BuiltinBoards;
use crate::{GpioError, GpioResult};

/// How pins reach the hardware.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AccessLayer {
    /// Memory-mapped registers when they can be opened, the character device otherwise.
    Auto,
    /// Memory-mapped registers.
    Memory,
    /// GPIO character device (uAPI v2).
    CharDev,
}

/// GPIO interface of one board.
///
/// ```no_run
/// use sbc_mmap_gpio::{Gpio, GpioConfig, Mode, Numbering};
///
/// # fn main() -> sbc_mmap_gpio::GpioResult<()> {
/// let mut gpio = Gpio::new(GpioConfig::default())?;
/// gpio.set_numbering(Numbering::Physical);
/// gpio.open()?;
/// gpio.pin(11)?.set_mode(Mode::Input)?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Gpio {
    board: BoardDescriptor,
    config: GpioConfig,
    layer: AccessLayer,
    memory: Arc<dyn MemoryDevice>,
    device: Arc<dyn GpioDevice>,
    connectors: BTreeMap<i32, Connector>,
    numbering: Numbering,
    /// GPIO pins indexed by their number in `numbering`.
    pins: BTreeMap<i32, Arc<Pin>>,
}

impl Gpio {
    /// Builds the interface for `config.board`, or for the board found in the device tree.
    pub fn new(config: GpioConfig) -> GpioResult<Self> {
        let boards = BuiltinBoards;
        let board = match config.board.as_deref() {
            Some(id) => boards.board(id)?,
            None => boards.detect()?,
        };
        Self::from_board(board, config)
    }

    /// Builds the interface for `board` on the running system.
    pub fn from_board(board: BoardDescriptor, config: GpioConfig) -> GpioResult<Self> {
        let memory = device::default_memory(board.soc);
        let lines = Arc::new(CdevLines::new(config.consumer.clone()));
        Self::with_parts(board, config, memory, lines)
    }

    /// Builds the interface with explicit hardware access, e.g. `SimulatedMemory`.
    pub fn with_parts(
        board: BoardDescriptor,
        config: GpioConfig,
        memory: Arc<dyn MemoryDevice>,
        lines: Arc<dyn LineProvider>,
    ) -> GpioResult<Self> {
        board.validate()?;
        let device = device::create_device(board.soc, Arc::clone(&memory))?;
        device.set_debug(config.debug);

        let layer = match config.access_layer {
            AccessLayer::Auto if memory.is_available() => AccessLayer::Memory,
            AccessLayer::Auto => AccessLayer::CharDev,
            layer => layer,
        };
        log::debug!("{}: using {:?} access layer", board.id, layer);

        let backend = PinBackend {
            device: Arc::clone(&device),
            lines,
            layer,
            release_on_close: config.release_on_close,
        };
        let connectors = board
            .connectors
            .iter()
            .map(|descriptor| (descriptor.number, Connector::new(descriptor, &backend)))
            .collect();

        let mut gpio = Self {
            board,
            numbering: config.numbering,
            config,
            layer,
            memory,
            device,
            connectors,
            pins: BTreeMap::new(),
        };
        gpio.index();
        Ok(gpio)
    }

    fn index(&mut self) {
        let numbering = self.numbering;
        self.pins = self
            .connectors
            .values()
            .flat_map(Connector::pins)
            .filter(|pin| pin.kind() == PinType::Gpio)
            .map(|pin| (pin.number(numbering), Arc::clone(pin)))
            .collect();
    }

    /// Opens the backend (memory-mapped layer only) and every pin.
    ///
    /// Failures don't stop the cascade; each one is logged and the first is returned.
    pub fn open(&self) -> GpioResult<()> {
        let mut first = Ok(());
        if self.layer == AccessLayer::Memory {
            if let Err(err) = self.device.open() {
                log::warn!("{}: failed to open {:?} device: {}", self.board.id, self.soc(), err);
                first = Err(err);
            }
        }
        for connector in self.connectors.values() {
            if let Err(err) = connector.open() {
                if first.is_ok() {
                    first = Err(err);
                }
            }
        }
        first
    }

    /// Closes every pin, then the backend. Best-effort like `open`.
    pub fn close(&self) -> GpioResult<()> {
        let mut first = Ok(());
        for connector in self.connectors.values() {
            if let Err(err) = connector.close() {
                if first.is_ok() {
                    first = Err(err);
                }
            }
        }
        self.device.close();
        first
    }

    pub fn is_open(&self) -> bool {
        (self.layer != AccessLayer::Memory || self.device.is_open())
            && self.connectors.values().all(Connector::is_open)
    }

    pub fn numbering(&self) -> Numbering {
        self.numbering
    }

    /// Changes the scheme used by `pin` and `pins`. Pins themselves are untouched.
    pub fn set_numbering(&mut self, numbering: Numbering) {
        if numbering != self.numbering {
            self.numbering = numbering;
            self.index();
        }
    }

    /// GPIO pin number `number` in the active numbering.
    pub fn pin(&self, number: i32) -> GpioResult<&Arc<Pin>> {
        self.pins
            .get(&number)
            .ok_or(GpioError::PinError(PinError::WrongPinNumber(number)))
    }

    /// GPIO pin number `number` in `scheme`.
    pub fn pin_by(&self, scheme: Numbering, number: i32) -> GpioResult<&Arc<Pin>> {
        if scheme == self.numbering {
            return self.pin(number);
        }
        self.pins
            .values()
            .find(|pin| pin.number(scheme) == number)
            .ok_or(GpioError::PinError(PinError::WrongPinNumber(number)))
    }

    /// Converts a GPIO pin number between two schemes.
    pub fn translate(&self, from: Numbering, number: i32, to: Numbering) -> GpioResult<i32> {
        Ok(self.pin_by(from, number)?.number(to))
    }

    /// GPIO pins ordered by their number in the active numbering.
    pub fn pins(&self) -> impl Iterator<Item = &Arc<Pin>> {
        self.pins.values()
    }

    pub fn connector(&self, number: i32) -> Option<&Connector> {
        self.connectors.get(&number)
    }

    pub fn connectors(&self) -> impl Iterator<Item = &Connector> {
        self.connectors.values()
    }

    pub fn board(&self) -> &BoardDescriptor {
        &self.board
    }

    pub fn config(&self) -> &GpioConfig {
        &self.config
    }

    pub fn soc(&self) -> SocModel {
        self.board.soc
    }

    /// The access layer after `Auto` was resolved.
    pub fn access_layer(&self) -> AccessLayer {
        self.layer
    }

    pub fn memory(&self) -> &Arc<dyn MemoryDevice> {
        &self.memory
    }

    pub fn device(&self) -> &Arc<dyn GpioDevice> {
        &self.device
    }

    pub fn set_debug(&self, enable: bool) {
        self.device.set_debug(enable);
    }
}

impl Drop for Gpio {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::warn!("{}: close on drop failed: {}", self.board.id, err);
        }
    }
}
