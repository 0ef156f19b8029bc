//! Pins and their numbering.
//!
//! A `Pin` is one header position. GPIO-typed pins delegate every electrical operation
//! to the backend selected by the access layer: the register-level `GpioDevice` or a
//! GPIO character-device line.
use embedded_hal::digital::v2 as eh;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::board::{ConnectorFamily, PinDescriptor, SocModel};
use crate::device::chardev::{GpioCharDevLine, InterruptEvent, LineError, LineHandle, LineProvider};
use crate::device::error::{DeviceError, PinError};
use crate::device::GpioDevice;
use crate::gpio::AccessLayer;
use crate::{GpioError, GpioResult};

/// Function selected for a pin.
///
/// `Pwm` is virtual: backends translate it to whichever alternate function routes the
/// pin to a PWM channel.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Input,
    Output,
    Disabled,
    Pwm,
    Alt0,
    Alt1,
    Alt2,
    Alt3,
    Alt4,
    Alt5,
    Alt6,
    Alt7,
    Alt8,
    Alt9,
    Unknown,
}

impl Mode {
    const ALTERNATES: [Mode; 10] = [
        Mode::Alt0,
        Mode::Alt1,
        Mode::Alt2,
        Mode::Alt3,
        Mode::Alt4,
        Mode::Alt5,
        Mode::Alt6,
        Mode::Alt7,
        Mode::Alt8,
        Mode::Alt9,
    ];

    /// `AltN` for `n` in `0..=9`.
    pub fn alternate(n: u32) -> Option<Mode> {
        Self::ALTERNATES.get(n as usize).copied()
    }

    /// Index of an alternate function, `None` for every other mode.
    pub fn alternate_index(self) -> Option<u32> {
        Self::ALTERNATES.iter().position(|alt| *alt == self).map(|n| n as u32)
    }
}

#[derive(Serialize, Deserialize, Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Pull {
    Off,
    Down,
    Up,
    Unknown,
}

/// Signal edge an interrupt fires on.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Edge {
    None,
    Rising,
    Falling,
    Both,
}

#[derive(Serialize, Deserialize, Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum PinType {
    Gpio,
    Power,
    Ground,
    Usb,
    NotConnected,
}

/// Pin numbering schemes.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Numbering {
    /// Contiguous `0..N-1` over the GPIO pins of a board.
    Logical,
    /// Index used by the SoC datasheet and its registers.
    Mcu,
    /// Number assigned by the kernel (sysfs).
    System,
    /// Position on the connector, `(row - 1) * columns + column`.
    Physical,
    /// Line offset within its GPIO chip.
    Offset,
}

impl Numbering {
    pub const ALL: [Numbering; 5] = [
        Numbering::Logical,
        Numbering::Mcu,
        Numbering::System,
        Numbering::Physical,
        Numbering::Offset,
    ];
}

/// Every number a pin is known by. Unused fields hold -1.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[serde(default)]
pub struct Number {
    pub logical: i32,
    pub mcu: i32,
    pub system: i32,
    pub row: i32,
    pub column: i32,
    pub chip: i32,
    pub offset: i32,
}

impl Default for Number {
    fn default() -> Self {
        Self {
            logical: -1,
            mcu: -1,
            system: -1,
            row: -1,
            column: -1,
            chip: -1,
            offset: -1,
        }
    }
}

/// How a pin reaches the hardware.
#[derive(Clone, Debug)]
pub struct PinBackend {
    pub device: Arc<dyn GpioDevice>,
    pub lines: Arc<dyn LineProvider>,
    pub layer: AccessLayer,
    pub release_on_close: bool,
}

/// Write-only view of a pin, usable from a generator thread without touching the pin's lock.
#[derive(Clone, Debug)]
pub enum PinOutput {
    Register { device: Arc<dyn GpioDevice>, mcu: u32 },
    Line(Arc<dyn LineHandle>),
}

impl PinOutput {
    pub fn write(&self, value: bool) -> GpioResult<()> {
        match self {
            PinOutput::Register { device, mcu } => device.write(*mcu, value),
            PinOutput::Line(line) => line.set_value(value).map_err(GpioError::LineError),
        }
    }
}

#[derive(Debug)]
struct PinState {
    open: bool,
    /// Mode and pull seen before the first mutation.
    saved: Option<(Mode, Pull)>,
    /// Cached configuration, authoritative only for the character-device layer.
    mode: Mode,
    pull: Pull,
    edge: Edge,
    debounce: Duration,
    line: Option<GpioCharDevLine>,
}

/// One physical pin of a connector.
#[derive(Debug)]
pub struct Pin {
    descriptor: PinDescriptor,
    position: i32,
    label: String,
    backend: PinBackend,
    state: Mutex<PinState>,
}

impl Pin {
    pub fn new(descriptor: PinDescriptor, connector: &str, family: &ConnectorFamily, backend: PinBackend) -> Self {
        let Number { row, column, mcu, .. } = descriptor.number;
        let position = family.position(row, column);
        let label = match descriptor.modes.get(&Mode::Input) {
            Some(name) if mcu >= 0 => format!("{}.{} ({})", connector, position, name),
            _ => format!("{}.{}", connector, position),
        };

        Self {
            descriptor,
            position,
            label,
            backend,
            state: Mutex::new(PinState {
                open: false,
                saved: None,
                mode: Mode::Input,
                pull: Pull::Off,
                edge: Edge::None,
                debounce: Duration::ZERO,
                line: None,
            }),
        }
    }

    pub fn descriptor(&self) -> &PinDescriptor {
        &self.descriptor
    }

    pub fn kind(&self) -> PinType {
        self.descriptor.kind
    }

    pub fn id(&self) -> i64 {
        self.descriptor.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn soc(&self) -> SocModel {
        self.backend.device.soc()
    }

    pub fn access_layer(&self) -> AccessLayer {
        self.backend.layer
    }

    pub(crate) fn device(&self) -> &Arc<dyn GpioDevice> {
        &self.backend.device
    }

    /// The pin's number in `scheme`, -1 if it has none.
    pub fn number(&self, scheme: Numbering) -> i32 {
        let number = &self.descriptor.number;
        match scheme {
            Numbering::Logical => number.logical,
            Numbering::Mcu => number.mcu,
            Numbering::System => number.system,
            Numbering::Physical => self.position,
            Numbering::Offset => number.offset,
        }
    }

    pub fn logical(&self) -> i32 {
        self.descriptor.number.logical
    }

    pub fn mcu(&self) -> i32 {
        self.descriptor.number.mcu
    }

    pub fn row(&self) -> i32 {
        self.descriptor.number.row
    }

    pub fn column(&self) -> i32 {
        self.descriptor.number.column
    }

    pub fn position(&self) -> i32 {
        self.position
    }

    /// Modes this pin supports.
    pub fn modes(&self) -> impl Iterator<Item = Mode> + '_ {
        self.descriptor.modes.keys().copied()
    }

    pub fn supports(&self, mode: Mode) -> bool {
        self.descriptor.modes.contains_key(&mode)
    }

    /// Signal name of the pin in `mode`.
    pub fn mode_name(&self, mode: Mode) -> Option<&str> {
        self.descriptor.modes.get(&mode).map(String::as_str)
    }

    pub fn mode_names(&self) -> &BTreeMap<Mode, String> {
        &self.descriptor.modes
    }

    fn state(&self) -> GpioResult<MutexGuard<'_, PinState>> {
        self.state
            .lock()
            .map_err(|_| GpioError::PinError(PinError::StatePoisoned))
    }

    fn mcu_index(&self) -> u32 {
        self.descriptor.number.mcu as u32
    }

    fn check_gpio(&self) -> GpioResult<()> {
        if self.descriptor.kind == PinType::Gpio {
            Ok(())
        } else {
            Err(GpioError::PinError(PinError::NotGpio(self.label.clone())))
        }
    }

    fn not_open(&self) -> GpioError {
        GpioError::PinError(PinError::NotOpen(self.label.clone()))
    }

    fn uses_line(&self) -> bool {
        self.backend.layer == AccessLayer::CharDev
    }

    fn new_line(&self) -> GpioCharDevLine {
        let number = &self.descriptor.number;
        GpioCharDevLine::new(
            number.chip.max(0) as u32,
            number.offset.max(0) as u32,
            Arc::clone(&self.backend.lines),
        )
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().map(|state| state.open).unwrap_or(false)
    }

    /// Makes the pin usable.
    ///
    /// Under the character-device layer this requests the line, configured from the
    /// mode and pull already set on the pin. Pins that are not GPIO open trivially.
    pub fn open(&self) -> GpioResult<()> {
        let mut state = self.state()?;
        if state.open {
            return Ok(());
        }
        if self.descriptor.kind == PinType::Gpio {
            if self.uses_line() {
                let mut line = self.new_line();
                line.open(line_config(&state))?;
                state.line = Some(line);
            } else if !self.backend.device.is_open() {
                return Err(GpioError::DeviceError(DeviceError::NotOpen));
            }
        }
        state.open = true;
        log::debug!("pin {} opened", self.label);
        Ok(())
    }

    /// Stops interrupt delivery, optionally restores the saved configuration and
    /// releases the line. The pin is closed afterwards even if restoring failed.
    pub fn close(&self) -> GpioResult<()> {
        let release = if self.backend.release_on_close && self.kind() == PinType::Gpio && self.is_open() {
            self.release()
        } else {
            Ok(())
        };

        let line = {
            let mut state = self.state()?;
            if state.open {
                log::debug!("pin {} closed", self.label);
            }
            state.open = false;
            state.line.take()
        };
        // Joins the interrupt thread, whose handler may lock the pin.
        if let Some(mut line) = line {
            line.close();
        }
        release
    }

    pub fn mode(&self) -> GpioResult<Mode> {
        self.check_gpio()?;
        let state = self.state()?;
        if self.uses_line() {
            return Ok(state.mode);
        }
        if !state.open {
            return Err(self.not_open());
        }
        self.backend.device.mode(self.mcu_index())
    }

    /// Selects the pin function.
    ///
    /// Fails with `PinError::NotGpio` on power/ground positions and with
    /// `PinError::InvalidMode` for a mode missing from the pin's mode table.
    pub fn set_mode(&self, mode: Mode) -> GpioResult<()> {
        self.check_gpio()?;
        if !self.supports(mode) {
            return Err(GpioError::PinError(PinError::InvalidMode {
                pin: self.label.clone(),
                mode,
            }));
        }
        let mut state = self.state()?;
        self.save_state(&mut state)?;
        self.apply_mode(&mut state, mode)
    }

    fn apply_mode(&self, state: &mut PinState, mode: Mode) -> GpioResult<()> {
        if self.uses_line() {
            if !matches!(mode, Mode::Input | Mode::Output) {
                return Err(GpioError::PinError(PinError::InvalidMode {
                    pin: self.label.clone(),
                    mode,
                }));
            }
            if let Some(line) = state.line.as_mut() {
                line.set_mode(mode)?;
            }
            state.mode = mode;
            return Ok(());
        }
        if !state.open {
            return Err(self.not_open());
        }
        self.backend.device.set_mode(self.mcu_index(), mode)?;
        state.mode = mode;
        Ok(())
    }

    pub fn pull(&self) -> GpioResult<Pull> {
        self.check_gpio()?;
        let state = self.state()?;
        if self.uses_line() {
            return Ok(state.pull);
        }
        if !state.open {
            return Err(self.not_open());
        }
        self.backend.device.pull(self.mcu_index())
    }

    pub fn set_pull(&self, pull: Pull) -> GpioResult<()> {
        self.check_gpio()?;
        if pull == Pull::Unknown {
            return Err(GpioError::PinError(PinError::InvalidPull {
                pin: self.label.clone(),
                pull,
            }));
        }
        let mut state = self.state()?;
        self.save_state(&mut state)?;
        self.apply_pull(&mut state, pull)
    }

    fn apply_pull(&self, state: &mut PinState, pull: Pull) -> GpioResult<()> {
        if self.uses_line() {
            if let Some(line) = state.line.as_mut() {
                line.set_pull(pull)?;
            }
            state.pull = pull;
            return Ok(());
        }
        if !state.open {
            return Err(self.not_open());
        }
        self.backend.device.set_pull(self.mcu_index(), pull)?;
        state.pull = pull;
        Ok(())
    }

    fn save_state(&self, state: &mut PinState) -> GpioResult<()> {
        if state.saved.is_some() {
            return Ok(());
        }
        let saved = if self.uses_line() {
            (state.mode, state.pull)
        } else {
            if !state.open {
                return Err(self.not_open());
            }
            let mcu = self.mcu_index();
            (self.backend.device.mode(mcu)?, self.backend.device.pull(mcu)?)
        };
        state.saved = Some(saved);
        Ok(())
    }

    /// Restores the mode and pull the pin had before it was first changed.
    pub fn release(&self) -> GpioResult<()> {
        self.check_gpio()?;
        let mut state = self.state()?;
        if let Some((mode, pull)) = state.saved.take() {
            if mode != Mode::Unknown {
                self.apply_mode(&mut state, mode)?;
            }
            if pull != Pull::Unknown {
                self.apply_pull(&mut state, pull)?;
            }
            log::debug!("pin {} released to {:?}/{:?}", self.label, mode, pull);
        }
        Ok(())
    }

    pub fn read(&self) -> GpioResult<bool> {
        self.check_gpio()?;
        let state = self.state()?;
        if !state.open {
            return Err(self.not_open());
        }
        match state.line.as_ref() {
            Some(line) if self.uses_line() => line.read(),
            _ => self.backend.device.read(self.mcu_index()),
        }
    }

    pub fn write(&self, value: bool) -> GpioResult<()> {
        self.check_gpio()?;
        let state = self.state()?;
        if !state.open {
            return Err(self.not_open());
        }
        match state.line.as_ref() {
            Some(line) if self.uses_line() => line.write(value),
            _ => self.backend.device.write(self.mcu_index(), value),
        }
    }

    pub fn toggle(&self) -> GpioResult<()> {
        self.check_gpio()?;
        let state = self.state()?;
        if !state.open {
            return Err(self.not_open());
        }
        match state.line.as_ref() {
            Some(line) if self.uses_line() => {
                let value = line.read()?;
                line.write(!value)
            }
            _ => self.backend.device.toggle(self.mcu_index()),
        }
    }

    /// Output drive strength, in backend-specific units.
    pub fn drive(&self) -> GpioResult<u32> {
        self.check_gpio()?;
        let state = self.state()?;
        if !state.open {
            return Err(self.not_open());
        }
        if self.uses_line() || !self.backend.device.capabilities().drive {
            return Err(GpioError::DeviceError(DeviceError::Unsupported("drive")));
        }
        self.backend.device.drive(self.mcu_index())
    }

    pub fn set_drive(&self, level: u32) -> GpioResult<()> {
        self.check_gpio()?;
        let state = self.state()?;
        if !state.open {
            return Err(self.not_open());
        }
        if self.uses_line() || !self.backend.device.capabilities().drive {
            return Err(GpioError::DeviceError(DeviceError::Unsupported("drive")));
        }
        self.backend.device.set_drive(self.mcu_index(), level)
    }

    pub fn edge(&self) -> Edge {
        self.state.lock().map(|state| state.edge).unwrap_or(Edge::None)
    }

    /// Edge used by `wait_for_interrupt` when called with `Edge::None`.
    pub fn set_edge(&self, edge: Edge) -> GpioResult<()> {
        self.check_gpio()?;
        self.state()?.edge = edge;
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        self.state.lock().map(|state| state.debounce).unwrap_or_default()
    }

    pub fn set_debounce(&self, period: Duration) -> GpioResult<()> {
        self.check_gpio()?;
        let mut state = self.state()?;
        if let Some(line) = state.line.as_mut() {
            line.set_debounce(period)?;
        }
        state.debounce = period;
        Ok(())
    }

    /// Line used for edge events, opened on demand under the memory-mapped layer.
    ///
    /// Edge detection needs the line as an input, so any other mode is refused rather
    /// than silently switched.
    fn event_line<'a>(&self, state: &'a mut PinState) -> GpioResult<&'a mut GpioCharDevLine> {
        if !state.open {
            return Err(self.not_open());
        }
        let mode = if self.uses_line() {
            state.mode
        } else {
            self.backend.device.mode(self.mcu_index())?
        };
        if mode != Mode::Input {
            return Err(GpioError::PinError(PinError::NotInput(self.label.clone())));
        }
        if state.line.is_none() {
            let mut line = self.new_line();
            let mut config = line_config(state);
            config.direction = crate::device::chardev::Direction::Input;
            line.open(config)?;
            state.line = Some(line);
        }
        state
            .line
            .as_mut()
            .ok_or_else(|| GpioError::PinError(PinError::NotOpen(self.label.clone())))
    }

    /// Calls `handler` from a background thread on every `edge` of the input.
    ///
    /// The pin must be an input. Only one handler can be attached at a time. The handler
    /// may use the pin itself.
    pub fn attach_interrupt<F>(&self, edge: Edge, handler: F) -> GpioResult<()>
    where
        F: FnMut(InterruptEvent) + Send + 'static,
    {
        self.check_gpio()?;
        let mut state = self.state()?;
        let debounce = state.debounce;
        let line = self.event_line(&mut state)?;
        if !debounce.is_zero() {
            line.set_debounce(debounce)?;
        }
        line.attach_interrupt(edge, Box::new(handler))?;
        state.edge = edge;
        Ok(())
    }

    /// Stops interrupt delivery. No handler call happens after this returns.
    ///
    /// The thread is joined after the pin lock is released.
    pub fn detach_interrupt(&self) -> GpioResult<()> {
        let (isr, line) = {
            let mut state = self.state()?;
            let Some(line) = state.line.as_mut() else {
                return Ok(());
            };
            let isr = line.take_interrupt();
            let line = if self.uses_line() { None } else { state.line.take() };
            (isr, line)
        };
        if let Some(isr) = isr {
            isr.stop();
        }
        if let Some(mut line) = line {
            line.close();
        }
        Ok(())
    }

    pub fn has_interrupt(&self) -> bool {
        self.state
            .lock()
            .map(|state| state.line.as_ref().map_or(false, GpioCharDevLine::has_interrupt))
            .unwrap_or(false)
    }

    /// Blocks until `edge` occurs or `timeout_ms` elapses (-1 waits forever).
    ///
    /// Returns `Ok(false)` on timeout; the timeout is also recorded as last error. The
    /// pin stays usable from other threads during the wait.
    pub fn wait_for_interrupt(&self, edge: Edge, timeout_ms: i32) -> GpioResult<bool> {
        self.check_gpio()?;
        let mut state = self.state()?;
        let edge = if edge == Edge::None { state.edge } else { edge };
        let (line, timeout) = self.event_line(&mut state)?.begin_wait(edge, timeout_ms)?;
        drop(state);

        let event = line.wait_event(timeout);

        let mut state = self.state()?;
        match state.line.as_mut() {
            Some(line) => line.finish_wait(event),
            // Closed while waiting.
            None => Ok(event.map_err(GpioError::LineError)?.is_some()),
        }
    }

    /// Error code and message recorded by the last failing line operation.
    pub fn last_error(&self) -> Option<LineError> {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.line.as_ref().and_then(|line| line.last_error().cloned()))
    }

    /// Lock-free output handle for generator threads.
    pub fn output(&self) -> GpioResult<PinOutput> {
        self.check_gpio()?;
        let state = self.state()?;
        if !state.open {
            return Err(self.not_open());
        }
        match state.line.as_ref().and_then(GpioCharDevLine::handle) {
            Some(handle) if self.uses_line() => Ok(PinOutput::Line(handle)),
            _ if self.uses_line() => Err(self.not_open()),
            _ => Ok(PinOutput::Register {
                device: Arc::clone(&self.backend.device),
                mcu: self.mcu_index(),
            }),
        }
    }
}

fn line_config(state: &PinState) -> crate::device::chardev::LineConfig {
    use crate::device::chardev::{Direction, LineConfig};

    LineConfig {
        direction: if state.mode == Mode::Output {
            Direction::Output
        } else {
            Direction::Input
        },
        bias: state.pull,
        value: false,
        edge: Edge::None,
        debounce: state.debounce,
    }
}

impl<'a> eh::InputPin for &'a Pin {
    type Error = GpioError;

    fn is_high(&self) -> Result<bool, Self::Error> {
        self.read()
    }

    fn is_low(&self) -> Result<bool, Self::Error> {
        self.read().map(|v| !v)
    }
}

impl<'a> eh::OutputPin for &'a Pin {
    type Error = GpioError;

    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.write(false)
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.write(true)
    }
}

impl<'a> eh::StatefulOutputPin for &'a Pin {
    fn is_set_high(&self) -> Result<bool, Self::Error> {
        self.read()
    }

    fn is_set_low(&self) -> Result<bool, Self::Error> {
        self.read().map(|v| !v)
    }
}

impl<'a> eh::ToggleableOutputPin for &'a Pin {
    type Error = GpioError;

    fn toggle(&mut self) -> Result<(), Self::Error> {
        Pin::toggle(self)
    }
}

impl eh::OutputPin for PinOutput {
    type Error = GpioError;

    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.write(false)
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.write(true)
    }
}
