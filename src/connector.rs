//! Headers of a board.
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::board::{ConnectorDescriptor, ConnectorFamily};
use crate::pin::{Pin, PinBackend};
use crate::GpioResult;

/// Ordered collection of the pins forming one header.
#[derive(Debug)]
pub struct Connector {
    name: String,
    number: i32,
    family: ConnectorFamily,
    rows: i32,
    /// Pins keyed by header position.
    pins: BTreeMap<i32, Arc<Pin>>,
}

impl Connector {
    pub fn new(descriptor: &ConnectorDescriptor, backend: &PinBackend) -> Self {
        let pins = descriptor
            .pins
            .iter()
            .map(|pin| {
                let pin = Pin::new(pin.clone(), &descriptor.name, &descriptor.family, backend.clone());
                (pin.position(), Arc::new(pin))
            })
            .collect();

        Self {
            name: descriptor.name.clone(),
            number: descriptor.number,
            family: descriptor.family.clone(),
            rows: descriptor.rows,
            pins,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn number(&self) -> i32 {
        self.number
    }

    pub fn family(&self) -> &ConnectorFamily {
        &self.family
    }

    pub fn rows(&self) -> i32 {
        self.rows
    }

    pub fn columns(&self) -> i32 {
        self.family.columns
    }

    pub fn pin(&self, row: i32, column: i32) -> Option<&Arc<Pin>> {
        if column < 1 || column > self.family.columns {
            return None;
        }
        self.pin_at(self.family.position(row, column))
    }

    /// Pin at header position `position` (1-based).
    pub fn pin_at(&self, position: i32) -> Option<&Arc<Pin>> {
        self.pins.get(&position)
    }

    /// Pins in header order.
    pub fn pins(&self) -> impl Iterator<Item = &Arc<Pin>> {
        self.pins.values()
    }

    /// Opens every pin, carrying on past failures. Returns the first one.
    pub fn open(&self) -> GpioResult<()> {
        self.for_each_pin("open", Pin::open)
    }

    /// Closes every pin, carrying on past failures. Returns the first one.
    pub fn close(&self) -> GpioResult<()> {
        self.for_each_pin("close", Pin::close)
    }

    pub fn is_open(&self) -> bool {
        self.pins.values().all(|pin| pin.is_open())
    }

    fn for_each_pin(&self, action: &str, op: fn(&Pin) -> GpioResult<()>) -> GpioResult<()> {
        let mut first = Ok(());
        for pin in self.pins.values() {
            if let Err(err) = op(pin) {
                log::warn!("{}: failed to {} pin {}: {}", self.name, action, pin.label(), err);
                if first.is_ok() {
                    first = Err(err);
                }
            }
        }
        first
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::PinDescriptor;
    use crate::device::memory::SimulatedMemory;
    use crate::device::Bcm2835Gpio;
    use crate::device::GpioDevice;
    use crate::device::chardev::testing::FakeLines;
    use crate::gpio::AccessLayer;
    use crate::pin::tests::gpio_descriptor;
    use crate::pin::{Mode, PinType};
    use crate::board::SocModel;

    fn descriptor() -> ConnectorDescriptor {
        let ground = PinDescriptor {
            kind: PinType::Ground,
            number: crate::pin::Number {
                row: 1,
                column: 2,
                ..Default::default()
            },
            id: 2,
            modes: Default::default(),
        };
        ConnectorDescriptor {
            name: "J8".into(),
            number: 0,
            family: ConnectorFamily::new("gpio2", 2),
            rows: 2,
            pins: vec![
                gpio_descriptor(0, 17, 1, 1, &[Mode::Input, Mode::Output]),
                ground,
                gpio_descriptor(1, 27, 2, 1, &[Mode::Input, Mode::Output]),
            ],
        }
    }

    fn backend() -> (PinBackend, Arc<dyn GpioDevice>) {
        let device: Arc<dyn GpioDevice> =
            Arc::new(Bcm2835Gpio::new(SocModel::Bcm2711, Arc::new(SimulatedMemory::new())).unwrap());
        let backend = PinBackend {
            device: Arc::clone(&device),
            lines: Arc::new(FakeLines::default()),
            layer: AccessLayer::Memory,
            release_on_close: false,
        };
        (backend, device)
    }

    #[test]
    fn lookup_by_row_column_and_position() {
        let (backend, _) = backend();
        let connector = Connector::new(&descriptor(), &backend);

        assert_eq!(connector.pins().count(), 3);
        assert_eq!(connector.pin(2, 1).unwrap().mcu(), 27);
        assert_eq!(connector.pin_at(3).unwrap().mcu(), 27);
        assert_eq!(connector.pin_at(2).unwrap().kind(), PinType::Ground);
        assert!(connector.pin(2, 2).is_none());
        assert!(connector.pin(1, 3).is_none());
    }

    #[test]
    fn open_is_best_effort() {
        let (backend, device) = backend();
        let connector = Connector::new(&descriptor(), &backend);

        // GPIO pins refuse to open on an unmapped device, the ground pin opens anyway.
        assert!(connector.open().is_err());
        assert!(connector.pin_at(2).unwrap().is_open());
        assert!(!connector.is_open());

        device.open().unwrap();
        connector.open().unwrap();
        assert!(connector.is_open());
        connector.close().unwrap();
        assert!(connector.pins().all(|pin| !pin.is_open()));
    }
}
