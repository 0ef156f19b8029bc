//! Built-in board descriptors.
//!
//! Each table lists the header positions of a board in order. Descriptors are
//! generated from the tables on demand so a `BuiltinBoards` costs nothing to create.
use std::collections::BTreeMap;

use crate::board::{BoardDatabase, BoardDescriptor, ConnectorDescriptor, ConnectorFamily, PinDescriptor, SocModel};
use crate::device::error::ConfigError;
use crate::device::{allwinner_hx, bcm2835, pwm_alternate, rp1};
use crate::pin::{Mode, Number, PinType};
use crate::{GpioError, GpioResult};

/// What sits at one header position.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Slot {
    V1_8,
    V3_3,
    V5,
    Ground,
    NotConnected,
    Gpio(u32),
}

use Slot::*;

struct ConnectorTable {
    name: &'static str,
    family: &'static str,
    columns: i32,
    slots: &'static [Slot],
}

struct BoardTable {
    id: &'static str,
    name: &'static str,
    soc: SocModel,
    models: &'static [&'static str],
    connectors: &'static [ConnectorTable],
    /// MCU numbers in logical order. Header order when empty.
    logical: &'static [u32],
    /// Kernel GPIO number, GPIO chip and line offset of an MCU pin.
    lines: fn(u32) -> (i32, i32, i32),
    modes: fn(u32) -> BTreeMap<Mode, String>,
}

/// Raspberry Pi J8, 40 pins.
const RPI_J8: [Slot; 40] = [
    V3_3, V5,
    Gpio(2), V5,
    Gpio(3), Ground,
    Gpio(4), Gpio(14),
    Ground, Gpio(15),
    Gpio(17), Gpio(18),
    Gpio(27), Ground,
    Gpio(22), Gpio(23),
    V3_3, Gpio(24),
    Gpio(10), Ground,
    Gpio(9), Gpio(25),
    Gpio(11), Gpio(8),
    Ground, Gpio(7),
    Gpio(0), Gpio(1),
    Gpio(5), Ground,
    Gpio(6), Gpio(12),
    Gpio(13), Ground,
    Gpio(19), Gpio(16),
    Gpio(26), Gpio(20),
    Ground, Gpio(21),
];

/// Logical order shared by every 40-pin Raspberry Pi.
const RPI_LOGICAL: [u32; 28] = [
    17, 18, 27, 22, 23, 24, 25, 4, 2, 3, 8, 7, 10, 9, 11, 14, 15, 5, 6, 13, 19, 26, 12, 16, 20, 21, 0, 1,
];

const PA: u32 = 0;
const PC: u32 = 2 * 32;
const PG: u32 = 6 * 32;

/// NanoPi NEO CON1, 24 pins.
const NANOPI_CON1: [Slot; 24] = [
    V3_3, V5,
    Gpio(PA + 12), V5,
    Gpio(PA + 11), Ground,
    Gpio(PG + 11), Gpio(PG + 6),
    Ground, Gpio(PG + 7),
    Gpio(PA), Gpio(PA + 6),
    Gpio(PA + 2), Ground,
    Gpio(PA + 3), Gpio(PG + 8),
    V3_3, Gpio(PG + 9),
    Gpio(PC), Ground,
    Gpio(PC + 1), Gpio(PA + 1),
    Gpio(PC + 2), Gpio(PC + 3),
];

/// NanoPi NEO debug UART header.
const NANOPI_DEBUG: [Slot; 4] = [Ground, V5, Gpio(PA + 4), Gpio(PA + 5)];

/// ODROID-C2 J2, 40 pins.
const ODROID_C2_J2: [Slot; 40] = [
    V3_3, V5,
    NotConnected, V5,
    NotConnected, Ground,
    Gpio(249), Gpio(240),
    Ground, Gpio(241),
    Gpio(247), Gpio(238),
    Gpio(239), Ground,
    Gpio(237), Gpio(236),
    V3_3, Gpio(233),
    Gpio(235), Ground,
    Gpio(232), Gpio(231),
    Gpio(230), Gpio(229),
    Ground, Gpio(225),
    Gpio(207), Gpio(208),
    Gpio(228), Ground,
    Gpio(219), Gpio(224),
    Gpio(234), Ground,
    Gpio(214), Gpio(218),
    NotConnected, V1_8,
    Ground, NotConnected,
];

const BOARDS: &[BoardTable] = &[
    BoardTable {
        id: "rpi3b",
        name: "Raspberry Pi 3 Model B",
        soc: SocModel::Bcm2837,
        models: &["Raspberry Pi 3"],
        connectors: &[ConnectorTable {
            name: "J8",
            family: "gpio2",
            columns: 2,
            slots: &RPI_J8,
        }],
        logical: &RPI_LOGICAL,
        lines: bcm2835_lines,
        modes: bcm2835_modes,
    },
    BoardTable {
        id: "rpi4b",
        name: "Raspberry Pi 4 Model B",
        soc: SocModel::Bcm2711,
        models: &["Raspberry Pi 4", "Raspberry Pi 400"],
        connectors: &[ConnectorTable {
            name: "J8",
            family: "gpio2",
            columns: 2,
            slots: &RPI_J8,
        }],
        logical: &RPI_LOGICAL,
        lines: bcm2835_lines,
        modes: bcm2835_modes,
    },
    BoardTable {
        id: "rpi5b",
        name: "Raspberry Pi 5 Model B",
        soc: SocModel::Bcm2712,
        models: &["Raspberry Pi 5"],
        connectors: &[ConnectorTable {
            name: "J8",
            family: "gpio2",
            columns: 2,
            slots: &RPI_J8,
        }],
        logical: &RPI_LOGICAL,
        lines: rp1_lines,
        modes: rp1_modes,
    },
    BoardTable {
        id: "nanopi-neo",
        name: "NanoPi NEO",
        soc: SocModel::H3,
        models: &["NanoPi NEO"],
        connectors: &[
            ConnectorTable {
                name: "CON1",
                family: "gpio2",
                columns: 2,
                slots: &NANOPI_CON1,
            },
            ConnectorTable {
                name: "DEBUG",
                family: "uart",
                columns: 1,
                slots: &NANOPI_DEBUG,
            },
        ],
        logical: &[],
        lines: sunxi_lines,
        modes: sunxi_modes,
    },
    BoardTable {
        id: "odroid-c2",
        name: "ODROID-C2",
        soc: SocModel::S905,
        models: &["ODROID-C2"],
        connectors: &[ConnectorTable {
            name: "J2",
            family: "gpio2",
            columns: 2,
            slots: &ODROID_C2_J2,
        }],
        logical: &[],
        lines: s905_lines,
        modes: s905_modes,
    },
];

fn bcm2835_lines(mcu: u32) -> (i32, i32, i32) {
    (512 + mcu as i32, 0, mcu as i32)
}

fn rp1_lines(mcu: u32) -> (i32, i32, i32) {
    (571 + mcu as i32, 0, mcu as i32)
}

/// Ports A to G sit on the first chip; port L on the second.
fn sunxi_lines(mcu: u32) -> (i32, i32, i32) {
    if mcu >= 11 * 32 {
        (mcu as i32, 1, mcu as i32 - 11 * 32)
    } else {
        (mcu as i32, 0, mcu as i32)
    }
}

fn s905_lines(mcu: u32) -> (i32, i32, i32) {
    (mcu as i32, 1, mcu as i32 - 136)
}

fn io_modes(name: String) -> BTreeMap<Mode, String> {
    let mut modes = BTreeMap::new();
    modes.insert(Mode::Input, name.clone());
    modes.insert(Mode::Output, name);
    modes
}

fn alternates(modes: &mut BTreeMap<Mode, String>, functions: impl Iterator<Item = u32>) {
    for n in functions {
        if let Some(mode) = Mode::alternate(n) {
            modes.insert(mode, format!("ALT{}", n));
        }
    }
}

/// Replaces the alternate function routed to a PWM channel with `Mode::Pwm`.
fn pwm(modes: &mut BTreeMap<Mode, String>, table: &[(u32, Mode)], mcu: u32, channel: String) {
    if let Some(alternate) = pwm_alternate(table, mcu) {
        modes.remove(&alternate);
        modes.insert(Mode::Pwm, channel);
    }
}

fn bcm2835_modes(mcu: u32) -> BTreeMap<Mode, String> {
    let mut modes = io_modes(format!("GPIO{}", mcu));
    alternates(&mut modes, 0..=5);
    pwm(&mut modes, &bcm2835::PWM_PINS, mcu, format!("PWM{}", mcu % 2));
    modes
}

/// Function 5 of the RP1 is the GPIO itself and is reached through Input/Output.
fn rp1_modes(mcu: u32) -> BTreeMap<Mode, String> {
    let mut modes = io_modes(format!("GPIO{}", mcu));
    alternates(&mut modes, (0..=8).filter(|n| *n != 5));
    let channel = match mcu {
        12 => 0,
        13 => 1,
        18 => 2,
        _ => 3,
    };
    pwm(&mut modes, &rp1::PWM_PINS, mcu, format!("PWM0_CHAN{}", channel));
    modes
}

fn sunxi_modes(mcu: u32) -> BTreeMap<Mode, String> {
    let port = (b'A' + (mcu / 32) as u8) as char;
    let mut modes = io_modes(format!("P{}{}", port, mcu % 32));
    alternates(&mut modes, 2..=6);
    modes.insert(Mode::Disabled, "IO_DISABLE".to_string());
    pwm(&mut modes, &allwinner_hx::PWM_PINS, mcu, "PWM0".to_string());
    modes
}

fn s905_modes(mcu: u32) -> BTreeMap<Mode, String> {
    let name = match mcu {
        181..=210 => format!("GPIODV.{}", mcu - 181),
        211..=227 => format!("GPIOY.{}", mcu - 211),
        _ => format!("GPIOX.{}", mcu - 228),
    };
    io_modes(name)
}

impl BoardTable {
    fn descriptor(&self) -> BoardDescriptor {
        let mut next_logical = 0;
        let connectors = self
            .connectors
            .iter()
            .enumerate()
            .map(|(index, table)| {
                let family = ConnectorFamily::new(table.family, table.columns);
                let pins = table
                    .slots
                    .iter()
                    .enumerate()
                    .map(|(slot, kind)| {
                        let (row, column) = family.row_column(slot as i32 + 1);
                        let id = (index as i64 + 1) * 100 + slot as i64 + 1;
                        self.pin(*kind, id, row, column, &mut next_logical)
                    })
                    .collect();
                ConnectorDescriptor {
                    name: table.name.to_string(),
                    number: index as i32,
                    rows: (table.slots.len() as i32 + table.columns - 1) / table.columns,
                    family,
                    pins,
                }
            })
            .collect();

        BoardDescriptor {
            id: self.id.to_string(),
            name: self.name.to_string(),
            soc: self.soc,
            models: self.models.iter().map(|model| model.to_string()).collect(),
            connectors,
        }
    }

    fn pin(&self, slot: Slot, id: i64, row: i32, column: i32, next_logical: &mut i32) -> PinDescriptor {
        let mut number = Number {
            row,
            column,
            ..Number::default()
        };
        let (kind, modes) = match slot {
            Gpio(mcu) => {
                number.logical = match self.logical.iter().position(|candidate| *candidate == mcu) {
                    Some(logical) => logical as i32,
                    None => {
                        *next_logical += 1;
                        *next_logical - 1
                    }
                };
                let (system, chip, offset) = (self.lines)(mcu);
                number.mcu = mcu as i32;
                number.system = system;
                number.chip = chip;
                number.offset = offset;
                (PinType::Gpio, (self.modes)(mcu))
            }
            V1_8 => (PinType::Power, power("1V8")),
            V3_3 => (PinType::Power, power("3V3")),
            V5 => (PinType::Power, power("5V")),
            Ground => (PinType::Ground, power("GND")),
            NotConnected => (PinType::NotConnected, BTreeMap::new()),
        };

        PinDescriptor {
            kind,
            number,
            id,
            modes,
        }
    }
}

fn power(name: &str) -> BTreeMap<Mode, String> {
    let mut modes = BTreeMap::new();
    modes.insert(Mode::Disabled, name.to_string());
    modes
}

/// Descriptors for the boards known to the library.
#[derive(Copy, Clone, Debug, Default)]
pub struct BuiltinBoards;

impl BoardDatabase for BuiltinBoards {
    fn board(&self, id: &str) -> GpioResult<BoardDescriptor> {
        BOARDS
            .iter()
            .find(|table| table.id == id)
            .map(BoardTable::descriptor)
            .ok_or_else(|| GpioError::ConfigError(ConfigError::UnknownBoard(id.to_string())))
    }

    fn boards(&self) -> Vec<BoardDescriptor> {
        BOARDS.iter().map(BoardTable::descriptor).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gpio_count(board: &BoardDescriptor) -> usize {
        board.gpio_pins().count()
    }

    #[test]
    fn every_board_is_valid() {
        for board in BuiltinBoards.boards() {
            board.validate().unwrap();
        }
    }

    #[test]
    fn raspberry_pi_header() {
        let board = BuiltinBoards.board("rpi4b").unwrap();
        assert_eq!(gpio_count(&board), 28);

        let j8 = &board.connectors[0];
        assert_eq!(j8.rows, 20);
        let pin11 = &j8.pins[10];
        assert_eq!(pin11.number.mcu, 17);
        assert_eq!(pin11.number.logical, 0);
        assert_eq!(pin11.number.system, 529);
        assert_eq!((pin11.number.row, pin11.number.column), (6, 1));
        assert_eq!(j8.pins[5].kind, PinType::Ground);

        let pin12 = &j8.pins[11];
        assert_eq!(pin12.modes.get(&Mode::Pwm).map(String::as_str), Some("PWM0"));
        assert!(!pin12.modes.contains_key(&Mode::Alt5));
        assert!(pin12.modes.contains_key(&Mode::Alt0));
        let pin32 = &j8.pins[31];
        assert!(pin32.modes.contains_key(&Mode::Pwm));
        assert!(!pin32.modes.contains_key(&Mode::Alt0));
    }

    #[test]
    fn raspberry_pi_5_uses_rp1_functions() {
        let board = BuiltinBoards.board("rpi5b").unwrap();
        let gpio18 = &board.connectors[0].pins[11];
        assert_eq!(gpio18.modes.get(&Mode::Pwm).map(String::as_str), Some("PWM0_CHAN2"));
        assert!(!gpio18.modes.contains_key(&Mode::Alt3));
        assert!(gpio18.modes.contains_key(&Mode::Alt8));
        assert!(!gpio18.modes.contains_key(&Mode::Alt5));
        assert_eq!(gpio18.number.system, 589);
    }

    #[test]
    fn nanopi_neo_numbers_pins_in_header_order() {
        let board = BuiltinBoards.board("nanopi-neo").unwrap();
        assert_eq!(gpio_count(&board), 18);

        let con1 = &board.connectors[0];
        assert_eq!(con1.pins[2].number.logical, 0);
        assert_eq!(con1.pins[2].modes.get(&Mode::Input).map(String::as_str), Some("PA12"));
        assert_eq!(con1.pins[6].number.mcu, 203);

        let debug = &board.connectors[1];
        assert_eq!(debug.family.columns, 1);
        let pa5 = &debug.pins[3];
        assert_eq!(pa5.number.logical, 17);
        assert_eq!((pa5.number.row, pa5.number.column), (4, 1));
        assert!(pa5.modes.contains_key(&Mode::Pwm));
        assert!(!pa5.modes.contains_key(&Mode::Alt3));
    }

    #[test]
    fn odroid_c2_keeps_its_pin_ids() {
        let board = BuiltinBoards.board("odroid-c2").unwrap();
        assert_eq!(gpio_count(&board), 23);
        let pin7 = &board.connectors[0].pins[6];
        assert_eq!(pin7.number.mcu, 249);
        assert_eq!(pin7.modes.get(&Mode::Output).map(String::as_str), Some("GPIOX.21"));
        assert_eq!(board.connectors[0].pins[2].kind, PinType::NotConnected);
    }

    #[test]
    fn unknown_id() {
        assert!(BuiltinBoards.board("beaglebone").is_err());
    }
}
