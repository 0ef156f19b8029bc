//! Board metadata: which SoC a board carries and how its headers are wired.
//!
//! The library never writes board metadata. Descriptors come from a `BoardDatabase`,
//! either the built-in tables in `pin_map` or a TOML file, and are read once when a
//! `Gpio` is constructed.
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use crate::device::error::ConfigError;
use crate::pin::{Mode, Number, PinType};
use crate::{GpioError, GpioResult};

/// Vendor/chip-generation grouping determining the register layout.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum SocFamily {
    Bcm2835,
    AllWinnerHx,
    Rp1,
    AmlogicS905,
    Unknown,
}

/// Concrete SoC model found on a board.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum SocModel {
    Bcm2835,
    Bcm2836,
    Bcm2837,
    Bcm2711,
    /// Raspberry Pi 5. GPIOs on the 40-pin header belong to the RP1 south bridge.
    Bcm2712,
    H3,
    H5,
    S905,
    Unknown,
}

impl SocModel {
    pub fn family(self) -> SocFamily {
        use SocModel::*;
        match self {
            Bcm2835 | Bcm2836 | Bcm2837 | Bcm2711 => SocFamily::Bcm2835,
            Bcm2712 => SocFamily::Rp1,
            H3 | H5 => SocFamily::AllWinnerHx,
            S905 => SocFamily::AmlogicS905,
            Unknown => SocFamily::Unknown,
        }
    }
}

/// Physical shape of a header.
#[derive(Serialize, Deserialize, Clone, Debug, Eq, PartialEq)]
pub struct ConnectorFamily {
    pub name: String,
    pub columns: i32,
}

impl ConnectorFamily {
    pub fn new(name: &str, columns: i32) -> Self {
        Self {
            name: name.to_string(),
            columns,
        }
    }

    /// Header position (1-based) of the pin at `row`, `column`.
    pub fn position(&self, row: i32, column: i32) -> i32 {
        (row - 1) * self.columns + column
    }

    /// Inverse of `position`.
    pub fn row_column(&self, position: i32) -> (i32, i32) {
        ((position - 1) / self.columns + 1, (position - 1) % self.columns + 1)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct PinDescriptor {
    pub kind: PinType,
    #[serde(default)]
    pub number: Number,
    /// Identifier of the pin in the board database.
    #[serde(default)]
    pub id: i64,
    /// Modes the pin supports and the name of the signal in each of them.
    #[serde(default)]
    pub modes: BTreeMap<Mode, String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ConnectorDescriptor {
    pub name: String,
    pub number: i32,
    pub family: ConnectorFamily,
    pub rows: i32,
    pub pins: Vec<PinDescriptor>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BoardDescriptor {
    /// Short tag used to look the board up, e.g. `rpi4b`.
    pub id: String,
    pub name: String,
    pub soc: SocModel,
    /// Substrings of `/proc/device-tree/model` identifying the board.
    #[serde(default)]
    pub models: Vec<String>,
    pub connectors: Vec<ConnectorDescriptor>,
}

impl BoardDescriptor {
    pub fn from_toml_str(text: &str) -> GpioResult<Self> {
        let board: Self = toml::from_str(text).map_err(|err| GpioError::ConfigError(ConfigError::Parse(err)))?;
        board.validate()?;
        Ok(board)
    }

    /// Iterates over every GPIO pin of the board.
    pub fn gpio_pins(&self) -> impl Iterator<Item = &PinDescriptor> {
        self.connectors
            .iter()
            .flat_map(|connector| connector.pins.iter())
            .filter(|pin| pin.kind == PinType::Gpio)
    }

    /// Checks the invariants the rest of the library relies on.
    ///
    /// Logical numbers of GPIO pins must be exactly `0..N-1`, every pin must sit
    /// inside its connector and no two pins may share a header position.
    pub fn validate(&self) -> GpioResult<()> {
        let invalid = |msg: String| GpioError::ConfigError(ConfigError::InvalidDescriptor(msg));

        let logical: BTreeSet<i32> = self.gpio_pins().map(|pin| pin.number.logical).collect();
        let count = self.gpio_pins().count();
        if logical.len() != count || !logical.iter().copied().eq(0..count as i32) {
            return Err(invalid(format!(
                "{}: logical pin numbers are not contiguous from 0",
                self.id
            )));
        }

        for connector in &self.connectors {
            if connector.family.columns < 1 || connector.rows < 1 {
                return Err(invalid(format!("{}: connector {} has no pins", self.id, connector.name)));
            }
            let mut positions = BTreeSet::new();
            for pin in &connector.pins {
                let Number { row, column, .. } = pin.number;
                if row < 1 || row > connector.rows || column < 1 || column > connector.family.columns {
                    return Err(invalid(format!(
                        "{}: pin at {}:{} lies outside connector {}",
                        self.id, row, column, connector.name
                    )));
                }
                if !positions.insert(connector.family.position(row, column)) {
                    return Err(invalid(format!(
                        "{}: two pins at {}:{} on connector {}",
                        self.id, row, column, connector.name
                    )));
                }
                if pin.kind == PinType::Gpio && pin.modes.is_empty() {
                    return Err(invalid(format!("{}: gpio pin {} has no modes", self.id, pin.id)));
                }
                if pin.kind == PinType::Gpio && pin.number.mcu < 0 {
                    return Err(invalid(format!("{}: gpio pin {} has no mcu number", self.id, pin.id)));
                }
            }
        }
        Ok(())
    }
}

/// Read-only source of board descriptors.
pub trait BoardDatabase {
    fn board(&self, id: &str) -> GpioResult<BoardDescriptor>;

    fn boards(&self) -> Vec<BoardDescriptor>;

    /// Finds the board whose model strings match the running device tree.
    fn detect(&self) -> GpioResult<BoardDescriptor> {
        let model = fs::read_to_string("/proc/device-tree/model")
            .map_err(|err| GpioError::ConfigError(ConfigError::Read("/proc/device-tree/model".into(), err)))?;
        let model = model.trim_end_matches('\0').trim();
        log::debug!("device tree model: {}", model);

        self.boards()
            .into_iter()
            .find(|board| board.models.iter().any(|pattern| model.contains(pattern.as_str())))
            .ok_or_else(|| GpioError::ConfigError(ConfigError::UnknownBoard(model.to_string())))
    }
}

/// Board descriptors loaded from a TOML document holding a `[[board]]` array.
#[derive(Debug, Clone, Default)]
pub struct TomlBoards {
    boards: Vec<BoardDescriptor>,
}

#[derive(Deserialize)]
struct TomlBoardsFile {
    #[serde(default)]
    board: Vec<BoardDescriptor>,
}

impl TomlBoards {
    pub fn from_toml_str(text: &str) -> GpioResult<Self> {
        let file: TomlBoardsFile =
            toml::from_str(text).map_err(|err| GpioError::ConfigError(ConfigError::Parse(err)))?;
        for board in &file.board {
            board.validate()?;
        }
        Ok(Self { boards: file.board })
    }

    pub fn load<P: AsRef<Path>>(path: P) -> GpioResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|err| GpioError::ConfigError(ConfigError::Read(path.display().to_string(), err)))?;
        Self::from_toml_str(&text)
    }
}

impl BoardDatabase for TomlBoards {
    fn board(&self, id: &str) -> GpioResult<BoardDescriptor> {
        self.boards
            .iter()
            .find(|board| board.id == id)
            .cloned()
            .ok_or_else(|| GpioError::ConfigError(ConfigError::UnknownBoard(id.to_string())))
    }

    fn boards(&self) -> Vec<BoardDescriptor> {
        self.boards.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TINY_BOARD: &str = r#"
        [[board]]
        id = "tiny"
        name = "Tiny test board"
        soc = "bcm2711"
        models = ["Tiny"]

        [[board.connectors]]
        name = "J1"
        number = 1
        rows = 2
        family = { name = "gpio2", columns = 2 }

        [[board.connectors.pins]]
        kind = "gpio"
        id = 10
        number = { logical = 0, mcu = 17, system = 529, row = 1, column = 1, chip = 0, offset = 17 }
        modes = { input = "GPIO17", output = "GPIO17", alt3 = "RTS0" }

        [[board.connectors.pins]]
        kind = "ground"
        id = 11
        number = { row = 1, column = 2 }

        [[board.connectors.pins]]
        kind = "gpio"
        id = 12
        number = { logical = 1, mcu = 18, system = 530, row = 2, column = 1, chip = 0, offset = 18 }
        modes = { input = "GPIO18", output = "GPIO18", pwm = "PWM0" }
    "#;

    #[test]
    fn parses_board_file() {
        let boards = TomlBoards::from_toml_str(TINY_BOARD).unwrap();
        let board = boards.board("tiny").unwrap();

        assert_eq!(board.soc, SocModel::Bcm2711);
        assert_eq!(board.soc.family(), SocFamily::Bcm2835);
        assert_eq!(board.gpio_pins().count(), 2);
        let ground = &board.connectors[0].pins[1];
        assert_eq!(ground.kind, PinType::Ground);
        assert_eq!(ground.number.logical, -1);
        assert_eq!(board.connectors[0].pins[2].modes.get(&Mode::Pwm).map(String::as_str), Some("PWM0"));
    }

    #[test]
    fn unknown_board_is_config_error() {
        let boards = TomlBoards::from_toml_str(TINY_BOARD).unwrap();
        assert!(matches!(
            boards.board("missing"),
            Err(GpioError::ConfigError(ConfigError::UnknownBoard(_)))
        ));
    }

    #[test]
    fn sparse_logical_numbers_are_rejected() {
        let broken = TINY_BOARD.replace("logical = 1", "logical = 4");
        assert!(TomlBoards::from_toml_str(&broken).is_err());
    }

    #[test]
    fn position_round_trips() {
        let family = ConnectorFamily::new("gpio2", 2);
        for position in 1..=40 {
            let (row, column) = family.row_column(position);
            assert_eq!(family.position(row, column), position);
        }
        assert_eq!(family.position(1, 1), 1);
        assert_eq!(family.position(20, 2), 40);
    }
}
