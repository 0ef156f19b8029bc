#![allow(dead_code)]

use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sbc_mmap_gpio::board::BoardDatabase;
use sbc_mmap_gpio::device::chardev::{Direction, InterruptEvent, LineConfig, LineError, LineHandle, LineProvider};
use sbc_mmap_gpio::device::memory::{RegisterWindow, SimulatedMemory, PAGE_SIZE};
use sbc_mmap_gpio::{AccessLayer, BuiltinBoards, Edge, Gpio, GpioConfig};

const GPSET0: usize = 0x07;
const GPCLR0: usize = 0x0A;
const GPLEV0: usize = 0x0D;

/// BCM2835 GPIO block where set and clear registers drive the level registers.
#[derive(Debug)]
pub struct BcmGpioModel {
    base: u64,
    words: Vec<AtomicU32>,
}

impl BcmGpioModel {
    pub fn new(base: u64) -> Self {
        Self {
            base,
            words: (0..PAGE_SIZE / 4).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    pub fn level(&self, mcu: u32) -> bool {
        self.read(GPLEV0 + (mcu / 32) as usize) & (1 << (mcu % 32)) != 0
    }
}

impl RegisterWindow for BcmGpioModel {
    fn base(&self) -> u64 {
        self.base
    }

    fn words(&self) -> usize {
        self.words.len()
    }

    fn read(&self, offset: usize) -> u32 {
        self.words[offset].load(Ordering::SeqCst)
    }

    fn write(&self, offset: usize, value: u32) {
        match offset {
            GPSET0 | 0x08 => {
                self.words[GPLEV0 + offset - GPSET0].fetch_or(value, Ordering::SeqCst);
            }
            GPCLR0 | 0x0B => {
                self.words[GPLEV0 + offset - GPCLR0].fetch_and(!value, Ordering::SeqCst);
            }
            _ => self.words[offset].store(value, Ordering::SeqCst),
        }
    }
}

#[derive(Debug)]
pub struct TestLine {
    config: Mutex<LineConfig>,
    value: AtomicBool,
    events: Sender<InterruptEvent>,
    pending: Receiver<InterruptEvent>,
}

impl TestLine {
    pub fn push_edge(&self, edge: Edge, sequence: u32) {
        let _ = self.events.send(InterruptEvent {
            edge,
            timestamp: Duration::from_micros(sequence as u64 * 100),
            sequence,
        });
    }

    pub fn config(&self) -> LineConfig {
        self.config.lock().unwrap().clone()
    }
}

impl LineHandle for TestLine {
    fn reconfigure(&self, config: &LineConfig) -> Result<(), LineError> {
        *self.config.lock().unwrap() = config.clone();
        Ok(())
    }

    fn value(&self) -> Result<bool, LineError> {
        Ok(self.value.load(Ordering::SeqCst))
    }

    fn set_value(&self, value: bool) -> Result<(), LineError> {
        if self.config.lock().unwrap().direction != Direction::Output {
            return Err(LineError::new(libc::EPERM, "line is an input"));
        }
        self.value.store(value, Ordering::SeqCst);
        Ok(())
    }

    fn wait_event(&self, timeout: Option<Duration>) -> Result<Option<InterruptEvent>, LineError> {
        match timeout {
            Some(timeout) => Ok(self.pending.recv_timeout(timeout).ok()),
            None => self
                .pending
                .recv()
                .map(Some)
                .map_err(|_| LineError::new(libc::EIO, "event source gone")),
        }
    }
}

/// In-process stand-in for `/dev/gpiochipN`.
#[derive(Debug, Default)]
pub struct TestLines {
    lines: Mutex<HashMap<(u32, u32), Arc<TestLine>>>,
}

impl TestLines {
    pub fn line(&self, chip: u32, offset: u32) -> Option<Arc<TestLine>> {
        self.lines.lock().unwrap().get(&(chip, offset)).cloned()
    }
}

impl LineProvider for TestLines {
    fn request(&self, chip: u32, offset: u32, config: &LineConfig) -> Result<Arc<dyn LineHandle>, LineError> {
        let mut lines = self.lines.lock().unwrap();
        let line = lines.entry((chip, offset)).or_insert_with(|| {
            let (events, pending) = unbounded();
            Arc::new(TestLine {
                config: Mutex::new(config.clone()),
                value: AtomicBool::new(config.value),
                events,
                pending,
            })
        });
        *line.config.lock().unwrap() = config.clone();
        Ok(line.clone() as Arc<dyn LineHandle>)
    }
}

pub struct Rig {
    pub gpio: Gpio,
    pub memory: Arc<SimulatedMemory>,
    pub lines: Arc<TestLines>,
}

/// Builtin `board` on simulated memory and lines.
pub fn rig(board: &str, layer: AccessLayer) -> Rig {
    let memory = Arc::new(SimulatedMemory::new());
    let lines = Arc::new(TestLines::default());
    let config = GpioConfig {
        access_layer: layer,
        ..GpioConfig::default()
    };
    let board = BuiltinBoards.board(board).unwrap();
    let gpio = Gpio::with_parts(board, config, memory.clone(), lines.clone()).unwrap();
    Rig { gpio, memory, lines }
}

/// Raspberry Pi 4 with a BCM GPIO model installed.
pub fn rpi4b() -> (Rig, Arc<BcmGpioModel>) {
    let memory = Arc::new(SimulatedMemory::new());
    let model = Arc::new(BcmGpioModel::new(0xFE20_0000));
    memory.install(model.clone());
    let lines = Arc::new(TestLines::default());
    let board = BuiltinBoards.board("rpi4b").unwrap();
    let config = GpioConfig {
        access_layer: AccessLayer::Memory,
        ..GpioConfig::default()
    };
    let gpio = Gpio::with_parts(board, config, memory.clone(), lines.clone()).unwrap();
    (Rig { gpio, memory, lines }, model)
}
