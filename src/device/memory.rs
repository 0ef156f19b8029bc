use memmap::{MmapMut, MmapOptions};
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use super::error::DeviceError;
use crate::{GpioError, GpioResult};

/// Size of the pages every register window is aligned to.
pub const PAGE_SIZE: usize = 4096;

/// A fixed physical address range mapped into the process.
///
/// Offsets are 4-byte word indices from the window base. Every access is a single
/// atomic 32-bit load or store, so a window can be shared between threads, but a
/// read-modify-write sequence on one word is not serialized.
pub trait RegisterWindow: fmt::Debug + Send + Sync {
    /// Physical address the window starts at.
    fn base(&self) -> u64;

    /// Number of 32-bit words in the window.
    fn words(&self) -> usize;

    fn read(&self, offset: usize) -> u32;

    fn write(&self, offset: usize, value: u32);

    /// Replaces the bits selected by `mask` with the matching bits of `value`.
    fn modify(&self, offset: usize, mask: u32, value: u32) {
        let current = self.read(offset);
        self.write(offset, (current & !mask) | (value & mask));
    }
}

/// Source of register windows.
pub trait MemoryDevice: fmt::Debug + Send + Sync {
    /// Maps `size` bytes starting at the physical address `base`.
    ///
    /// Both values must be multiples of `PAGE_SIZE`.
    fn map(&self, base: u64, size: usize) -> GpioResult<Arc<dyn RegisterWindow>>;

    /// Whether the device can be used by the current process at all.
    fn is_available(&self) -> bool;
}

fn check_alignment(base: u64, size: usize) -> GpioResult<()> {
    if base % PAGE_SIZE as u64 != 0 || size % PAGE_SIZE != 0 || size == 0 {
        return Err(GpioError::DeviceError(DeviceError::Unaligned { base, size }));
    }
    Ok(())
}

/// Memory-mapped window over `/dev/mem` or one of the `/dev/gpiomem*` devices.
pub struct MmapWindow {
    base: u64,
    words: usize,
    registers: NonNull<AtomicU32>,
    _map: MmapMut,
    _file_handle: File,
}

// SAFETY: the mapping is owned by the window and lives as long as it does. All access
// goes through `AtomicU32`, which is valid to share between threads.
unsafe impl Send for MmapWindow {}
unsafe impl Sync for MmapWindow {}

impl MmapWindow {
    fn register(&self, offset: usize) -> &AtomicU32 {
        assert!(
            offset < self.words,
            "register offset {:#x} outside window of {} words",
            offset,
            self.words
        );
        // SAFETY: offset is checked against the mapped length above and the mapping is page aligned.
        unsafe { &*self.registers.as_ptr().add(offset) }
    }
}

impl fmt::Debug for MmapWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MmapWindow")
            .field("base", &format_args!("{:#x}", self.base))
            .field("words", &self.words)
            .finish()
    }
}

impl RegisterWindow for MmapWindow {
    fn base(&self) -> u64 {
        self.base
    }

    fn words(&self) -> usize {
        self.words
    }

    fn read(&self, offset: usize) -> u32 {
        self.register(offset).load(Ordering::SeqCst)
    }

    fn write(&self, offset: usize, value: u32) {
        self.register(offset).store(value, Ordering::SeqCst)
    }
}

/// Access to physical memory through a device file.
///
/// `/dev/mem` exposes the whole physical address space and requires root. The
/// `/dev/gpiomem*` devices only expose the GPIO block of one SoC, starting at file
/// offset zero, and are usable by members of the `gpio` group.
#[derive(Debug, Clone)]
pub struct DevMem {
    path: PathBuf,
    exposed: Option<(u64, usize)>,
}

impl DevMem {
    /// Physical memory through `/dev/mem`.
    pub fn mem() -> Self {
        Self {
            path: PathBuf::from("/dev/mem"),
            exposed: None,
        }
    }

    /// A gpiomem-style device exposing `size` bytes of physical memory at `base`.
    pub fn gpiomem<P: AsRef<Path>>(path: P, base: u64, size: usize) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            exposed: Some((base, size)),
        }
    }

    /// `/dev/mem` for root, the given gpiomem device for everyone else.
    pub fn for_current_user<P: AsRef<Path>>(gpiomem_path: P, base: u64, size: usize) -> Self {
        use nix::unistd::Uid;

        if Uid::current().is_root() {
            Self::mem()
        } else {
            Self::gpiomem(gpiomem_path, base, size)
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file_offset(&self, base: u64, size: usize) -> GpioResult<u64> {
        match self.exposed {
            None => Ok(base),
            Some((exposed_base, exposed_size)) => {
                if base >= exposed_base && base + size as u64 <= exposed_base + exposed_size as u64 {
                    Ok(base - exposed_base)
                } else {
                    Err(GpioError::DeviceError(DeviceError::Unreachable(base)))
                }
            }
        }
    }

    fn load_device_file(&self) -> GpioResult<File> {
        use std::os::unix::io::FromRawFd;
        use DeviceError::*;

        let mut open_flags = OFlag::empty();
        open_flags.insert(OFlag::O_RDWR);
        open_flags.insert(OFlag::O_SYNC);
        open_flags.insert(OFlag::O_CLOEXEC);

        let file_fd = open(self.path.as_path(), open_flags, Mode::empty()).map_err(|err| {
            GpioError::DeviceError(DeviceAccessFailed(self.path.display().to_string(), err))
        })?;

        // SAFETY: Validity of file_fd is checked by Nix.
        Ok(unsafe { File::from_raw_fd(file_fd) })
    }
}

impl MemoryDevice for DevMem {
    fn map(&self, base: u64, size: usize) -> GpioResult<Arc<dyn RegisterWindow>> {
        check_alignment(base, size)?;
        let offset = self.file_offset(base, size)?;
        let handle = self.load_device_file()?;

        let mut map_opts = MmapOptions::new();
        map_opts.offset(offset);
        map_opts.len(size);

        // SAFETY: File handle is valid at this point.
        let mut map = unsafe {
            map_opts
                .map_mut(&handle)
                .map_err(|err| GpioError::DeviceError(DeviceError::MemoryMapFailed(base, err)))?
        };
        let registers = NonNull::new(map.as_mut_ptr() as *mut AtomicU32)
            .ok_or(GpioError::DeviceError(DeviceError::Unreachable(base)))?;

        log::debug!("mapped {:#x}+{:#x} through {}", base, size, self.path.display());

        Ok(Arc::new(MmapWindow {
            base,
            words: size / std::mem::size_of::<u32>(),
            registers,
            _map: map,
            _file_handle: handle,
        }))
    }

    fn is_available(&self) -> bool {
        self.path.exists()
    }
}

/// Heap-backed register window.
#[derive(Debug)]
pub struct MemoryWindow {
    base: u64,
    registers: Box<[AtomicU32]>,
}

impl MemoryWindow {
    pub fn new(base: u64, size: usize) -> Self {
        let words = size / std::mem::size_of::<u32>();
        Self {
            base,
            registers: (0..words).map(|_| AtomicU32::new(0)).collect(),
        }
    }
}

impl RegisterWindow for MemoryWindow {
    fn base(&self) -> u64 {
        self.base
    }

    fn words(&self) -> usize {
        self.registers.len()
    }

    fn read(&self, offset: usize) -> u32 {
        self.registers[offset].load(Ordering::SeqCst)
    }

    fn write(&self, offset: usize, value: u32) {
        self.registers[offset].store(value, Ordering::SeqCst)
    }
}

/// Memory device handing out heap-backed windows instead of hardware.
///
/// Mapping the same base twice yields the same window, so several backends (or a
/// test) observe each other's writes. Custom windows modelling register side
/// effects can be installed before a backend maps them.
#[derive(Debug, Default)]
pub struct SimulatedMemory {
    windows: Mutex<HashMap<u64, Arc<dyn RegisterWindow>>>,
}

impl SimulatedMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `window` the one returned for its base address.
    pub fn install(&self, window: Arc<dyn RegisterWindow>) {
        if let Ok(mut windows) = self.windows.lock() {
            windows.insert(window.base(), window);
        }
    }

    /// The window previously mapped or installed at `base`.
    pub fn window(&self, base: u64) -> Option<Arc<dyn RegisterWindow>> {
        self.windows.lock().ok()?.get(&base).cloned()
    }
}

impl MemoryDevice for SimulatedMemory {
    fn map(&self, base: u64, size: usize) -> GpioResult<Arc<dyn RegisterWindow>> {
        check_alignment(base, size)?;
        let mut windows = self
            .windows
            .lock()
            .map_err(|_| GpioError::DeviceError(DeviceError::Unreachable(base)))?;

        let window = windows
            .entry(base)
            .or_insert_with(|| Arc::new(MemoryWindow::new(base, size)) as Arc<dyn RegisterWindow>);
        if window.words() * std::mem::size_of::<u32>() < size {
            return Err(GpioError::DeviceError(DeviceError::Unreachable(base)));
        }
        Ok(Arc::clone(window))
    }

    fn is_available(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unaligned_ranges_are_rejected() {
        let memory = SimulatedMemory::new();
        assert!(memory.map(0x1000_0800, PAGE_SIZE).is_err());
        assert!(memory.map(0x1000_0000, 100).is_err());
        assert!(memory.map(0x1000_0000, PAGE_SIZE).is_ok());
    }

    #[test]
    fn same_base_yields_shared_window() {
        let memory = SimulatedMemory::new();
        let first = memory.map(0x2000_0000, PAGE_SIZE).unwrap();
        let second = memory.map(0x2000_0000, PAGE_SIZE).unwrap();

        first.write(3, 0xdead_beef);
        assert_eq!(second.read(3), 0xdead_beef);
    }

    #[test]
    fn modify_only_touches_masked_bits() {
        let window = MemoryWindow::new(0, PAGE_SIZE);
        window.write(0, 0xffff_0000);
        window.modify(0, 0x0000_ff00, 0x1234_5678);
        assert_eq!(window.read(0), 0xffff_5600);
    }

    #[test]
    fn gpiomem_only_reaches_its_block() {
        let gpiomem = DevMem::gpiomem("/dev/gpiomem", 0xfe20_0000, PAGE_SIZE);
        assert_eq!(gpiomem.file_offset(0xfe20_0000, PAGE_SIZE).unwrap(), 0);
        assert!(gpiomem.file_offset(0xfe20_c000, PAGE_SIZE).is_err());
        assert_eq!(DevMem::mem().file_offset(0xfe20_c000, PAGE_SIZE).unwrap(), 0xfe20_c000);
    }
}
