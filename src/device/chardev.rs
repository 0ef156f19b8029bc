//! GPIO character device (uAPI v2) access.
//!
//! Kernel access goes through the `LineProvider`/`LineHandle` pair so the line logic,
//! including the interrupt thread, does not depend on a particular binding. `CdevLines`
//! implements them on top of `gpiocdev`.
use crossbeam_channel::{Sender, TryRecvError};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

use crate::pin::{Edge, Mode, Pull};
use crate::{GpioError, GpioResult};

/// Upper bound of a single wait of the interrupt thread, and so of `detach_interrupt` latency.
pub const ISR_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Failure reported by the character device, as an errno-style code and a message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} (code {code})")]
pub struct LineError {
    pub code: i32,
    pub message: String,
}

impl LineError {
    pub fn new<M: Into<String>>(code: i32, message: M) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn timeout() -> Self {
        Self::new(libc::ETIMEDOUT, "timed out waiting for edge event")
    }

    pub fn is_timeout(&self) -> bool {
        self.code == libc::ETIMEDOUT
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    Input,
    Output,
}

/// Everything the kernel needs to configure one requested line.
#[derive(Clone, Debug, PartialEq)]
pub struct LineConfig {
    pub direction: Direction,
    pub bias: Pull,
    /// Initial level of an output line.
    pub value: bool,
    pub edge: Edge,
    pub debounce: Duration,
}

impl Default for LineConfig {
    fn default() -> Self {
        Self {
            direction: Direction::Input,
            bias: Pull::Off,
            value: false,
            edge: Edge::None,
            debounce: Duration::ZERO,
        }
    }
}

/// Edge event delivered to interrupt handlers.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct InterruptEvent {
    /// `Edge::Rising` or `Edge::Falling`.
    pub edge: Edge,
    /// Kernel timestamp of the edge.
    pub timestamp: Duration,
    pub sequence: u32,
}

pub type InterruptHandler = Box<dyn FnMut(InterruptEvent) + Send + 'static>;

/// A requested line.
pub trait LineHandle: fmt::Debug + Send + Sync {
    /// Changes the configuration without releasing the line.
    fn reconfigure(&self, config: &LineConfig) -> Result<(), LineError>;

    fn value(&self) -> Result<bool, LineError>;

    fn set_value(&self, value: bool) -> Result<(), LineError>;

    /// Waits for the next edge event, forever if `timeout` is `None`.
    ///
    /// Returns `Ok(None)` when the timeout elapsed first.
    fn wait_event(&self, timeout: Option<Duration>) -> Result<Option<InterruptEvent>, LineError>;
}

/// Opens lines on GPIO chips.
pub trait LineProvider: fmt::Debug + Send + Sync {
    fn request(&self, chip: u32, offset: u32, config: &LineConfig) -> Result<Arc<dyn LineHandle>, LineError>;
}

/// `LineProvider` backed by `/dev/gpiochipN` through `gpiocdev`.
#[derive(Debug, Clone)]
pub struct CdevLines {
    consumer: String,
}

impl CdevLines {
    pub fn new<S: Into<String>>(consumer: S) -> Self {
        Self {
            consumer: consumer.into(),
        }
    }
}

impl Default for CdevLines {
    fn default() -> Self {
        Self::new(env!("CARGO_PKG_NAME"))
    }
}

fn cdev_error(err: gpiocdev::Error) -> LineError {
    LineError::new(libc::EIO, err.to_string())
}

fn apply_config(config: &mut gpiocdev::request::Config, offset: u32, line: &LineConfig) {
    use gpiocdev::line::{Bias, EdgeDetection, Value};

    config.with_line(offset);
    match line.direction {
        Direction::Input => {
            config.as_input();
            let edge = match line.edge {
                Edge::None => None,
                Edge::Rising => Some(EdgeDetection::RisingEdge),
                Edge::Falling => Some(EdgeDetection::FallingEdge),
                Edge::Both => Some(EdgeDetection::BothEdges),
            };
            config.with_edge_detection(edge);
            if edge.is_some() && !line.debounce.is_zero() {
                config.with_debounce_period(line.debounce);
            }
        }
        Direction::Output => {
            config.as_output(if line.value { Value::Active } else { Value::Inactive });
        }
    }
    let bias = match line.bias {
        Pull::Off => Some(Bias::Disabled),
        Pull::Down => Some(Bias::PullDown),
        Pull::Up => Some(Bias::PullUp),
        Pull::Unknown => None,
    };
    config.with_bias(bias);
}

impl LineProvider for CdevLines {
    fn request(&self, chip: u32, offset: u32, config: &LineConfig) -> Result<Arc<dyn LineHandle>, LineError> {
        let path = PathBuf::from(format!("/dev/gpiochip{}", chip));
        let mut line_config = gpiocdev::request::Config::default();
        apply_config(&mut line_config, offset, config);

        let request = gpiocdev::Request::builder()
            .on_chip(path)
            .with_consumer(self.consumer.as_str())
            .with_config(line_config)
            .request()
            .map_err(cdev_error)?;
        log::debug!("requested gpiochip{} line {} as {:?}", chip, offset, config.direction);

        Ok(Arc::new(CdevLine { request, offset }))
    }
}

#[derive(Debug)]
struct CdevLine {
    request: gpiocdev::Request,
    offset: u32,
}

impl LineHandle for CdevLine {
    fn reconfigure(&self, config: &LineConfig) -> Result<(), LineError> {
        let mut line_config = self.request.config();
        apply_config(&mut line_config, self.offset, config);
        self.request.reconfigure(&line_config).map_err(cdev_error)
    }

    fn value(&self) -> Result<bool, LineError> {
        use gpiocdev::line::Value;
        Ok(self.request.value(self.offset).map_err(cdev_error)? == Value::Active)
    }

    fn set_value(&self, value: bool) -> Result<(), LineError> {
        use gpiocdev::line::Value;
        let value = if value { Value::Active } else { Value::Inactive };
        self.request.set_value(self.offset, value).map_err(cdev_error)
    }

    fn wait_event(&self, timeout: Option<Duration>) -> Result<Option<InterruptEvent>, LineError> {
        use gpiocdev::line::EdgeKind;

        if let Some(timeout) = timeout {
            if !self.request.wait_edge_event(timeout).map_err(cdev_error)? {
                return Ok(None);
            }
        }
        let event = self.request.read_edge_event().map_err(cdev_error)?;
        Ok(Some(InterruptEvent {
            edge: match event.kind {
                EdgeKind::Rising => Edge::Rising,
                EdgeKind::Falling => Edge::Falling,
            },
            timestamp: Duration::from_nanos(event.timestamp_ns),
            sequence: event.line_seqno,
        }))
    }
}

/// Running interrupt thread of a line, detached from it by `take_interrupt`.
pub struct IsrThread {
    chip: u32,
    offset: u32,
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl fmt::Debug for IsrThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IsrThread")
            .field("chip", &self.chip)
            .field("offset", &self.offset)
            .finish()
    }
}

impl IsrThread {
    /// Signals the thread and joins it. No handler call happens after this returns.
    pub fn stop(self) {
        let _ = self.stop.send(());
        if self.handle.join().is_err() {
            log::error!("gpiochip{} line {}: interrupt handler panicked", self.chip, self.offset);
        }
        log::debug!("gpiochip{} line {}: interrupt detached", self.chip, self.offset);
    }
}

/// One GPIO line driven through the character device, with its interrupt thread.
pub struct GpioCharDevLine {
    chip: u32,
    offset: u32,
    provider: Arc<dyn LineProvider>,
    config: LineConfig,
    handle: Option<Arc<dyn LineHandle>>,
    isr: Option<IsrThread>,
    last_error: Option<LineError>,
}

impl fmt::Debug for GpioCharDevLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpioCharDevLine")
            .field("chip", &self.chip)
            .field("offset", &self.offset)
            .field("config", &self.config)
            .field("open", &self.handle.is_some())
            .field("interrupt", &self.isr.is_some())
            .finish()
    }
}

impl GpioCharDevLine {
    pub fn new(chip: u32, offset: u32, provider: Arc<dyn LineProvider>) -> Self {
        Self {
            chip,
            offset,
            provider,
            config: LineConfig::default(),
            handle: None,
            isr: None,
            last_error: None,
        }
    }

    fn record<T>(&mut self, result: Result<T, LineError>) -> GpioResult<T> {
        result.map_err(|err| {
            log::debug!("gpiochip{} line {}: {}", self.chip, self.offset, err);
            self.last_error = Some(err.clone());
            GpioError::LineError(err)
        })
    }

    fn not_open() -> GpioError {
        GpioError::LineError(LineError::new(libc::EBADF, "line is not open"))
    }

    pub fn open(&mut self, config: LineConfig) -> GpioResult<()> {
        if self.handle.is_some() {
            return self.apply(config);
        }
        let handle = self.provider.request(self.chip, self.offset, &config);
        let handle = self.record(handle)?;
        self.handle = Some(handle);
        self.config = config;
        Ok(())
    }

    pub fn close(&mut self) {
        self.detach_interrupt();
        self.handle = None;
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    pub fn config(&self) -> &LineConfig {
        &self.config
    }

    pub fn handle(&self) -> Option<Arc<dyn LineHandle>> {
        self.handle.clone()
    }

    pub fn last_error(&self) -> Option<&LineError> {
        self.last_error.as_ref()
    }

    fn apply(&mut self, config: LineConfig) -> GpioResult<()> {
        let handle = self.handle.clone().ok_or_else(Self::not_open)?;
        if config != self.config {
            let result = handle.reconfigure(&config);
            self.record(result)?;
            self.config = config;
        }
        Ok(())
    }

    /// Switches direction on the live line. Only input and output exist at this level.
    pub fn set_mode(&mut self, mode: Mode) -> GpioResult<()> {
        let mut config = self.config.clone();
        match mode {
            Mode::Input => config.direction = Direction::Input,
            Mode::Output => {
                config.direction = Direction::Output;
                config.edge = Edge::None;
            }
            _ => {
                return Err(GpioError::LineError(LineError::new(
                    libc::EINVAL,
                    format!("mode {:?} is not available through the character device", mode),
                )))
            }
        }
        self.apply(config)
    }

    pub fn set_pull(&mut self, pull: Pull) -> GpioResult<()> {
        let mut config = self.config.clone();
        config.bias = pull;
        self.apply(config)
    }

    pub fn set_debounce(&mut self, period: Duration) -> GpioResult<()> {
        let mut config = self.config.clone();
        config.debounce = period;
        self.apply(config)
    }

    pub fn read(&self) -> GpioResult<bool> {
        let handle = self.handle.as_ref().ok_or_else(Self::not_open)?;
        handle.value().map_err(GpioError::LineError)
    }

    pub fn write(&self, value: bool) -> GpioResult<()> {
        let handle = self.handle.as_ref().ok_or_else(Self::not_open)?;
        handle.set_value(value).map_err(GpioError::LineError)
    }

    fn listen(&mut self, edge: Edge) -> GpioResult<Arc<dyn LineHandle>> {
        let mut config = self.config.clone();
        config.direction = Direction::Input;
        config.edge = if edge == Edge::None { Edge::Both } else { edge };
        self.apply(config)?;
        self.handle.clone().ok_or_else(Self::not_open)
    }

    /// Spawns the interrupt thread, calling `handler` for every `edge`.
    pub fn attach_interrupt(&mut self, edge: Edge, mut handler: InterruptHandler) -> GpioResult<()> {
        if self.isr.is_some() {
            return Err(GpioError::LineError(LineError::new(libc::EBUSY, "interrupt already attached")));
        }
        let line = self.listen(edge)?;
        let (stop, stopped) = crossbeam_channel::bounded::<()>(1);
        let name = format!("gpio-isr-{}-{}", self.chip, self.offset);
        let (chip, offset) = (self.chip, self.offset);

        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || loop {
                match stopped.try_recv() {
                    Err(TryRecvError::Empty) => {}
                    _ => break,
                }
                match line.wait_event(Some(ISR_POLL_INTERVAL)) {
                    Ok(Some(event)) => handler(event),
                    Ok(None) => {}
                    Err(err) => {
                        log::error!("gpiochip{} line {}: interrupt wait failed: {}", chip, offset, err);
                        std::process::abort();
                    }
                }
            })
            .map_err(GpioError::ThreadSpawnFailed)?;

        self.isr = Some(IsrThread {
            chip,
            offset,
            stop,
            handle,
        });
        log::debug!("gpiochip{} line {}: interrupt attached on {:?}", self.chip, self.offset, edge);
        Ok(())
    }

    /// Stops and joins the interrupt thread.
    pub fn detach_interrupt(&mut self) {
        if let Some(isr) = self.take_interrupt() {
            isr.stop();
        }
    }

    /// Hands the interrupt thread over to the caller, which must `stop` it.
    ///
    /// Lets the owner of the line release its own locks before joining, since the
    /// handler may use them.
    pub fn take_interrupt(&mut self) -> Option<IsrThread> {
        self.isr.take()
    }

    pub fn has_interrupt(&self) -> bool {
        self.isr.is_some()
    }

    /// Blocks until `edge` occurs. `timeout_ms` of -1 waits forever.
    ///
    /// A timeout returns `Ok(false)` and records `ETIMEDOUT` as the last error.
    pub fn wait_for_interrupt(&mut self, edge: Edge, timeout_ms: i32) -> GpioResult<bool> {
        let (line, timeout) = self.begin_wait(edge, timeout_ms)?;
        let event = line.wait_event(timeout);
        self.finish_wait(event)
    }

    /// Configures the line for `edge` and returns the handle to wait on, with the
    /// timeout to use. The wait itself needs no access to `self`.
    pub fn begin_wait(&mut self, edge: Edge, timeout_ms: i32) -> GpioResult<(Arc<dyn LineHandle>, Option<Duration>)> {
        if self.isr.is_some() {
            return Err(GpioError::LineError(LineError::new(
                libc::EBUSY,
                "events are consumed by the interrupt thread",
            )));
        }
        let line = self.listen(edge)?;
        let timeout = u64::try_from(timeout_ms).ok().map(Duration::from_millis);
        Ok((line, timeout))
    }

    /// Records the outcome of a wait started with `begin_wait`.
    pub fn finish_wait(&mut self, event: Result<Option<InterruptEvent>, LineError>) -> GpioResult<bool> {
        match self.record(event)? {
            Some(_) => {
                self.last_error = None;
                Ok(true)
            }
            None => {
                self.last_error = Some(LineError::timeout());
                Ok(false)
            }
        }
    }
}

impl Drop for GpioCharDevLine {
    fn drop(&mut self) {
        self.detach_interrupt();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crossbeam_channel::{unbounded, Receiver};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Debug)]
    pub struct FakeLine {
        config: Mutex<LineConfig>,
        value: AtomicBool,
        events: Sender<InterruptEvent>,
        pending: Receiver<InterruptEvent>,
    }

    impl FakeLine {
        pub fn push_edge(&self, edge: Edge, sequence: u32) {
            let _ = self.events.send(InterruptEvent {
                edge,
                timestamp: Duration::from_micros(sequence as u64),
                sequence,
            });
        }

        pub fn config(&self) -> LineConfig {
            self.config.lock().unwrap().clone()
        }
    }

    impl LineHandle for FakeLine {
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

    #[derive(Debug, Default)]
    pub struct FakeLines {
        lines: Mutex<HashMap<(u32, u32), Arc<FakeLine>>>,
    }

    impl FakeLines {
        pub fn line(&self, chip: u32, offset: u32) -> Option<Arc<FakeLine>> {
            self.lines.lock().unwrap().get(&(chip, offset)).cloned()
        }

        pub fn last_config(&self, chip: u32, offset: u32) -> Option<LineConfig> {
            self.line(chip, offset).map(|line| line.config())
        }
    }

    impl LineProvider for FakeLines {
        fn request(&self, chip: u32, offset: u32, config: &LineConfig) -> Result<Arc<dyn LineHandle>, LineError> {
            let mut lines = self.lines.lock().unwrap();
            let line = lines.entry((chip, offset)).or_insert_with(|| {
                let (events, pending) = unbounded();
                Arc::new(FakeLine {
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
}

#[cfg(test)]
mod tests {
    use super::testing::FakeLines;
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn open_line(lines: &Arc<FakeLines>) -> GpioCharDevLine {
        let mut line = GpioCharDevLine::new(0, 4, lines.clone());
        line.open(LineConfig::default()).unwrap();
        line
    }

    #[test]
    fn handler_sees_every_event_until_detach() {
        let lines = Arc::new(FakeLines::default());
        let mut line = open_line(&lines);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        line.attach_interrupt(Edge::Both, Box::new(move |event| sink.lock().unwrap().push(event.sequence)))
            .unwrap();
        assert_eq!(lines.last_config(0, 4).unwrap().edge, Edge::Both);

        let fake = lines.line(0, 4).unwrap();
        fake.push_edge(Edge::Rising, 1);
        fake.push_edge(Edge::Falling, 2);
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while seen.lock().unwrap().len() < 2 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }

        line.detach_interrupt();
        assert!(!line.has_interrupt());
        let delivered = seen.lock().unwrap().len();
        fake.push_edge(Edge::Rising, 3);
        thread::sleep(ISR_POLL_INTERVAL * 3);
        assert_eq!(seen.lock().unwrap().len(), delivered);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn second_attach_is_refused() {
        let lines = Arc::new(FakeLines::default());
        let mut line = open_line(&lines);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        line.attach_interrupt(Edge::Rising, Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();

        let err = line.attach_interrupt(Edge::Rising, Box::new(|_| {})).unwrap_err();
        assert!(matches!(err, GpioError::LineError(LineError { code, .. }) if code == libc::EBUSY));
        line.close();
        assert!(!line.has_interrupt());
    }

    #[test]
    fn wait_times_out_with_recorded_code() {
        let lines = Arc::new(FakeLines::default());
        let mut line = open_line(&lines);

        assert!(!line.wait_for_interrupt(Edge::Falling, 5).unwrap());
        assert!(line.last_error().unwrap().is_timeout());

        lines.line(0, 4).unwrap().push_edge(Edge::Falling, 7);
        assert!(line.wait_for_interrupt(Edge::Falling, -1).unwrap());
        assert!(line.last_error().is_none());
    }

    #[test]
    fn reconfigures_live_line() {
        let lines = Arc::new(FakeLines::default());
        let mut line = open_line(&lines);

        line.set_mode(Mode::Output).unwrap();
        line.set_pull(Pull::Up).unwrap();
        let config = lines.last_config(0, 4).unwrap();
        assert_eq!(config.direction, Direction::Output);
        assert_eq!(config.bias, Pull::Up);

        line.write(true).unwrap();
        assert!(line.read().unwrap());
        assert!(line.set_mode(Mode::Alt2).is_err());
    }

    #[test]
    fn operations_on_closed_line_fail() {
        let lines = Arc::new(FakeLines::default());
        let mut line = GpioCharDevLine::new(0, 4, lines);
        assert!(line.read().is_err());
        assert!(line.set_pull(Pull::Down).is_err());
    }
}
