//! `AtPort` -- the handle plugins and modem objects talk to.
//!
//! An [`AtPort`] wraps one AT-capable device node. While open, a dedicated
//! IO task (see [`crate::io`]) owns the transport; the handle only enqueues
//! commands, manages unsolicited handlers and swaps the response parser.
//! Handles are cheap to clone and all clones refer to the same port.
//!
//! # Example
//!
//! ```no_run
//! use mmlib_at_io::{AtCommand, AtPortBuilder};
//! use std::time::Duration;
//!
//! # async fn example() -> mmlib_core::Result<()> {
//! let port = AtPortBuilder::new()
//!     .device("/dev/ttyUSB2")
//!     .init_sequence(["E0 V1", "+CMEE=1"])
//!     .build()
//!     .await?;
//!
//! let manufacturer = port.queue_command(AtCommand::new("+CGMI")).await?;
//! let caps = port
//!     .queue_command(AtCommand::new("+CNMI=?").timeout(Duration::from_secs(3)).allow_cached(true))
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use mmlib_core::error::{Error, Result};
use mmlib_core::events::PortEvent;
use mmlib_core::transport::Transport;
use mmlib_core::types::{LineEnding, PortFlags};

use crate::framer;
use crate::io::{self, IoConfig, IoShared, PendingCommand, PortIo, Request, SharedParser};
use crate::parser::{ResponseParser, V1Parser};
use crate::unsolicited::{UnsolicitedCallback, UnsolicitedMatch, UnsolicitedRegistry};

/// Default reply timeout for a command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(3);

/// Timeout used for each init sequence command.
pub const INIT_COMMAND_TIMEOUT: Duration = Duration::from_secs(3);

// ---------------------------------------------------------------------------
// AtCommand
// ---------------------------------------------------------------------------

/// One AT command, as handed to [`AtPort::queue_command`].
#[derive(Debug, Clone)]
pub struct AtCommand {
    text: String,
    timeout: Duration,
    raw: bool,
    allow_cached: bool,
    cancel: Option<CancellationToken>,
}

impl AtCommand {
    /// A command with the default 3 second timeout.
    ///
    /// The `AT` prefix and trailing carriage return are added when missing.
    pub fn new(text: impl Into<String>) -> Self {
        AtCommand {
            text: text.into(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
            raw: false,
            allow_cached: false,
            cancel: None,
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send the text byte for byte, without `AT` prefix or terminator
    /// (PDU bodies, Ctrl-Z).
    pub fn raw(mut self, raw: bool) -> Self {
        self.raw = raw;
        self
    }

    /// Accept a cached reply from an earlier successful run of the same
    /// command.
    pub fn allow_cached(mut self, allow: bool) -> Self {
        self.allow_cached = allow;
        self
    }

    /// Fail the command with [`Error::Cancelled`] once `token` fires.
    pub fn cancellable(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn timeout_duration(&self) -> Duration {
        self.timeout
    }
}

// ---------------------------------------------------------------------------
// PendingReply
// ---------------------------------------------------------------------------

/// The eventual reply to a queued command.
///
/// Resolves exactly once. Dropping it does not remove the command from the
/// queue.
#[derive(Debug)]
pub struct PendingReply {
    rx: oneshot::Receiver<Result<String>>,
}

impl Future for PendingReply {
    type Output = Result<String>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(Error::NotConnected)))
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Per-port settings.
#[derive(Debug, Clone)]
pub struct AtPortConfig {
    /// Strip command echo from replies.
    pub remove_echo: bool,
    pub line_ending: LineEnding,
    /// Commands queued, without waiting for their replies, every time the
    /// port is opened.
    pub init_sequence: Vec<String>,
    pub init_sequence_enabled: bool,
    pub spew_control: bool,
    /// Receive buffer limit for spew control.
    pub max_buffer: usize,
    pub poll_interval: Duration,
    /// How long to keep waiting for a timed-out command's reply before the
    /// next command goes out.
    pub late_reply_window: Duration,
    /// Capacity of the [`PortEvent`] broadcast channel.
    pub event_capacity: usize,
}

impl Default for AtPortConfig {
    fn default() -> Self {
        AtPortConfig {
            remove_echo: true,
            line_ending: LineEnding::Cr,
            init_sequence: Vec::new(),
            init_sequence_enabled: true,
            spew_control: true,
            max_buffer: 2048,
            poll_interval: Duration::from_millis(100),
            late_reply_window: Duration::from_secs(1),
            event_capacity: 64,
        }
    }
}

impl AtPortConfig {
    fn io_config(&self) -> IoConfig {
        IoConfig {
            remove_echo: self.remove_echo,
            spew_control: self.spew_control,
            max_buffer: self.max_buffer,
            poll_interval: self.poll_interval,
            late_reply_window: self.late_reply_window,
        }
    }
}

// ---------------------------------------------------------------------------
// AtPort
// ---------------------------------------------------------------------------

struct PortInner {
    device: String,
    flags: PortFlags,
    config: Mutex<AtPortConfig>,
    registry: UnsolicitedRegistry,
    parser: SharedParser,
    events: broadcast::Sender<PortEvent>,
    io: Mutex<Option<PortIo>>,
    /// The transport while the port is closed.
    parked: Mutex<Option<Box<dyn Transport>>>,
}

/// Handle to an AT port.
#[derive(Clone)]
pub struct AtPort {
    inner: Arc<PortInner>,
}

impl std::fmt::Debug for AtPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AtPort")
            .field("device", &self.inner.device)
            .field("flags", &self.inner.flags)
            .field("open", &self.is_open())
            .finish()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl AtPort {
    /// Wrap `transport` in a closed port. Call [`open`](Self::open) to start
    /// processing.
    pub fn new(
        device: impl Into<String>,
        flags: PortFlags,
        config: AtPortConfig,
        transport: Box<dyn Transport>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let parser: Arc<dyn ResponseParser> = Arc::new(V1Parser::new());
        AtPort {
            inner: Arc::new(PortInner {
                device: device.into(),
                flags,
                config: Mutex::new(config),
                registry: UnsolicitedRegistry::new(),
                parser: Arc::new(Mutex::new(parser)),
                events,
                io: Mutex::new(None),
                parked: Mutex::new(Some(transport)),
            }),
        }
    }

    pub fn device(&self) -> &str {
        &self.inner.device
    }

    pub fn flags(&self) -> PortFlags {
        self.inner.flags
    }

    /// Whether the IO task is running.
    pub fn is_open(&self) -> bool {
        lock(&self.inner.io)
            .as_ref()
            .is_some_and(|io| !io.task.is_finished())
    }

    /// Start the IO task and queue the init sequence if enabled.
    ///
    /// Opening an open port is a no-op. Fails with
    /// [`Error::NotConnected`] when the transport has gone away.
    pub async fn open(&self) -> Result<()> {
        let exited = {
            let mut io = lock(&self.inner.io);
            match io.as_ref().map(|running| running.task.is_finished()) {
                Some(false) => return Ok(()),
                Some(true) => io.take(),
                None => None,
            }
        };
        // The task stopped by itself (hangup); recover its transport.
        if let Some(exited) = exited {
            if let Ok(transport) = exited.task.await {
                *lock(&self.inner.parked) = Some(transport);
            }
        }

        let config = lock(&self.inner.config).clone();
        {
            let mut io = lock(&self.inner.io);
            if io.is_some() {
                return Ok(());
            }
            let mut parked = lock(&self.inner.parked);
            let transport = parked.take().ok_or(Error::NotConnected)?;
            if !transport.is_connected() {
                *parked = Some(transport);
                return Err(Error::NotConnected);
            }
            let shared = IoShared {
                registry: self.inner.registry.clone(),
                parser: Arc::clone(&self.inner.parser),
                events: self.inner.events.clone(),
                device: self.inner.device.clone(),
            };
            *io = Some(io::spawn_io_task(transport, config.io_config(), shared));
        }

        debug!(device = %self.inner.device, "AT port open");
        if config.init_sequence_enabled {
            self.run_init_sequence();
        }
        Ok(())
    }

    /// Close the port once every command queued so far has been handled.
    ///
    /// The transport is kept so the port can be opened again. Closing a
    /// closed port is a no-op.
    pub async fn close(&self) -> Result<()> {
        let Some(io) = lock(&self.inner.io).take() else {
            return Ok(());
        };
        let _ = io.tx.send(Request::Close);
        let transport = io
            .task
            .await
            .map_err(|e| Error::Transport(format!("AT IO task failed: {e}")))?;
        *lock(&self.inner.parked) = Some(transport);
        debug!(device = %self.inner.device, "AT port closed");
        Ok(())
    }

    /// Close the port and hand back its transport.
    pub async fn shutdown(self) -> Result<Box<dyn Transport>> {
        self.close().await?;
        lock(&self.inner.parked).take().ok_or(Error::NotConnected)
    }

    /// Stop the IO task at once, failing everything queued with
    /// [`Error::NotConnected`]. The transport is parked as with `close`.
    pub async fn abort(&self) -> Result<()> {
        let Some(io) = lock(&self.inner.io).take() else {
            return Ok(());
        };
        io.shutdown.cancel();
        let transport = io
            .task
            .await
            .map_err(|e| Error::Transport(format!("AT IO task failed: {e}")))?;
        *lock(&self.inner.parked) = Some(transport);
        Ok(())
    }

    /// Queue `cmd` and return its eventual reply.
    ///
    /// The command enters the queue before this returns, so the order of
    /// `queue_command` calls is the order commands reach the wire.
    pub fn queue_command(&self, cmd: AtCommand) -> PendingReply {
        let send_lf = lock(&self.inner.config).line_ending.sends_lf();
        let (tx, rx) = oneshot::channel();
        let pending = PendingCommand {
            bytes: framer::encode_command(&cmd.text, cmd.raw, send_lf),
            timeout: cmd.timeout,
            allow_cached: cmd.allow_cached,
            cancel: cmd.cancel,
            reply: tx,
        };

        let io = lock(&self.inner.io);
        let rejected = match io.as_ref() {
            Some(io) => io.tx.send(Request::Command(pending)).err().map(|e| e.0),
            None => Some(Request::Command(pending)),
        };
        if let Some(Request::Command(pending)) = rejected {
            let _ = pending.reply.send(Err(Error::NotConnected));
        }
        PendingReply { rx }
    }

    /// Shorthand for a command that accepts a cached reply.
    pub fn queue_command_cached(&self, text: &str, timeout: Duration) -> PendingReply {
        self.queue_command(AtCommand::new(text).timeout(timeout).allow_cached(true))
    }

    /// Queue every init sequence command without waiting for replies.
    pub fn run_init_sequence(&self) {
        let sequence = lock(&self.inner.config).init_sequence.clone();
        if sequence.is_empty() {
            return;
        }
        debug!(device = %self.inner.device, "running init sequence");
        for text in sequence {
            drop(self.queue_command(AtCommand::new(text).timeout(INIT_COMMAND_TIMEOUT)));
        }
    }

    pub fn init_sequence_enabled(&self) -> bool {
        lock(&self.inner.config).init_sequence_enabled
    }

    pub fn set_init_sequence_enabled(&self, enabled: bool) {
        lock(&self.inner.config).init_sequence_enabled = enabled;
    }

    /// Register `callback` for unsolicited messages matching `pattern`.
    ///
    /// Replaces the callback of an existing handler with the same pattern
    /// string and re-enables it.
    pub fn add_unsolicited_handler<F>(&self, pattern: &str, callback: F) -> Result<()>
    where
        F: Fn(&UnsolicitedMatch) -> Result<()> + Send + Sync + 'static,
    {
        let callback: UnsolicitedCallback = Arc::new(callback);
        self.inner.registry.add(pattern, Some(callback))
    }

    /// Strip messages matching `pattern` without reporting them.
    pub fn ignore_unsolicited(&self, pattern: &str) -> Result<()> {
        self.inner.registry.add(pattern, None)
    }

    pub fn enable_unsolicited_handler(&self, pattern: &str, enabled: bool) {
        self.inner.registry.enable(pattern, enabled);
    }

    pub fn remove_unsolicited_handler(&self, pattern: &str) -> bool {
        self.inner.registry.remove(pattern)
    }

    /// The handler registry, for callers that manage handlers in bulk.
    pub fn unsolicited(&self) -> &UnsolicitedRegistry {
        &self.inner.registry
    }

    /// Replace the final response parser. Takes effect from the next
    /// received chunk.
    pub fn set_response_parser(&self, parser: impl ResponseParser) {
        *lock(&self.inner.parser) = Arc::new(parser);
    }

    /// Subscribe to port health events.
    pub fn subscribe(&self) -> broadcast::Receiver<PortEvent> {
        self.inner.events.subscribe()
    }
}

// ---------------------------------------------------------------------------
// AtPortBuilder
// ---------------------------------------------------------------------------

/// Fluent builder for [`AtPort`].
///
/// Both build methods return an open port with its init sequence queued.
#[derive(Debug, Clone)]
pub struct AtPortBuilder {
    device: Option<String>,
    baud_rate: u32,
    flags: PortFlags,
    config: AtPortConfig,
}

impl Default for AtPortBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AtPortBuilder {
    pub fn new() -> Self {
        AtPortBuilder {
            device: None,
            baud_rate: 115_200,
            flags: PortFlags::PRIMARY,
            config: AtPortConfig::default(),
        }
    }

    /// Device node path (e.g. `/dev/ttyUSB2`). Required for [`build`](Self::build).
    pub fn device(mut self, device: &str) -> Self {
        self.device = Some(device.to_string());
        self
    }

    pub fn baud_rate(mut self, baud: u32) -> Self {
        self.baud_rate = baud;
        self
    }

    pub fn flags(mut self, flags: PortFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Follow every command's carriage return with a line feed.
    pub fn send_lf(mut self, send_lf: bool) -> Self {
        self.config.line_ending = if send_lf {
            LineEnding::CrLf
        } else {
            LineEnding::Cr
        };
        self
    }

    pub fn remove_echo(mut self, remove: bool) -> Self {
        self.config.remove_echo = remove;
        self
    }

    pub fn init_sequence<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.init_sequence = commands.into_iter().map(Into::into).collect();
        self
    }

    pub fn init_sequence_enabled(mut self, enabled: bool) -> Self {
        self.config.init_sequence_enabled = enabled;
        self
    }

    pub fn max_buffer(mut self, len: usize) -> Self {
        self.config.max_buffer = len;
        self
    }

    pub fn spew_control(mut self, enabled: bool) -> Self {
        self.config.spew_control = enabled;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn late_reply_window(mut self, window: Duration) -> Self {
        self.config.late_reply_window = window;
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: AtPortConfig) -> Self {
        self.config = config;
        self
    }

    /// Build an open port on a caller-provided transport.
    ///
    /// This is the entry point for tests (pass a `MockTransport` from
    /// `mmlib-test-harness`).
    pub async fn build_with_transport(self, transport: Box<dyn Transport>) -> Result<AtPort> {
        if self.config.max_buffer < 2 {
            return Err(Error::InvalidParameter("max_buffer must be at least 2".into()));
        }
        let device = self.device.unwrap_or_else(|| "virtual".to_string());
        let port = AtPort::new(device, self.flags, self.config, transport);
        port.open().await?;
        Ok(port)
    }

    /// Open the device as a serial port and build an open port on it.
    pub async fn build(self) -> Result<AtPort> {
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| Error::InvalidParameter("device is required for build()".into()))?;
        let transport = mmlib_transport::SerialTransport::open(device, self.baud_rate).await?;
        self.build_with_transport(Box::new(transport)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mmlib_test_harness::MockTransport;

    #[test]
    fn at_command_defaults() {
        let cmd = AtCommand::new("+CGMI");
        assert_eq!(cmd.text(), "+CGMI");
        assert_eq!(cmd.timeout_duration(), DEFAULT_COMMAND_TIMEOUT);
        assert!(!cmd.raw);
        assert!(!cmd.allow_cached);
        assert!(cmd.cancel.is_none());
    }

    #[test]
    fn config_defaults() {
        let config = AtPortConfig::default();
        assert!(config.remove_echo);
        assert!(config.init_sequence.is_empty());
        assert!(config.init_sequence_enabled);
        assert_eq!(config.max_buffer, 2048);
        assert_eq!(config.line_ending, LineEnding::Cr);
    }

    #[tokio::test]
    async fn builder_returns_open_port() {
        let port = AtPortBuilder::new()
            .device("/dev/ttyUSB2")
            .flags(PortFlags::PRIMARY | PortFlags::GPS_CONTROL)
            .build_with_transport(Box::new(MockTransport::new()))
            .await
            .unwrap();
        assert!(port.is_open());
        assert_eq!(port.device(), "/dev/ttyUSB2");
        assert!(port.flags().contains(PortFlags::GPS_CONTROL));
    }

    #[tokio::test]
    async fn builder_device_required_for_build() {
        let result = AtPortBuilder::new().build().await;
        assert!(matches!(result, Err(Error::InvalidParameter(_))));
    }

    #[tokio::test]
    async fn builder_rejects_tiny_buffer() {
        let result = AtPortBuilder::new()
            .max_buffer(1)
            .build_with_transport(Box::new(MockTransport::new()))
            .await;
        assert!(matches!(result, Err(Error::InvalidParameter(_))));
    }

    #[tokio::test]
    async fn simple_command_round_trip() {
        let mut mock = MockTransport::new();
        mock.expect(b"AT+CGMI\r", b"AT+CGMI\r\r\nQuectel\r\n\r\nOK\r\n");
        let port = AtPortBuilder::new()
            .build_with_transport(Box::new(mock))
            .await
            .unwrap();

        let reply = port.queue_command(AtCommand::new("+CGMI")).await.unwrap();
        assert_eq!(reply, "Quectel");
    }

    #[tokio::test]
    async fn unreadable_error_reply_is_malformed() {
        let mut mock = MockTransport::new();
        mock.expect(b"AT+CPIN?\r", b"\r\n+CME ERROR: \r\n");
        mock.expect(b"AT+CGMI\r", b"\r\nQuectel\r\n\r\nOK\r\n");
        let port = AtPortBuilder::new()
            .build_with_transport(Box::new(mock))
            .await
            .unwrap();

        let result = port.queue_command(AtCommand::new("+CPIN?")).await;
        assert!(matches!(result, Err(Error::MalformedResponse(_))));
        assert_eq!(port.queue_command(AtCommand::new("+CGMI")).await.unwrap(), "Quectel");
    }

    #[tokio::test]
    async fn send_lf_is_applied() {
        let mut mock = MockTransport::new();
        mock.expect(b"AT\r\n", b"\r\nOK\r\n");
        let port = AtPortBuilder::new()
            .send_lf(true)
            .build_with_transport(Box::new(mock))
            .await
            .unwrap();

        assert_eq!(port.queue_command(AtCommand::new("")).await.unwrap(), "");
    }

    #[tokio::test]
    async fn queue_on_closed_port_fails() {
        let port = AtPort::new(
            "virtual",
            PortFlags::PRIMARY,
            AtPortConfig::default(),
            Box::new(MockTransport::new()),
        );
        assert!(!port.is_open());
        let err = port.queue_command(AtCommand::new("")).await.unwrap_err();
        assert!(matches!(err, Error::NotConnected));
    }

    #[tokio::test]
    async fn close_then_reopen() {
        let mut mock = MockTransport::new();
        mock.expect(b"AT\r", b"\r\nOK\r\n");
        mock.expect(b"ATI\r", b"\r\nEG25\r\n\r\nOK\r\n");
        let port = AtPortBuilder::new()
            .build_with_transport(Box::new(mock))
            .await
            .unwrap();

        port.queue_command(AtCommand::new("")).await.unwrap();
        port.close().await.unwrap();
        assert!(!port.is_open());

        port.open().await.unwrap();
        assert!(port.is_open());
        assert_eq!(port.queue_command(AtCommand::new("I")).await.unwrap(), "EG25");
    }

    #[tokio::test]
    async fn close_drains_queue_first() {
        let mut mock = MockTransport::new();
        mock.expect(b"AT\r", b"\r\nOK\r\n");
        let handle = mock.handle();
        let port = AtPortBuilder::new()
            .build_with_transport(Box::new(mock))
            .await
            .unwrap();

        let reply = port.queue_command(AtCommand::new(""));
        port.close().await.unwrap();
        assert!(reply.await.is_ok());
        assert_eq!(handle.sent().len(), 1);
    }

    #[tokio::test]
    async fn shutdown_returns_transport() {
        let port = AtPortBuilder::new()
            .build_with_transport(Box::new(MockTransport::new()))
            .await
            .unwrap();
        let transport = port.shutdown().await.unwrap();
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn abort_fails_queued_commands() {
        let mut mock = MockTransport::new();
        mock.expect_silence(b"AT+COPS=?\r");
        let port = AtPortBuilder::new()
            .build_with_transport(Box::new(mock))
            .await
            .unwrap();

        let reply = port.queue_command(AtCommand::new("+COPS=?").timeout(Duration::from_secs(120)));
        tokio::task::yield_now().await;
        port.abort().await.unwrap();
        assert!(matches!(reply.await, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn init_sequence_sent_on_open() {
        let mut mock = MockTransport::new();
        mock.expect(b"ATE0 V1\r", b"\r\nOK\r\n");
        mock.expect(b"AT+CMEE=1\r", b"\r\nOK\r\n");
        mock.expect(b"AT+CGMI\r", b"\r\nQuectel\r\n\r\nOK\r\n");
        let handle = mock.handle();
        let port = AtPortBuilder::new()
            .init_sequence(["E0 V1", "+CMEE=1"])
            .build_with_transport(Box::new(mock))
            .await
            .unwrap();

        port.queue_command(AtCommand::new("+CGMI")).await.unwrap();
        assert_eq!(handle.sent_strings(), ["ATE0 V1\r", "AT+CMEE=1\r", "AT+CGMI\r"]);
    }

    #[tokio::test]
    async fn init_sequence_skipped_when_disabled() {
        let mut mock = MockTransport::new();
        mock.expect(b"AT+CGMI\r", b"\r\nQuectel\r\n\r\nOK\r\n");
        let handle = mock.handle();
        let port = AtPortBuilder::new()
            .init_sequence(["E0 V1"])
            .init_sequence_enabled(false)
            .build_with_transport(Box::new(mock))
            .await
            .unwrap();

        port.queue_command(AtCommand::new("+CGMI")).await.unwrap();
        assert_eq!(handle.sent_strings(), ["AT+CGMI\r"]);
    }

    #[tokio::test]
    async fn raw_command_written_verbatim() {
        let mut mock = MockTransport::new();
        mock.expect(b"hello\x1a", b"\r\n+CMGS: 4\r\n\r\nOK\r\n");
        let port = AtPortBuilder::new()
            .build_with_transport(Box::new(mock))
            .await
            .unwrap();

        let reply = port.queue_command(AtCommand::new("hello\u{1a}").raw(true)).await.unwrap();
        assert_eq!(reply, "+CMGS: 4");
    }

    #[tokio::test]
    async fn unsolicited_handler_via_port() {
        let mut mock = MockTransport::new();
        mock.expect(b"AT+CREG?\r", b"\r\n+CREG: 2,1\r\n\r\n+CREG: 0,1\r\n\r\nOK\r\n");
        let port = AtPortBuilder::new()
            .build_with_transport(Box::new(mock))
            .await
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        port.add_unsolicited_handler(r"\r\n\+CREG: (\d)\r\n", move |m: &UnsolicitedMatch| {
            sink.lock().unwrap().push(m.group_u32(1));
            Ok(())
        })
        .unwrap();

        let reply = port.queue_command(AtCommand::new("+CREG?")).await.unwrap();
        assert_eq!(reply, "+CREG: 2,1\r\n\r\n+CREG: 0,1");
        assert!(seen.lock().unwrap().is_empty());
        assert!(port.remove_unsolicited_handler(r"\r\n\+CREG: (\d)\r\n"));
    }

    #[tokio::test]
    async fn port_events_are_broadcast() {
        let port = AtPortBuilder::new()
            .build_with_transport(Box::new(MockTransport::new()))
            .await
            .unwrap();
        let mut events = port.subscribe();
        port.close().await.unwrap();
        assert!(matches!(events.recv().await, Ok(PortEvent::Closed)));
    }
}
