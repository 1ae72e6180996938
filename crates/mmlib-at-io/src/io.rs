//! IO task types and implementation for AT ports.
//!
//! One tokio task per open port owns the transport exclusively. Callers
//! hand it commands over an unbounded channel; the task keeps them in a
//! FIFO queue, writes one at a time, and resolves each with the first final
//! response that follows. Every chunk of received bytes goes through spew
//! control, echo removal and unsolicited extraction before final response
//! parsing, whether or not a command is in flight.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use mmlib_core::error::{Error, Result};
use mmlib_core::events::PortEvent;
use mmlib_core::transport::Transport;

use crate::framer::{self, debug_escape};
use crate::parser::{ParseResult, ResponseParser};
use crate::unsolicited::UnsolicitedRegistry;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Settings the IO task reads on every cycle.
#[derive(Debug, Clone)]
pub struct IoConfig {
    /// Strip echoed command text before parsing.
    pub remove_echo: bool,
    /// Drop the oldest half of the receive buffer once it grows past
    /// `max_buffer`.
    pub spew_control: bool,
    pub max_buffer: usize,
    /// Upper bound on a single transport read; the loop re-checks its
    /// queue at least this often.
    pub poll_interval: Duration,
    /// How long a timed-out command's reply is still expected before the
    /// next command is written.
    pub late_reply_window: Duration,
}

/// Parser slot shared between a port handle and its IO task so the parser
/// can be replaced while the port is open.
pub type SharedParser = Arc<Mutex<Arc<dyn ResponseParser>>>;

/// A command waiting in, or at the head of, the port queue.
pub struct PendingCommand {
    pub bytes: Vec<u8>,
    pub timeout: Duration,
    pub allow_cached: bool,
    pub cancel: Option<CancellationToken>,
    pub reply: oneshot::Sender<Result<String>>,
}

impl PendingCommand {
    fn resolve(self, result: Result<String>) {
        // The caller may have stopped waiting; the command still ran.
        let _ = self.reply.send(result);
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }
}

/// A request sent from the port handle to the IO task.
pub enum Request {
    Command(PendingCommand),
    /// Stop once everything queued before this request has been handled.
    Close,
}

enum Queued {
    Command(PendingCommand),
    Close,
}

struct InFlight {
    cmd: PendingCommand,
    deadline: Instant,
}

/// Handle to a running IO task. Stored inside the port.
pub struct PortIo {
    pub tx: mpsc::UnboundedSender<Request>,
    /// Stops the task immediately, failing whatever is queued.
    pub shutdown: CancellationToken,
    /// Resolves to the transport once the task has exited.
    pub task: JoinHandle<Box<dyn Transport>>,
}

/// State shared by the port handle and the task.
pub struct IoShared {
    pub registry: UnsolicitedRegistry,
    pub parser: SharedParser,
    pub events: broadcast::Sender<PortEvent>,
    pub device: String,
}

// ---------------------------------------------------------------------------
// Spawn
// ---------------------------------------------------------------------------

/// Spawn the IO task on `transport`.
pub fn spawn_io_task(
    transport: Box<dyn Transport>,
    config: IoConfig,
    shared: IoShared,
) -> PortIo {
    let (tx, rx) = mpsc::unbounded_channel();
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(io_loop(transport, config, shared, rx, shutdown.clone()));
    PortIo { tx, shutdown, task }
}

// ---------------------------------------------------------------------------
// IO Loop
// ---------------------------------------------------------------------------

enum Wake {
    Shutdown,
    Expired,
    Cancelled,
    Request(Option<Request>),
    Data(Result<usize>),
}

struct PortState {
    transport: Box<dyn Transport>,
    config: IoConfig,
    shared: IoShared,
    queue: VecDeque<Queued>,
    inflight: Option<InFlight>,
    buffer: Vec<u8>,
    cache: HashMap<Vec<u8>, String>,
    consecutive_timeouts: u32,
    /// Set while an abandoned command's reply may still arrive. The next
    /// final response before this instant is dropped, and nothing new is
    /// written until then.
    owed: Option<Instant>,
}

/// Why the loop stopped.
#[derive(Clone, Copy)]
enum Exit {
    Closed,
    Lost,
}

async fn io_loop(
    transport: Box<dyn Transport>,
    config: IoConfig,
    shared: IoShared,
    mut rx: mpsc::UnboundedReceiver<Request>,
    shutdown: CancellationToken,
) -> Box<dyn Transport> {
    let mut state = PortState {
        transport,
        config,
        shared,
        queue: VecDeque::new(),
        inflight: None,
        buffer: Vec::new(),
        cache: HashMap::new(),
        consecutive_timeouts: 0,
        owed: None,
    };
    let mut recv_buf = [0u8; 1024];

    let exit = loop {
        if state.inflight.is_none() && state.owed.is_none() {
            if let Some(exit) = state.start_next().await {
                break exit;
            }
        }

        let deadline = state.inflight.as_ref().map(|f| f.deadline).or(state.owed);
        let cancel = state.inflight.as_ref().and_then(|f| f.cmd.cancel.clone());
        let poll = state.config.poll_interval;

        let wake = tokio::select! {
            biased;

            _ = shutdown.cancelled() => Wake::Shutdown,
            _ = expire(deadline) => Wake::Expired,
            _ = cancelled(cancel) => Wake::Cancelled,
            req = rx.recv() => Wake::Request(req),
            res = state.transport.receive(&mut recv_buf, poll) => Wake::Data(res),
        };

        match wake {
            Wake::Shutdown => {
                debug!(device = %state.shared.device, "AT IO task cancelled");
                break Exit::Closed;
            }
            Wake::Expired if state.inflight.is_some() => state.time_out(),
            Wake::Expired => {
                debug!(device = %state.shared.device, "late reply never arrived");
                state.owed = None;
            }
            Wake::Cancelled => {
                if let Some(f) = state.inflight.take() {
                    debug!(device = %state.shared.device, "command cancelled while waiting for reply");
                    state.owed = Some(f.deadline);
                    f.cmd.resolve(Err(Error::Cancelled));
                }
            }
            Wake::Request(Some(Request::Command(cmd))) => state.enqueue(cmd),
            Wake::Request(Some(Request::Close)) => state.queue.push_back(Queued::Close),
            Wake::Request(None) => {
                debug!(device = %state.shared.device, "port handle dropped, exiting IO task");
                break Exit::Closed;
            }
            Wake::Data(Ok(0)) => {
                debug!(device = %state.shared.device, "unexpected port hangup");
                break Exit::Lost;
            }
            Wake::Data(Ok(n)) => {
                debug!(
                    device = %state.shared.device,
                    data = %debug_escape(&recv_buf[..n]),
                    "<--"
                );
                state.buffer.extend_from_slice(&recv_buf[..n]);
                state.process_buffer();
            }
            Wake::Data(Err(Error::Timeout)) => {}
            Wake::Data(Err(e)) => {
                warn!(device = %state.shared.device, error = %e, "read failed");
                break Exit::Lost;
            }
        }
    };

    // Anything still queued behind a close or a shutdown fails the same way.
    let error = || match exit {
        Exit::Closed => Error::NotConnected,
        Exit::Lost => Error::ConnectionLost,
    };
    while let Ok(req) = rx.try_recv() {
        if let Request::Command(cmd) = req {
            state.queue.push_back(Queued::Command(cmd));
        }
    }
    if let Some(f) = state.inflight.take() {
        f.cmd.resolve(Err(error()));
    }
    for queued in state.queue.drain(..) {
        if let Queued::Command(cmd) = queued {
            cmd.resolve(Err(error()));
        }
    }

    let _ = state.shared.events.send(PortEvent::Closed);
    state.transport
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn cancelled(token: Option<CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

impl PortState {
    /// Accept a new command into the queue.
    fn enqueue(&mut self, cmd: PendingCommand) {
        if !cmd.allow_cached {
            self.cache.remove(&cmd.bytes);
        }
        self.queue.push_back(Queued::Command(cmd));
    }

    /// Move queued commands to the wire until one is in flight, the queue
    /// is empty, or a close request reaches the head.
    async fn start_next(&mut self) -> Option<Exit> {
        while self.inflight.is_none() {
            let cmd = match self.queue.pop_front()? {
                Queued::Close => return Some(Exit::Closed),
                Queued::Command(cmd) => cmd,
            };

            if cmd.is_cancelled() {
                cmd.resolve(Err(Error::Cancelled));
                continue;
            }

            if cmd.allow_cached {
                if let Some(cached) = self.cache.get(&cmd.bytes) {
                    debug!(
                        device = %self.shared.device,
                        command = %debug_escape(&cmd.bytes),
                        "using cached reply"
                    );
                    let reply = cached.clone();
                    cmd.resolve(Ok(reply));
                    continue;
                }
            }

            debug!(device = %self.shared.device, data = %debug_escape(&cmd.bytes), "-->");
            match self.transport.send(&cmd.bytes).await {
                Ok(()) => {
                    let deadline = Instant::now() + cmd.timeout;
                    self.inflight = Some(InFlight { cmd, deadline });
                }
                Err(e @ (Error::ConnectionLost | Error::NotConnected)) => {
                    warn!(device = %self.shared.device, error = %e, "write failed");
                    cmd.resolve(Err(Error::ConnectionLost));
                    return Some(Exit::Lost);
                }
                Err(e) => {
                    warn!(device = %self.shared.device, error = %e, "write failed");
                    cmd.resolve(Err(e));
                }
            }
        }
        None
    }

    fn time_out(&mut self) {
        let Some(f) = self.inflight.take() else {
            return;
        };
        self.consecutive_timeouts += 1;
        debug!(
            device = %self.shared.device,
            command = %debug_escape(&f.cmd.bytes),
            consecutive = self.consecutive_timeouts,
            "command timed out"
        );
        f.cmd.resolve(Err(Error::Timeout));
        self.owed = Some(Instant::now() + self.config.late_reply_window);
        let _ = self.shared.events.send(PortEvent::TimedOut {
            consecutive: self.consecutive_timeouts,
        });
    }

    /// Run the receive buffer through the framing pipeline and resolve the
    /// head command if a final response is found.
    fn process_buffer(&mut self) {
        if self.config.spew_control && self.buffer.len() > self.config.max_buffer {
            let len = self.buffer.len();
            warn!(device = %self.shared.device, len, "receive buffer full, dropping oldest half");
            let _ = self.shared.events.send(PortEvent::BufferFull { len });
            let drop = (self.config.max_buffer / 2).min(len);
            self.buffer.drain(..drop);
        }

        if self.config.remove_echo {
            framer::remove_echo(&mut self.buffer);
        }
        self.shared.registry.dispatch(&mut self.buffer);

        let parser = match self.shared.parser.lock() {
            Ok(slot) => Arc::clone(&slot),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        };

        while !self.buffer.is_empty() {
            let (result, consumed) = match parser.parse(&self.buffer) {
                ParseResult::Incomplete => break,
                ParseResult::Final { payload, consumed } => (Ok(payload), consumed),
                ParseResult::Error { error, consumed } => (Err(error), consumed),
            };
            self.buffer.drain(..consumed.min(self.buffer.len()));
            self.consecutive_timeouts = 0;

            match self.inflight.take() {
                Some(f) => {
                    if f.cmd.allow_cached {
                        if let Ok(payload) = &result {
                            self.cache.insert(f.cmd.bytes.clone(), payload.clone());
                        }
                    }
                    f.cmd.resolve(result);
                }
                None if self.owed.take().is_some() => {
                    debug!(
                        device = %self.shared.device,
                        result = ?result,
                        "discarding late reply to abandoned command"
                    );
                }
                None => {
                    debug!(
                        device = %self.shared.device,
                        result = ?result,
                        "final response with no command in flight, discarding"
                    );
                }
            }

            if consumed == 0 {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::V1Parser;
    use crate::unsolicited::UnsolicitedMatch;
    use mmlib_test_harness::{MockHandle, MockTransport};

    struct Harness {
        io: PortIo,
        registry: UnsolicitedRegistry,
        parser: SharedParser,
        events: broadcast::Receiver<PortEvent>,
    }

    fn test_config() -> IoConfig {
        IoConfig {
            remove_echo: true,
            spew_control: true,
            max_buffer: 2048,
            poll_interval: Duration::from_millis(100),
            late_reply_window: Duration::from_secs(1),
        }
    }

    fn spawn_with(mock: MockTransport, config: IoConfig) -> Harness {
        let registry = UnsolicitedRegistry::new();
        let default_parser: Arc<dyn ResponseParser> = Arc::new(V1Parser::new());
        let parser: SharedParser = Arc::new(Mutex::new(default_parser));
        let (event_tx, events) = broadcast::channel(16);
        let io = spawn_io_task(
            Box::new(mock),
            config,
            IoShared {
                registry: registry.clone(),
                parser: Arc::clone(&parser),
                events: event_tx,
                device: "ttyTEST".into(),
            },
        );
        Harness {
            io,
            registry,
            parser,
            events,
        }
    }

    fn spawn(mock: MockTransport) -> Harness {
        spawn_with(mock, test_config())
    }

    fn queue(
        io: &PortIo,
        text: &str,
        timeout: Duration,
        allow_cached: bool,
        cancel: Option<CancellationToken>,
    ) -> oneshot::Receiver<Result<String>> {
        let (reply, rx) = oneshot::channel();
        let cmd = PendingCommand {
            bytes: framer::encode_command(text, false, false),
            timeout,
            allow_cached,
            cancel,
            reply,
        };
        io.tx.send(Request::Command(cmd)).ok().unwrap();
        rx
    }

    fn command(io: &PortIo, text: &str) -> oneshot::Receiver<Result<String>> {
        queue(io, text, Duration::from_secs(3), false, None)
    }

    async fn close(io: PortIo) -> Box<dyn Transport> {
        let _ = io.tx.send(Request::Close);
        io.task.await.unwrap()
    }

    fn sent(handle: &MockHandle) -> Vec<String> {
        handle.sent_strings()
    }

    // =======================================================================
    // Queue ordering and timeouts
    // =======================================================================

    #[tokio::test(start_paused = true)]
    async fn replies_match_commands_in_fifo_order() {
        let mut mock = MockTransport::new();
        mock.expect_delayed(b"AT+CGMI\r", b"\r\nQuectel\r\n\r\nOK\r\n", Duration::from_millis(700));
        mock.expect_delayed(b"AT+CGMM\r", b"\r\nEG25\r\n\r\nOK\r\n", Duration::from_millis(20));
        mock.expect_delayed(b"AT+CGSN\r", b"\r\n867698041234567\r\n\r\nOK\r\n", Duration::from_millis(350));
        let handle = mock.handle();
        let h = spawn(mock);

        let a = command(&h.io, "+CGMI");
        let b = command(&h.io, "+CGMM");
        let c = command(&h.io, "+CGSN");

        assert_eq!(c.await.unwrap().unwrap(), "867698041234567");
        assert_eq!(a.await.unwrap().unwrap(), "Quectel");
        assert_eq!(b.await.unwrap().unwrap(), "EG25");
        assert_eq!(sent(&handle), ["AT+CGMI\r", "AT+CGMM\r", "AT+CGSN\r"]);

        close(h.io).await;
    }

    #[tokio::test(start_paused = true)]
    async fn silent_command_times_out_and_queue_moves_on() {
        let mut mock = MockTransport::new();
        mock.expect_silence(b"AT+CNMI=?\r");
        mock.expect(b"AT+CGMI\r", b"\r\nQuectel\r\n\r\nOK\r\n");
        let handle = mock.handle();
        let h = spawn(mock);

        let start = Instant::now();
        let probe = command(&h.io, "+CNMI=?");
        let next = command(&h.io, "+CGMI");

        assert!(matches!(probe.await.unwrap(), Err(Error::Timeout)));
        assert!(start.elapsed() >= Duration::from_secs(3));
        assert_eq!(next.await.unwrap().unwrap(), "Quectel");
        assert_eq!(sent(&handle), ["AT+CNMI=?\r", "AT+CGMI\r"]);

        close(h.io).await;
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_events_count_and_reset() {
        let mut mock = MockTransport::new();
        mock.expect_silence(b"AT+CSQ\r");
        mock.expect_silence(b"AT+CSQ\r");
        mock.expect(b"AT+CSQ\r", b"\r\n+CSQ: 20,99\r\n\r\nOK\r\n");
        mock.expect_silence(b"AT+CSQ\r");
        let mut h = spawn(mock);

        let short = Duration::from_secs(1);
        for _ in 0..4 {
            let _ = queue(&h.io, "+CSQ", short, false, None).await.unwrap();
        }

        let mut counts = Vec::new();
        while let Ok(event) = h.events.try_recv() {
            if let PortEvent::TimedOut { consecutive } = event {
                counts.push(consecutive);
            }
        }
        assert_eq!(counts, [1, 2, 1]);

        close(h.io).await;
    }

    #[tokio::test(start_paused = true)]
    async fn write_error_fails_only_that_command() {
        let mut mock = MockTransport::new();
        mock.expect(b"AT+CGMI\r", b"\r\nQuectel\r\n\r\nOK\r\n");
        let h = spawn(mock);

        // No expectation left for this one: the mock refuses the write.
        let first = command(&h.io, "+CGMI");
        let second = command(&h.io, "+CGMM");
        assert!(first.await.unwrap().is_ok());
        assert!(matches!(second.await.unwrap(), Err(Error::Transport(_))));

        close(h.io).await;
    }

    // =======================================================================
    // Unsolicited extraction
    // =======================================================================

    #[tokio::test(start_paused = true)]
    async fn unsolicited_messages_are_cut_from_reply() {
        let mut mock = MockTransport::new();
        mock.expect(
            b"AT+CSQ\r",
            b"AT+CSQ\r\r\n^SYSSTART\r\n\r\n+CSQ: 20,99\r\n\r\n+CIEV: 1,0\r\n\r\nOK\r\n",
        );
        let h = spawn(mock);

        let seen = Arc::new(Mutex::new(Vec::new()));
        for pattern in [r"\r\n\^SYSSTART\r\n", r"\r\n\+CIEV: (\d+),(\d+)\r\n"] {
            let sink = Arc::clone(&seen);
            let cb: crate::unsolicited::UnsolicitedCallback =
                Arc::new(move |m: &UnsolicitedMatch| {
                    sink.lock().unwrap().push(m.text().trim().to_string());
                    Ok(())
                });
            h.registry.add(pattern, Some(cb)).unwrap();
        }

        let reply = command(&h.io, "+CSQ").await.unwrap().unwrap();
        assert_eq!(reply, "+CSQ: 20,99");
        // Wire order, not handler order.
        assert_eq!(*seen.lock().unwrap(), ["^SYSSTART", "+CIEV: 1,0"]);

        close(h.io).await;
    }

    #[tokio::test(start_paused = true)]
    async fn unsolicited_dispatch_while_idle() {
        let mock = MockTransport::new();
        let handle = mock.handle();
        let h = spawn(mock);

        let rssi = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&rssi);
        let cb: crate::unsolicited::UnsolicitedCallback = Arc::new(move |m: &UnsolicitedMatch| {
            *sink.lock().unwrap() = m.group_u32(2);
            Ok(())
        });
        h.registry.add(r"\r\n\+CIEV: (\d+),(\d+)\r\n", Some(cb)).unwrap();

        handle.inject(b"\r\n+CIEV: 2,4\r\n");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*rssi.lock().unwrap(), Some(4));

        close(h.io).await;
    }

    #[tokio::test(start_paused = true)]
    async fn reply_split_across_reads() {
        let mut mock = MockTransport::new();
        mock.expect(b"AT+CGMR\r", b"\r\nEG25GGBR07A08M2G\r\n");
        let handle = mock.handle();
        let h = spawn(mock);

        let reply = command(&h.io, "+CGMR");
        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.inject(b"\r\nO");
        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.inject(b"K\r\n");

        assert_eq!(reply.await.unwrap().unwrap(), "EG25GGBR07A08M2G");
        close(h.io).await;
    }

    // =======================================================================
    // Buffer handling
    // =======================================================================

    #[tokio::test(start_paused = true)]
    async fn final_response_without_command_is_discarded() {
        let mut mock = MockTransport::new();
        mock.expect(b"AT+CSQ\r", b"\r\n+CSQ: 1,2\r\n\r\nOK\r\n");
        let handle = mock.handle();
        let h = spawn(mock);

        handle.inject(b"\r\nERROR\r\n");
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(command(&h.io, "+CSQ").await.unwrap().unwrap(), "+CSQ: 1,2");
        close(h.io).await;
    }

    #[tokio::test(start_paused = true)]
    async fn spew_control_drops_oldest_half() {
        let mock = MockTransport::new();
        let handle = mock.handle();
        let mut config = test_config();
        config.max_buffer = 16;
        let mut h = spawn_with(mock, config);

        handle.inject(&[b'x'; 40]);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(matches!(h.events.try_recv(), Ok(PortEvent::BufferFull { len: 40 })));
        close(h.io).await;
    }

    #[tokio::test(start_paused = true)]
    async fn spew_control_can_be_disabled() {
        let mock = MockTransport::new();
        let handle = mock.handle();
        let mut config = test_config();
        config.max_buffer = 16;
        config.spew_control = false;
        let mut h = spawn_with(mock, config);

        handle.inject(&[b'x'; 40]);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(h.events.try_recv().is_err());
        close(h.io).await;
    }

    // =======================================================================
    // Cache
    // =======================================================================

    #[tokio::test(start_paused = true)]
    async fn cached_reply_skips_the_wire() {
        let mut mock = MockTransport::new();
        mock.expect(b"AT+CNMI=?\r", b"\r\n+CNMI: (0-2),(0-3)\r\n\r\nOK\r\n");
        let handle = mock.handle();
        let h = spawn(mock);

        let timeout = Duration::from_secs(3);
        let first = queue(&h.io, "+CNMI=?", timeout, true, None).await.unwrap();
        let second = queue(&h.io, "+CNMI=?", timeout, true, None).await.unwrap();
        assert_eq!(first.unwrap(), "+CNMI: (0-2),(0-3)");
        assert_eq!(second.unwrap(), "+CNMI: (0-2),(0-3)");
        assert_eq!(handle.sent().len(), 1);

        close(h.io).await;
    }

    #[tokio::test(start_paused = true)]
    async fn uncached_command_invalidates_entry() {
        let mut mock = MockTransport::new();
        mock.expect(b"AT+CNMI=?\r", b"\r\n+CNMI: (0-2)\r\n\r\nOK\r\n");
        mock.expect(b"AT+CNMI=?\r", b"\r\n+CNMI: (0-3)\r\n\r\nOK\r\n");
        mock.expect(b"AT+CNMI=?\r", b"\r\n+CNMI: (0-1)\r\n\r\nOK\r\n");
        let handle = mock.handle();
        let h = spawn(mock);

        let timeout = Duration::from_secs(3);
        let cached = queue(&h.io, "+CNMI=?", timeout, true, None).await.unwrap();
        let fresh = queue(&h.io, "+CNMI=?", timeout, false, None).await.unwrap();
        let again = queue(&h.io, "+CNMI=?", timeout, true, None).await.unwrap();

        assert_eq!(cached.unwrap(), "+CNMI: (0-2)");
        assert_eq!(fresh.unwrap(), "+CNMI: (0-3)");
        assert_eq!(again.unwrap(), "+CNMI: (0-1)");
        assert_eq!(handle.sent().len(), 3);

        close(h.io).await;
    }

    #[tokio::test(start_paused = true)]
    async fn error_replies_are_not_cached() {
        let mut mock = MockTransport::new();
        mock.expect(b"AT^SGPSC=?\r", b"\r\nERROR\r\n");
        mock.expect(b"AT^SGPSC=?\r", b"\r\nERROR\r\n");
        let handle = mock.handle();
        let h = spawn(mock);

        let timeout = Duration::from_secs(3);
        for _ in 0..2 {
            let result = queue(&h.io, "^SGPSC=?", timeout, true, None).await.unwrap();
            assert!(result.unwrap_err().is_protocol_code(100));
        }
        assert_eq!(handle.sent().len(), 2);

        close(h.io).await;
    }

    // =======================================================================
    // Cancellation
    // =======================================================================

    #[tokio::test(start_paused = true)]
    async fn cancelled_before_dispatch_never_written() {
        let mut mock = MockTransport::new();
        mock.expect_silence(b"AT+COPS=?\r");
        let handle = mock.handle();
        let h = spawn(mock);

        let token = CancellationToken::new();
        let busy = queue(&h.io, "+COPS=?", Duration::from_secs(1), false, None);
        let victim = queue(&h.io, "+CGMI", Duration::from_secs(3), false, Some(token.clone()));
        token.cancel();

        assert!(matches!(busy.await.unwrap(), Err(Error::Timeout)));
        assert!(matches!(victim.await.unwrap(), Err(Error::Cancelled)));
        assert_eq!(sent(&handle), ["AT+COPS=?\r"]);

        close(h.io).await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_while_in_flight() {
        let mut mock = MockTransport::new();
        mock.expect_silence(b"AT+COPS=?\r");
        mock.expect(b"AT+CGMI\r", b"\r\nQuectel\r\n\r\nOK\r\n");
        let h = spawn(mock);

        let token = CancellationToken::new();
        let start = Instant::now();
        let scan = queue(&h.io, "+COPS=?", Duration::from_secs(120), false, Some(token.clone()));
        let next = command(&h.io, "+CGMI");
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        });

        assert!(matches!(scan.await.unwrap(), Err(Error::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(120));
        assert_eq!(next.await.unwrap().unwrap(), "Quectel");

        close(h.io).await;
    }

    #[tokio::test(start_paused = true)]
    async fn late_reply_after_cancel_is_discarded() {
        let mut mock = MockTransport::new();
        mock.expect_delayed(
            b"AT+COPS=?\r",
            b"\r\n+COPS: (1,\"Stale\",\"Stale\",\"00101\",7)\r\n\r\nOK\r\n",
            Duration::from_millis(500),
        );
        mock.expect_delayed(b"AT+CGMI\r", b"\r\nQuectel\r\n\r\nOK\r\n", Duration::from_millis(1500));
        let handle = mock.handle();
        let h = spawn(mock);

        let token = CancellationToken::new();
        let scan = queue(&h.io, "+COPS=?", Duration::from_secs(120), false, Some(token.clone()));
        let next = command(&h.io, "+CGMI");
        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();

        assert!(matches!(scan.await.unwrap(), Err(Error::Cancelled)));
        // The modem is still busy with the scan.
        assert_eq!(sent(&handle), ["AT+COPS=?\r"]);
        assert_eq!(next.await.unwrap().unwrap(), "Quectel");
        assert_eq!(sent(&handle), ["AT+COPS=?\r", "AT+CGMI\r"]);

        close(h.io).await;
    }

    #[tokio::test(start_paused = true)]
    async fn late_reply_after_timeout_is_discarded() {
        let mut mock = MockTransport::new();
        mock.expect_delayed(b"AT+CSQ\r", b"\r\n+CSQ: 20,99\r\n\r\nOK\r\n", Duration::from_millis(1500));
        mock.expect(b"AT+CGMI\r", b"\r\nQuectel\r\n\r\nOK\r\n");
        let handle = mock.handle();
        let h = spawn(mock);

        let start = Instant::now();
        let signal = queue(&h.io, "+CSQ", Duration::from_secs(1), false, None);
        let next = command(&h.io, "+CGMI");

        assert!(matches!(signal.await.unwrap(), Err(Error::Timeout)));
        assert_eq!(next.await.unwrap().unwrap(), "Quectel");
        assert!(start.elapsed() >= Duration::from_millis(1500));
        assert_eq!(sent(&handle), ["AT+CSQ\r", "AT+CGMI\r"]);

        close(h.io).await;
    }

    #[tokio::test(start_paused = true)]
    async fn missing_late_reply_holds_queue_for_window() {
        let mut mock = MockTransport::new();
        mock.expect_silence(b"AT+CSQ\r");
        mock.expect(b"AT+CGMI\r", b"\r\nQuectel\r\n\r\nOK\r\n");
        let h = spawn(mock);

        let start = Instant::now();
        let signal = queue(&h.io, "+CSQ", Duration::from_secs(1), false, None);
        let next = command(&h.io, "+CGMI");

        assert!(matches!(signal.await.unwrap(), Err(Error::Timeout)));
        assert_eq!(next.await.unwrap().unwrap(), "Quectel");
        // One second of timeout plus one second of late reply window.
        assert!(start.elapsed() >= Duration::from_secs(2));

        close(h.io).await;
    }

    // =======================================================================
    // Parser and lifecycle
    // =======================================================================

    #[tokio::test(start_paused = true)]
    async fn custom_parser_recognizes_prompt() {
        let mut mock = MockTransport::new();
        mock.expect(b"AT+CMGS=23\r", b"\r\n> ");
        let h = spawn(mock);

        let prompt: Arc<dyn ResponseParser> = Arc::new(|buf: &[u8]| {
            if buf.ends_with(b"> ") {
                ParseResult::Final {
                    payload: String::new(),
                    consumed: buf.len(),
                }
            } else {
                ParseResult::Incomplete
            }
        });
        *h.parser.lock().unwrap() = prompt;

        assert_eq!(command(&h.io, "+CMGS=23").await.unwrap().unwrap(), "");
        close(h.io).await;
    }

    #[tokio::test(start_paused = true)]
    async fn hangup_fails_pending_with_connection_lost() {
        let mut mock = MockTransport::new();
        mock.expect_silence(b"AT+COPS=?\r");
        let handle = mock.handle();
        let mut h = spawn(mock);

        let scan = queue(&h.io, "+COPS=?", Duration::from_secs(120), false, None);
        let behind = command(&h.io, "+CGMI");
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.hang_up();

        assert!(matches!(scan.await.unwrap(), Err(Error::ConnectionLost)));
        assert!(matches!(behind.await.unwrap(), Err(Error::ConnectionLost)));

        let transport = h.io.task.await.unwrap();
        assert!(!transport.is_connected());
        let mut closed = false;
        while let Ok(event) = h.events.try_recv() {
            closed |= matches!(event, PortEvent::Closed);
        }
        assert!(closed);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_fails_queue_with_not_connected() {
        let mut mock = MockTransport::new();
        mock.expect_silence(b"AT+COPS=?\r");
        let h = spawn(mock);

        let scan = queue(&h.io, "+COPS=?", Duration::from_secs(120), false, None);
        let behind = command(&h.io, "+CGMI");
        tokio::time::sleep(Duration::from_millis(50)).await;
        h.io.shutdown.cancel();

        assert!(matches!(scan.await.unwrap(), Err(Error::NotConnected)));
        assert!(matches!(behind.await.unwrap(), Err(Error::NotConnected)));
        let _ = h.io.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn close_returns_transport() {
        let h = spawn(MockTransport::new());
        let transport = close(h.io).await;
        assert!(transport.is_connected());
    }
}
