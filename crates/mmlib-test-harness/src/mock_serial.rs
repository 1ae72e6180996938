//! Mock transport for deterministic testing of the AT engine.
//!
//! [`MockTransport`] implements the [`Transport`] trait with pre-loaded
//! request/response pairs. Replies can be immediate, delayed, or absent
//! (to exercise command timeouts), and a [`MockHandle`] obtained before the
//! transport is handed to a port keeps a way to push unsolicited bytes and
//! to read back everything that was written.
//!
//! # Example
//!
//! ```
//! use mmlib_test_harness::MockTransport;
//!
//! let mut mock = MockTransport::new();
//! // When the engine writes this command, reply with this response.
//! mock.expect(b"AT+CGMI\r", b"AT+CGMI\r\r\nQuectel\r\n\r\nOK\r\n");
//! // Accept the write but never answer.
//! mock.expect_silence(b"AT+CNMI=?\r");
//! let handle = mock.handle();
//! handle.inject(b"\r\n+CIEV: 1,0\r\n");
//! ```

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use mmlib_core::error::{Error, Result};
use mmlib_core::transport::Transport;

/// What the mock does once a matching request is written.
#[derive(Debug, Clone)]
enum Reply {
    Now(Vec<u8>),
    After(Duration, Vec<u8>),
    Silent,
}

#[derive(Debug, Clone)]
struct Expectation {
    request: Vec<u8>,
    reply: Reply,
}

/// Bytes arriving from the simulated modem.
#[derive(Debug)]
enum Inbound {
    Bytes(Vec<u8>),
    HangUp,
}

/// A mock [`Transport`] for testing without a modem.
///
/// Expectations are consumed in order. Writing data that does not match the
/// next expectation (or writing when none are left) fails the `send()` with
/// [`Error::Transport`], which surfaces as the failing command's error.
#[derive(Debug)]
pub struct MockTransport {
    expectations: VecDeque<Expectation>,
    /// Bytes ready for the next `receive()` calls.
    pending: VecDeque<u8>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    connected: bool,
    sent_log: Arc<Mutex<Vec<Vec<u8>>>>,
}

/// Test-side handle to a [`MockTransport`] that has been moved into a port.
#[derive(Debug, Clone)]
pub struct MockHandle {
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    sent_log: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl MockHandle {
    /// Deliver `data` as if the modem had sent it unprompted.
    pub fn inject(&self, data: &[u8]) {
        let _ = self.inbound_tx.send(Inbound::Bytes(data.to_vec()));
    }

    /// Simulate the device node disappearing.
    pub fn hang_up(&self) {
        let _ = self.inbound_tx.send(Inbound::HangUp);
    }

    /// Every write made through the transport so far, one entry per `send()`.
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent_log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    /// Writes rendered as lossy UTF-8, convenient for AT text assertions.
    pub fn sent_strings(&self) -> Vec<String> {
        self.sent()
            .iter()
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect()
    }
}

impl MockTransport {
    /// Create a new mock transport in the connected state.
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        MockTransport {
            expectations: VecDeque::new(),
            pending: VecDeque::new(),
            inbound_tx,
            inbound_rx,
            connected: true,
            sent_log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Reply with `response` as soon as `request` is written.
    pub fn expect(&mut self, request: &[u8], response: &[u8]) {
        self.push(request, Reply::Now(response.to_vec()));
    }

    /// Reply with `response` once `delay` has elapsed after `request` is written.
    pub fn expect_delayed(&mut self, request: &[u8], response: &[u8], delay: Duration) {
        self.push(request, Reply::After(delay, response.to_vec()));
    }

    /// Accept `request` and never answer it.
    pub fn expect_silence(&mut self, request: &[u8]) {
        self.push(request, Reply::Silent);
    }

    fn push(&mut self, request: &[u8], reply: Reply) {
        self.expectations.push_back(Expectation {
            request: request.to_vec(),
            reply,
        });
    }

    /// A handle that stays usable after the transport has been moved away.
    pub fn handle(&self) -> MockHandle {
        MockHandle {
            inbound_tx: self.inbound_tx.clone(),
            sent_log: Arc::clone(&self.sent_log),
        }
    }

    /// Every write made through this transport so far.
    pub fn sent_data(&self) -> Vec<Vec<u8>> {
        self.handle().sent()
    }

    /// Return the number of expectations that have not yet been consumed.
    pub fn remaining_expectations(&self) -> usize {
        self.expectations.len()
    }

    /// When set to `false`, subsequent `send()` and `receive()` calls
    /// return [`Error::NotConnected`].
    pub fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    fn take_pending(&mut self, buf: &mut [u8]) -> usize {
        let n = self.pending.len().min(buf.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        n
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        if !self.connected {
            return Err(Error::NotConnected);
        }

        if let Ok(mut log) = self.sent_log.lock() {
            log.push(data.to_vec());
        }

        let Some(expectation) = self.expectations.pop_front() else {
            return Err(Error::Transport(format!(
                "no more expectations in mock transport, got {:?}",
                String::from_utf8_lossy(data)
            )));
        };
        if data != expectation.request.as_slice() {
            return Err(Error::Transport(format!(
                "unexpected send data: expected {:?}, got {:?}",
                String::from_utf8_lossy(&expectation.request),
                String::from_utf8_lossy(data)
            )));
        }

        match expectation.reply {
            Reply::Now(response) => self.pending.extend(response),
            Reply::After(delay, response) => {
                let tx = self.inbound_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(Inbound::Bytes(response));
                });
            }
            Reply::Silent => {}
        }
        Ok(())
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        if !self.connected {
            return Err(Error::NotConnected);
        }

        if !self.pending.is_empty() {
            return Ok(self.take_pending(buf));
        }

        match tokio::time::timeout(timeout, self.inbound_rx.recv()).await {
            Ok(Some(Inbound::Bytes(data))) => {
                self.pending.extend(data);
                Ok(self.take_pending(buf))
            }
            Ok(Some(Inbound::HangUp)) => {
                self.connected = false;
                Ok(0)
            }
            // The sender half lives in `self`, so the channel never closes.
            Ok(None) => Err(Error::Timeout),
            Err(_) => Err(Error::Timeout),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.connected = false;
        self.pending.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}
