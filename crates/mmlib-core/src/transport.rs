//! Transport trait for modem communication.
//!
//! The [`Transport`] trait abstracts over the physical link to one modem
//! interface. The production implementation is a serial port
//! (`mmlib-transport`); tests use `MockTransport` from the
//! `mmlib-test-harness` crate.
//!
//! The AT engine in `mmlib-at-io` operates on a `Transport` rather than on a
//! serial port directly, so the same code path drives real hardware and
//! deterministic scripted exchanges.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;

/// Asynchronous byte-level transport to a modem interface.
///
/// Implementations handle buffering and error recovery at the physical
/// layer. Framing (echo removal, final response detection) is done by the
/// AT engine that consumes this trait.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send raw bytes to the modem.
    ///
    /// Implementations should block until all bytes have been written to
    /// the underlying device.
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Receive bytes from the modem into the provided buffer.
    ///
    /// Returns the number of bytes actually read. Will wait up to `timeout`
    /// for data to arrive; returns [`Error::Timeout`](crate::error::Error::Timeout)
    /// if no data is received within the deadline. A return of `Ok(0)`
    /// means the far end hung up.
    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Close the transport connection.
    ///
    /// After calling `close()`, subsequent `send()` and `receive()` calls
    /// should return [`Error::NotConnected`](crate::error::Error::NotConnected).
    async fn close(&mut self) -> Result<()>;

    /// Check whether the transport is currently connected.
    fn is_connected(&self) -> bool;
}
