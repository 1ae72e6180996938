//! Asynchronous port event types.
//!
//! Events are published by each AT port's IO task through a
//! [`tokio::sync::broadcast`] channel. They describe the health of the
//! port rather than modem state: the modem layer subscribes to decide when
//! a port has stopped answering or has gone away.

/// An event emitted by a port's IO task.
///
/// Delivered on a best-effort basis through a bounded broadcast channel;
/// slow consumers may miss events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortEvent {
    /// A command expired without a final response.
    TimedOut {
        /// Number of timeouts in a row since the last parsed response
        /// (1-based).
        consecutive: u32,
    },

    /// The receive buffer exceeded its limit and the oldest half was
    /// discarded.
    BufferFull {
        /// Buffer length at the moment the limit was hit.
        len: usize,
    },

    /// The port was closed, either on request or because the transport
    /// went away.
    Closed,
}
