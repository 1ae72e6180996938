//! Error types for mmlib.
//!
//! All fallible operations across the library return [`Result<T>`], which
//! uses [`Error`] as the error type. Transport-layer failures (timeouts,
//! lost ports), protocol-layer failures (final error responses reported by
//! the modem) and locally synthesized failures (unsupported features) are
//! all captured here.

use std::fmt;

/// Generic "unknown" mobile equipment error code (3GPP TS 27.007).
///
/// Used when the modem replies with a bare `ERROR` or a verbose
/// `+CME ERROR` text that cannot be mapped back to a number.
pub const MOBILE_ERROR_UNKNOWN: u32 = 100;

/// The error type for all mmlib operations.
///
/// The protocol-error family ([`Mobile`](Error::Mobile),
/// [`Message`](Error::Message) and [`Connect`](Error::Connect)) carries the
/// code reported on the wire so callers can branch on specific values, for
/// example retrying a command a bounded number of times on `+CME ERROR: 767`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A transport-level error (serial port could not be opened, write failed).
    #[error("transport error: {0}")]
    Transport(String),

    /// No final response arrived within the command's timeout window.
    #[error("timeout waiting for response")]
    Timeout,

    /// The operation's cancellation token fired before it completed.
    #[error("operation cancelled")]
    Cancelled,

    /// The modem replied with a mobile equipment error (`+CME ERROR`, `ERROR`).
    #[error("mobile equipment error {code}: {message}")]
    Mobile {
        /// Numeric 3GPP TS 27.007 error code.
        code: u32,
        /// Human readable description of the code.
        message: String,
    },

    /// The modem replied with a message service error (`+CMS ERROR`).
    #[error("message service error {code}: {message}")]
    Message {
        /// Numeric 3GPP TS 27.005 error code.
        code: u32,
        /// Human readable description of the code.
        message: String,
    },

    /// A dial or data-mode request was refused (`NO CARRIER`, `BUSY`, ...).
    #[error("connection attempt failed: {0}")]
    Connect(ConnectFailure),

    /// The operation is not supported by this modem.
    ///
    /// Synthesized locally when a feature probe recorded the capability as
    /// missing; never decoded from the wire.
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    /// A reply could not be classified or interpreted.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// An invalid parameter was passed to an operation.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// The port is not open.
    #[error("not connected")]
    NotConnected,

    /// The port was lost while an operation was pending.
    #[error("connection lost")]
    ConnectionLost,

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Numeric code reported by the modem, for `+CME ERROR` and `+CMS ERROR`
    /// replies.
    pub fn protocol_code(&self) -> Option<u32> {
        match self {
            Error::Mobile { code, .. } | Error::Message { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Whether the modem reported exactly `code` in a `+CME ERROR` or `+CMS ERROR`.
    pub fn is_protocol_code(&self, code: u32) -> bool {
        self.protocol_code() == Some(code)
    }

    /// Whether the modem itself reported this failure as a final response.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Error::Mobile { .. } | Error::Message { .. } | Error::Connect(_)
        )
    }
}

/// Final responses reporting a failed dial or data-mode switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailure {
    NoCarrier,
    Busy,
    NoAnswer,
    NoDialtone,
}

impl fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectFailure::NoCarrier => "no carrier",
            ConnectFailure::Busy => "busy",
            ConnectFailure::NoAnswer => "no answer",
            ConnectFailure::NoDialtone => "no dialtone",
        };
        f.write_str(s)
    }
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;
