//! mmlib-at-io: the AT command/response engine for one modem port.
//!
//! This crate turns a byte-level [`Transport`](mmlib_core::Transport) into
//! a command queue:
//!
//! - [`framer`] -- echo removal and command encoding
//! - [`parser`] -- final response recognition ([`V1Parser`] by default)
//! - [`unsolicited`] -- URC extraction and handler dispatch
//! - [`io`] -- the per-port IO task that serializes commands
//! - [`port`] -- the [`AtPort`] handle and its builder

pub mod framer;
pub mod io;
pub mod parser;
pub mod port;
pub mod unsolicited;

pub use framer::{debug_escape, encode_command, quote_string, remove_echo};
pub use parser::{ParseResult, ResponseParser, V1Parser};
pub use port::{
    AtCommand, AtPort, AtPortBuilder, AtPortConfig, DEFAULT_COMMAND_TIMEOUT, PendingReply,
};
pub use unsolicited::{UnsolicitedCallback, UnsolicitedMatch, UnsolicitedRegistry};
