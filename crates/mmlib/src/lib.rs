//! # mmlib -- AT command engine for cellular modems
//!
//! `mmlib` drives the AT command interfaces of cellular modems: it frames
//! commands, recognizes final responses, strips unsolicited result codes
//! out of the reply stream and serializes every command on a port through
//! one IO task, so callers simply `await` a reply.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use mmlib::at::{AtCommand, AtPortBuilder};
//!
//! #[tokio::main]
//! async fn main() -> mmlib::Result<()> {
//!     let port = AtPortBuilder::new()
//!         .device("/dev/ttyUSB2")
//!         .init_sequence(["E0 V1", "+CMEE=1"])
//!         .build()
//!         .await?;
//!
//!     port.add_unsolicited_handler(r"\r\n\+CREG: (\d)\r\n", |m| {
//!         println!("registration state {:?}", m.group_u32(1));
//!         Ok(())
//!     })?;
//!
//!     let imei = port
//!         .queue_command(AtCommand::new("+CGSN").timeout(Duration::from_secs(3)))
//!         .await?;
//!     println!("IMEI {imei}");
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! | Crate                | Purpose                                          |
//! |----------------------|--------------------------------------------------|
//! | `mmlib-core`         | [`Error`], [`Transport`], [`PortEvent`], port types |
//! | `mmlib-transport`    | Serial transport over tokio-serial               |
//! | `mmlib-at-io`        | Framer, parsers, unsolicited dispatch, IO task, `AtPort` |
//! | `mmlib-modem`        | `BaseModem`, AT sequences, step sequencer, feature cache |
//! | **`mmlib`**          | This facade crate -- re-exports everything      |
//!
//! ## Feature Flags
//!
//! | Feature  | Enables                                 | Default |
//! |----------|-----------------------------------------|---------|
//! | `serial` | [`transport`] module (serial ports)     | yes     |
//! | `modem`  | [`modem`] module (modem-level helpers)  | yes     |

pub use mmlib_core::*;

/// The per-port AT engine.
///
/// [`AtPort`](at::AtPort) is the handle commands are queued on; the
/// [`ResponseParser`](at::ResponseParser) and
/// [`UnsolicitedRegistry`](at::UnsolicitedRegistry) decide how the reply
/// stream is split.
pub mod at {
    pub use mmlib_at_io::*;
}

/// Serial transport.
#[cfg(feature = "serial")]
pub mod transport {
    pub use mmlib_transport::*;
}

/// Modem objects built on the AT engine: [`BaseModem`](modem::BaseModem),
/// table-driven sequences, step machines, the feature-probe cache and the
/// location and power-down consumers.
#[cfg(feature = "modem")]
pub mod modem {
    pub use mmlib_modem::*;
}
